use std::collections::HashMap;
use std::time::Duration;

use crate::proto::ctap2::{
    AuthenticatorData, Ctap2AttestationStatement, Ctap2CredentialProtectionPolicy,
    Ctap2CredentialType, Ctap2PublicKeyCredentialDescriptor, Ctap2PublicKeyCredentialRpEntity,
    Ctap2PublicKeyCredentialUserEntity,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UserVerificationRequirement {
    Required,
    Preferred,
    Discouraged,
}

impl UserVerificationRequirement {
    pub fn is_preferred(&self) -> bool {
        matches!(self, Self::Required | Self::Preferred)
    }

    pub fn is_required(&self) -> bool {
        matches!(self, Self::Required)
    }
}

/// Salts for an hmac-secret evaluation. Each salt must be exactly 32 bytes.
#[derive(Debug, Clone)]
pub struct HmacGetSecretInput {
    pub salt1: Vec<u8>,
    pub salt2: Option<Vec<u8>>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HmacGetSecretOutput {
    pub output1: Vec<u8>,
    pub output2: Option<Vec<u8>>,
}

/// PRF evaluation inputs, before domain separation is applied.
#[derive(Debug, Clone)]
pub struct PrfValues {
    pub first: Vec<u8>,
    pub second: Option<Vec<u8>>,
}

#[derive(Debug, Clone, Default)]
pub struct PrfInput {
    pub eval: Option<PrfValues>,
    /// Per-credential evaluation inputs, keyed by raw credential id.
    /// Resolved against the allow list; only valid for assertions.
    pub eval_by_credential: HashMap<Vec<u8>, PrfValues>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct PrfOutput {
    pub enabled: bool,
    pub first: Option<Vec<u8>>,
    pub second: Option<Vec<u8>>,
}

#[derive(Debug, Clone, Copy)]
pub struct CredentialProtectionInput {
    pub policy: Ctap2CredentialProtectionPolicy,
    /// Fail instead of downgrading when the device lacks credProtect.
    pub enforce_policy: bool,
}

/// largeBlob extension input, part of the WebAuthn surface but not
/// supported by this implementation; its presence fails fast.
#[derive(Debug, Clone, Default)]
pub struct LargeBlobInput {
    pub support: Option<String>,
    pub read: bool,
    pub write: Option<Vec<u8>>,
}

#[derive(Debug, Clone, Default)]
pub struct CreateExtensionInputs {
    /// hmac-secret: request creation of the per-credential secret.
    pub hmac_create_secret: Option<bool>,
    /// hmac-secret-mc: evaluate salts at registration time.
    pub hmac_secret_mc: Option<HmacGetSecretInput>,
    /// prf: served over the hmac-secret-mc primitive during registration.
    pub prf: Option<PrfInput>,
    pub cred_protect: Option<CredentialProtectionInput>,
    pub cred_blob: Option<Vec<u8>>,
    pub min_pin_length: Option<bool>,
    pub pin_complexity_policy: Option<bool>,
    pub large_blob: Option<LargeBlobInput>,
    /// credProps: answered client-side, no device round trip.
    pub cred_props: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct CredentialPropertiesOutput {
    pub resident_key: bool,
}

#[derive(Debug, Clone, Default)]
pub struct CreateExtensionOutputs {
    pub hmac_create_secret: Option<bool>,
    pub hmac_secret_mc: Option<HmacGetSecretOutput>,
    pub prf: Option<PrfOutput>,
    pub cred_blob: Option<bool>,
    pub cred_protect: Option<Ctap2CredentialProtectionPolicy>,
    pub min_pin_length: Option<u32>,
    pub cred_props: Option<CredentialPropertiesOutput>,
}

#[derive(Debug, Clone, Default)]
pub struct GetExtensionInputs {
    pub hmac_get_secret: Option<HmacGetSecretInput>,
    pub prf: Option<PrfInput>,
    /// Request the blob stored alongside the credential.
    pub cred_blob: bool,
    pub large_blob: Option<LargeBlobInput>,
    pub third_party_payment: Option<bool>,
}

#[derive(Debug, Clone, Default)]
pub struct GetExtensionOutputs {
    pub hmac_get_secret: Option<HmacGetSecretOutput>,
    pub prf: Option<PrfOutput>,
    pub cred_blob: Option<Vec<u8>>,
    pub third_party_payment: Option<bool>,
}

#[derive(Debug, Clone)]
pub struct MakeCredentialRequest {
    /// clientDataHash
    pub hash: Vec<u8>,
    /// rpEntity
    pub relying_party: Ctap2PublicKeyCredentialRpEntity,
    /// userEntity
    pub user: Ctap2PublicKeyCredentialUserEntity,
    pub require_resident_key: bool,
    pub user_verification: UserVerificationRequirement,
    /// credTypesAndPubKeyAlgs
    pub algorithms: Vec<Ctap2CredentialType>,
    /// excludeCredentialDescriptorList
    pub exclude: Option<Vec<Ctap2PublicKeyCredentialDescriptor>>,
    pub extensions: Option<CreateExtensionInputs>,
    /// Obtained via [`Device::get_pin_uv_auth_token`](crate::Device::get_pin_uv_auth_token),
    /// when the device requires user verification.
    pub pin_uv_auth_token: Option<Vec<u8>>,
    pub enterprise_attestation: Option<u32>,
    pub timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct MakeCredentialResponse {
    pub format: String,
    pub authenticator_data: AuthenticatorData,
    /// The raw authenticator data, as covered by the attestation signature.
    pub authenticator_data_raw: Vec<u8>,
    pub attestation_statement: Ctap2AttestationStatement,
    pub enterprise_attestation: Option<bool>,
    pub extensions: CreateExtensionOutputs,
}

#[derive(Debug, Clone)]
pub struct GetAssertionRequest {
    pub relying_party_id: String,
    /// clientDataHash
    pub hash: Vec<u8>,
    pub allow: Vec<Ctap2PublicKeyCredentialDescriptor>,
    pub extensions: Option<GetExtensionInputs>,
    pub user_verification: UserVerificationRequirement,
    pub pin_uv_auth_token: Option<Vec<u8>>,
    pub timeout: Duration,
}

/// One assertion from a (possibly multi-credential) GetAssertion exchange.
#[derive(Debug, Clone)]
pub struct Assertion {
    pub credential_id: Option<Ctap2PublicKeyCredentialDescriptor>,
    pub authenticator_data: AuthenticatorData,
    /// The raw authenticator data, as covered by the signature.
    pub authenticator_data_raw: Vec<u8>,
    pub signature: Vec<u8>,
    pub user: Option<Ctap2PublicKeyCredentialUserEntity>,
    pub credentials_count: Option<u32>,
    pub user_selected: Option<bool>,
    pub extensions: GetExtensionOutputs,
}
