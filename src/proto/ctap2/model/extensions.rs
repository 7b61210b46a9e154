use cosey::PublicKey;
use serde::{Deserialize, Serialize};
use serde_bytes::ByteBuf;
use serde_indexed::SerializeIndexed;
use serde_repr::{Deserialize_repr, Serialize_repr};

use super::Ctap2PinUvAuthProtocol;

/// Extension identifiers as advertised in authenticatorGetInfo.
pub const EXTENSION_HMAC_SECRET: &str = "hmac-secret";
pub const EXTENSION_HMAC_SECRET_MC: &str = "hmac-secret-mc";
pub const EXTENSION_CRED_PROTECT: &str = "credProtect";
pub const EXTENSION_CRED_BLOB: &str = "credBlob";
pub const EXTENSION_MIN_PIN_LENGTH: &str = "minPinLength";
pub const EXTENSION_PIN_COMPLEXITY_POLICY: &str = "pinComplexityPolicy";
pub const EXTENSION_THIRD_PARTY_PAYMENT: &str = "thirdPartyPayment";

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize_repr, Deserialize_repr)]
pub enum Ctap2CredentialProtectionPolicy {
    UserVerificationOptional = 0x01,
    UserVerificationOptionalWithCredentialIdList = 0x02,
    UserVerificationRequired = 0x03,
}

/// Platform share of an hmac-secret exchange: the encapsulated platform
/// key, the encrypted salt(s) and their authentication tag.
#[derive(Debug, Clone, SerializeIndexed)]
#[serde_indexed(offset = 1)]
pub struct Ctap2HmacSecretInput {
    /// keyAgreement (0x01)
    pub key_agreement: PublicKey,

    /// saltEnc (0x02)
    pub salt_enc: ByteBuf,

    /// saltAuth (0x03)
    pub salt_auth: ByteBuf,

    /// pinUvAuthProtocol (0x04)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pin_uv_auth_protocol: Option<Ctap2PinUvAuthProtocol>,
}

/// Extension map attached to an authenticatorMakeCredential request.
#[derive(Debug, Clone, Default, Serialize)]
pub struct Ctap2MakeCredentialExtensions {
    #[serde(rename = "hmac-secret", skip_serializing_if = "Option::is_none")]
    pub hmac_secret: Option<bool>,

    #[serde(rename = "hmac-secret-mc", skip_serializing_if = "Option::is_none")]
    pub hmac_secret_mc: Option<Ctap2HmacSecretInput>,

    #[serde(rename = "credProtect", skip_serializing_if = "Option::is_none")]
    pub cred_protect: Option<Ctap2CredentialProtectionPolicy>,

    #[serde(rename = "credBlob", skip_serializing_if = "Option::is_none")]
    pub cred_blob: Option<ByteBuf>,

    #[serde(rename = "minPinLength", skip_serializing_if = "Option::is_none")]
    pub min_pin_length: Option<bool>,

    #[serde(
        rename = "pinComplexityPolicy",
        skip_serializing_if = "Option::is_none"
    )]
    pub pin_complexity_policy: Option<bool>,
}

impl Ctap2MakeCredentialExtensions {
    pub fn skip_serializing(&self) -> bool {
        self.hmac_secret.is_none()
            && self.hmac_secret_mc.is_none()
            && self.cred_protect.is_none()
            && self.cred_blob.is_none()
            && self.min_pin_length.is_none()
            && self.pin_complexity_policy.is_none()
    }
}

/// Extension map attached to an authenticatorGetAssertion request.
#[derive(Debug, Clone, Default, Serialize)]
pub struct Ctap2GetAssertionExtensions {
    #[serde(rename = "hmac-secret", skip_serializing_if = "Option::is_none")]
    pub hmac_secret: Option<Ctap2HmacSecretInput>,

    #[serde(rename = "credBlob", skip_serializing_if = "Option::is_none")]
    pub cred_blob: Option<bool>,

    #[serde(
        rename = "thirdPartyPayment",
        skip_serializing_if = "Option::is_none"
    )]
    pub third_party_payment: Option<bool>,
}

impl Ctap2GetAssertionExtensions {
    pub fn skip_serializing(&self) -> bool {
        self.hmac_secret.is_none() && self.cred_blob.is_none() && self.third_party_payment.is_none()
    }
}

/// hmac-secret output: a bare confirmation in MakeCredential responses, an
/// encrypted salt in GetAssertion responses.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(untagged)]
pub enum Ctap2HmacSecretOutput {
    Confirmed(bool),
    Encrypted(ByteBuf),
}

/// credBlob output: a stored-successfully flag in MakeCredential
/// responses, the blob itself in GetAssertion responses.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(untagged)]
pub enum Ctap2CredBlobOutput {
    Stored(bool),
    Blob(ByteBuf),
}

/// Extension output map embedded in authenticator data.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct Ctap2ExtensionOutputs {
    #[serde(rename = "hmac-secret", default)]
    pub hmac_secret: Option<Ctap2HmacSecretOutput>,

    #[serde(rename = "hmac-secret-mc", default)]
    pub hmac_secret_mc: Option<ByteBuf>,

    #[serde(rename = "credProtect", default)]
    pub cred_protect: Option<Ctap2CredentialProtectionPolicy>,

    #[serde(rename = "credBlob", default)]
    pub cred_blob: Option<Ctap2CredBlobOutput>,

    #[serde(rename = "minPinLength", default)]
    pub min_pin_length: Option<u32>,

    #[serde(rename = "pinComplexityPolicy", default)]
    pub pin_complexity_policy: Option<bool>,

    #[serde(rename = "thirdPartyPayment", default)]
    pub third_party_payment: Option<bool>,
}
