use serde::Serialize;
use serde_bytes::ByteBuf;
use serde_indexed::{DeserializeIndexed, SerializeIndexed};

use super::{
    Ctap2AttestationStatement, Ctap2AuthTokenPermissionRole, Ctap2GetAssertionExtensions,
    Ctap2PublicKeyCredentialDescriptor, Ctap2PublicKeyCredentialUserEntity,
    Ctap2UserVerifiableRequest,
};
use crate::pin::PinUvAuthProtocol;

#[derive(Debug, Clone, Copy, Serialize, Default)]
pub struct Ctap2GetAssertionOptions {
    #[serde(rename = "up")]
    /// True for all requests; False for pre-flight only.
    pub require_user_presence: bool,

    #[serde(rename = "uv")]
    #[serde(skip_serializing_if = "Self::skip_serializing_uv")]
    pub require_user_verification: bool,
}

impl Ctap2GetAssertionOptions {
    fn skip_serializing_uv(uv: &bool) -> bool {
        !uv
    }
}

// https://fidoalliance.org/specs/fido-v2.1-ps-20210615/fido-client-to-authenticator-protocol-v2.1-ps-20210615.html#authenticatorGetAssertion
#[derive(Debug, Clone, SerializeIndexed)]
#[serde_indexed(offset = 1)]
pub struct Ctap2GetAssertionRequest {
    /// rpId (0x01)
    pub relying_party_id: String,

    /// clientDataHash (0x02)
    pub client_data_hash: ByteBuf,

    /// allowList (0x03)
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub allow: Vec<Ctap2PublicKeyCredentialDescriptor>,

    /// extensions (0x04)
    #[serde(skip_serializing_if = "Self::skip_serializing_extensions")]
    pub extensions: Option<Ctap2GetAssertionExtensions>,

    /// options (0x05)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub options: Option<Ctap2GetAssertionOptions>,

    /// pinUvAuthParam (0x06)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pin_auth_param: Option<ByteBuf>,

    /// pinUvAuthProtocol (0x07)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pin_auth_proto: Option<u32>,
}

impl Ctap2GetAssertionRequest {
    pub fn skip_serializing_extensions(extensions: &Option<Ctap2GetAssertionExtensions>) -> bool {
        extensions
            .as_ref()
            .map_or(true, |extensions| extensions.skip_serializing())
    }
}

#[derive(Debug, Clone, DeserializeIndexed)]
#[serde_indexed(offset = 1)]
pub struct Ctap2GetAssertionResponse {
    /// credential (0x01)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub credential_id: Option<Ctap2PublicKeyCredentialDescriptor>,

    /// authData (0x02)
    pub authenticator_data: ByteBuf,

    /// signature (0x03)
    pub signature: ByteBuf,

    /// user (0x04)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user: Option<Ctap2PublicKeyCredentialUserEntity>,

    /// numberOfCredentials (0x05)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub credentials_count: Option<u32>,

    /// userSelected (0x06)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_selected: Option<bool>,

    /// largeBlobKey (0x07)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub large_blob_key: Option<ByteBuf>,

    /// unsignedExtensionOutputs (0x08)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub unsigned_extension_outputs: Option<std::collections::BTreeMap<serde_cbor::Value, serde_cbor::Value>>,

    /// epAtt (0x09)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub enterprise_attestation: Option<bool>,

    /// attStmt (0x0A)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub attestation_statement: Option<Ctap2AttestationStatement>,
}

impl Ctap2UserVerifiableRequest for Ctap2GetAssertionRequest {
    fn calculate_and_set_uv_auth(
        &mut self,
        uv_proto: &dyn PinUvAuthProtocol,
        uv_auth_token: &[u8],
    ) {
        let uv_auth_param = uv_proto.authenticate(uv_auth_token, self.client_data_hash());
        self.pin_auth_proto = Some(uv_proto.version() as u32);
        self.pin_auth_param = Some(ByteBuf::from(uv_auth_param));
    }

    fn client_data_hash(&self) -> &[u8] {
        self.client_data_hash.as_slice()
    }

    fn permissions(&self) -> Ctap2AuthTokenPermissionRole {
        Ctap2AuthTokenPermissionRole::GET_ASSERTION
    }

    fn permissions_rpid(&self) -> Option<&str> {
        Some(&self.relying_party_id)
    }
}
