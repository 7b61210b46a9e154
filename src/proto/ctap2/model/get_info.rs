use std::collections::HashMap;

use num_traits::FromPrimitive;
use serde_bytes::ByteBuf;
use serde_indexed::DeserializeIndexed;

use super::{Ctap2CredentialType, Ctap2PinUvAuthProtocol};
use crate::transport::error::{Error, PlatformError};

/// Device capability snapshot, immutable once fetched.
#[derive(Debug, Clone, DeserializeIndexed)]
#[serde_indexed(offset = 1)]
pub struct Ctap2GetInfoResponse {
    /// versions (0x01)
    pub versions: Vec<String>,

    /// extensions (0x02)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub extensions: Option<Vec<String>>,

    /// aaguid (0x03)
    pub aaguid: ByteBuf,

    /// options (0x04)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub options: Option<HashMap<String, bool>>,

    /// maxMsgSize (0x05)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_msg_size: Option<u32>,

    /// pinUvAuthProtocols (0x06)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pin_auth_protos: Option<Vec<u32>>,

    /// maxCredentialCountInList (0x07)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_credential_count: Option<u32>,

    /// maxCredentialIdLength (0x08)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_credential_id_length: Option<u32>,

    /// transports (0x09)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub transports: Option<Vec<String>>,

    /// algorithms (0x0A)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub algorithms: Option<Vec<Ctap2CredentialType>>,

    /// maxSerializedLargeBlobArray (0x0B)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_blob_array: Option<u32>,

    /// forcePINChange (0x0C)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub force_pin_change: Option<bool>,

    /// minPINLength (0x0D)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub min_pin_length: Option<u32>,

    /// firmwareVersion (0x0E)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub firmware_version: Option<u32>,

    /// maxCredBlobLength (0x0F)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_cred_blob_length: Option<u32>,

    /// maxRPIDsForSetMinPINLength (0x10)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_rpids_for_setminpinlength: Option<u32>,

    /// preferredPlatformUvAttempts (0x11)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub preferred_platform_uv_attempts: Option<u32>,

    /// uvModality (0x12)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub uv_modality: Option<u32>,

    /// certifications (0x13)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub certifications: Option<HashMap<String, u32>>,

    /// remainingDiscoverableCredentials (0x14)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub remaining_discoverable_creds: Option<u32>,
}

impl Ctap2GetInfoResponse {
    pub fn option_enabled(&self, name: &str) -> bool {
        let Some(options) = &self.options else {
            return false;
        };
        options.get(name) == Some(&true)
    }

    /// True if the option is listed at all, regardless of its value.
    pub fn option_present(&self, name: &str) -> bool {
        self.options
            .as_ref()
            .map_or(false, |options| options.contains_key(name))
    }

    pub fn supports_extension(&self, name: &str) -> bool {
        self.extensions
            .as_ref()
            .map_or(false, |extensions| extensions.iter().any(|e| e == name))
    }

    pub fn supports_fido_2_1(&self) -> bool {
        self.versions.iter().any(|v| v == "FIDO_2_1")
    }

    /// The PIN/UV auth protocol to use with this device: the first entry
    /// of the advertised list, per the CTAP2 platform rules.
    pub fn pin_uv_auth_protocol(&self) -> Result<Ctap2PinUvAuthProtocol, Error> {
        let Some(protocols) = self.pin_auth_protos.as_ref().filter(|p| !p.is_empty()) else {
            return Err(Error::Platform(PlatformError::NoPinUvAuthProtocol));
        };
        Ctap2PinUvAuthProtocol::from_u32(protocols[0])
            .ok_or(Error::Platform(PlatformError::InvalidPinUvAuthProtocol))
    }
}
