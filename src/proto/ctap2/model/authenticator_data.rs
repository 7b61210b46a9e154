use std::io::Cursor as IOCursor;

use byteorder::{BigEndian, ReadBytesExt};
use serde_cbor::Value;
use tracing::error;

use super::Ctap2ExtensionOutputs;
use crate::transport::error::{Error, PlatformError};

// 32 (rpIdHash) + 1 (flags) + 4 (signCount)
const FIXED_HEADER_LEN: usize = 37;
const AAGUID_LEN: usize = 16;

bitflags! {
    #[derive(Debug, Copy, Clone, PartialEq, Eq)]
    pub struct AuthenticatorDataFlags: u8 {
        const USER_PRESENT = 0x01;
        const USER_VERIFIED = 0x04;
        const BACKUP_ELIGIBLE = 0x08;
        const BACKED_UP = 0x10;
        const ATTESTED_CREDENTIAL = 0x40;
        const EXTENSION_DATA = 0x80;
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct AttestedCredentialData {
    pub aaguid: [u8; AAGUID_LEN],
    pub credential_id: Vec<u8>,
    /// COSE_Key map, as sent by the authenticator.
    pub credential_public_key: Value,
}

/// The signed binary structure returned by the authenticator, parsed per
/// the WebAuthn authenticator-data layout. The attested-credential and
/// extension sections are present if and only if their flag bits are set.
#[derive(Debug, Clone, PartialEq)]
pub struct AuthenticatorData {
    pub rp_id_hash: [u8; 32],
    pub flags: AuthenticatorDataFlags,
    pub sign_count: u32,
    pub attested_credential: Option<AttestedCredentialData>,
    pub extensions: Option<Ctap2ExtensionOutputs>,
}

impl AuthenticatorData {
    pub fn parse(raw: &[u8]) -> Result<Self, Error> {
        if raw.len() < FIXED_HEADER_LEN {
            error!({ len = raw.len() }, "Authenticator data is too short");
            return Err(Error::Platform(PlatformError::InvalidDeviceResponse));
        }

        let mut rp_id_hash = [0u8; 32];
        rp_id_hash.copy_from_slice(&raw[0..32]);
        let flags = AuthenticatorDataFlags::from_bits_retain(raw[32]);
        let sign_count = IOCursor::new(&raw[33..37])
            .read_u32::<BigEndian>()
            .or(Err(Error::Platform(PlatformError::InvalidDeviceResponse)))?;

        let mut offset = FIXED_HEADER_LEN;

        let attested_credential = if flags.contains(AuthenticatorDataFlags::ATTESTED_CREDENTIAL) {
            let (attested, credential_len) = Self::parse_attested_credential(&raw[offset..])?;
            offset += credential_len;
            Some(attested)
        } else {
            None
        };

        let extensions = if flags.contains(AuthenticatorDataFlags::EXTENSION_DATA) {
            if offset >= raw.len() {
                error!("Extension flag is set but no extension data is present");
                return Err(Error::Platform(PlatformError::InvalidDeviceResponse));
            }
            let outputs: Ctap2ExtensionOutputs =
                serde_cbor::from_slice(&raw[offset..]).map_err(|err| {
                    error!(%err, "Failed to decode extension output map");
                    Error::Platform(PlatformError::InvalidDeviceResponse)
                })?;
            Some(outputs)
        } else {
            if offset != raw.len() {
                error!(
                    { trailing = raw.len() - offset },
                    "Trailing bytes after authenticator data with no extension flag"
                );
                return Err(Error::Platform(PlatformError::InvalidDeviceResponse));
            }
            None
        };

        Ok(Self {
            rp_id_hash,
            flags,
            sign_count,
            attested_credential,
            extensions,
        })
    }

    fn parse_attested_credential(raw: &[u8]) -> Result<(AttestedCredentialData, usize), Error> {
        if raw.len() < AAGUID_LEN + 2 {
            error!({ len = raw.len() }, "Attested credential data is too short");
            return Err(Error::Platform(PlatformError::InvalidDeviceResponse));
        }

        let mut aaguid = [0u8; AAGUID_LEN];
        aaguid.copy_from_slice(&raw[0..AAGUID_LEN]);

        let credential_id_len = IOCursor::new(&raw[AAGUID_LEN..AAGUID_LEN + 2])
            .read_u16::<BigEndian>()
            .or(Err(Error::Platform(PlatformError::InvalidDeviceResponse)))?
            as usize;
        let key_offset = AAGUID_LEN + 2 + credential_id_len;
        if raw.len() < key_offset {
            error!("Attested credential id is truncated");
            return Err(Error::Platform(PlatformError::InvalidDeviceResponse));
        }
        let credential_id = raw[AAGUID_LEN + 2..key_offset].to_vec();

        let mut deserializer = serde_cbor::Deserializer::from_slice(&raw[key_offset..]);
        let credential_public_key: Value = serde::de::Deserialize::deserialize(&mut deserializer)
            .map_err(|err| {
            error!(%err, "Failed to decode attested credential public key");
            Error::Platform(PlatformError::InvalidDeviceResponse)
        })?;
        let consumed = key_offset + deserializer.byte_offset();

        Ok((
            AttestedCredentialData {
                aaguid,
                credential_id,
                credential_public_key,
            },
            consumed,
        ))
    }

    pub fn user_present(&self) -> bool {
        self.flags.contains(AuthenticatorDataFlags::USER_PRESENT)
    }

    pub fn user_verified(&self) -> bool {
        self.flags.contains(AuthenticatorDataFlags::USER_VERIFIED)
    }
}
