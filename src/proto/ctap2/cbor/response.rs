use serde::de::DeserializeOwned;
use tracing::error;

use crate::proto::error::CtapError;
use crate::transport::error::{Error, PlatformError, TransportError};

/// A CTAP2 response as read off the wire: one status byte, optionally
/// followed by a CBOR-encoded body.
#[derive(Debug, Clone)]
pub struct CborResponse {
    pub status_code: CtapError,
    pub data: Option<Vec<u8>>,
}

impl CborResponse {
    pub fn decoded<T: DeserializeOwned>(&self) -> Result<T, Error> {
        let Some(data) = &self.data else {
            error!("CTAP2 response has no body where one was expected");
            return Err(Error::Platform(PlatformError::InvalidDeviceResponse));
        };
        serde_cbor::from_slice(data).map_err(|err| {
            error!(%err, "Failed to decode CTAP2 response body");
            Error::Platform(PlatformError::InvalidDeviceResponse)
        })
    }
}

impl TryFrom<&Vec<u8>> for CborResponse {
    type Error = Error;

    fn try_from(payload: &Vec<u8>) -> Result<Self, Self::Error> {
        if payload.is_empty() {
            return Err(Error::Transport(TransportError::InvalidFraming));
        }

        let Ok(status_code) = CtapError::try_from(payload[0]) else {
            error!({ code = ?payload[0] }, "Invalid CTAP status code");
            return Err(Error::Transport(TransportError::InvalidFraming));
        };

        let data = if payload.len() > 1 {
            Some(Vec::from(&payload[1..]))
        } else {
            None
        };
        Ok(CborResponse { status_code, data })
    }
}
