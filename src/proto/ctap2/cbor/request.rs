use serde::Serialize;
use serde_cbor::ser::to_vec;
use tracing::error;

use crate::proto::ctap2::model::Ctap2CommandCode;
use crate::transport::error::{Error, PlatformError};

/// A CTAP2 command ready for the wire: one command byte followed by the
/// CBOR-encoded parameter map (absent for parameterless commands).
#[derive(Debug, Clone)]
pub struct CborRequest {
    pub command: Ctap2CommandCode,
    pub encoded_data: Vec<u8>,
}

impl CborRequest {
    pub fn new(command: Ctap2CommandCode) -> Self {
        Self {
            command,
            encoded_data: vec![],
        }
    }

    pub fn from_request<T: Serialize>(
        command: Ctap2CommandCode,
        request: &T,
    ) -> Result<Self, Error> {
        let encoded_data = to_vec(request).map_err(|err| {
            error!(?command, %err, "Failed to encode CTAP2 request parameters");
            Error::Platform(PlatformError::SyntaxError)
        })?;
        Ok(Self {
            command,
            encoded_data,
        })
    }

    pub fn ctap_hid_data(&self) -> Vec<u8> {
        let mut data = vec![self.command as u8];
        data.extend(&self.encoded_data);
        data
    }
}
