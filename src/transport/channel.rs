use std::fmt::Display;
use std::time::Duration;

use crate::proto::ctap2::cbor::{CborRequest, CborResponse};
use crate::transport::error::Error;

/// One logical session with an authenticator, able to carry CBOR-encoded
/// CTAP2 commands. Implementations own the underlying transport handle
/// exclusively for the lifetime of the channel.
pub trait Channel: Send + Display {
    fn cbor_send(&mut self, request: &CborRequest, timeout: Duration) -> Result<(), Error>;

    fn cbor_recv(&mut self, timeout: Duration) -> Result<CborResponse, Error>;

    /// Requests cancellation of the in-flight command, if any.
    fn cancel(&mut self) -> Result<(), Error>;

    /// Releases the transport handle. The channel is unusable afterwards.
    fn close(&mut self);
}
