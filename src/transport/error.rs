pub use crate::proto::CtapError;

use crate::proto::ctap2::Ctap2CommandCode;

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum PlatformError {
    PinTooShort,
    PinTooLong,
    PinNotSupported,
    PinNotSet,
    PinUvAuthTokenRequired,
    NoPinUvAuthProtocol,
    InvalidPinUvAuthProtocol,
    UnsupportedExtension,
    ConflictingExtensions,
    InvalidSaltSize,
    InvalidBlockLength,
    SyntaxError,
    NotSupported,
    InvalidDeviceResponse,
}

impl std::error::Error for PlatformError {}

impl std::fmt::Display for PlatformError {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{:?}", self)
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum TransportError {
    ConnectionFailed,
    ConnectionLost,
    InvalidEndpoint,
    InvalidFraming,
    InvalidChannel,
    InvalidSequence,
    MessageTooLarge,
    TransportUnavailable,
    Timeout,
}

impl std::error::Error for TransportError {}

impl std::fmt::Display for TransportError {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{:?}", self)
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Error {
    Transport(TransportError),
    /// Device-signaled error on the CTAPHID layer (CTAPHID_ERROR report).
    Ctap(CtapError),
    /// Non-OK status byte in a CBOR response, with the originating command.
    Command(Ctap2CommandCode, CtapError),
    Platform(PlatformError),
}

impl std::error::Error for Error {}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            Error::Command(command, error) => write!(f, "{:?} failed: {}", command, error),
            other => write!(f, "{:?}", other),
        }
    }
}

impl From<CtapError> for Error {
    fn from(error: CtapError) -> Self {
        Error::Ctap(error)
    }
}

impl From<TransportError> for Error {
    fn from(error: TransportError) -> Self {
        Error::Transport(error)
    }
}

impl From<PlatformError> for Error {
    fn from(error: PlatformError) -> Self {
        Error::Platform(error)
    }
}
