pub mod ctap2;
pub mod error;

pub use error::CtapError;
