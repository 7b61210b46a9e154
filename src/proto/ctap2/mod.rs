pub mod cbor;

pub mod model;
mod protocol;

pub use model::*;
pub use protocol::Ctap2;
