pub mod ops;
pub mod pin;
pub mod proto;
pub mod transport;
pub mod webauthn;

#[macro_use]
extern crate num_derive;

#[macro_use]
extern crate bitflags;

pub use webauthn::{Assertions, Device};
