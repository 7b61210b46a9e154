pub mod channel;
pub mod framing;

pub use channel::HidChannel;
