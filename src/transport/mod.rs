pub mod channel;
pub mod device;
pub mod error;
pub mod hid;

pub use channel::Channel;
pub use device::{list_fido_devices, DeviceDescriptor, HidBackend, HidDeviceIo, ReportLayout};
