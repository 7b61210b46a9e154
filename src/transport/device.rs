use std::fmt;
use std::time::Duration;

use tracing::{debug, info};

use crate::transport::error::Error;

pub const FIDO_USAGE_PAGE: u16 = 0xF1D0;
pub const FIDO_USAGE: u16 = 0x0001;

/// Report sizes and addressing, derived from the device's HID report
/// descriptor. Parsed once by the backend at enumeration time.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct ReportLayout {
    pub usage_page: u16,
    pub usage: u16,
    pub input_report_len: usize,
    pub output_report_len: usize,
    /// Whether reports on this device carry an explicit report-id byte.
    pub numbered_reports: bool,
}

impl Default for ReportLayout {
    fn default() -> Self {
        Self {
            usage_page: FIDO_USAGE_PAGE,
            usage: FIDO_USAGE,
            input_report_len: 64,
            output_report_len: 64,
            numbered_reports: false,
        }
    }
}

#[derive(Debug, Clone)]
pub struct DeviceDescriptor {
    /// Platform-specific device path.
    pub path: String,
    pub vendor_id: u16,
    pub product_id: u16,
    pub manufacturer: String,
    pub product: String,
    pub serial_number: String,
    pub report: ReportLayout,
}

impl fmt::Display for DeviceDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:} {:} ({:04x}:{:04x})",
            self.manufacturer, self.product, self.vendor_id, self.product_id
        )
    }
}

/// Raw HID access to a single open device. Implemented by platform
/// backends outside this crate; the protocol core never touches platform
/// APIs directly.
pub trait HidDeviceIo: Send {
    fn layout(&self) -> &ReportLayout;

    /// Blocks until an input report arrives or `timeout` elapses.
    fn get_input_report(&mut self, timeout: Duration) -> Result<(u8, Vec<u8>), Error>;

    fn set_output_report(&mut self, report_id: u8, data: &[u8]) -> Result<usize, Error>;

    fn close(&mut self) -> Result<(), Error>;
}

/// Device enumeration and open, implemented per target platform.
pub trait HidBackend {
    fn enumerate(&self) -> Result<Vec<DeviceDescriptor>, Error>;

    fn open(
        &self,
        descriptor: &DeviceDescriptor,
        exclusive: bool,
    ) -> Result<Box<dyn HidDeviceIo>, Error>;
}

/// Lists connected devices which advertise the FIDO usage page.
pub fn list_fido_devices(backend: &dyn HidBackend) -> Result<Vec<DeviceDescriptor>, Error> {
    let devices: Vec<_> = backend
        .enumerate()?
        .into_iter()
        .filter(|descriptor| descriptor.report.usage_page == FIDO_USAGE_PAGE)
        .filter(|descriptor| descriptor.report.usage == FIDO_USAGE)
        .collect();
    info!({ count = devices.len() }, "Listing available FIDO HID devices");
    debug!(?devices);
    Ok(devices)
}
