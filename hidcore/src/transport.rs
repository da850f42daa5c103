//! Defines the bridge between the element engine and an actual HID device.

use std::error::Error;

use async_trait::async_trait;

use crate::caps::ReportType;

/// Represents an arbitrary HID transport able to exchange whole reports with a
/// device. It has to support async I/O.
///
/// Report buffers are laid out like the element fields address them. They
/// start with the report ID byte if the device uses several report IDs, or if
/// the fields of a report with a non-zero ID leave its first byte free, and
/// with the first data byte otherwise.
#[async_trait]
pub trait ReportTransport: Send + Sync + 'static {
    /// Requests a report from the device and writes it into `buf`.
    ///
    /// Returns the exact amount of written bytes on success.
    async fn get_report(
        &self,
        report_type: ReportType,
        report_id: u8,
        buf: &mut [u8],
    ) -> Result<usize, Box<dyn Error + Sync + Send>>;

    /// Sends a report to the device.
    async fn set_report(
        &self,
        report_type: ReportType,
        report_id: u8,
        data: &[u8],
    ) -> Result<(), Box<dyn Error + Sync + Send>>;

    /// Waits for the next input report the device sends on its own.
    ///
    /// If the buffer is not large enough to fit the whole report, its remainder
    /// should be discarded.
    ///
    /// Returns the exact amount of read bytes on success.
    async fn read_report(&self, buf: &mut [u8]) -> Result<usize, Box<dyn Error + Sync + Send>>;
}
