//! An element engine for HID devices.
//!
//! A HID device describes its reports in a report descriptor. This crate
//! takes the flattened capabilities of such a descriptor (collections, buttons
//! and values) and turns them into a tree of addressable *elements*. Every
//! element is referenced by a stable [`element::Cookie`].
//!
//! Once the tree is built, the crate keeps the values of all elements current:
//!
//! - arriving input reports are routed to exactly the elements they carry,
//!   sub-byte and cross-byte bit fields included
//! - batches of elements can be refreshed by requesting their reports from the
//!   device, fetching every report only once
//! - batches of elements can be written to the device, one report per
//!   distinct report ID, carrying the values of all elements of that report
//! - clients can subscribe to value changes of single elements
//!
//! All values are mirrored into a shared value store which can be read
//! without taking any lock.
//!
//! # Quickstart
//!
//! ## Describe the device
//!
//! The crate does not parse report descriptors on its own. Capabilities are
//! provided by a [`caps::CapabilitySource`]. [`caps::CapabilityTable`] is an
//! in-memory implementation that can either be filled by hand or produced
//! from raw descriptor bytes via [`caps::CapabilityTable::from_descriptor`].
//!
//! ## Establish HID communication
//!
//! This crate implements the element engine, not the underlying
//! [HID](https://en.wikipedia.org/wiki/Human_interface_device) communication,
//! which is left to an external crate of your choice. The trait used for
//! bridging your HID implementation to this crate is
//! [`transport::ReportTransport`], so make sure to provide an implementation
//! for it. The trait defines async methods using [`mod@async_trait`], which is
//! re-exported for annotating your implementing type.
//!
//! ```
//! use std::error::Error;
//!
//! use hidcore::{
//!     async_trait,
//!     caps::{ButtonCap, CapabilityTable, CollectionNode, ReportType, ValueCap},
//!     device::HidDevice,
//!     element::Cookie,
//!     transport::ReportTransport,
//! };
//!
//! struct Device;
//!
//! #[async_trait]
//! impl ReportTransport for Device {
//!     async fn get_report(
//!         &self,
//!         _report_type: ReportType,
//!         _report_id: u8,
//!         buf: &mut [u8],
//!     ) -> Result<usize, Box<dyn Error + Sync + Send>> {
//!         buf[..2].copy_from_slice(&[0x83, 0x00]);
//!         Ok(2)
//!     }
//!
//!     async fn set_report(
//!         &self,
//!         _report_type: ReportType,
//!         _report_id: u8,
//!         _data: &[u8],
//!     ) -> Result<(), Box<dyn Error + Sync + Send>> {
//!         Ok(())
//!     }
//!
//!     async fn read_report(&self, _buf: &mut [u8]) -> Result<usize, Box<dyn Error + Sync + Send>> {
//!         futures::future::pending().await
//!     }
//! }
//!
//! // One application collection holding a button (bit 0) and an 8 bit value
//! // (bits 1 to 8) of the same input report.
//! let mut table = CapabilityTable::new();
//! let app = table.add_collection(CollectionNode::default());
//! table.add_button(ReportType::Input, ButtonCap {
//!     parent: app,
//!     bit_offset: 0,
//!     ..Default::default()
//! });
//! table.add_value(ReportType::Input, ValueCap {
//!     parent: app,
//!     bit_offset: 1,
//!     bit_width: 8,
//!     logical_max: 255,
//!     ..Default::default()
//! });
//!
//! let device = HidDevice::new(Device, &table).expect("could not build the element tree");
//! device.set_ready(true);
//!
//! // Both elements share a report, which is requested once.
//! futures::executor::block_on(device.update_element_values(&[Cookie(2), Cookie(3)]))
//!     .expect("could not update element values");
//!
//! assert_eq!(device.logical_value(Cookie(2)), Some(1));
//! assert_eq!(device.logical_value(Cookie(3)), Some(0x41));
//! ```
//!
//! Input reports the device sends on its own are routed by a reader thread
//! started with [`device::HidDevice::start`]. Value changes are delivered to
//! [`subscription::EventQueue`]s registered via
//! [`device::HidDevice::subscribe`].

pub use async_trait::async_trait;

pub mod bits;
pub mod caps;
mod descriptor;
pub mod device;
pub mod dispatch;
pub mod element;
pub mod event;
pub mod router;
pub mod store;
pub mod subscription;
pub mod transaction;
pub mod transport;
pub mod tree;
