//! Implements HID communication using the `async-hid` crate.

use std::{error::Error, fs};

use anyhow::{Context, Result, anyhow};
use async_hid::{
    AsyncHidRead,
    AsyncHidWrite,
    Device,
    DeviceId,
    DeviceInfo,
    DeviceReader,
    DeviceWriter,
    HidBackend,
};
use futures_lite::StreamExt;
use hidcore::{async_trait, caps::ReportType, transport::ReportTransport};
use itertools::Itertools;
use tokio::sync::Mutex;

/// An opened `async-hid` device.
pub struct AsyncHidTransport {
    reader: Mutex<DeviceReader>,
    writer: Mutex<DeviceWriter>,
    info: DeviceInfo,
}

impl AsyncHidTransport {
    pub async fn open(device: &Device) -> Result<Self> {
        let (reader, writer) = device.open().await.context("could not open the device")?;

        Ok(Self {
            reader: Mutex::new(reader),
            writer: Mutex::new(writer),
            info: (**device).clone(),
        })
    }

    pub fn info(&self) -> &DeviceInfo {
        &self.info
    }

    /// Reads the raw report descriptor of the device.
    pub fn report_descriptor(&self) -> Result<Vec<u8>> {
        let DeviceId::DevPath(ref path) = self.info.id else {
            return Err(anyhow!(
                "report descriptors are currently only supported on Linux"
            ));
        };

        let descriptor_path = path.join("device/report_descriptor");
        fs::read(&descriptor_path)
            .with_context(|| format!("could not read {}", descriptor_path.display()))
    }
}

#[async_trait]
impl ReportTransport for AsyncHidTransport {
    async fn get_report(
        &self,
        report_type: ReportType,
        _report_id: u8,
        _buf: &mut [u8],
    ) -> Result<usize, Box<dyn Error + Sync + Send>> {
        Err(anyhow!("getting {report_type:?} reports is not supported").into_boxed_dyn_error())
    }

    async fn set_report(
        &self,
        report_type: ReportType,
        report_id: u8,
        data: &[u8],
    ) -> Result<(), Box<dyn Error + Sync + Send>> {
        if report_type != ReportType::Output {
            return Err(
                anyhow!("setting {report_type:?} reports is not supported").into_boxed_dyn_error()
            );
        }

        let mut guard = self.writer.lock().await;

        // Trees built from descriptors lead reports with their ID already.
        // Reports without an ID still need the zero ID prefix on the wire.
        if report_id == 0 {
            let mut prefixed = Vec::with_capacity(data.len() + 1);
            prefixed.push(0);
            prefixed.extend_from_slice(data);
            guard.write_output_report(&prefixed).await?;
        } else {
            guard.write_output_report(data).await?;
        }

        Ok(())
    }

    async fn read_report(&self, buf: &mut [u8]) -> Result<usize, Box<dyn Error + Sync + Send>> {
        let mut guard = self.reader.lock().await;
        Ok(guard.read_input_report(buf).await?)
    }
}

/// Lists all HID devices on the local machine, once per device.
pub async fn enumerate() -> Result<Vec<Device>> {
    let hid = HidBackend::default();
    let devices = hid
        .enumerate()
        .await?
        .collect::<Vec<Device>>()
        .await
        .into_iter()
        .unique_by(|x| x.id.clone())
        .collect();

    Ok(devices)
}
