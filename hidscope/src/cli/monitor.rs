use std::{
    collections::HashMap,
    io::{BufWriter, Write},
};

use anyhow::{Context, Result, bail};
use clap::Args;
use hidcore::{
    bits,
    caps::CapabilityTable,
    device::HidDevice,
    subscription::{ElementEvent, EventQueue},
};
use owo_colors::OwoColorize;
use serde_json::json;
use tracing::{debug, warn};

use super::Cli;
use crate::async_hid_impl::{AsyncHidTransport, enumerate};

/// Watch the element values of a connected device change. Lists all devices
/// if none is selected.
#[derive(Args)]
pub struct MonitorCommand {
    /// Vendor ID (hex, e.g. 0x046d)
    #[arg(long, value_parser = parse_hex_u16, requires = "pid")]
    vid: Option<u16>,

    /// Product ID (hex, e.g. 0xc52b)
    #[arg(long, value_parser = parse_hex_u16, requires = "vid")]
    pid: Option<u16>,
}

impl MonitorCommand {
    pub async fn execute(&self, root: &Cli) -> Result<()> {
        let mut stdout = BufWriter::new(anstream::stdout());

        let devices = enumerate().await?;

        let (Some(vid), Some(pid)) = (self.vid, self.pid) else {
            let infos: Vec<_> = devices.iter().map(|dev| (**dev).clone()).collect();

            if root.json {
                let listed: Vec<_> = infos
                    .iter()
                    .map(|info| {
                        json!({
                            "name": info.name,
                            "vendor_id": info.vendor_id,
                            "product_id": info.product_id,
                        })
                    })
                    .collect();
                writeln!(stdout, "{}", json!(listed)).unwrap();
                return Ok(());
            }

            if infos.is_empty() {
                writeln!(stdout, "{}", "No HID devices were found.".bright_black()).unwrap();
            }
            for info in infos {
                writeln!(
                    stdout,
                    "{:#06x}:{:#06x} {}",
                    info.vendor_id.bright_black(),
                    info.product_id.bright_black(),
                    info.name
                )
                .unwrap();
            }

            stdout.flush().unwrap();
            return Ok(());
        };

        let (transport, table) = open_matching(devices, vid, pid).await?;
        let name = transport.info().name.clone();
        let device =
            HidDevice::new(transport, &table).context("could not build the element tree")?;

        let (queue, events) = EventQueue::unbounded();
        let fields = device.with_tree(|tree| {
            tree.data_elements()
                .map(|element| {
                    (element.cookie(), WatchedField {
                        usage_page: element.usage_page(),
                        usage: element.usage(),
                        signed: element.range().is_some_and(|range| range.signed),
                        bit_width: element.field().map_or(0, |field| field.bit_width),
                    })
                })
                .collect::<HashMap<_, _>>()
        });
        for cookie in fields.keys() {
            device.subscribe(*cookie, &queue)?;
        }

        if !root.json {
            writeln!(
                stdout,
                "Monitoring {} ({} elements), press Ctrl+C to stop.",
                name.bright_blue(),
                fields.len()
            )
            .unwrap();
            stdout.flush().unwrap();
        }

        device.start();

        loop {
            let event = tokio::select! {
                _ = tokio::signal::ctrl_c() => break,
                event = events.recv_async() => match event {
                    Ok(event) => event,
                    Err(_) => break,
                },
            };

            if root.json {
                writeln!(stdout, "{}", json!(event)).unwrap();
            } else {
                write_event(&mut stdout, &event, fields.get(&event.cookie));
            }
            stdout.flush().unwrap();
        }

        device.stop();

        Ok(())
    }
}

/// What is needed to print the events of a data element.
struct WatchedField {
    usage_page: u16,
    usage: u16,
    signed: bool,
    bit_width: u32,
}

fn write_event(stdout: &mut impl Write, event: &ElementEvent, field: Option<&WatchedField>) {
    let Some(field) = field else {
        return;
    };

    let raw = event.value.first().copied().unwrap_or(0);
    let value = if field.signed {
        i64::from(bits::sign_extend(raw, field.bit_width.min(32)))
    } else {
        i64::from(raw)
    };

    writeln!(
        stdout,
        "{:>14} {} ({:#06x}:{:#06x}) = {}",
        format!("{}.{:09}", event.timestamp / 1_000_000_000, event.timestamp % 1_000_000_000)
            .bright_black(),
        event.cookie.bright_black(),
        field.usage_page,
        field.usage,
        value.blue()
    )
    .unwrap();
}

/// Opens the first interface of a device that has a usable report
/// descriptor.
async fn open_matching(
    devices: Vec<async_hid::Device>,
    vid: u16,
    pid: u16,
) -> Result<(AsyncHidTransport, CapabilityTable)> {
    for dev in devices {
        let info = (*dev).clone();
        if info.vendor_id != vid || info.product_id != pid {
            continue;
        }

        let transport = match AsyncHidTransport::open(&dev).await {
            Ok(transport) => transport,
            Err(err) => {
                warn!("skipping interface of {}: {err:#}", info.name);
                continue;
            },
        };

        let table = match transport
            .report_descriptor()
            .and_then(|bytes| Ok(CapabilityTable::from_descriptor(&bytes)?))
        {
            Ok(table) => table,
            Err(err) => {
                warn!("skipping interface of {}: {err:#}", info.name);
                continue;
            },
        };

        debug!(
            collections = table.collections.len(),
            "opened interface of {}", info.name
        );
        return Ok((transport, table));
    }

    bail!("no usable device {vid:#06x}:{pid:#06x} was found")
}

fn parse_hex_u16(s: &str) -> Result<u16, String> {
    let s = s.trim_start_matches("0x").trim_start_matches("0X");
    u16::from_str_radix(s, 16).map_err(|e| format!("invalid hex value '{s}': {e}"))
}
