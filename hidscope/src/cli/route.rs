use std::io::{BufWriter, Write};

use anyhow::{Context, Result};
use clap::Args;
use hidcore::{device::HidDevice, element::Cookie, tree::ElementTree};
use owo_colors::OwoColorize;
use serde::Serialize;
use serde_json::json;

use super::{Cli, OfflineTransport, ReportTypeArg, SourceArgs, format_hex, parse_hex};

/// Route raw reports through the element tree of a device and view the
/// resulting element values.
#[derive(Args)]
pub struct RouteCommand {
    #[command(flatten)]
    source: SourceArgs,

    /// The type of the reports
    #[arg(short = 't', long = "type", value_enum, default_value = "input")]
    report_type: ReportTypeArg,

    /// Only show values that differ from zero
    #[arg(long)]
    nonzero: bool,

    /// The reports to route, in hex, including the report ID if the device
    /// uses report IDs
    #[arg(required = true, value_name = "REPORT")]
    reports: Vec<String>,
}

impl RouteCommand {
    pub async fn execute(&self, root: &Cli) -> Result<()> {
        let mut stdout = BufWriter::new(anstream::stdout());

        let table = self.source.load()?;
        let device = HidDevice::new(OfflineTransport::default(), &table)
            .context("could not build the element tree")?;
        device.set_ready(true);

        let mut routed = Vec::with_capacity(self.reports.len());
        for report in &self.reports {
            let data = parse_hex(report)?;
            let changed = device
                .route(&data, self.report_type.into())
                .with_context(|| format!("could not route report {report:?}"))?;
            routed.push(RoutedReport { data, changed });
        }

        let values: Vec<_> = device
            .with_tree(collect_values)
            .into_iter()
            .filter(|value| !self.nonzero || value.raw.iter().any(|word| *word != 0))
            .collect();

        if root.json {
            writeln!(stdout, "{}", json!({ "reports": routed, "values": values })).unwrap();
            return Ok(());
        }

        for report in &routed {
            writeln!(
                stdout,
                "{} {}",
                format_hex(&report.data),
                if report.changed {
                    "changed".green().into_styled()
                } else {
                    "unchanged".bright_black().into_styled()
                }
            )
            .unwrap();
        }
        writeln!(stdout).unwrap();

        if values.is_empty() {
            writeln!(stdout, "{}", "No values to show.".bright_black()).unwrap();
        }

        for value in values {
            writeln!(
                stdout,
                "{} ({:#06x}:{:#06x}) = {} {}",
                value.cookie.bright_black(),
                value.usage_page,
                value.usage,
                value.value.blue(),
                format!("{:x?}", value.raw).bright_black()
            )
            .unwrap();
        }

        stdout.flush().unwrap();

        Ok(())
    }
}

fn collect_values(tree: &ElementTree) -> Vec<RoutedValue> {
    tree.data_elements()
        .map(|element| RoutedValue {
            cookie: element.cookie(),
            usage_page: element.usage_page(),
            usage: element.usage(),
            value: element.logical_value(),
            raw: element.raw_value().to_vec(),
        })
        .collect()
}

#[derive(Clone, PartialEq, Eq, Hash, Debug, Serialize)]
struct RoutedReport {
    data: Vec<u8>,
    changed: bool,
}

#[derive(Clone, PartialEq, Eq, Hash, Debug, Serialize)]
struct RoutedValue {
    cookie: Cookie,
    usage_page: u16,
    usage: u16,
    value: i64,
    raw: Vec<u32>,
}
