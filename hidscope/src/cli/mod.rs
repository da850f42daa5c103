mod inspect;
mod monitor;
mod post;
mod route;

use std::{
    error::Error,
    fs,
    path::PathBuf,
    sync::{Mutex, PoisonError},
};

use anyhow::{Context, Result, anyhow, bail};
use clap::{Args, Parser, Subcommand, ValueEnum};
use hidcore::{
    async_trait,
    caps::{CapabilityTable, ReportType},
    transaction::OutgoingReport,
    transport::ReportTransport,
};
use inspect::InspectCommand;
use monitor::MonitorCommand;
use post::PostCommand;
use route::RouteCommand;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(version, about, long_about = None)]
struct Cli {
    #[command(flatten)]
    color: colorchoice_clap::Color,

    #[command(subcommand)]
    command: Commands,

    /// Output plain JSON without color and interactivity
    #[arg(short, long, global = true)]
    json: bool,

    /// Increase logging verbosity (-v, -vv, -vvv)
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,
}

#[derive(Subcommand)]
enum Commands {
    Inspect(InspectCommand),
    Route(RouteCommand),
    Post(PostCommand),
    Monitor(MonitorCommand),
}

pub async fn execute() -> Result<()> {
    let cli = Cli::parse();

    cli.color.write_global();
    init_logging(cli.verbose);

    match &cli.command {
        Commands::Inspect(cmd) => cmd.execute(&cli).await,
        Commands::Route(cmd) => cmd.execute(&cli).await,
        Commands::Post(cmd) => cmd.execute(&cli).await,
        Commands::Monitor(cmd) => cmd.execute(&cli).await,
    }
}

/// Logs to stderr, honoring `RUST_LOG` over the verbosity flag.
fn init_logging(verbose: u8) {
    let level = match verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };

    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level)))
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_writer(std::io::stderr),
        )
        .init();
}

/// Where the capabilities of an offline device come from.
#[derive(Args)]
#[group(required = true, multiple = false)]
struct SourceArgs {
    /// A raw binary report descriptor
    #[arg(short, long, value_name = "FILE")]
    descriptor: Option<PathBuf>,

    /// A capability table in JSON
    #[arg(short, long, value_name = "FILE")]
    caps: Option<PathBuf>,
}

impl SourceArgs {
    fn load(&self) -> Result<CapabilityTable> {
        if let Some(path) = &self.descriptor {
            let bytes = fs::read(path)
                .with_context(|| format!("could not read {}", path.display()))?;
            return CapabilityTable::from_descriptor(&bytes)
                .context("could not parse the report descriptor");
        }

        if let Some(path) = &self.caps {
            let json = fs::read_to_string(path)
                .with_context(|| format!("could not read {}", path.display()))?;
            return serde_json::from_str(&json).context("could not parse the capability table");
        }

        bail!("either a descriptor or a capability table is required")
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Debug, ValueEnum)]
enum ReportTypeArg {
    Input,
    Output,
    Feature,
}

impl From<ReportTypeArg> for ReportType {
    fn from(value: ReportTypeArg) -> Self {
        match value {
            ReportTypeArg::Input => ReportType::Input,
            ReportTypeArg::Output => ReportType::Output,
            ReportTypeArg::Feature => ReportType::Feature,
        }
    }
}

/// Parses hex bytes, optionally separated by whitespace, colons or dashes.
fn parse_hex(input: &str) -> Result<Vec<u8>> {
    let digits: String = input
        .chars()
        .filter(|c| !c.is_whitespace() && *c != ':' && *c != '-')
        .collect();
    let digits = digits.strip_prefix("0x").unwrap_or(&digits);

    if let Some(c) = digits.chars().find(|c| !c.is_ascii_hexdigit()) {
        bail!("invalid hex digit {c:?} in {input:?}");
    }
    if digits.len() % 2 != 0 {
        bail!("odd number of hex digits in {input:?}");
    }

    (0..digits.len())
        .step_by(2)
        .map(|i| {
            u8::from_str_radix(&digits[i..i + 2], 16)
                .with_context(|| format!("invalid hex byte {:?}", &digits[i..i + 2]))
        })
        .collect()
}

fn format_hex(bytes: &[u8]) -> String {
    bytes
        .iter()
        .map(|byte| format!("{byte:02x}"))
        .collect::<Vec<_>>()
        .join(" ")
}

/// A transport for devices that only exist as a descriptor. Sent reports are
/// recorded, nothing can be read.
#[derive(Default)]
struct OfflineTransport {
    sent: Mutex<Vec<OutgoingReport>>,
}

impl OfflineTransport {
    fn take_sent(&self) -> Vec<OutgoingReport> {
        std::mem::take(&mut *self.sent.lock().unwrap_or_else(PoisonError::into_inner))
    }
}

#[async_trait]
impl ReportTransport for OfflineTransport {
    async fn get_report(
        &self,
        _report_type: ReportType,
        _report_id: u8,
        _buf: &mut [u8],
    ) -> Result<usize, Box<dyn Error + Sync + Send>> {
        Err(anyhow!("offline devices have no reports to get").into_boxed_dyn_error())
    }

    async fn set_report(
        &self,
        report_type: ReportType,
        report_id: u8,
        data: &[u8],
    ) -> Result<(), Box<dyn Error + Sync + Send>> {
        self.sent
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(OutgoingReport {
                report_type,
                report_id,
                data: data.to_vec(),
            });
        Ok(())
    }

    async fn read_report(&self, _buf: &mut [u8]) -> Result<usize, Box<dyn Error + Sync + Send>> {
        Err(anyhow!("offline devices send no input reports").into_boxed_dyn_error())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_hex_reports() {
        assert_eq!(parse_hex("83 00").unwrap(), vec![0x83, 0x00]);
        assert_eq!(parse_hex("0x0102ff").unwrap(), vec![0x01, 0x02, 0xff]);
        assert_eq!(parse_hex("de:ad-be ef").unwrap(), vec![0xde, 0xad, 0xbe, 0xef]);
        assert!(parse_hex("123").is_err());
        assert!(parse_hex("zz").is_err());
        assert!(parse_hex("€a").is_err());
        assert!(parse_hex("0xé").is_err());
    }

    #[test]
    fn formats_hex_reports() {
        assert_eq!(format_hex(&[0x03, 0xa0]), "03 a0");
        assert_eq!(format_hex(&[]), "");
    }

    #[test]
    fn parses_verbosity_and_sources() {
        let cli = Cli::try_parse_from(["hidscope", "-vv", "inspect", "--descriptor", "mouse.bin"])
            .unwrap();
        assert_eq!(cli.verbose, 2);
        assert!(!cli.json);

        assert!(
            Cli::try_parse_from(["hidscope", "inspect", "--descriptor", "a", "--caps", "b"])
                .is_err()
        );
        assert!(Cli::try_parse_from(["hidscope", "inspect"]).is_err());
    }
}
