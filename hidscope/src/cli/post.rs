use std::io::{BufWriter, Write};

use anyhow::{Context, Result, anyhow};
use clap::Args;
use hidcore::{device::HidDevice, element::Cookie};
use owo_colors::OwoColorize;
use serde_json::json;

use super::{Cli, OfflineTransport, SourceArgs, format_hex};

/// Stage element values and view the reports that would be sent to the
/// device.
#[derive(Args)]
pub struct PostCommand {
    #[command(flatten)]
    source: SourceArgs,

    /// The values to stage, as COOKIE=VALUE pairs
    #[arg(required = true, value_name = "COOKIE=VALUE", value_parser = parse_assignment)]
    values: Vec<(Cookie, i64)>,
}

impl PostCommand {
    pub async fn execute(&self, root: &Cli) -> Result<()> {
        let mut stdout = BufWriter::new(anstream::stdout());

        let table = self.source.load()?;
        let device = HidDevice::new(OfflineTransport::default(), &table)
            .context("could not build the element tree")?;

        for (cookie, value) in &self.values {
            device
                .set_element_value(*cookie, *value)
                .with_context(|| format!("could not stage a value on element {cookie}"))?;
        }

        let cookies: Vec<Cookie> = self.values.iter().map(|(cookie, _)| *cookie).collect();
        device
            .post_element_values(&cookies)
            .await
            .context("could not post the element values")?;

        let reports = device.transport().take_sent();

        if root.json {
            writeln!(stdout, "{}", json!(reports)).unwrap();
            return Ok(());
        }

        for report in reports {
            writeln!(
                stdout,
                "{:?} report {}: {}",
                report.report_type.green(),
                report.report_id.bright_blue(),
                format_hex(&report.data)
            )
            .unwrap();
        }

        stdout.flush().unwrap();

        Ok(())
    }
}

/// Parses `COOKIE=VALUE`, where the value is decimal or `0x` prefixed hex.
fn parse_assignment(input: &str) -> Result<(Cookie, i64)> {
    let (cookie, value) = input
        .split_once('=')
        .ok_or_else(|| anyhow!("expected COOKIE=VALUE, got {input:?}"))?;

    let cookie = cookie
        .trim()
        .trim_start_matches('#')
        .parse::<u32>()
        .with_context(|| format!("invalid cookie {cookie:?}"))?;

    let value = value.trim();
    let (negative, digits) = match value.strip_prefix('-') {
        Some(digits) => (true, digits),
        None => (false, value),
    };
    let magnitude = match digits.strip_prefix("0x") {
        Some(hex) => i64::from_str_radix(hex, 16),
        None => digits.parse::<i64>(),
    }
    .with_context(|| format!("invalid value {value:?}"))?;

    Ok((Cookie(cookie), if negative { -magnitude } else { magnitude }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_assignments() {
        assert_eq!(parse_assignment("3=10").unwrap(), (Cookie(3), 10));
        assert_eq!(parse_assignment("#7 = 0xff").unwrap(), (Cookie(7), 255));
        assert_eq!(parse_assignment("2=-0x10").unwrap(), (Cookie(2), -16));
        assert!(parse_assignment("2").is_err());
        assert!(parse_assignment("x=1").is_err());
        assert!(parse_assignment("1=abc").is_err());
    }
}
