use clap::Parser;
use std::process::ExitCode;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use stress_runner::cli::{ValidateCli, ValidateConfig};
use stress_runner::validator::{self, FileStatus};
use stress_runner::Result;

const EXIT_PASS: u8 = 0;
const EXIT_FAIL: u8 = 1;
const EXIT_CONFIG: u8 = 2;

/// Violations printed per file; the JSON report carries all of them.
const SHOWN_PER_FILE: usize = 5;

fn main() -> Result<ExitCode> {
    color_eyre::install()?;

    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = match ValidateConfig::from_cli(ValidateCli::parse()) {
        Ok(config) => config,
        Err(e) => {
            error!("{:#}", e);
            return Ok(ExitCode::from(EXIT_CONFIG));
        }
    };
    let validation = &config.validation;

    let report = match validator::validate(
        &config.data_dir,
        &validation.pattern,
        &validation.ranges,
        &validation.options,
    ) {
        Ok(report) => report,
        Err(e) => {
            error!("{}", e);
            return Ok(ExitCode::from(EXIT_CONFIG));
        }
    };

    for (path, file) in &report.files {
        match file.status {
            FileStatus::Ok => info!("{}: OK ({} lines)", path, file.stats.lines),
            status => {
                warn!("{}: {:?} ({} lines)", path, status, file.stats.lines);
                for violation in file.violations.iter().take(SHOWN_PER_FILE) {
                    let line = violation.line.map(|l| format!("line {}: ", l)).unwrap_or_default();
                    warn!("  {}{}", line, violation.message);
                }
                if file.violations.len() > SHOWN_PER_FILE {
                    warn!("  ... (+{} more)", file.violations.len() - SHOWN_PER_FILE);
                }
            }
        }
    }

    if let Some(path) = &validation.json_out {
        report.write_json(path)?;
        info!("JSON report written to {}", path.display());
    }

    Ok(ExitCode::from(if report.passed() {
        EXIT_PASS
    } else {
        EXIT_FAIL
    }))
}
