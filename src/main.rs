use clap::Parser;
use std::process::ExitCode;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use stress_runner::cli::{Cli, RunnerConfig};
use stress_runner::orchestrator::{self, EXIT_CONFIG};
use stress_runner::{signals, Result};

#[tokio::main]
async fn main() -> Result<ExitCode> {
    // Initialize error handling and logging
    color_eyre::install()?;

    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();

    // Configuration problems exit before any process is launched
    let config = match RunnerConfig::from_cli(cli) {
        Ok(config) => config,
        Err(e) => {
            error!("{:#}", e);
            return Ok(ExitCode::from(EXIT_CONFIG));
        }
    };

    info!("stress-runner starting");

    let cancel = CancellationToken::new();
    let signal_task = signals::cancel_on_signal(cancel.clone())?;

    let code = match orchestrator::run(&config, &cancel).await {
        Ok(outcome) => {
            info!(
                "session {} finished: {}/{} passed",
                outcome.session_dir.display(),
                outcome.summary.passed,
                outcome.summary.total
            );
            outcome.exit_code()
        }
        Err(e) => {
            error!("{:#}", e);
            EXIT_CONFIG
        }
    };

    signal_task.abort();
    info!("stress-runner exiting with {}", code);
    Ok(ExitCode::from(code))
}
