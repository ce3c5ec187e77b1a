use super::Result;
use crate::cli::RunnerConfig;
use crate::collector::{self, Summary};
use crate::command_line::CommandLine;
use crate::log_checks;
use crate::report::{self, Report};
use crate::supervisor::{FailureReason, RunResult, Supervisor};
use crate::validator::{self, ValidationReport};
use chrono::Utc;
use eyre::WrapErr;
use std::path::{Path, PathBuf};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

pub const EXIT_OK: u8 = 0;
pub const EXIT_FAILED: u8 = 1;
pub const EXIT_CONFIG: u8 = 2;
pub const EXIT_INTERRUPTED: u8 = 130;

/// Everything a finished session produced
#[derive(Debug)]
pub struct Outcome {
    pub session_dir: PathBuf,
    pub results: Vec<RunResult>,
    pub summary: Summary,
    pub report: Report,
    pub validation: Option<ValidationReport>,
    pub interrupted: bool,
}

impl Outcome {
    /// Worst outcome wins: interruption, then any failure.
    pub fn exit_code(&self) -> u8 {
        if self.interrupted {
            EXIT_INTERRUPTED
        } else if !self.summary.all_passed()
            || self.validation.as_ref().is_some_and(|v| !v.passed())
        {
            EXIT_FAILED
        } else {
            EXIT_OK
        }
    }
}

/// Runs a whole session: resolve, supervise each scenario in turn, collect, report,
/// then validate.
///
/// Configuration problems are returned as errors before any process is launched.
/// Scenario failures are part of the outcome.
pub async fn run(config: &RunnerConfig, cancel: &CancellationToken) -> Result<Outcome> {
    let scenarios = config.registry.resolve(&config.selection, &config.defaults)?;
    for scenario in &scenarios {
        for check in &scenario.checks {
            log_checks::compile(&check.pattern)?;
        }
    }
    CommandLine::parse(&config.supervisor.subject_command)?;
    let supervisor = Supervisor::new(config.supervisor.clone())?;

    let session_dir = create_session_dir(&config.work_root)?;
    info!(
        "Running {} scenario(s) in {}",
        scenarios.len(),
        session_dir.display()
    );

    let mut results = Vec::with_capacity(scenarios.len());
    let mut interrupted = false;
    for scenario in &scenarios {
        if cancel.is_cancelled() {
            interrupted = true;
            break;
        }

        let result = supervisor.run(scenario, &session_dir, cancel).await?;
        match &result.reason {
            None => info!("[PASS] {} ({:.1}s)", result.scenario, result.elapsed_secs),
            Some(reason) => error!("[FAIL] {}: {}", result.scenario, reason),
        }
        let stop = result.reason == Some(FailureReason::Interrupted);
        results.push(result);
        if stop {
            interrupted = true;
            break;
        }
    }
    if interrupted {
        warn!(
            "Interrupted after {} of {} scenario(s)",
            results.len(),
            scenarios.len()
        );
    }

    let summary = collector::collect(&results);
    info!(
        "Summary: {} passed, {} failed of {} ({:.1}s)",
        summary.passed, summary.failed, summary.total, summary.total_duration_secs
    );

    let report = report::build(&summary, &results)?;
    report::write_reports(
        &report,
        config.report_json.as_deref(),
        config.html_report.as_deref(),
    )?;

    let validation = match &config.validation {
        Some(validation) if !interrupted => {
            let outcome = validator::validate(
                &session_dir,
                &validation.pattern,
                &validation.ranges,
                &validation.options,
            )?;
            if let Some(path) = &validation.json_out {
                outcome.write_json(path)?;
                info!("Validation report written to {}", path.display());
            }
            Some(outcome)
        }
        _ => None,
    };

    Ok(Outcome {
        session_dir,
        results,
        summary,
        report,
        validation,
        interrupted,
    })
}

/// `<work_root>/work/run-<UTC timestamp>`
fn create_session_dir(work_root: &Path) -> Result<PathBuf> {
    let name = format!("run-{}", Utc::now().format("%Y%m%dT%H%M%SZ"));
    let dir = work_root.join("work").join(name);
    std::fs::create_dir_all(&dir)
        .wrap_err_with(|| format!("failed to create session directory {}", dir.display()))?;
    Ok(dir)
}
