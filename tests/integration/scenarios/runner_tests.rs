use crate::integration::infrastructure::{fixtures, RunnerHarness};
use anyhow::Result;
use std::time::Duration;
use stress_runner::report;
use stress_runner::supervisor::{FailureReason, RunStatus};
use stress_runner::process_manager::Role;

const LIMIT: Duration = Duration::from_secs(30);

/// A clean session exits 0 and writes both reports in run order
#[tokio::test]
async fn test_passing_session_writes_reports() -> Result<()> {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();

    let mut harness = RunnerHarness::new()?;
    let config = fixtures::write_config(harness.temp_path(), &[("OK2", ""), ("OK1", "")])?;
    let report_path = harness.report_path();
    let html_path = harness.temp_path().join("html/report.html");

    let code = harness
        .run_runner(
            &[
                "--sensor-cmd",
                "sh -c 'exit 0'",
                "--config",
                config.to_str().unwrap(),
                "--all",
                "--report-json",
                report_path.to_str().unwrap(),
                "--html-report",
                html_path.to_str().unwrap(),
            ],
            LIMIT,
        )
        .await?;
    assert_eq!(code, 0);

    let document = report::parse_json(&std::fs::read_to_string(&report_path)?)
        .map_err(|e| anyhow::anyhow!("{:#}", e))?;
    assert_eq!(document.run_order, vec!["OK2", "OK1"]);
    assert_eq!(document.summary.total, 2);
    assert_eq!(document.summary.passed, 2);
    assert_eq!(document.scenarios["OK1"].status, RunStatus::Pass);
    assert!(document.scenarios["OK1"].uuid.starts_with("test-OK1-"));

    let html = std::fs::read_to_string(&html_path)?;
    assert!(html.contains("2 PASS"));
    assert_eq!(harness.session_dirs()?.len(), 1);
    Ok(())
}

/// Log checks run against the sensor log; a failed check fails only its scenario
#[tokio::test]
async fn test_log_checks_decide_pass_and_fail() -> Result<()> {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();

    let mut harness = RunnerHarness::new()?;
    let config = fixtures::write_config(
        harness.temp_path(),
        &[
            ("C1", "checks: [{ re: 'connection closed by the client', min: 2 }]"),
            ("C2", "checks: [{ re: 'never printed', min: 1 }]"),
        ],
    )?;
    let report_path = harness.report_path();

    let code = harness
        .run_runner(
            &[
                "--sensor-cmd",
                "sh -c 'printf \"Connection closed by the client\\nConnection closed by the client\\n\" > \"$LOG_DIR/sensor_1.log\"'",
                "--config",
                config.to_str().unwrap(),
                "--only",
                "C1,C2",
                "--report-json",
                report_path.to_str().unwrap(),
            ],
            LIMIT,
        )
        .await?;
    assert_eq!(code, 1);

    let document = report::parse_json(&std::fs::read_to_string(&report_path)?)
        .map_err(|e| anyhow::anyhow!("{:#}", e))?;
    let passing = &document.scenarios["C1"];
    assert_eq!(passing.status, RunStatus::Pass);
    assert_eq!(passing.checks[0].count, 2);
    assert!(passing.log.as_ref().unwrap().ends_with("logs/sensor_1.log"));

    assert_eq!(
        document.scenarios["C2"].reason,
        Some(FailureReason::ChecksFailed { failed: 1 })
    );
    assert_eq!(document.summary.failures_by_kind["checks_failed"], 1);
    Ok(())
}

/// A sensor exiting non-zero is reported with its code and stderr tail
#[tokio::test]
async fn test_non_zero_exit_is_reported() -> Result<()> {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();

    let mut harness = RunnerHarness::new()?;
    let config = fixtures::write_config(harness.temp_path(), &[("E1", "")])?;
    let report_path = harness.report_path();

    let code = harness
        .run_runner(
            &[
                "--sensor-cmd",
                "sh -c 'echo boom >&2; exit 3'",
                "--config",
                config.to_str().unwrap(),
                "--report-json",
                report_path.to_str().unwrap(),
            ],
            LIMIT,
        )
        .await?;
    assert_eq!(code, 1);

    let document = report::parse_json(&std::fs::read_to_string(&report_path)?)
        .map_err(|e| anyhow::anyhow!("{:#}", e))?;
    let result = &document.scenarios["E1"];
    assert_eq!(
        result.reason,
        Some(FailureReason::NonZeroExit {
            role: Role::Subject,
            code: 3
        })
    );
    assert!(result.diagnostic.as_deref().unwrap_or_default().contains("boom"));
    Ok(())
}

/// Unknown selectors abort before any session directory is created
#[tokio::test]
async fn test_unknown_scenario_is_a_configuration_error() -> Result<()> {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();

    let mut harness = RunnerHarness::new()?;
    let code = harness
        .run_runner(&["--sensor-cmd", "sh -c 'exit 0'", "--only", "P1", "NOPE"], LIMIT)
        .await?;
    assert_eq!(code, 2);
    assert!(harness.session_dirs()?.is_empty());
    Ok(())
}

/// SHM files written by the sensor are validated after the run
#[tokio::test]
async fn test_post_run_validation() -> Result<()> {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();

    let mut harness = RunnerHarness::new()?;
    let config = fixtures::write_config(harness.temp_path(), &[("V1", "")])?;
    let body = fixtures::shm_line(0, 0.0, 0.5, -1.0, 24.5) + &fixtures::shm_line(2000, 16.0, -16.0, 1.0, 125.0);
    let source = fixtures::write_shm(&harness.temp_path().join("fixtures"), 1_700_000_000_000_000, 2000, &body)?;
    let validation_path = harness.temp_path().join("validation.json");
    let sensor = format!("sh -c 'cp \"{}\" \"$RUN_DIR/\"'", source.display());

    let code = harness
        .run_runner(
            &[
                "--sensor-cmd",
                &sensor,
                "--config",
                config.to_str().unwrap(),
                "--validate",
                "--acc-range",
                "-16",
                "16",
                "--temp-range",
                "-40",
                "125",
                "--validate-strict",
                "--validation-json",
                validation_path.to_str().unwrap(),
            ],
            LIMIT,
        )
        .await?;
    assert_eq!(code, 0);

    let validation: serde_json::Value = serde_json::from_str(&std::fs::read_to_string(&validation_path)?)?;
    assert_eq!(validation["files_total"], 1);
    assert_eq!(validation["files_ok"], 1);
    assert_eq!(validation["verdict"], "pass");
    Ok(())
}
