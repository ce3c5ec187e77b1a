use crate::integration::infrastructure::{fixtures, RunnerHarness};
use anyhow::Result;
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use std::time::Duration;
use stress_runner::report;
use stress_runner::supervisor::FailureReason;
use tracing::debug;

/// SIGINT stops the in-flight scenario, skips the rest and still writes the report
#[tokio::test]
async fn test_sigint_interrupts_session() -> Result<()> {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();

    let mut harness = RunnerHarness::new()?;
    let config = fixtures::write_config(harness.temp_path(), &[("L1", ""), ("L2", "")])?;
    let report_path = harness.report_path();
    let mut process = harness
        .spawn_runner(&[
            "--sensor-cmd",
            "sh -c 'sleep 30'",
            "--config",
            config.to_str().unwrap(),
            "--duration",
            "60",
            "--report-json",
            report_path.to_str().unwrap(),
        ])
        .await?;

    // Wait for the first scenario's sensor to be launched
    let started = tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            let launched = harness.session_dirs().ok().is_some_and(|dirs| {
                dirs.iter().any(|session| {
                    std::fs::read_dir(session)
                        .map(|entries| {
                            entries
                                .filter_map(|e| e.ok())
                                .any(|e| e.path().join("subject_stdout.log").exists())
                        })
                        .unwrap_or(false)
                })
            });
            if launched {
                break;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    })
    .await;
    assert!(started.is_ok(), "sensor was never launched");
    tokio::time::sleep(Duration::from_millis(200)).await;

    kill(process.pid, Signal::SIGINT)?;
    let status = process
        .wait_for_exit_timeout(Duration::from_secs(10))
        .await?
        .expect("runner should exit after SIGINT");
    debug!("runner exited after {:?}", process.runtime());
    assert_eq!(status.code(), Some(130));

    let document = report::parse_json(&std::fs::read_to_string(&report_path)?)
        .map_err(|e| anyhow::anyhow!("{:#}", e))?;
    assert_eq!(document.run_order, vec!["L1"]);
    let result = &document.scenarios["L1"];
    assert_eq!(result.reason, Some(FailureReason::Interrupted));

    // No orphaned sensor
    let pid = result.processes[0].pid.expect("sensor pid recorded");
    assert!(kill(Pid::from_raw(pid), None).is_err(), "sensor {} still alive", pid);
    Ok(())
}
