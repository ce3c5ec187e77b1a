use crate::integration::infrastructure::{fixtures, RunnerHarness};
use anyhow::Result;
use std::path::Path;

const T0: u64 = 1_700_000_000_000_000;

fn ranges() -> Vec<&'static str> {
    vec!["--acc-range", "-16", "16", "--temp-range", "-40", "125"]
}

fn args<'a>(dir: &'a Path, extra: &[&'a str]) -> Vec<&'a str> {
    let mut args = vec![dir.to_str().unwrap()];
    args.extend(ranges());
    args.extend_from_slice(extra);
    args
}

/// In-range data passes and the JSON report is keyed by file path
#[tokio::test]
async fn test_valid_data_passes() -> Result<()> {
    let harness = RunnerHarness::new()?;
    let data = harness.temp_path().join("data");
    let body = fixtures::shm_line(0, 0.1, 0.2, 0.98, 21.0) + &fixtures::shm_line(500, -16.0, 16.0, 0.0, -40.0);
    let file = fixtures::write_shm(&data.join("nested"), T0, 500, &body)?;
    let json_out = harness.temp_path().join("out/validation.json");

    let output = harness
        .run_validator(&args(&data, &["--strict", "--json-out", json_out.to_str().unwrap()]))
        .await?;
    assert_eq!(output.status.code(), Some(0));

    let report: serde_json::Value = serde_json::from_str(&std::fs::read_to_string(&json_out)?)?;
    assert_eq!(report["verdict"], "pass");
    assert_eq!(report["files_ok"], 1);
    let key = file.display().to_string();
    assert_eq!(report["files"][key.as_str()]["violations"], serde_json::json!([]));
    Ok(())
}

/// One unit beyond a bound fails in strict mode and is only recorded otherwise
#[tokio::test]
async fn test_out_of_range_strictness() -> Result<()> {
    let harness = RunnerHarness::new()?;
    let data = harness.temp_path().join("data");
    fixtures::write_shm(&data, T0, 0, &fixtures::shm_line(0, 0.0, 0.0, 17.0, 20.0))?;

    let strict = harness.run_validator(&args(&data, &["--strict"])).await?;
    assert_eq!(strict.status.code(), Some(1));

    let json_out = harness.temp_path().join("lenient.json");
    let lenient = harness
        .run_validator(&args(&data, &["--json-out", json_out.to_str().unwrap()]))
        .await?;
    assert_eq!(lenient.status.code(), Some(0));

    let report: serde_json::Value = serde_json::from_str(&std::fs::read_to_string(&json_out)?)?;
    assert_eq!(report["files_warn"], 1);
    let file = report["files"].as_object().unwrap().values().next().unwrap();
    assert_eq!(file["violations"][0]["kind"], "acc_out_of_range");
    assert_eq!(file["violations"][0]["line"], 1);
    Ok(())
}

/// An empty match is a configuration error only in strict mode
#[tokio::test]
async fn test_no_files_matched() -> Result<()> {
    let harness = RunnerHarness::new()?;
    let data = harness.temp_path().join("empty");
    std::fs::create_dir_all(&data)?;

    let strict = harness.run_validator(&args(&data, &["--strict"])).await?;
    assert_eq!(strict.status.code(), Some(2));

    let lenient = harness.run_validator(&args(&data, &[])).await?;
    assert_eq!(lenient.status.code(), Some(0));
    Ok(())
}

#[tokio::test]
async fn test_missing_directory() -> Result<()> {
    let harness = RunnerHarness::new()?;
    let missing = harness.temp_path().join("missing");
    let output = harness.run_validator(&args(&missing, &[])).await?;
    assert_eq!(output.status.code(), Some(2));
    Ok(())
}

/// End-time drift within --tolerance-us is accepted
#[tokio::test]
async fn test_end_time_tolerance() -> Result<()> {
    let harness = RunnerHarness::new()?;
    let data = harness.temp_path().join("data");
    std::fs::create_dir_all(&data)?;
    std::fs::write(
        data.join(format!("shm_0A1B2C3D4E5F_05_{}_{}", T0, T0 + 1_010)),
        fixtures::shm_line(0, 0.0, 0.0, 1.0, 20.0) + &fixtures::shm_line(1_000, 0.0, 0.0, 1.0, 20.0),
    )?;

    let exact = harness.run_validator(&args(&data, &["--strict"])).await?;
    assert_eq!(exact.status.code(), Some(1));

    let tolerant = harness
        .run_validator(&args(&data, &["--strict", "--tolerance-us", "10"]))
        .await?;
    assert_eq!(tolerant.status.code(), Some(0));
    Ok(())
}
