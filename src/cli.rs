use clap::Parser;
use std::path::PathBuf;
use std::time::Duration;

use crate::error::RunnerError;
use crate::port_manager::PortProbeConfig;
use crate::registry::{Registry, ScenarioDefaults, Selection};
use crate::supervisor::{self, MockPeerConfig, StressorConfig, SupervisorConfig};
use crate::validator::{self, FieldRange, FieldRanges, ValidateOptions};

type Result<T> = color_eyre::eyre::Result<T>;

const DEFAULT_MOCK_ARGS: &str = "--uuid {uuid} --ip 127.0.0.1 --tcp-port 1105 --channels-map 11140000";

/// Runs sensor stress scenarios against a mock board peer
#[derive(Parser, Debug)]
#[command(name = "stress-runner")]
#[command(about = "Runs sensor stress scenarios against a mock board peer")]
#[command(version)]
pub struct Cli {
    /// Command launching the sensor, e.g. "python -u main.py"
    #[arg(long)]
    pub sensor_cmd: String,

    /// Working directory of the sensor
    #[arg(long)]
    pub cwd: PathBuf,

    /// Directory that receives the work/ tree
    #[arg(long, default_value = ".")]
    pub work_root: PathBuf,

    /// JSON5 file overriding or adding scenarios
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Run every scenario in registry order
    #[arg(long, conflicts_with = "only")]
    pub all: bool,

    /// Run only these scenarios (e.g. --only S2 P1 or --only S2,P1)
    #[arg(long, num_args = 1..)]
    pub only: Vec<String>,

    /// Default scenario timeout (seconds)
    #[arg(long, default_value = "12")]
    pub duration: f64,

    /// Base port; each scenario listens on base + its offset
    #[arg(long, default_value = "5000")]
    pub base_port: u16,

    /// Command launching the mock board peer
    #[arg(long)]
    pub board_mock_cmd: Option<String>,

    /// Mock peer argument template ({uuid} and {port} are substituted)
    #[arg(long, default_value = DEFAULT_MOCK_ARGS, allow_hyphen_values = true)]
    pub board_mock_args: String,

    /// Write the HTML report here
    #[arg(long)]
    pub html_report: Option<PathBuf>,

    /// Write the JSON report here
    #[arg(long)]
    pub report_json: Option<PathBuf>,

    /// Readiness budget for the mock peer and the sensor port (seconds)
    #[arg(long, default_value = "15")]
    pub sensor_wait_seconds: f64,

    /// Command launching the TCP frame stressor
    #[arg(long)]
    pub stressor_cmd: Option<String>,

    /// Extra words appended to every stressor invocation
    #[arg(long, default_value = "", allow_hyphen_values = true)]
    pub stressor_extra: String,

    /// Time between SIGTERM and SIGKILL (seconds)
    #[arg(long, default_value = "5")]
    pub grace_seconds: f64,

    /// Time the sensor keeps running after the stressor finished (seconds)
    #[arg(long, default_value = "2")]
    pub drain_seconds: f64,

    /// File name glob of the sensor log inside logs/
    #[arg(long, default_value = "sensor_*.log")]
    pub subject_log_pattern: String,

    /// Launch the stressor as soon as the sensor port accepts connections,
    /// without waiting for the server and packet handler log markers
    #[arg(long)]
    pub no_ready_markers: bool,

    /// Validate SHM files produced during the session
    #[arg(long)]
    pub validate: bool,

    /// File name glob of the SHM files to validate
    #[arg(long, default_value = validator::DEFAULT_PATTERN)]
    pub validate_pattern: String,

    /// Accelerometer range (g), inclusive
    #[arg(long, num_args = 2, value_names = ["MIN", "MAX"], allow_negative_numbers = true)]
    pub acc_range: Option<Vec<f64>>,

    /// Temperature range (°C), inclusive
    #[arg(long, num_args = 2, value_names = ["MIN", "MAX"], allow_negative_numbers = true)]
    pub temp_range: Option<Vec<f64>>,

    /// Fail the run on any validation violation
    #[arg(long)]
    pub validate_strict: bool,

    /// Write the validation report here
    #[arg(long)]
    pub validation_json: Option<PathBuf>,
}

/// Validates SHM files produced by the sensor
#[derive(Parser, Debug)]
#[command(name = "shm-validate")]
#[command(about = "Validates SHM files produced by the sensor")]
#[command(version)]
pub struct ValidateCli {
    /// Directory scanned recursively
    pub data_dir: PathBuf,

    /// File name glob of the files to validate
    #[arg(long, default_value = validator::DEFAULT_PATTERN)]
    pub pattern: String,

    /// Accelerometer range (g), inclusive
    #[arg(long, num_args = 2, value_names = ["MIN", "MAX"], allow_negative_numbers = true)]
    pub acc_range: Option<Vec<f64>>,

    /// Temperature range (°C), inclusive
    #[arg(long, num_args = 2, value_names = ["MIN", "MAX"], allow_negative_numbers = true)]
    pub temp_range: Option<Vec<f64>>,

    /// Allowed drift between t1 and t0 + last deltaT (µs)
    #[arg(long, default_value = "0")]
    pub tolerance_us: u64,

    /// Write the JSON report here
    #[arg(long)]
    pub json_out: Option<PathBuf>,

    /// Fail on any violation, and on an empty match
    #[arg(long)]
    pub strict: bool,
}

/// Post-run validation settings
#[derive(Debug, Clone)]
pub struct ValidationConfig {
    pub pattern: String,
    pub ranges: FieldRanges,
    pub options: ValidateOptions,
    pub json_out: Option<PathBuf>,
}

/// Everything a runner session needs, fixed at startup
#[derive(Debug, Clone)]
pub struct RunnerConfig {
    pub registry: Registry,
    pub selection: Selection,
    pub defaults: ScenarioDefaults,
    pub supervisor: SupervisorConfig,
    /// Parent of the `work/` tree
    pub work_root: PathBuf,
    pub report_json: Option<PathBuf>,
    pub html_report: Option<PathBuf>,
    /// Present when `--validate` was given
    pub validation: Option<ValidationConfig>,
}

/// Standalone validator settings
#[derive(Debug, Clone)]
pub struct ValidateConfig {
    pub data_dir: PathBuf,
    pub validation: ValidationConfig,
}

impl RunnerConfig {
    /// Parse command line arguments into configuration
    pub fn from_cli(cli: Cli) -> Result<Self> {
        if !cli.cwd.is_dir() {
            return Err(RunnerError::InvalidConfig(format!(
                "sensor cwd {} is not a directory",
                cli.cwd.display()
            ))
            .into());
        }

        let registry = match &cli.config {
            Some(path) => Registry::from_file(path)?,
            None => Registry::builtin(),
        };

        let selection = if cli.only.is_empty() || cli.all {
            Selection::All
        } else {
            Selection::from_only(&cli.only)
        };

        let ranges = field_ranges(cli.acc_range.as_deref(), cli.temp_range.as_deref())?;

        Ok(RunnerConfig {
            registry,
            selection,
            defaults: ScenarioDefaults {
                duration: seconds("--duration", cli.duration)?,
                base_port: cli.base_port,
            },
            supervisor: SupervisorConfig {
                subject_command: cli.sensor_cmd,
                subject_cwd: cli.cwd,
                mock: cli.board_mock_cmd.map(|command| MockPeerConfig {
                    command,
                    args_template: cli.board_mock_args,
                }),
                stressor: cli.stressor_cmd.map(|command| StressorConfig {
                    command,
                    extra: cli.stressor_extra,
                }),
                ready_wait: seconds("--sensor-wait-seconds", cli.sensor_wait_seconds)?,
                grace: seconds("--grace-seconds", cli.grace_seconds)?,
                drain: seconds("--drain-seconds", cli.drain_seconds)?,
                subject_log_pattern: cli.subject_log_pattern,
                ready_markers: if cli.no_ready_markers {
                    Vec::new()
                } else {
                    supervisor::READY_MARKERS.iter().map(|m| m.to_string()).collect()
                },
                probe: PortProbeConfig::default(),
            },
            work_root: cli.work_root,
            report_json: cli.report_json,
            html_report: cli.html_report,
            validation: cli.validate.then_some(ValidationConfig {
                pattern: cli.validate_pattern,
                ranges,
                options: ValidateOptions {
                    tolerance_us: 0,
                    strict: cli.validate_strict,
                },
                json_out: cli.validation_json,
            }),
        })
    }
}

impl ValidateConfig {
    pub fn from_cli(cli: ValidateCli) -> Result<Self> {
        Ok(ValidateConfig {
            data_dir: cli.data_dir,
            validation: ValidationConfig {
                pattern: cli.pattern,
                ranges: field_ranges(cli.acc_range.as_deref(), cli.temp_range.as_deref())?,
                options: ValidateOptions {
                    tolerance_us: cli.tolerance_us,
                    strict: cli.strict,
                },
                json_out: cli.json_out,
            },
        })
    }
}

/// Upper bound for any timing flag: one week
const MAX_SECONDS: f64 = 7.0 * 24.0 * 3600.0;

fn seconds(flag: &str, value: f64) -> std::result::Result<Duration, RunnerError> {
    if value > MAX_SECONDS {
        return Err(RunnerError::InvalidConfig(format!(
            "{} {}: more than {} seconds",
            flag, value, MAX_SECONDS
        )));
    }
    Duration::try_from_secs_f64(value)
        .map_err(|e| RunnerError::InvalidConfig(format!("{} {}: {}", flag, value, e)))
}

fn field_ranges(acc: Option<&[f64]>, temp: Option<&[f64]>) -> std::result::Result<FieldRanges, RunnerError> {
    let range = |pair: Option<&[f64]>| match pair {
        Some([min, max]) => FieldRange::new(*min, *max).map(Some),
        Some(other) => Err(RunnerError::InvalidConfig(format!(
            "a range takes MIN and MAX, got {} values",
            other.len()
        ))),
        None => Ok(None),
    };
    Ok(FieldRanges {
        acc: range(acc)?,
        temp: range(temp)?,
    })
}
