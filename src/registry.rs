use crate::error::RunnerError;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::Path;
use std::time::Duration;
use tracing::{debug, info};

/// Stressor scenarios whose load length follows `--duration` unless set explicitly
const TIMED_STRESSORS: [&str; 4] = ["S2", "S3", "S5", "A1"];

/// Head room between the end of a timed stressor and the hard timeout, covering
/// startup and the post-load drain.
pub const STRESSOR_MARGIN: Duration = Duration::from_secs(10);

use super::Result;
use eyre::WrapErr;

/// A regular expression that must occur in the subject log between `min` and `max`
/// times (both inclusive, both optional).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogCheck {
    #[serde(rename = "re", alias = "pattern")]
    pub pattern: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max: Option<u64>,
}

impl LogCheck {
    pub fn at_least(pattern: &str, min: u64) -> Self {
        Self {
            pattern: pattern.to_string(),
            min: Some(min),
            max: None,
        }
    }

    pub fn at_most(pattern: &str, max: u64) -> Self {
        Self {
            pattern: pattern.to_string(),
            min: None,
            max: Some(max),
        }
    }
}

/// Load generator invocation attached to a scenario.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StressorDef {
    /// Stressor scenario name, defaults to the owning scenario id
    #[serde(default)]
    pub scenario: Option<String>,
    #[serde(default)]
    pub args: BTreeMap<String, serde_json::Value>,
}

/// Scenario as written in the registry or a configuration file.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ScenarioDef {
    #[serde(default)]
    pub name: String,
    /// Hard timeout in seconds; the runner default applies when absent
    #[serde(default, alias = "sensor_wait_seconds")]
    pub duration: Option<f64>,
    #[serde(default)]
    pub port_offset: u16,
    #[serde(default)]
    pub stressor: Option<StressorDef>,
    #[serde(default, alias = "patterns")]
    pub checks: Vec<LogCheck>,
    /// Whether the scenario only passes if it completes before the timeout
    #[serde(default)]
    pub expect_early_exit: bool,
}

/// Shape of a `--config` file. Both keys are optional and overlay the built-in registry.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RegistryFile {
    #[serde(default)]
    pub scenario_order: Option<Vec<String>>,
    #[serde(default)]
    pub scenarios: BTreeMap<String, ScenarioDef>,
}

/// Resolved stressor parameters.
#[derive(Debug, Clone, PartialEq)]
pub struct Stressor {
    pub scenario: String,
    pub args: BTreeMap<String, serde_json::Value>,
}

impl Stressor {
    /// Seconds of load requested through the `duration` argument.
    pub fn load_secs(&self) -> Option<f64> {
        self.args.get("duration").and_then(serde_json::Value::as_f64)
    }
}

/// A fully resolved, immutable scenario ready to be supervised.
#[derive(Debug, Clone, PartialEq)]
pub struct Scenario {
    pub id: String,
    pub name: String,
    pub duration: Duration,
    pub port: u16,
    pub stressor: Option<Stressor>,
    pub checks: Vec<LogCheck>,
    pub expect_early_exit: bool,
}

/// Values applied to scenarios that do not set their own.
#[derive(Debug, Clone, Copy)]
pub struct ScenarioDefaults {
    pub duration: Duration,
    pub base_port: u16,
}

/// Which scenarios a run should execute.
#[derive(Debug, Clone, PartialEq)]
pub enum Selection {
    All,
    Only(Vec<String>),
}

impl Selection {
    /// Normalizes raw `--only` values. Accepts "P1 P2", "P1,P2" or repeated values;
    /// a literal `all` selects everything.
    pub fn from_only<S: AsRef<str>>(raw: &[S]) -> Self {
        let ids: Vec<String> = raw
            .iter()
            .flat_map(|item| {
                item.as_ref()
                    .split(|c: char| c == ',' || c.is_whitespace())
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .map(str::to_string)
                    .collect::<Vec<_>>()
            })
            .collect();

        if ids.iter().any(|id| id.eq_ignore_ascii_case("all")) {
            Selection::All
        } else {
            Selection::Only(ids)
        }
    }
}

/// Named scenario definitions in registry order.
#[derive(Debug, Clone)]
pub struct Registry {
    order: Vec<String>,
    defs: HashMap<String, ScenarioDef>,
}

impl Registry {
    /// The scenarios shipped with the runner.
    pub fn builtin() -> Self {
        let forbid_crash = || LogCheck::at_most(r"Unhandled|Traceback", 0);
        let stressor = |args: &[(&str, serde_json::Value)]| StressorDef {
            scenario: None,
            args: args
                .iter()
                .map(|(k, v)| (k.to_string(), v.clone()))
                .collect(),
        };

        let defs = vec![
            (
                "S1",
                ScenarioDef {
                    name: "No client / accept-timeout".into(),
                    duration: Some(25.0),
                    checks: vec![
                        LogCheck::at_least(r"Accept timeout: no client connected", 1),
                        LogCheck::at_least(r"Board stop\+reset due to accept-timeout", 1),
                    ],
                    ..Default::default()
                },
            ),
            (
                "S2",
                ScenarioDef {
                    name: "Connect/Disconnect flapping".into(),
                    stressor: Some(stressor(&[])),
                    checks: vec![
                        LogCheck::at_least(r"Connection closed by the client", 1),
                        forbid_crash(),
                    ],
                    ..Default::default()
                },
            ),
            (
                "S3",
                ScenarioDef {
                    name: "High jitter".into(),
                    stressor: Some(stressor(&[])),
                    checks: vec![forbid_crash()],
                    ..Default::default()
                },
            ),
            (
                "S4",
                ScenarioDef {
                    name: "Long pause (socket alive)".into(),
                    duration: Some(20.0),
                    stressor: Some(stressor(&[
                        ("warmup", 2.0.into()),
                        ("pause", 10.0.into()),
                        ("tail", 2.0.into()),
                    ])),
                    checks: vec![
                        LogCheck::at_least(
                            r"Timeout while reading data|Connection closed by the client",
                            1,
                        ),
                        forbid_crash(),
                    ],
                    ..Default::default()
                },
            ),
            (
                "S5",
                ScenarioDef {
                    name: "High throughput".into(),
                    stressor: Some(stressor(&[("duration", 8.into())])),
                    checks: vec![LogCheck::at_least(r"queue full → dropped .*", 0), forbid_crash()],
                    ..Default::default()
                },
            ),
            (
                "P1",
                ScenarioDef {
                    name: "Split frames".into(),
                    stressor: Some(stressor(&[("nframes", 50.into()), ("split", 5.into())])),
                    checks: vec![
                        LogCheck::at_least(r"payload len .* != expected .*", 0),
                        forbid_crash(),
                    ],
                    ..Default::default()
                },
            ),
            (
                "P2",
                ScenarioDef {
                    name: "Garbage between frames".into(),
                    stressor: Some(stressor(&[("nframes", 20.into()), ("garbage", 64.into())])),
                    checks: vec![
                        LogCheck::at_least(r"buffer trimmed to .* cap reached", 0),
                        forbid_crash(),
                    ],
                    ..Default::default()
                },
            ),
            (
                "P3",
                ScenarioDef {
                    name: "Intermittent header-only".into(),
                    stressor: Some(stressor(&[("nheaders", 20.into())])),
                    checks: vec![forbid_crash()],
                    ..Default::default()
                },
            ),
            (
                "P4",
                ScenarioDef {
                    name: "Variable nreports".into(),
                    stressor: Some(stressor(&[("seq", serde_json::json!([4, 10, 4, 8, 6]))])),
                    checks: vec![
                        LogCheck::at_least(r"Number of reports differs", 1),
                        forbid_crash(),
                    ],
                    ..Default::default()
                },
            ),
            (
                "P5",
                ScenarioDef {
                    name: "Oversize/Undersize payload".into(),
                    stressor: Some(stressor(&[])),
                    checks: vec![
                        LogCheck::at_least(r"payload len .* != expected .*", 1),
                        forbid_crash(),
                    ],
                    ..Default::default()
                },
            ),
            (
                "T1",
                ScenarioDef {
                    name: "Microsecond timestamps".into(),
                    stressor: Some(stressor(&[("nframes", 20.into())])),
                    checks: vec![forbid_crash()],
                    ..Default::default()
                },
            ),
            (
                "A1",
                ScenarioDef {
                    name: "Prolonged STA/LTA without FFT".into(),
                    duration: Some(45.0),
                    stressor: Some(stressor(&[("duration", 35.into())])),
                    checks: vec![
                        LogCheck::at_least(r"STA/LTA flag entered in pre-alarm state", 1),
                        LogCheck::at_least(r"Resetting STA_LTA flag", 1),
                        forbid_crash(),
                    ],
                    ..Default::default()
                },
            ),
            (
                "A2",
                ScenarioDef {
                    name: "Prolonged FFT without STA/LTA".into(),
                    duration: Some(45.0),
                    stressor: Some(stressor(&[("duration", 35.into())])),
                    checks: vec![
                        LogCheck::at_least(r"FFT flag set", 1),
                        LogCheck::at_least(r"Resetting FFT flag", 1),
                        forbid_crash(),
                    ],
                    ..Default::default()
                },
            ),
            (
                "A3",
                ScenarioDef {
                    name: "Alarm triggered".into(),
                    stressor: Some(StressorDef {
                        scenario: Some("A2".into()),
                        ..stressor(&[("pre", 3.0.into()), ("post", 3.0.into())])
                    }),
                    checks: vec![
                        LogCheck::at_least(r"STA/LTA flag entered in pre-alarm state", 1),
                        LogCheck::at_least(r"FFT flag set", 1),
                        LogCheck::at_least(r"Triggering alarm on channel .*", 1),
                        LogCheck::at_least(r"Creating a new event data buffer", 1),
                        LogCheck::at_least(r"Sending triggered buffer to the alarm handler", 1),
                        forbid_crash(),
                    ],
                    ..Default::default()
                },
            ),
        ];

        // A3 is defined but, like upstream, not part of the default order.
        let order = [
            "S1", "S2", "S3", "S4", "S5", "P1", "P2", "P3", "P4", "P5", "T1", "A1", "A2",
        ]
        .iter()
        .map(|s| s.to_string())
        .collect();

        Self {
            order,
            defs: defs
                .into_iter()
                .map(|(id, def)| (id.to_string(), def))
                .collect(),
        }
    }

    /// Built-in registry overlaid with a JSON5 configuration file.
    pub fn from_file(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .wrap_err_with(|| format!("failed to read scenario config {}", path.display()))?;
        let file: RegistryFile = json5::from_str(&contents).map_err(|e| {
            RunnerError::InvalidConfig(format!("{}: {}", path.display(), e))
        })?;
        info!("loaded scenario config from {}", path.display());
        Ok(Self::builtin().overlay(file)?)
    }

    /// Replaces the order and same-id definitions, adds new definitions.
    pub fn overlay(mut self, file: RegistryFile) -> std::result::Result<Self, RunnerError> {
        for (id, def) in file.scenarios {
            if !self.defs.contains_key(&id) && file.scenario_order.is_none() {
                self.order.push(id.clone());
            }
            debug!("scenario {} defined by config", id);
            self.defs.insert(id, def);
        }

        if let Some(order) = file.scenario_order {
            if let Some(missing) = order.iter().find(|id| !self.defs.contains_key(*id)) {
                return Err(RunnerError::InvalidConfig(format!(
                    "scenario_order references undefined scenario '{}'",
                    missing
                )));
            }
            self.order = order;
        }

        Ok(self)
    }

    /// Scenario ids in registry order.
    pub fn ids(&self) -> &[String] {
        &self.order
    }

    /// Turns a selection into an ordered, duplicate-free list of scenarios.
    ///
    /// Explicit selections keep the caller's order; `All` follows the registry order.
    /// Any unknown id fails the whole resolution.
    pub fn resolve(
        &self,
        selection: &Selection,
        defaults: &ScenarioDefaults,
    ) -> std::result::Result<Vec<Scenario>, RunnerError> {
        let ids: Vec<&String> = match selection {
            Selection::All => self.order.iter().collect(),
            Selection::Only(ids) => {
                let mut seen = HashSet::new();
                ids.iter().filter(|id| seen.insert(id.as_str())).collect()
            }
        };

        ids.into_iter()
            .map(|id| {
                let def = self.defs.get(id).ok_or_else(|| RunnerError::UnknownScenario {
                    id: id.clone(),
                    known: self.known_ids(),
                })?;
                Self::materialize(id, def, defaults)
            })
            .collect()
    }

    fn known_ids(&self) -> Vec<String> {
        let mut known: Vec<String> = self.defs.keys().cloned().collect();
        known.sort();
        known
    }

    fn materialize(
        id: &str,
        def: &ScenarioDef,
        defaults: &ScenarioDefaults,
    ) -> std::result::Result<Scenario, RunnerError> {
        let stressor = def.stressor.as_ref().map(|s| {
            let scenario = s.scenario.clone().unwrap_or_else(|| id.to_string());
            let mut args = s.args.clone();
            if TIMED_STRESSORS.contains(&scenario.as_str()) && !args.contains_key("duration") {
                args.insert(
                    "duration".to_string(),
                    serde_json::json!(defaults.duration.as_secs_f64()),
                );
            }
            Stressor { scenario, args }
        });

        // A timed stressor must finish and drain before the hard timeout fires.
        let duration = match def.duration {
            Some(secs) => Duration::try_from_secs_f64(secs).map_err(|e| {
                RunnerError::InvalidConfig(format!("scenario {} duration {}: {}", id, secs, e))
            })?,
            None => stressor
                .as_ref()
                .and_then(Stressor::load_secs)
                .and_then(|secs| Duration::try_from_secs_f64(secs).ok())
                .and_then(|load| load.checked_add(STRESSOR_MARGIN))
                .map_or(defaults.duration, |timeout| timeout.max(defaults.duration)),
        };

        let port = defaults.base_port.checked_add(def.port_offset).ok_or_else(|| {
            RunnerError::InvalidConfig(format!(
                "scenario {} port offset {} overflows base port {}",
                id, def.port_offset, defaults.base_port
            ))
        })?;

        Ok(Scenario {
            id: id.to_string(),
            name: def.name.clone(),
            duration,
            port,
            stressor,
            checks: def.checks.clone(),
            expect_early_exit: def.expect_early_exit,
        })
    }
}
