use std::collections::BTreeMap;
use std::path::Path;

/// Variables the sensor reads to locate its log and runtime directories.
pub const LOG_DIR: &str = "LOG_DIR";
pub const RUN_DIR: &str = "RUN_DIR";
pub const ALLOW_UNREGISTERED: &str = "SENSOR_ALLOW_UNREGISTERED";

/// Extra environment variables layered over the runner's own environment when a
/// child process is spawned.
///
/// The runner never mutates its own process environment; every scenario builds its
/// overlay explicitly and hands it to the process manager.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Environment(BTreeMap<String, String>);

impl Environment {
    pub fn new() -> Self {
        Self(BTreeMap::new())
    }

    /// Overlay for the subject: points its logs and runtime files into the scenario
    /// directory and lets it run without a registered board.
    ///
    /// # Arguments
    /// * `log_dir` - Directory the sensor writes `sensor_*.log` into
    /// * `run_dir` - Directory for the sensor's runtime artifacts
    pub fn for_subject(log_dir: &Path, run_dir: &Path) -> Self {
        let mut env = Self::new();
        env.set(LOG_DIR, log_dir.display().to_string());
        env.set(RUN_DIR, run_dir.display().to_string());
        env.set(ALLOW_UNREGISTERED, "1");
        env
    }

    /// Sets a variable, replacing any previous value.
    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.0.insert(key.into(), value.into());
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &String)> {
        self.0.iter()
    }
}
