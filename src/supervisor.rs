use super::Result;
use crate::command_line::{self, CommandLine};
use crate::environment::Environment;
use crate::log_checks::{self, CheckOutcome, CHECK_WINDOW_BYTES};
use crate::port_manager::{PortManager, PortProbeConfig};
use crate::process_manager::{capture_paths, ChildSpec, ExitOutcome, ManagedChild, Role};
use crate::registry::Scenario;
use crate::validator::glob_to_regex;
use chrono::{DateTime, Utc};
use eyre::WrapErr;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tokio::time::{interval, sleep, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;
use walkdir::WalkDir;

/// How often running children are polled for exit
const MONITOR_INTERVAL: Duration = Duration::from_millis(100);

/// Lines of stderr kept in a failed result
const DIAGNOSTIC_LINES: usize = 5;

/// Host the subject serves on and the stressor connects to
const LOOPBACK: &str = "127.0.0.1";

/// Log lines the sensor prints once its server socket is open and its packet
/// handler consumes frames. `{port}` is replaced with the scenario port.
pub const READY_MARKERS: [&str; 2] = [
    r"Socket server opened at .*:{port}\b",
    r"\[PacketHandler\]\s*Packet handler is running\.\.\.",
];

/// Outcome of a scenario
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Pass,
    Fail,
}

/// Why a scenario failed
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FailureReason {
    /// A process could not be started or its port was taken
    LaunchFailure { role: Role, message: String },
    /// The mock peer never accepted connections
    PeerNotReady { port: u16, waited_secs: f64 },
    /// The subject never opened its port before the stressor was due
    SubjectNotReady { port: u16 },
    NonZeroExit { role: Role, code: i32 },
    KilledBySignal { role: Role, signal: i32 },
    /// The scenario had to finish before its timeout and did not
    TimeoutExpired,
    ChecksFailed { failed: usize },
    LogMissing,
    Interrupted,
}

impl FailureReason {
    /// Stable name used for summary counters
    pub fn kind(&self) -> &'static str {
        match self {
            FailureReason::LaunchFailure { .. } => "launch_failure",
            FailureReason::PeerNotReady { .. } => "peer_not_ready",
            FailureReason::SubjectNotReady { .. } => "subject_not_ready",
            FailureReason::NonZeroExit { .. } => "non_zero_exit",
            FailureReason::KilledBySignal { .. } => "killed_by_signal",
            FailureReason::TimeoutExpired => "timeout_expired",
            FailureReason::ChecksFailed { .. } => "checks_failed",
            FailureReason::LogMissing => "log_missing",
            FailureReason::Interrupted => "interrupted",
        }
    }

    fn from_exit(role: Role, outcome: ExitOutcome) -> Option<Self> {
        if outcome.is_clean() {
            return None;
        }
        match (outcome.code, outcome.signal) {
            (Some(code), _) => Some(FailureReason::NonZeroExit { role, code }),
            (None, Some(signal)) => Some(FailureReason::KilledBySignal { role, signal }),
            (None, None) => Some(FailureReason::NonZeroExit { role, code: -1 }),
        }
    }
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailureReason::LaunchFailure { role, message } => {
                write!(f, "{} failed to launch: {}", role, message)
            }
            FailureReason::PeerNotReady { port, waited_secs } => {
                write!(f, "mock peer not listening on {} after {:.1}s", port, waited_secs)
            }
            FailureReason::SubjectNotReady { port } => write!(f, "subject port {} never opened", port),
            FailureReason::NonZeroExit { role, code } => write!(f, "{} exited with code {}", role, code),
            FailureReason::KilledBySignal { role, signal } => {
                write!(f, "{} killed by signal {}", role, signal)
            }
            FailureReason::TimeoutExpired => f.write_str("timeout expired before the scenario completed"),
            FailureReason::ChecksFailed { failed } => write!(f, "{} log check(s) failed", failed),
            FailureReason::LogMissing => f.write_str("subject log not found"),
            FailureReason::Interrupted => f.write_str("interrupted by user"),
        }
    }
}

/// One launched (or attempted) process
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessRecord {
    pub role: Role,
    pub command: String,
    pub pid: Option<i32>,
    pub exit: Option<ExitOutcome>,
    pub stdout: PathBuf,
    pub stderr: PathBuf,
}

/// Everything recorded about one scenario execution
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunResult {
    pub scenario: String,
    pub name: String,
    pub uuid: String,
    pub status: RunStatus,
    pub reason: Option<FailureReason>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub elapsed_secs: f64,
    /// The hard timeout fired; informational unless `reason` says otherwise
    pub timed_out: bool,
    pub work_dir: PathBuf,
    /// Log the checks ran against
    pub log: Option<PathBuf>,
    pub processes: Vec<ProcessRecord>,
    pub checks: Vec<CheckOutcome>,
    pub artifacts: Vec<PathBuf>,
    pub diagnostic: Option<String>,
}

impl RunResult {
    pub fn passed(&self) -> bool {
        self.status == RunStatus::Pass
    }
}

/// How the mock peer is launched
#[derive(Debug, Clone)]
pub struct MockPeerConfig {
    pub command: String,
    /// Argument template; `{uuid}` and `{port}` are substituted per scenario
    pub args_template: String,
}

/// How the stressor is launched
#[derive(Debug, Clone)]
pub struct StressorConfig {
    pub command: String,
    /// Raw words appended after the scenario arguments
    pub extra: String,
}

/// Immutable settings shared by every scenario of a session
#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    pub subject_command: String,
    pub subject_cwd: PathBuf,
    pub mock: Option<MockPeerConfig>,
    pub stressor: Option<StressorConfig>,
    /// Readiness budget for the mock peer and for the subject's port
    pub ready_wait: Duration,
    /// Time between SIGTERM and SIGKILL
    pub grace: Duration,
    /// Time the subject keeps running after the stressor finished
    pub drain: Duration,
    pub subject_log_pattern: String,
    /// Patterns that must appear in the subject log before the stressor starts
    pub ready_markers: Vec<String>,
    pub probe: PortProbeConfig,
}

/// Per-scenario directory layout
#[derive(Debug, Clone)]
pub struct ScenarioLayout {
    pub dir: PathBuf,
    pub logs: PathBuf,
    pub run: PathBuf,
    pub uuid: String,
}

impl ScenarioLayout {
    /// Creates `<session>/<id>-<hex8>/{logs,run}`.
    pub fn create(session_dir: &Path, scenario_id: &str) -> Result<Self> {
        let suffix = Uuid::new_v4().simple().to_string();
        let sid = format!("{}-{}", scenario_id, &suffix[..8]);
        let dir = session_dir.join(&sid);
        let logs = dir.join("logs");
        let run = dir.join("run");
        for d in [&logs, &run] {
            std::fs::create_dir_all(d).wrap_err_with(|| format!("failed to create {}", d.display()))?;
        }
        Ok(Self {
            dir,
            logs,
            run,
            uuid: format!("test-{}", sid),
        })
    }
}

/// Result of driving the children, before teardown
#[derive(Debug, Default)]
struct Verdict {
    reason: Option<FailureReason>,
    timed_out: bool,
    culprit: Option<Role>,
}

impl Verdict {
    fn completed() -> Self {
        Self::default()
    }

    fn failed(reason: FailureReason) -> Self {
        Self {
            reason: Some(reason),
            ..Default::default()
        }
    }

    fn blame(reason: FailureReason, role: Role) -> Self {
        Self {
            reason: Some(reason),
            culprit: Some(role),
            ..Default::default()
        }
    }
}

/// Runs one scenario at a time: mock peer, subject, optional stressor, timeout,
/// teardown and log checks.
pub struct Supervisor {
    config: SupervisorConfig,
    ports: PortManager,
    log_pattern: Regex,
}

impl Supervisor {
    pub fn new(config: SupervisorConfig) -> Result<Self> {
        let log_pattern = glob_to_regex(&config.subject_log_pattern)?;
        for marker in &config.ready_markers {
            log_checks::compile(&marker.replace("{port}", "0"))?;
        }
        Ok(Self {
            ports: PortManager::new(config.probe.clone()),
            config,
            log_pattern,
        })
    }

    /// Executes `scenario` inside `session_dir`
    ///
    /// Per-scenario failures never surface as errors: they are recorded in the
    /// returned result. Errors are reserved for the runner's own environment, such
    /// as an unwritable work directory.
    ///
    /// # Arguments
    /// * `scenario` - The resolved scenario
    /// * `session_dir` - Directory receiving this scenario's work directory
    /// * `cancel` - Fires when the user aborts the run
    ///
    /// # Returns
    /// * `Result<RunResult>` - Exactly one result for the scenario
    pub async fn run(
        &self,
        scenario: &Scenario,
        session_dir: &Path,
        cancel: &CancellationToken,
    ) -> Result<RunResult> {
        let layout = ScenarioLayout::create(session_dir, &scenario.id)?;
        info!("=== RUN {} ({}) in {} ===", scenario.id, scenario.name, layout.dir.display());

        let started_at = Utc::now();
        let clock = Instant::now();
        let mut children: Vec<ManagedChild> = Vec::new();
        let mut failed_launches: Vec<ProcessRecord> = Vec::new();

        let verdict = self
            .drive(scenario, &layout, &mut children, &mut failed_launches, cancel)
            .await?;

        // Tear down in reverse launch order: stressor, subject, mock peer.
        for child in children.iter_mut().rev() {
            if let Err(e) = child.terminate(self.config.grace).await {
                warn!("failed to stop {}: {:#}", child.role(), e);
            }
        }

        let mut processes: Vec<ProcessRecord> = children
            .iter()
            .map(|child| ProcessRecord {
                role: child.role(),
                command: child.command().to_string(),
                pid: Some(child.pid().as_raw()),
                exit: child.outcome(),
                stdout: child.stdout_path().to_path_buf(),
                stderr: child.stderr_path().to_path_buf(),
            })
            .collect();
        processes.extend(failed_launches);
        processes.sort_by_key(|p| p.role);

        let mut reason = verdict.reason;
        let subject_launched = children.iter().any(|c| c.role() == Role::Subject);
        let (log, checks) = if subject_launched {
            self.run_checks(scenario, &layout, &processes)?
        } else {
            (None, Vec::new())
        };

        if reason.is_none() && subject_launched {
            if !scenario.checks.is_empty() && log.is_none() {
                reason = Some(FailureReason::LogMissing);
            } else {
                let failed = checks.iter().filter(|c| !c.matched).count();
                if failed > 0 {
                    reason = Some(FailureReason::ChecksFailed { failed });
                }
            }
        }

        let diagnostic = verdict.culprit.and_then(|role| {
            processes.iter().find(|p| p.role == role).and_then(|p| {
                log_checks::tail_lines(&p.stderr, DIAGNOSTIC_LINES)
                    .or_else(|| log_checks::tail_lines(&p.stdout, DIAGNOSTIC_LINES))
            })
        });

        let artifacts = collect_artifacts(&layout.dir, &processes);
        let status = if reason.is_none() {
            RunStatus::Pass
        } else {
            RunStatus::Fail
        };

        match &reason {
            None => info!("{}: PASS", scenario.id),
            Some(r) => warn!("{}: FAIL ({})", scenario.id, r),
        }

        Ok(RunResult {
            scenario: scenario.id.clone(),
            name: scenario.name.clone(),
            uuid: layout.uuid.clone(),
            status,
            reason,
            started_at,
            finished_at: Utc::now(),
            elapsed_secs: clock.elapsed().as_secs_f64(),
            timed_out: verdict.timed_out,
            work_dir: layout.dir.clone(),
            log,
            processes,
            checks,
            artifacts,
            diagnostic,
        })
    }

    async fn drive(
        &self,
        scenario: &Scenario,
        layout: &ScenarioLayout,
        children: &mut Vec<ManagedChild>,
        failed_launches: &mut Vec<ProcessRecord>,
        cancel: &CancellationToken,
    ) -> Result<Verdict> {
        if let Err(e) = self.ports.ensure_free(scenario.port) {
            return Ok(Verdict::blame(
                FailureReason::LaunchFailure {
                    role: Role::Subject,
                    message: format!("port {} unavailable: {}", scenario.port, e),
                },
                Role::Subject,
            ));
        }

        if let Some(mock) = &self.config.mock {
            let args = command_line::expand_placeholders(&mock.args_template, &layout.uuid, scenario.port);
            let console_port = command_line::console_port(&args);
            let spec = command_line::split_words(&args).and_then(|words| {
                let command = CommandLine::parse(&mock.command)?.extend(words);
                Ok(ChildSpec::new(Role::MockPeer, command, &layout.dir))
            });

            let mut child = match self.launch(Role::MockPeer, &mock.command, spec, layout, failed_launches) {
                Ok(child) => child,
                Err(verdict) => return Ok(verdict),
            };

            info!("waiting for mock peer on {}:{}", LOOPBACK, console_port);
            let waiting = Instant::now();
            let deadline = waiting.checked_add(self.config.ready_wait);
            loop {
                let not_ready = FailureReason::PeerNotReady {
                    port: console_port,
                    waited_secs: waiting.elapsed().as_secs_f64(),
                };
                if let Some(outcome) = child.try_reap()? {
                    children.push(child);
                    let reason = FailureReason::from_exit(Role::MockPeer, outcome).unwrap_or(not_ready);
                    return Ok(Verdict::blame(reason, Role::MockPeer));
                }
                if self.ports.wait_listening(console_port, Duration::ZERO).await {
                    break;
                }
                if expired(deadline) {
                    children.push(child);
                    return Ok(Verdict::blame(not_ready, Role::MockPeer));
                }
                tokio::select! {
                    _ = sleep(self.config.probe.poll_interval) => {}
                    _ = cancel.cancelled() => {
                        children.push(child);
                        return Ok(Verdict::failed(FailureReason::Interrupted));
                    }
                }
            }
            child.mark_ready()?;
            children.push(child);
        }

        let spec = CommandLine::parse(&self.config.subject_command).map(|command| {
            let command = command.extend([
                "-su".to_string(),
                layout.uuid.clone(),
                "-sp".to_string(),
                scenario.port.to_string(),
                "-sh".to_string(),
                LOOPBACK.to_string(),
            ]);
            let mut spec = ChildSpec::new(Role::Subject, command, &layout.dir);
            spec.working_directory = Some(self.config.subject_cwd.clone());
            spec.environment = Environment::for_subject(&layout.logs, &layout.run);
            spec
        });
        match self.launch(Role::Subject, &self.config.subject_command, spec, layout, failed_launches) {
            Ok(child) => children.push(child),
            Err(verdict) => return Ok(verdict),
        }

        if let Some(verdict) = self
            .start_stressor(scenario, layout, children, failed_launches, cancel)
            .await?
        {
            return Ok(verdict);
        }

        self.monitor(scenario, children, cancel).await
    }

    /// Spawns a child, or records the attempt and returns a launch-failure verdict.
    fn launch(
        &self,
        role: Role,
        raw_command: &str,
        spec: std::result::Result<ChildSpec, crate::RunnerError>,
        layout: &ScenarioLayout,
        failed_launches: &mut Vec<ProcessRecord>,
    ) -> std::result::Result<ManagedChild, Verdict> {
        let spawned = match spec {
            Ok(spec) => ManagedChild::spawn(spec),
            Err(e) => Err(e.into()),
        };

        spawned.map_err(|e| {
            let message = format!("{:#}", e);
            warn!("{} failed to launch: {}", role, message);
            let (stdout, stderr) = capture_paths(role, &layout.dir);
            failed_launches.push(ProcessRecord {
                role,
                command: raw_command.to_string(),
                pid: None,
                exit: None,
                stdout,
                stderr,
            });
            Verdict::blame(FailureReason::LaunchFailure { role, message }, role)
        })
    }

    /// Waits for the subject's port and its readiness log markers, then launches
    /// the stressor.
    ///
    /// Returns a verdict only when the scenario is already decided.
    async fn start_stressor(
        &self,
        scenario: &Scenario,
        layout: &ScenarioLayout,
        children: &mut Vec<ManagedChild>,
        failed_launches: &mut Vec<ProcessRecord>,
        cancel: &CancellationToken,
    ) -> Result<Option<Verdict>> {
        let Some(stressor) = &scenario.stressor else {
            return Ok(None);
        };
        let Some(config) = &self.config.stressor else {
            info!("no stressor command configured, {} runs without load", scenario.id);
            return Ok(None);
        };

        {
            let Some(subject) = children.iter_mut().find(|c| c.role() == Role::Subject) else {
                return Ok(None);
            };

            let markers = self
                .config
                .ready_markers
                .iter()
                .map(|m| log_checks::compile(&m.replace("{port}", &scenario.port.to_string())))
                .collect::<std::result::Result<Vec<_>, _>>()?;

            info!("waiting for subject on {}:{}", LOOPBACK, scenario.port);
            let deadline = Instant::now().checked_add(self.config.ready_wait);
            let mut listening = false;
            loop {
                if let Some(outcome) = subject.try_reap()? {
                    // A clean early exit is picked up by the monitor as completion.
                    return Ok(FailureReason::from_exit(Role::Subject, outcome)
                        .map(|reason| Verdict::blame(reason, Role::Subject)));
                }
                if !listening && self.ports.wait_listening(scenario.port, Duration::ZERO).await {
                    listening = true;
                }
                if listening && self.markers_logged(layout, &markers) {
                    break;
                }
                if expired(deadline) {
                    if listening {
                        warn!(
                            "subject port {} is open but its log never showed the ready markers",
                            scenario.port
                        );
                    }
                    return Ok(Some(Verdict::blame(
                        FailureReason::SubjectNotReady { port: scenario.port },
                        Role::Subject,
                    )));
                }
                tokio::select! {
                    _ = sleep(self.config.probe.poll_interval) => {}
                    _ = cancel.cancelled() => return Ok(Some(Verdict::failed(FailureReason::Interrupted))),
                }
            }
            subject.mark_ready()?;
        }

        let spec = command_line::split_words(&config.extra).and_then(|extra| {
            let command = CommandLine::parse(&config.command)?
                .extend([
                    "--host".to_string(),
                    LOOPBACK.to_string(),
                    "--port".to_string(),
                    scenario.port.to_string(),
                    "--scenario".to_string(),
                    stressor.scenario.clone(),
                ])
                .extend(command_line::flatten_args(&stressor.args))
                .extend(extra);
            Ok(ChildSpec::new(Role::Stressor, command, &layout.dir))
        });
        debug!("stressor args map: {:?}", stressor.args);

        match self.launch(Role::Stressor, &config.command, spec, layout, failed_launches) {
            Ok(child) => {
                children.push(child);
                Ok(None)
            }
            Err(verdict) => Ok(Some(verdict)),
        }
    }

    /// Watches running children until one decides the scenario, the timeout fires
    /// or the run is cancelled.
    async fn monitor(
        &self,
        scenario: &Scenario,
        children: &mut [ManagedChild],
        cancel: &CancellationToken,
    ) -> Result<Verdict> {
        for child in children.iter_mut() {
            if child.try_reap()?.is_none() {
                child.mark_running()?;
            }
        }

        info!("{} running for up to {:?}", scenario.id, scenario.duration);
        let deadline = sleep(scenario.duration);
        tokio::pin!(deadline);
        let mut ticker = interval(MONITOR_INTERVAL);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut handled: HashSet<Role> = HashSet::new();

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    return Ok(Verdict::failed(FailureReason::Interrupted));
                }

                _ = &mut deadline => {
                    info!("{} reached its {:?} timeout", scenario.id, scenario.duration);
                    let mut verdict = if scenario.expect_early_exit {
                        Verdict::failed(FailureReason::TimeoutExpired)
                    } else {
                        Verdict::completed()
                    };
                    verdict.timed_out = true;
                    return Ok(verdict);
                }

                _ = ticker.tick() => {
                    if let Some(verdict) = first_failure(children, &mut handled)? {
                        return Ok(verdict);
                    }
                    if handled.contains(&Role::Subject) {
                        info!("subject completed");
                        return Ok(Verdict::completed());
                    }
                    if handled.contains(&Role::Stressor) {
                        info!("stressor finished, draining for {:?}", self.config.drain);
                        tokio::select! {
                            _ = sleep(self.config.drain) => {}
                            _ = cancel.cancelled() => {
                                return Ok(Verdict::failed(FailureReason::Interrupted));
                            }
                        }
                        return Ok(first_failure(children, &mut handled)?.unwrap_or_else(Verdict::completed));
                    }
                }
            }
        }
    }

    /// All `markers` occur in the tail of the subject log.
    fn markers_logged(&self, layout: &ScenarioLayout, markers: &[Regex]) -> bool {
        if markers.is_empty() {
            return true;
        }
        let Some(path) = log_checks::find_log(&layout.logs, &self.log_pattern) else {
            return false;
        };
        match log_checks::tail_bytes(&path, CHECK_WINDOW_BYTES) {
            Ok(content) => markers.iter().all(|m| m.is_match(&content)),
            Err(e) => {
                debug!("cannot read {} yet: {}", path.display(), e);
                false
            }
        }
    }

    fn run_checks(
        &self,
        scenario: &Scenario,
        layout: &ScenarioLayout,
        processes: &[ProcessRecord],
    ) -> Result<(Option<PathBuf>, Vec<CheckOutcome>)> {
        let log = log_checks::find_log(&layout.logs, &self.log_pattern).or_else(|| {
            processes
                .iter()
                .find(|p| p.role == Role::Subject)
                .map(|p| p.stdout.clone())
                .filter(|path| std::fs::metadata(path).is_ok_and(|m| m.len() > 0))
        });

        let Some(path) = log else {
            return Ok((None, Vec::new()));
        };
        if scenario.checks.is_empty() {
            return Ok((Some(path), Vec::new()));
        }

        let content = log_checks::tail_bytes(&path, CHECK_WINDOW_BYTES)
            .wrap_err_with(|| format!("failed to read {}", path.display()))?;
        let checks = log_checks::evaluate(&scenario.checks, &content)?;
        for check in &checks {
            debug!(
                "check '{}': count={} matched={}",
                check.pattern, check.count, check.matched
            );
        }
        Ok((Some(path), checks))
    }
}

/// `None` is a deadline too far out to represent and never passes.
fn expired(deadline: Option<Instant>) -> bool {
    deadline.is_some_and(|d| Instant::now() >= d)
}

/// Reaps newly exited children; the first unclean exit decides the scenario.
fn first_failure(children: &mut [ManagedChild], handled: &mut HashSet<Role>) -> Result<Option<Verdict>> {
    for child in children.iter_mut() {
        let role = child.role();
        if handled.contains(&role) {
            continue;
        }
        let Some(outcome) = child.try_reap()? else {
            continue;
        };
        handled.insert(role);
        if let Some(reason) = FailureReason::from_exit(role, outcome) {
            return Ok(Some(Verdict::blame(reason, role)));
        }
        debug!("{} exited cleanly", role);
    }
    Ok(None)
}

/// Files left in the scenario directory apart from the process captures.
fn collect_artifacts(dir: &Path, processes: &[ProcessRecord]) -> Vec<PathBuf> {
    let captures: HashSet<&Path> = processes
        .iter()
        .flat_map(|p| [p.stdout.as_path(), p.stderr.as_path()])
        .collect();

    WalkDir::new(dir)
        .sort_by_file_name()
        .into_iter()
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_type().is_file())
        .map(|entry| entry.into_path())
        .filter(|path| !captures.contains(path.as_path()))
        .collect()
}
