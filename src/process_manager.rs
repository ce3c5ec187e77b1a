use super::Result;
use crate::command_line::CommandLine;
use crate::environment::Environment;
use crate::error::RunnerError;
use eyre::WrapErr;
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs::File;
use std::os::unix::process::ExitStatusExt;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::time::Duration;
use tokio::process::{Child, Command};
use tokio::time::timeout;
use tracing::{debug, info, warn};

/// Which part a child process plays in a scenario
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    /// Board emulator the subject talks to
    MockPeer,
    /// The sensor under test
    Subject,
    /// Optional load generator hitting the subject's port
    Stressor,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::MockPeer => "mock_peer",
            Role::Subject => "subject",
            Role::Stressor => "stressor",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle of a supervised child
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChildState {
    /// Spawned, readiness not yet confirmed
    Starting,
    /// Readiness signal observed (or no readiness probe applies)
    Ready,
    /// Part of the monitored scenario window
    Running,
    /// Termination requested by the supervisor
    Terminating,
    /// Reaped
    Exited,
}

impl ChildState {
    /// Whether the lifecycle allows moving from `self` to `next`.
    pub fn can_transition_to(self, next: ChildState) -> bool {
        use ChildState::*;
        matches!(
            (self, next),
            (Starting, Ready)
                | (Starting, Terminating)
                | (Starting, Exited)
                | (Ready, Running)
                | (Ready, Terminating)
                | (Ready, Exited)
                | (Running, Terminating)
                | (Running, Exited)
                | (Terminating, Exited)
        )
    }
}

/// How a child ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExitOutcome {
    /// Exit code, if the process exited normally
    pub code: Option<i32>,
    /// Terminating signal number, if the process was killed by a signal
    pub signal: Option<i32>,
    /// Whether the supervisor asked the process to stop
    pub terminated_by_supervisor: bool,
}

impl ExitOutcome {
    fn from_status(status: ExitStatus, terminated_by_supervisor: bool) -> Self {
        Self {
            code: status.code(),
            signal: status.signal(),
            terminated_by_supervisor,
        }
    }

    /// A child ended cleanly if it exited 0 on its own or was stopped by the supervisor.
    pub fn is_clean(&self) -> bool {
        self.terminated_by_supervisor || self.code == Some(0)
    }
}

/// Everything needed to launch one child
#[derive(Debug, Clone)]
pub struct ChildSpec {
    pub role: Role,
    pub command: CommandLine,
    pub working_directory: Option<PathBuf>,
    pub environment: Environment,
    /// File receiving the child's stdout
    pub stdout: PathBuf,
    /// File receiving the child's stderr
    pub stderr: PathBuf,
}

/// Capture files for `role`: `<role>_stdout.log` and `<role>_stderr.log` in `dir`.
pub fn capture_paths(role: Role, dir: &Path) -> (PathBuf, PathBuf) {
    (
        dir.join(format!("{}_stdout.log", role)),
        dir.join(format!("{}_stderr.log", role)),
    )
}

impl ChildSpec {
    /// Spec capturing output into `capture_dir`, see [`capture_paths`].
    pub fn new(role: Role, command: CommandLine, capture_dir: &Path) -> Self {
        let (stdout, stderr) = capture_paths(role, capture_dir);
        Self {
            role,
            command,
            working_directory: None,
            environment: Environment::new(),
            stdout,
            stderr,
        }
    }
}

/// A child process in its own process group, driven through [`ChildState`].
///
/// Signals go to the whole group so helpers spawned by the child die with it.
/// Dropping a child that has not been reaped kills its group.
pub struct ManagedChild {
    role: Role,
    command: String,
    state: ChildState,
    pid: Pid,
    child: Child,
    outcome: Option<ExitOutcome>,
    stdout: PathBuf,
    stderr: PathBuf,
}

impl ManagedChild {
    /// Spawns a child according to `spec`
    ///
    /// # Arguments
    /// * `spec` - Command, environment overlay and capture files
    ///
    /// # Returns
    /// * `Result<Self>` - The child in [`ChildState::Starting`], or the launch error
    pub fn spawn(spec: ChildSpec) -> Result<Self> {
        let stdout = File::create(&spec.stdout)
            .wrap_err_with(|| format!("failed to create {}", spec.stdout.display()))?;
        let stderr = File::create(&spec.stderr)
            .wrap_err_with(|| format!("failed to create {}", spec.stderr.display()))?;

        let mut command = Command::new(&spec.command.program);
        command.args(&spec.command.args);

        // process_group(0) makes the child a group leader so the whole tree can be signalled
        command.process_group(0);
        command.kill_on_drop(true);
        command.stdin(Stdio::null());
        command.stdout(Stdio::from(stdout));
        command.stderr(Stdio::from(stderr));

        if let Some(ref work_dir) = spec.working_directory {
            command.current_dir(work_dir);
        }
        for (key, value) in spec.environment.iter() {
            command.env(key, value);
        }

        info!("spawning {}: {}", spec.role, spec.command.display());
        let child = command
            .spawn()
            .wrap_err_with(|| format!("failed to spawn {} '{}'", spec.role, spec.command.program))?;

        let pid = match child.id() {
            Some(pid) => Pid::from_raw(pid.try_into()?),
            None => return Err(eyre::eyre!("{} exited before its pid was read", spec.role)),
        };
        info!("{} spawned with PID: {}", spec.role, pid);

        Ok(Self {
            role: spec.role,
            command: spec.command.display(),
            state: ChildState::Starting,
            pid,
            child,
            outcome: None,
            stdout: spec.stdout,
            stderr: spec.stderr,
        })
    }

    pub fn role(&self) -> Role {
        self.role
    }

    /// The command line as launched
    pub fn command(&self) -> &str {
        &self.command
    }

    pub fn state(&self) -> ChildState {
        self.state
    }

    pub fn pid(&self) -> Pid {
        self.pid
    }

    pub fn outcome(&self) -> Option<ExitOutcome> {
        self.outcome
    }

    pub fn stdout_path(&self) -> &Path {
        &self.stdout
    }

    pub fn stderr_path(&self) -> &Path {
        &self.stderr
    }

    fn transition(&mut self, next: ChildState) -> std::result::Result<(), RunnerError> {
        if !self.state.can_transition_to(next) {
            return Err(RunnerError::InvalidTransition {
                role: self.role.to_string(),
                from: self.state,
                to: next,
            });
        }
        debug!("{} {:?} -> {:?}", self.role, self.state, next);
        self.state = next;
        Ok(())
    }

    /// Records the readiness signal.
    pub fn mark_ready(&mut self) -> Result<()> {
        Ok(self.transition(ChildState::Ready)?)
    }

    /// Enters the monitored window. Children without a readiness probe pass
    /// through `Ready` implicitly.
    pub fn mark_running(&mut self) -> Result<()> {
        if self.state == ChildState::Starting {
            self.transition(ChildState::Ready)?;
        }
        Ok(self.transition(ChildState::Running)?)
    }

    fn record_exit(&mut self, status: ExitStatus) -> Result<ExitOutcome> {
        let by_supervisor = self.state == ChildState::Terminating;
        let outcome = ExitOutcome::from_status(status, by_supervisor);
        self.transition(ChildState::Exited)?;
        self.outcome = Some(outcome);
        info!("{} (PID {}) exited with status: {:?}", self.role, self.pid, status);
        Ok(outcome)
    }

    /// Non-blocking check for exit
    ///
    /// # Returns
    /// * `Result<Option<ExitOutcome>>` - The outcome once the child has exited
    pub fn try_reap(&mut self) -> Result<Option<ExitOutcome>> {
        if let Some(outcome) = self.outcome {
            return Ok(Some(outcome));
        }
        match self.child.try_wait()? {
            Some(status) => Ok(Some(self.record_exit(status)?)),
            None => Ok(None),
        }
    }

    /// Stops the child: SIGTERM to its group, SIGKILL after `grace`
    ///
    /// # Arguments
    /// * `grace` - How long to wait for a graceful exit
    ///
    /// # Returns
    /// * `Result<ExitOutcome>` - The final outcome; already-exited children return theirs
    pub async fn terminate(&mut self, grace: Duration) -> Result<ExitOutcome> {
        if let Some(outcome) = self.try_reap()? {
            return Ok(outcome);
        }

        self.transition(ChildState::Terminating)?;
        info!("terminating {} (PID {})", self.role, self.pid);
        if let Err(e) = self.signal_group(Signal::SIGTERM) {
            warn!("failed to send SIGTERM to {}: {}", self.role, e);
        }

        match timeout(grace, self.child.wait()).await {
            Ok(status) => self.record_exit(status?),
            Err(_) => {
                warn!("{} ignored SIGTERM for {:?}, forcing kill", self.role, grace);
                if let Err(e) = self.signal_group(Signal::SIGKILL) {
                    warn!("failed to send SIGKILL to {}: {}", self.role, e);
                }
                let status = self.child.wait().await?;
                self.record_exit(status)
            }
        }
    }

    fn signal_group(&self, signal: Signal) -> nix::Result<()> {
        debug!("sending {:?} to process group {}", signal, self.pid);
        kill(Pid::from_raw(-self.pid.as_raw()), signal)
    }
}

#[cfg(test)]
impl ManagedChild {
    async fn wait(&mut self) -> Result<ExitOutcome> {
        if let Some(outcome) = self.outcome {
            return Ok(outcome);
        }
        let status = self.child.wait().await?;
        self.record_exit(status)
    }
}

impl Drop for ManagedChild {
    fn drop(&mut self) {
        if self.state == ChildState::Exited {
            return;
        }
        match self.signal_group(Signal::SIGKILL) {
            Ok(()) => warn!("{} (PID {}) dropped while alive, killed its process group", self.role, self.pid),
            Err(nix::Error::ESRCH) => {}
            Err(e) => warn!("failed to kill process group {} on drop: {}", self.pid, e),
        }
    }
}
