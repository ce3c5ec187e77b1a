use anyhow::{Context, Result};
use nix::{sys::signal::Signal, unistd::Pid};
use std::net::TcpListener;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Output};
use std::time::{Duration, Instant};
use tempfile::TempDir;
use tokio::process::Command;
use tokio::time::timeout;

/// Core testing harness for running stress-runner sessions during integration tests
pub struct RunnerHarness {
    runner_binary: PathBuf,
    validator_binary: PathBuf,
    temp_dir: TempDir,
    base_port: u16,
    cleanup_pids: Vec<Pid>,
}

impl RunnerHarness {
    /// Create a new test harness with its own work root and base port
    pub fn new() -> Result<Self> {
        let temp_dir = TempDir::new().context("Failed to create temporary directory")?;
        let base_port = TcpListener::bind("127.0.0.1:0")?.local_addr()?.port();

        Ok(Self {
            runner_binary: PathBuf::from(env!("CARGO_BIN_EXE_stress-runner")),
            validator_binary: PathBuf::from(env!("CARGO_BIN_EXE_shm-validate")),
            temp_dir,
            base_port,
            cleanup_pids: Vec::new(),
        })
    }

    /// Get the temporary directory path, used as sensor cwd and work root
    pub fn temp_path(&self) -> &Path {
        self.temp_dir.path()
    }

    pub fn report_path(&self) -> PathBuf {
        self.temp_path().join("report.json")
    }

    /// Spawn stress-runner with short timings plus the given arguments
    pub async fn spawn_runner(&mut self, args: &[&str]) -> Result<TestProcess> {
        let root = self.temp_path().to_path_buf();
        let mut cmd = Command::new(&self.runner_binary);
        cmd.arg("--cwd")
            .arg(&root)
            .arg("--work-root")
            .arg(&root)
            .args(["--base-port", &self.base_port.to_string()])
            .args(["--grace-seconds", "1", "--drain-seconds", "0", "--sensor-wait-seconds", "2"])
            .args(args)
            .env("RUST_LOG", "debug");

        // Spawn in a new process group for easier cleanup
        cmd.process_group(0);

        let start_time = Instant::now();
        let child = cmd.spawn().context("Failed to spawn stress-runner")?;
        let pid = Pid::from_raw(
            child
                .id()
                .ok_or_else(|| anyhow::anyhow!("Failed to get child PID"))? as i32,
        );
        self.cleanup_pids.push(pid);

        Ok(TestProcess {
            pid,
            start_time,
            child: Some(child),
        })
    }

    /// Run stress-runner to completion and return its exit code
    pub async fn run_runner(&mut self, args: &[&str], limit: Duration) -> Result<i32> {
        let mut process = self.spawn_runner(args).await?;
        let status = process
            .wait_for_exit_timeout(limit)
            .await?
            .ok_or_else(|| anyhow::anyhow!("stress-runner did not finish within {:?}", limit))?;
        status
            .code()
            .ok_or_else(|| anyhow::anyhow!("stress-runner killed by a signal: {:?}", status))
    }

    /// Run shm-validate to completion
    pub async fn run_validator(&self, args: &[&str]) -> Result<Output> {
        let output = timeout(
            Duration::from_secs(20),
            Command::new(&self.validator_binary).args(args).output(),
        )
        .await
        .context("shm-validate timed out")?
        .context("Failed to run shm-validate")?;
        Ok(output)
    }

    /// Session directories created under `<work root>/work`
    pub fn session_dirs(&self) -> Result<Vec<PathBuf>> {
        let work = self.temp_path().join("work");
        if !work.exists() {
            return Ok(Vec::new());
        }
        let mut dirs: Vec<PathBuf> = std::fs::read_dir(&work)?
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|path| path.is_dir())
            .collect();
        dirs.sort();
        Ok(dirs)
    }
}

impl Drop for RunnerHarness {
    fn drop(&mut self) {
        // Clean up any remaining runner process groups
        for pid in &self.cleanup_pids {
            let _ = nix::sys::signal::killpg(*pid, Signal::SIGKILL);
        }
    }
}

/// A spawned stress-runner with timing and control capabilities
pub struct TestProcess {
    pub pid: Pid,
    pub start_time: Instant,
    child: Option<tokio::process::Child>,
}

impl TestProcess {
    /// Wait for process exit with a timeout
    pub async fn wait_for_exit_timeout(&mut self, duration: Duration) -> Result<Option<ExitStatus>> {
        if let Some(child) = &mut self.child {
            match timeout(duration, child.wait()).await {
                Ok(result) => Ok(Some(result.context("Process wait failed")?)),
                Err(_) => Ok(None),
            }
        } else {
            Ok(None)
        }
    }

    /// Get the runtime duration since process start
    pub fn runtime(&self) -> Duration {
        self.start_time.elapsed()
    }
}
