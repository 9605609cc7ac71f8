//! Runner module - Execution abstraction layer
//!
//! `ProcessRunner` spawns one command as the leader of a fresh process group,
//! enforces time, memory and output ceilings on the group and its
//! descendants, and kills and reaps all of them before returning.
//!
//! The runner module does NOT:
//! - Know about languages or compile steps
//! - Manage workspaces
//! - Interpret exit codes beyond raw status

mod capture;
mod group;
mod monitor;
mod process;

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tokio_util::sync::CancellationToken;

use crate::error::RunnerResult;

pub use group::ProcessGroup;
pub use monitor::{GroupMonitor, GroupSample};
pub use process::ProcessRunner;

/// Command specification for execution
#[derive(Debug, Clone, Default)]
pub struct CommandSpec {
    /// Program path or name
    pub program: String,
    /// Arguments to the program
    pub args: Vec<String>,
    /// Extra environment variables (KEY=VALUE)
    pub env: Vec<String>,
    /// Working directory, also exported as HOME
    pub work_dir: Option<PathBuf>,
}

impl CommandSpec {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            ..Self::default()
        }
    }

    pub fn with_args(mut self, args: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.args = args.into_iter().map(|a| a.into()).collect();
        self
    }

    pub fn with_env(mut self, env: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.env = env.into_iter().map(|e| e.into()).collect();
        self
    }

    pub fn with_work_dir(mut self, dir: impl AsRef<Path>) -> Self {
        self.work_dir = Some(dir.as_ref().to_path_buf());
        self
    }

    /// Create from a rendered command line (first element is the program)
    pub fn from_vec(cmd: &[String]) -> Self {
        let mut iter = cmd.iter();
        Self {
            program: iter.next().cloned().unwrap_or_default(),
            args: iter.cloned().collect(),
            ..Self::default()
        }
    }
}

/// Resource ceilings for one process group
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunLimits {
    /// Wall clock deadline in milliseconds
    pub wall_time_ms: u64,
    /// CPU time limit in milliseconds, summed over the group
    pub cpu_time_ms: u64,
    /// Resident memory limit in MB, summed over the group
    pub memory_mb: u32,
    /// Capture limit per stream
    pub max_output_bytes: usize,
    /// RLIMIT_NPROC, if set (per user, so only meaningful under a dedicated uid)
    pub max_processes: Option<u64>,
    pub max_file_size_kb: u64,
    pub max_open_files: u64,
}

impl RunLimits {
    /// Limits for a CPU budget, with the wall deadline at twice the budget plus a second
    pub fn for_time(time_ms: u32, memory_mb: u32, max_output_bytes: usize) -> Self {
        let cpu_time_ms = u64::from(time_ms);
        Self {
            wall_time_ms: cpu_time_ms * 2 + 1000,
            cpu_time_ms,
            memory_mb,
            max_output_bytes,
            ..Self::default()
        }
    }
}

impl Default for RunLimits {
    fn default() -> Self {
        Self {
            wall_time_ms: 3_000,
            cpu_time_ms: 1_000,
            memory_mb: 256,
            max_output_bytes: 64 * 1024,
            max_processes: None,
            max_file_size_kb: 256 * 1024,
            max_open_files: 256,
        }
    }
}

/// How the process ended, before any interpretation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunStatus {
    /// Program exited normally with given exit code
    Exited(i32),
    /// Killed by a signal the runner did not send
    Signaled(i32),
    /// CPU or wall time limit exceeded
    TimeLimitExceeded,
    /// Memory limit exceeded
    MemoryLimitExceeded,
    /// Output capture limit exceeded
    OutputLimitExceeded,
    /// Caller cancelled the run
    Cancelled,
}

impl RunStatus {
    /// Check if execution was successful (exited with code 0)
    pub fn is_success(&self) -> bool {
        matches!(self, RunStatus::Exited(0))
    }
}

/// Outcome of running a program
#[derive(Debug, Clone)]
pub struct RunOutcome {
    pub status: RunStatus,
    /// Exit code, -1 when the process did not exit normally
    pub exit_code: i32,
    /// Terminating signal, if any
    pub signal: Option<i32>,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub wall_time_ms: u64,
    /// Last sampled CPU time of the group
    pub cpu_time_ms: u64,
    /// Peak sampled resident memory of the group
    pub memory_kb: u64,
    pub timed_out: bool,
    pub memory_exceeded: bool,
    pub truncated: bool,
    pub cancelled: bool,
}

impl RunOutcome {
    /// Exit code 0 with nothing killed and nothing truncated
    pub fn is_success(&self) -> bool {
        self.status.is_success() && !self.truncated
    }
}

/// Runner trait for executing programs
#[async_trait]
pub trait Runner: Send + Sync {
    /// Run a command under the given limits with optional stdin
    async fn run(
        &self,
        cmd: &CommandSpec,
        limits: &RunLimits,
        stdin: Option<&[u8]>,
        cancel: &CancellationToken,
    ) -> RunnerResult<RunOutcome>;
}
