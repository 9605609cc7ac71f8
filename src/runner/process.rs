//! Process runner implementation
//!
//! Runs a command directly on the host as the leader of its own process
//! group. Limits are enforced on the group as a whole: kernel rlimits set
//! before exec, a /proc sampler for memory and CPU, a wall deadline, and
//! capped output capture.

use async_trait::async_trait;
use std::os::unix::process::ExitStatusExt;
use std::process::Stdio;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tokio::sync::Notify;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use nix::sys::signal::Signal;
use uuid::Uuid;

use super::capture::Capture;
use super::group::{adopt_orphans, ProcessGroup, Rlimits};
use super::monitor::GroupMonitor;
use super::{CommandSpec, RunLimits, RunOutcome, RunStatus, Runner};
use crate::error::{RunnerError, RunnerResult};

const DEFAULT_PATH: &str = "/usr/local/sbin:/usr/local/bin:/usr/sbin:/usr/bin:/sbin:/bin";
/// Set in every run's environment to find its orphans
const RUN_MARKER_VAR: &str = "CODE_RUNNER_RUN";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StopReason {
    TimedOut,
    MemoryExceeded,
    OutputOverflow,
    Cancelled,
}

/// Runner that executes commands as host processes under group-wide limits
#[derive(Debug, Clone)]
pub struct ProcessRunner {
    /// How often the group's /proc entries are sampled
    monitor_interval: Duration,
    /// How long to wait for output pipes to close after the group is killed
    drain_grace: Duration,
}

impl ProcessRunner {
    pub fn new(monitor_interval: Duration) -> Self {
        adopt_orphans();
        Self {
            // A zero period would make the sampling interval panic
            monitor_interval: monitor_interval.max(Duration::from_millis(1)),
            drain_grace: Duration::from_secs(2),
        }
    }
}

impl Default for ProcessRunner {
    fn default() -> Self {
        Self::new(Duration::from_millis(10))
    }
}

#[async_trait]
impl Runner for ProcessRunner {
    async fn run(
        &self,
        cmd: &CommandSpec,
        limits: &RunLimits,
        stdin: Option<&[u8]>,
        cancel: &CancellationToken,
    ) -> RunnerResult<RunOutcome> {
        if cmd.program.is_empty() {
            return Err(RunnerError::ResourceExhausted("empty command".to_string()));
        }

        debug!(
            "Running {} {:?} with limits {:?}",
            cmd.program, cmd.args, limits
        );

        let mut command = Command::new(&cmd.program);
        command
            .args(&cmd.args)
            .env_clear()
            .env(
                "PATH",
                std::env::var_os("PATH").unwrap_or_else(|| DEFAULT_PATH.into()),
            )
            .stdin(if stdin.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .process_group(0)
            .kill_on_drop(true);

        if let Some(dir) = &cmd.work_dir {
            command.current_dir(dir).env("HOME", dir);
        }
        for entry in &cmd.env {
            if let Some((key, value)) = entry.split_once('=') {
                command.env(key, value);
            }
        }
        let run_id = Uuid::new_v4().simple().to_string();
        command.env(RUN_MARKER_VAR, &run_id);

        let rlimits = Rlimits::from_limits(limits);
        // SAFETY: the closure only calls setrlimit, which is async-signal-safe
        unsafe {
            command.pre_exec(move || rlimits.apply());
        }

        let started = Instant::now();
        let mut child = command
            .spawn()
            .map_err(|e| RunnerError::exhausted(&format!("failed to spawn {}", cmd.program), e))?;
        let leader = child
            .id()
            .ok_or_else(|| RunnerError::ResourceExhausted("child exited before tracking".into()))?;
        let mut group =
            ProcessGroup::new(leader).with_marker(format!("{}={}", RUN_MARKER_VAR, run_id));

        let stdin_task = match (child.stdin.take(), stdin) {
            (Some(mut pipe), Some(input)) => {
                let input = input.to_vec();
                Some(tokio::spawn(async move {
                    if let Err(e) = pipe.write_all(&input).await {
                        // Programs are free to exit without reading their input
                        if e.kind() != std::io::ErrorKind::BrokenPipe {
                            debug!("Failed to write stdin: {}", e);
                        }
                    }
                }))
            }
            _ => None,
        };

        let overflow = Arc::new(Notify::new());
        let stdout = Capture::default();
        let stderr = Capture::default();
        let limit = limits.max_output_bytes;
        let readers = [
            child
                .stdout
                .take()
                .map(|pipe| spawn_capture(pipe, &stdout, limit, &overflow)),
            child
                .stderr
                .take()
                .map(|pipe| spawn_capture(pipe, &stderr, limit, &overflow)),
        ];

        let mut monitor = GroupMonitor::new();
        let mut ticker = tokio::time::interval(self.monitor_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let deadline = tokio::time::sleep(Duration::from_millis(limits.wall_time_ms));
        tokio::pin!(deadline);

        let memory_limit_kb = u64::from(limits.memory_mb) * 1024;
        let mut stop: Option<StopReason> = None;

        let wait_result = loop {
            tokio::select! {
                result = child.wait() => break result,
                _ = &mut deadline, if stop.is_none() => {
                    stop = Some(StopReason::TimedOut);
                    group.kill();
                }
                _ = ticker.tick(), if stop.is_none() => {
                    let sample = monitor.sample(&mut group).await;
                    if sample.rss_kb > memory_limit_kb {
                        stop = Some(StopReason::MemoryExceeded);
                        group.kill();
                    } else if sample.cpu_time_ms > limits.cpu_time_ms {
                        stop = Some(StopReason::TimedOut);
                        group.kill();
                    }
                }
                _ = overflow.notified(), if stop.is_none() => {
                    stop = Some(StopReason::OutputOverflow);
                    group.kill();
                }
                _ = cancel.cancelled(), if stop.is_none() => {
                    stop = Some(StopReason::Cancelled);
                    group.kill();
                }
            }
        };

        // Descendants still holding the pipes die with the group, including
        // any that left it
        group.terminate().await;
        let wall_time_ms = started.elapsed().as_millis() as u64;

        let drain_deadline = tokio::time::Instant::now() + self.drain_grace;
        for reader in readers.into_iter().flatten() {
            let abort = reader.abort_handle();
            if tokio::time::timeout_at(drain_deadline, reader).await.is_err() {
                warn!(
                    "Output of process group {} still open after kill, abandoning",
                    group.pgid()
                );
                abort.abort();
            }
        }
        if let Some(task) = stdin_task {
            task.abort();
        }

        let exit_status =
            wait_result.map_err(|e| RunnerError::exhausted("failed to wait for child", e))?;
        let exit_code = exit_status.code().unwrap_or(-1);
        let signal = exit_status.signal();
        let truncated = stdout.overflowed() || stderr.overflowed();

        let status = match stop {
            Some(StopReason::Cancelled) => RunStatus::Cancelled,
            Some(StopReason::MemoryExceeded) => RunStatus::MemoryLimitExceeded,
            Some(StopReason::TimedOut) => RunStatus::TimeLimitExceeded,
            Some(StopReason::OutputOverflow) => RunStatus::OutputLimitExceeded,
            None => match signal {
                Some(sig) if sig == Signal::SIGXCPU as i32 => RunStatus::TimeLimitExceeded,
                Some(sig) => RunStatus::Signaled(sig),
                None => RunStatus::Exited(exit_code),
            },
        };

        let outcome = RunOutcome {
            status,
            exit_code,
            signal,
            stdout: stdout.take(),
            stderr: stderr.take(),
            wall_time_ms,
            cpu_time_ms: monitor.cpu_time_ms(),
            memory_kb: monitor.peak_rss_kb(),
            timed_out: status == RunStatus::TimeLimitExceeded,
            memory_exceeded: status == RunStatus::MemoryLimitExceeded,
            truncated,
            cancelled: status == RunStatus::Cancelled,
        };

        debug!(
            "Process group {} finished: {:?}, {}ms wall, {}ms cpu, {}KB",
            group.pgid(),
            outcome.status,
            outcome.wall_time_ms,
            outcome.cpu_time_ms,
            outcome.memory_kb
        );

        Ok(outcome)
    }
}

fn spawn_capture<R>(
    pipe: R,
    capture: &Capture,
    limit: usize,
    overflow: &Arc<Notify>,
) -> tokio::task::JoinHandle<()>
where
    R: tokio::io::AsyncRead + Send + Unpin + 'static,
{
    let capture = capture.clone();
    let overflow = Arc::clone(overflow);
    tokio::spawn(async move { capture.read_from(pipe, limit, overflow).await })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_test::assert_ok;

    fn sh(script: &str) -> CommandSpec {
        CommandSpec::new("sh").with_args(["-c", script])
    }

    fn limits(time_ms: u32) -> RunLimits {
        RunLimits::for_time(time_ms, 256, 64 * 1024)
    }

    async fn run(cmd: &CommandSpec, limits: &RunLimits, stdin: Option<&[u8]>) -> RunOutcome {
        ProcessRunner::default()
            .run(cmd, limits, stdin, &CancellationToken::new())
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_stdin_round_trip() {
        let outcome = run(&CommandSpec::new("cat"), &limits(2000), Some(b"hello\nworld\n")).await;

        assert_eq!(outcome.status, RunStatus::Exited(0));
        assert_eq!(outcome.stdout, b"hello\nworld\n");
        assert!(outcome.stderr.is_empty());
        assert!(outcome.is_success());
    }

    #[tokio::test]
    async fn test_exit_code_and_stderr() {
        let outcome = run(&sh("echo out; echo err >&2; exit 3"), &limits(2000), None).await;

        assert_eq!(outcome.status, RunStatus::Exited(3));
        assert_eq!(outcome.exit_code, 3);
        assert_eq!(outcome.signal, None);
        assert_eq!(outcome.stdout, b"out\n");
        assert_eq!(outcome.stderr, b"err\n");
    }

    #[tokio::test]
    async fn test_signal_reported() {
        let outcome = run(&sh("kill -SEGV $$"), &limits(2000), None).await;

        assert_eq!(outcome.status, RunStatus::Signaled(Signal::SIGSEGV as i32));
        assert_eq!(outcome.exit_code, -1);
        assert_eq!(outcome.signal, Some(Signal::SIGSEGV as i32));
    }

    #[tokio::test]
    async fn test_cpu_loop_times_out() {
        let outcome = run(&sh("while :; do :; done"), &limits(300), None).await;

        assert!(outcome.timed_out);
        assert_eq!(outcome.status, RunStatus::TimeLimitExceeded);
        assert_eq!(outcome.exit_code, -1);
        assert!(outcome.wall_time_ms < 5_000);
    }

    #[tokio::test]
    async fn test_sleep_hits_wall_deadline() {
        let outcome = run(&CommandSpec::new("sleep").with_args(["30"]), &limits(100), None).await;

        assert!(outcome.timed_out);
        assert!(outcome.wall_time_ms >= 1_200);
        assert!(outcome.wall_time_ms < 10_000);
    }

    #[tokio::test]
    async fn test_memory_hog_killed() {
        let limits = RunLimits::for_time(10_000, 32, 64 * 1024);
        let outcome = run(&CommandSpec::new("tail").with_args(["/dev/zero"]), &limits, None).await;

        assert!(outcome.memory_exceeded);
        assert!(!outcome.timed_out);
        assert_eq!(outcome.status, RunStatus::MemoryLimitExceeded);
        assert!(outcome.memory_kb > 32 * 1024);
    }

    #[tokio::test]
    async fn test_output_truncated() {
        let limits = RunLimits::for_time(5_000, 256, 1024);
        let outcome = run(&CommandSpec::new("yes"), &limits, None).await;

        assert!(outcome.truncated);
        assert_eq!(outcome.status, RunStatus::OutputLimitExceeded);
        assert_eq!(outcome.stdout.len(), 1024);
        assert!(outcome.stdout.starts_with(b"y\ny\n"));
        assert!(!outcome.is_success());
    }

    #[tokio::test]
    async fn test_cancel_kills_group() {
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            trigger.cancel();
        });

        let started = Instant::now();
        let outcome = ProcessRunner::default()
            .run(&sh("sleep 30 & sleep 30"), &limits(20_000), None, &cancel)
            .await
            .unwrap();

        assert!(outcome.cancelled);
        assert_eq!(outcome.status, RunStatus::Cancelled);
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    fn process_exists(pid: &str) -> bool {
        std::path::Path::new(&format!("/proc/{}", pid)).exists()
    }

    #[tokio::test]
    async fn test_background_grandchild_is_killed() {
        let started = Instant::now();
        let outcome = run(&sh("sleep 30 & echo $!"), &limits(20_000), None).await;

        assert_eq!(outcome.status, RunStatus::Exited(0));
        assert!(started.elapsed() < Duration::from_secs(10));

        // Killed and reaped, not left behind as a zombie
        let pid = String::from_utf8_lossy(&outcome.stdout).trim().to_string();
        assert!(!process_exists(&pid), "background process {} survived", pid);
    }

    #[tokio::test]
    async fn test_new_session_descendant_is_killed() {
        // With and without the parent outliving the first samples
        for script in [
            "setsid sleep 30 </dev/null >/dev/null 2>&1 & echo $!; sleep 0.2",
            "setsid sleep 30 </dev/null >/dev/null 2>&1 & echo $!",
        ] {
            let outcome = run(&sh(script), &limits(5_000), None).await;

            assert_eq!(outcome.status, RunStatus::Exited(0));
            let pid = String::from_utf8_lossy(&outcome.stdout).trim().to_string();
            assert!(!pid.is_empty());
            assert!(!process_exists(&pid), "{:?}: process {} survived", script, pid);
        }
    }

    #[tokio::test]
    async fn test_new_session_memory_is_counted() {
        let limits = RunLimits::for_time(10_000, 32, 64 * 1024);
        let outcome = run(
            &sh("setsid tail /dev/zero </dev/null >/dev/null 2>&1 & sleep 30"),
            &limits,
            None,
        )
        .await;

        assert!(outcome.memory_exceeded);
        assert_eq!(outcome.status, RunStatus::MemoryLimitExceeded);
    }

    #[tokio::test]
    async fn test_zero_monitor_interval_is_clamped() {
        let outcome = ProcessRunner::new(Duration::ZERO)
            .run(&CommandSpec::new("true"), &limits(1000), None, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(outcome.status, RunStatus::Exited(0));
    }

    #[tokio::test]
    async fn test_unread_stdin_is_ignored() {
        let input = vec![b'x'; 1024 * 1024];
        let outcome = run(&CommandSpec::new("true"), &limits(2000), Some(&input)).await;

        assert_eq!(outcome.status, RunStatus::Exited(0));
    }

    #[tokio::test]
    async fn test_environment_is_cleared() {
        std::env::set_var("CODE_RUNNER_LEAK_CHECK", "leaked");
        let dir = tempfile::tempdir().unwrap();
        let cmd = sh("echo \"$HOME|$GREETING|$CODE_RUNNER_LEAK_CHECK\"; pwd")
            .with_env(["GREETING=hi"])
            .with_work_dir(dir.path());

        let outcome = run(&cmd, &limits(2000), None).await;

        let stdout = String::from_utf8(outcome.stdout).unwrap();
        let mut lines = stdout.lines();
        assert_eq!(
            lines.next().unwrap(),
            format!("{}|hi|", dir.path().display())
        );
        assert_eq!(
            std::fs::canonicalize(lines.next().unwrap()).unwrap(),
            std::fs::canonicalize(dir.path()).unwrap()
        );
    }

    #[tokio::test]
    async fn test_spawn_failure_is_resource_exhausted() {
        let result = ProcessRunner::default()
            .run(
                &CommandSpec::new("/nonexistent/compiler"),
                &limits(1000),
                None,
                &CancellationToken::new(),
            )
            .await;

        match result {
            Err(RunnerError::ResourceExhausted(message)) => {
                assert!(message.contains("/nonexistent/compiler"))
            }
            other => panic!("expected ResourceExhausted, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_concurrent_runs_are_independent() {
        let runner = ProcessRunner::default();
        let mut tasks = tokio::task::JoinSet::new();

        for i in 0..8 {
            let runner = runner.clone();
            tasks.spawn(async move {
                let outcome = runner
                    .run(
                        &sh(&format!("sleep 0.1; echo {}", i)),
                        &limits(5000),
                        None,
                        &CancellationToken::new(),
                    )
                    .await;
                (i, outcome)
            });
        }

        while let Some(joined) = tasks.join_next().await {
            let (i, outcome) = joined.unwrap();
            let outcome = assert_ok!(outcome);
            assert_eq!(outcome.stdout, format!("{}\n", i).into_bytes());
        }
    }
}
