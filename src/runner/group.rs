//! Process group ownership and pre-exec resource limits
//!
//! A run owns its process group and every descendant, including ones that
//! left the group with `setsid`/`setpgid`. The service registers itself as a
//! child subreaper, so such descendants are reparented to it once their
//! parent dies and can be killed and reaped here.

use std::collections::HashMap;
use std::sync::Once;
use std::time::Duration;

use nix::errno::Errno;
use nix::sys::prctl;
use nix::sys::resource::{setrlimit, Resource};
use nix::sys::signal::{kill, killpg, Signal};
use nix::sys::wait::{waitpid, WaitPidFlag};
use nix::unistd::Pid;
use tracing::{debug, warn};

use super::monitor::{read_start_time, scan_members, Member};
use super::RunLimits;

const TERMINATE_ROUNDS: usize = 100;
const TERMINATE_POLL: Duration = Duration::from_millis(10);

/// Make this process the reaper of orphaned descendants
pub(crate) fn adopt_orphans() {
    static ONCE: Once = Once::new();
    ONCE.call_once(|| match prctl::set_child_subreaper(true) {
        Ok(()) => debug!("Registered as child subreaper"),
        Err(e) => warn!(
            "Failed to become child subreaper, escaped processes will be reaped by init: {}",
            e
        ),
    });
}

/// Owns a process group and every descendant seen so far
///
/// Everything is killed at the latest on drop.
#[derive(Debug)]
pub struct ProcessGroup {
    pgid: Pid,
    /// Run members by pid, with start time so a recycled pid is never touched
    members: HashMap<i32, u64>,
    /// `KEY=VALUE` entry in the environment of every process of the run
    marker: Option<String>,
    finished: bool,
}

impl ProcessGroup {
    /// Take ownership of the group led by `leader` (spawned with pgid 0)
    pub fn new(leader: u32) -> Self {
        let leader = leader as i32;
        let mut members = HashMap::new();
        if let Some(start) = read_start_time(leader) {
            members.insert(leader, start);
        }

        Self {
            pgid: Pid::from_raw(leader),
            members,
            marker: None,
            finished: false,
        }
    }

    /// Also claim orphans reparented to this process that carry `marker`
    pub fn with_marker(mut self, marker: impl Into<String>) -> Self {
        self.marker = Some(marker.into());
        self
    }

    pub fn pgid(&self) -> i32 {
        self.pgid.as_raw()
    }

    /// Processes seen in this run so far, the leader included
    pub fn tracked(&self) -> usize {
        self.members.len()
    }

    /// Current members of the run, read from /proc off the async runtime
    pub(crate) async fn scan(&mut self) -> Vec<Member> {
        let pgid = self.pgid();
        let known = self.members.clone();
        let marker = self.marker.clone();

        let members = tokio::task::spawn_blocking(move || {
            scan_members(pgid, &known, marker.as_deref())
        })
        .await
        .unwrap_or_default();

        for member in &members {
            self.members.insert(member.pid, member.start_time);
        }
        members
    }

    /// SIGKILL the group and every tracked process that is still alive
    pub fn kill(&self) {
        match killpg(self.pgid, Signal::SIGKILL) {
            Ok(()) | Err(Errno::ESRCH) => {}
            Err(e) => warn!("Failed to kill process group {}: {}", self.pgid, e),
        }

        for (&pid, &start) in &self.members {
            if read_start_time(pid) != Some(start) {
                continue;
            }
            match kill(Pid::from_raw(pid), Signal::SIGKILL) {
                Ok(()) | Err(Errno::ESRCH) => {}
                Err(e) => warn!("Failed to kill process {}: {}", pid, e),
            }
        }
    }

    /// Kill until every member is dead, reaping the ones reparented here
    ///
    /// The leader is left to its `Child` handle.
    pub async fn terminate(&mut self) {
        for _ in 0..TERMINATE_ROUNDS {
            self.kill();
            let members = self.scan().await;
            if members.iter().all(|member| member.zombie) {
                self.reap();
                self.finished = true;
                return;
            }
            tokio::time::sleep(TERMINATE_POLL).await;
        }

        warn!(
            "Process group {} still has live members after repeated SIGKILL",
            self.pgid
        );
        self.reap();
        self.finished = true;
    }

    fn reap(&self) {
        for (&pid, &start) in &self.members {
            if pid == self.pgid() || read_start_time(pid) != Some(start) {
                continue;
            }
            // ECHILD: not ours, its own parent reaps it
            if let Ok(status) = waitpid(Pid::from_raw(pid), Some(WaitPidFlag::WNOHANG)) {
                debug!("Reaped escaped process {}: {:?}", pid, status);
            }
        }
    }
}

impl Drop for ProcessGroup {
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        self.kill();

        // Finish the kill and reap in the background when a runtime is around
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            let mut rest = ProcessGroup {
                pgid: self.pgid,
                members: std::mem::take(&mut self.members),
                marker: self.marker.take(),
                finished: true,
            };
            handle.spawn(async move { rest.terminate().await });
        }
    }
}

/// Kernel limits applied in the child between fork and exec
#[derive(Debug, Clone, Copy)]
pub(crate) struct Rlimits {
    cpu_secs: u64,
    file_size_bytes: u64,
    open_files: u64,
    processes: Option<u64>,
}

impl Rlimits {
    pub(crate) fn from_limits(limits: &RunLimits) -> Self {
        Self {
            // Backstop only; the monitor enforces the precise CPU limit
            cpu_secs: limits.cpu_time_ms.div_ceil(1000) + 1,
            file_size_bytes: limits.max_file_size_kb.saturating_mul(1024),
            open_files: limits.max_open_files,
            processes: limits.max_processes,
        }
    }

    /// Runs in the forked child: no allocation, no locking
    pub(crate) fn apply(&self) -> std::io::Result<()> {
        setrlimit(Resource::RLIMIT_CPU, self.cpu_secs, self.cpu_secs + 1)?;
        setrlimit(
            Resource::RLIMIT_FSIZE,
            self.file_size_bytes,
            self.file_size_bytes,
        )?;
        setrlimit(Resource::RLIMIT_NOFILE, self.open_files, self.open_files)?;
        setrlimit(Resource::RLIMIT_CORE, 0, 0)?;
        if let Some(processes) = self.processes {
            setrlimit(Resource::RLIMIT_NPROC, processes, processes)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rlimits_round_cpu_up() {
        let limits = RunLimits {
            cpu_time_ms: 1500,
            ..RunLimits::default()
        };
        let rlimits = Rlimits::from_limits(&limits);
        assert_eq!(rlimits.cpu_secs, 3);
        assert_eq!(rlimits.file_size_bytes, 256 * 1024 * 1024);
        assert_eq!(rlimits.processes, None);

        let zero = Rlimits::from_limits(&RunLimits {
            cpu_time_ms: 0,
            ..RunLimits::default()
        });
        assert_eq!(zero.cpu_secs, 1);
    }

    #[tokio::test]
    async fn test_drop_kills_group() {
        let mut child = tokio::process::Command::new("sleep")
            .arg("30")
            .process_group(0)
            .spawn()
            .unwrap();
        let group = ProcessGroup::new(child.id().unwrap());
        assert_eq!(group.tracked(), 1);

        drop(group);

        let status = tokio::time::timeout(Duration::from_secs(5), child.wait())
            .await
            .unwrap()
            .unwrap();
        assert!(!status.success());
    }

    #[tokio::test]
    async fn test_terminate_kills_and_reaps_session_leader() {
        adopt_orphans();
        let mut child = tokio::process::Command::new("sh")
            .args(["-c", "setsid sleep 30 </dev/null >/dev/null 2>&1 & echo $!; exec sleep 30"])
            .stdout(std::process::Stdio::piped())
            .process_group(0)
            .kill_on_drop(true)
            .spawn()
            .unwrap();
        let mut group = ProcessGroup::new(child.id().unwrap());

        let mut stdout = child.stdout.take().unwrap();
        let mut line = String::new();
        {
            use tokio::io::AsyncReadExt;
            let mut buf = [0u8; 32];
            let n = stdout.read(&mut buf).await.unwrap();
            line.push_str(std::str::from_utf8(&buf[..n]).unwrap());
        }
        let escaped: i32 = line.trim().parse().unwrap();

        // The escaped process is a member while its parent is alive
        let mut seen = false;
        for _ in 0..50 {
            if group.scan().await.iter().any(|m| m.pid == escaped) {
                seen = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(seen);

        group.kill();
        let _ = child.wait().await;
        group.terminate().await;

        assert!(read_start_time(escaped).is_none(), "process {} survived", escaped);
    }
}
