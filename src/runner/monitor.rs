//! Run resource sampling via /proc
//!
//! A run's members are the processes of its group, every descendant of a
//! member (even after `setsid`), and orphans reparented to this service that
//! carry the run's environment marker. Memory and CPU are summed over all of
//! them.

use std::collections::{HashMap, HashSet};
use std::fs;

use nix::unistd::{sysconf, SysconfVar};

use super::group::ProcessGroup;

/// One sample of a run
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GroupSample {
    /// Summed resident set size
    pub rss_kb: u64,
    /// Summed user + system time, including reaped children
    pub cpu_time_ms: u64,
}

/// A process belonging to a run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Member {
    pub(crate) pid: i32,
    pub(crate) start_time: u64,
    pub(crate) zombie: bool,
    rss_pages: u64,
    cpu_ticks: u64,
}

/// Tracks peak memory and CPU time of one run
#[derive(Debug)]
pub struct GroupMonitor {
    clk_tck: u64,
    page_kb: u64,
    peak_rss_kb: u64,
    cpu_time_ms: u64,
}

impl GroupMonitor {
    pub fn new() -> Self {
        let clk_tck = sysconf(SysconfVar::CLK_TCK)
            .ok()
            .flatten()
            .filter(|v| *v > 0)
            .unwrap_or(100) as u64;
        let page_size = sysconf(SysconfVar::PAGE_SIZE)
            .ok()
            .flatten()
            .filter(|v| *v > 0)
            .unwrap_or(4096) as u64;

        Self {
            clk_tck,
            page_kb: (page_size / 1024).max(1),
            peak_rss_kb: 0,
            cpu_time_ms: 0,
        }
    }

    /// Sample every member of `group`, recording new members in it
    pub async fn sample(&mut self, group: &mut ProcessGroup) -> GroupSample {
        let members = group.scan().await;

        let mut sample = GroupSample::default();
        let mut ticks = 0u64;
        for member in &members {
            sample.rss_kb += member.rss_pages * self.page_kb;
            ticks += member.cpu_ticks;
        }

        sample.cpu_time_ms = ticks * 1000 / self.clk_tck;
        self.peak_rss_kb = self.peak_rss_kb.max(sample.rss_kb);
        self.cpu_time_ms = self.cpu_time_ms.max(sample.cpu_time_ms);
        sample
    }

    pub fn peak_rss_kb(&self) -> u64 {
        self.peak_rss_kb
    }

    /// Highest CPU time observed so far
    pub fn cpu_time_ms(&self) -> u64 {
        self.cpu_time_ms
    }
}

impl Default for GroupMonitor {
    fn default() -> Self {
        Self::new()
    }
}

/// Start time of `pid` in clock ticks since boot, if it exists
pub(crate) fn read_start_time(pid: i32) -> Option<u64> {
    let content = fs::read_to_string(format!("/proc/{}/stat", pid)).ok()?;
    ProcStat::parse(&content).map(|stat| stat.start_time)
}

/// Find the members of the run led by `pgid`
///
/// Blocking: reads every /proc/<pid>/stat once.
pub(crate) fn scan_members(
    pgid: i32,
    known: &HashMap<i32, u64>,
    marker: Option<&str>,
) -> Vec<Member> {
    let Ok(entries) = fs::read_dir("/proc") else {
        return Vec::new();
    };

    let mut stats = Vec::new();
    for entry in entries.flatten() {
        let Some(pid) = entry
            .file_name()
            .to_str()
            .filter(|n| n.bytes().all(|b| b.is_ascii_digit()))
            .and_then(|n| n.parse::<i32>().ok())
        else {
            continue;
        };
        // Processes may exit between listing and reading
        let Ok(content) = fs::read_to_string(entry.path().join("stat")) else {
            continue;
        };
        if let Some(stat) = ProcStat::parse(&content) {
            stats.push((pid, stat));
        }
    }

    let service = std::process::id() as i32;
    let mut in_run: HashSet<i32> = stats
        .iter()
        .filter(|(pid, stat)| {
            stat.pgrp == pgid
                || known.get(pid) == Some(&stat.start_time)
                || (stat.ppid == service
                    && marker.is_some_and(|marker| carries_marker(*pid, marker)))
        })
        .map(|(pid, _)| *pid)
        .collect();

    // Pull in descendants until nothing changes
    loop {
        let before = in_run.len();
        for (pid, stat) in &stats {
            if in_run.contains(&stat.ppid) {
                in_run.insert(*pid);
            }
        }
        if in_run.len() == before {
            break;
        }
    }

    stats
        .into_iter()
        .filter(|(pid, _)| in_run.contains(pid))
        .map(|(pid, stat)| Member {
            pid,
            start_time: stat.start_time,
            zombie: stat.state == 'Z',
            rss_pages: stat.rss_pages,
            cpu_ticks: stat.cpu_ticks,
        })
        .collect()
}

fn carries_marker(pid: i32, marker: &str) -> bool {
    fs::read(format!("/proc/{}/environ", pid))
        .map(|environ| {
            environ
                .split(|b| *b == 0)
                .any(|entry| entry == marker.as_bytes())
        })
        .unwrap_or(false)
}

#[derive(Debug, PartialEq, Eq)]
struct ProcStat {
    state: char,
    ppid: i32,
    pgrp: i32,
    cpu_ticks: u64,
    start_time: u64,
    rss_pages: u64,
}

impl ProcStat {
    /// Parse /proc/<pid>/stat; fields are counted after the `comm` field,
    /// which may itself contain spaces and parentheses
    fn parse(content: &str) -> Option<Self> {
        let rest = &content[content.rfind(')')? + 1..];
        let fields: Vec<&str> = rest.split_whitespace().collect();
        if fields.len() < 22 {
            return None;
        }

        let field = |idx: usize| fields[idx].parse::<u64>().ok();
        let cpu_ticks = field(11)? + field(12)? + field(13)? + field(14)?;
        let rss_pages = fields[21].parse::<i64>().ok()?.max(0) as u64;

        Some(Self {
            state: fields[0].chars().next()?,
            ppid: fields[1].parse().ok()?,
            pgrp: fields[2].parse().ok()?,
            cpu_ticks,
            start_time: field(19)?,
            rss_pages,
        })
    }
}
