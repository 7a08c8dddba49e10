//! Process-group accounting from `/proc`
//!
//! The executor polls this while a command runs. Rlimits are per process; the
//! scan sums over the whole group so forked children count against the same
//! budget as the program that spawned them.

use std::fs;
use std::os::unix::fs::MetadataExt;
use std::sync::OnceLock;
use std::time::Duration;

use nix::errno::Errno;
use nix::sys::signal::{killpg, Signal};
use nix::unistd::{sysconf, Pid, SysconfVar};
use tracing::{debug, warn};

use super::{ExecLimits, LimitKind};

const KILL_ATTEMPTS: usize = 50;
const KILL_RETRY_DELAY: Duration = Duration::from_millis(10);

fn clock_ticks() -> u64 {
    static TICKS: OnceLock<u64> = OnceLock::new();
    *TICKS.get_or_init(|| match sysconf(SysconfVar::CLK_TCK) {
        Ok(Some(t)) if t > 0 => t as u64,
        _ => 100,
    })
}

fn page_size() -> u64 {
    static PAGE: OnceLock<u64> = OnceLock::new();
    *PAGE.get_or_init(|| match sysconf(SysconfVar::PAGE_SIZE) {
        Ok(Some(p)) if p > 0 => p as u64,
        _ => 4096,
    })
}

/// Fields of `/proc/<pid>/stat` the monitor cares about
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ProcStat {
    pub state: char,
    pub pgrp: i32,
    pub cpu_ticks: u64,
    pub threads: u64,
    pub rss_pages: u64,
}

/// Parse one `/proc/<pid>/stat` line.
///
/// The command name may contain spaces and parentheses, so fields are counted
/// from the last `)`.
pub fn parse_stat(content: &str) -> Option<ProcStat> {
    let rest = &content[content.rfind(')')? + 1..];
    let fields: Vec<&str> = rest.split_whitespace().collect();
    // fields[0] is field 3 of stat(5)
    let field = |n: usize| fields.get(n - 3).copied();

    Some(ProcStat {
        state: field(3)?.chars().next()?,
        pgrp: field(5)?.parse().ok()?,
        cpu_ticks: field(14)?.parse::<u64>().ok()? + field(15)?.parse::<u64>().ok()?,
        threads: field(20)?.parse().ok()?,
        rss_pages: field(24)?.parse().ok()?,
    })
}

/// Live usage of one process group
#[derive(Debug, Default, Clone, Copy, PartialEq)]
pub struct GroupUsage {
    pub processes: u64,
    pub threads: u64,
    pub cpu_ms: u64,
    pub rss_bytes: u64,
}

impl GroupUsage {
    fn add(&mut self, stat: &ProcStat) {
        self.processes += 1;
        self.threads += stat.threads.max(1);
        self.cpu_ms += stat.cpu_ticks * 1000 / clock_ticks();
        self.rss_bytes += stat.rss_pages * page_size();
    }

    /// First limit this usage breaks, if any
    pub fn violation(&self, limits: &ExecLimits) -> Option<LimitKind> {
        if self.processes > limits.max_processes || self.threads > limits.max_processes {
            Some(LimitKind::Processes)
        } else if limits.memory_mb > 0 && self.rss_bytes > limits.memory_mb * 1024 * 1024 {
            Some(LimitKind::Memory)
        } else if self.cpu_ms > limits.cpu_time_ms {
            Some(LimitKind::CpuTime)
        } else {
            None
        }
    }
}

fn proc_pids() -> impl Iterator<Item = (u32, fs::DirEntry)> {
    fs::read_dir("/proc")
        .into_iter()
        .flatten()
        .flatten()
        .filter_map(|entry| {
            let pid = entry.file_name().to_str()?.parse::<u32>().ok()?;
            Some((pid, entry))
        })
}

/// Sum usage over every live (non-zombie) member of `pgid`
pub fn scan_group(pgid: i32) -> GroupUsage {
    let mut usage = GroupUsage::default();
    for (pid, _) in proc_pids() {
        let Ok(content) = fs::read_to_string(format!("/proc/{}/stat", pid)) else {
            continue;
        };
        match parse_stat(&content) {
            Some(stat) if stat.pgrp == pgid && stat.state != 'Z' => usage.add(&stat),
            _ => {}
        }
    }
    usage
}

/// Number of tasks (threads) currently owned by `uid`, which is what
/// RLIMIT_NPROC is checked against
pub fn count_user_tasks(uid: u32) -> u64 {
    proc_pids()
        .filter(|(_, entry)| entry.metadata().map(|m| m.uid() == uid).unwrap_or(false))
        .map(|(pid, _)| {
            fs::read_dir(format!("/proc/{}/task", pid))
                .map(|tasks| tasks.count() as u64)
                .unwrap_or(1)
        })
        .sum()
}

/// SIGKILL the whole group until no live member remains
pub async fn kill_group(pgid: i32) {
    for _ in 0..KILL_ATTEMPTS {
        match killpg(Pid::from_raw(pgid), Signal::SIGKILL) {
            Ok(()) => {}
            Err(Errno::ESRCH) => return,
            Err(e) => {
                warn!("killpg({}) failed: {}", pgid, e);
                return;
            }
        }
        tokio::time::sleep(KILL_RETRY_DELAY).await;
        if scan_group(pgid).processes == 0 {
            return;
        }
    }
    debug!("Process group {} still has members after kill attempts", pgid);
}
