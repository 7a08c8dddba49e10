//! Kernel resource limits applied in the child between fork and exec

use nix::sys::resource::{getrlimit, setrlimit, Resource};
use nix::unistd::{setpgid, Pid};

use super::ExecLimits;

/// Room for threads and processes that appear between counting the uid's
/// tasks and the child's first fork: runtime workers, concurrent runs.
const NPROC_HEADROOM: u64 = 64;

/// One (soft, hard) pair, already clamped to what the worker may set
#[derive(Debug, Clone, Copy, PartialEq)]
struct Pair {
    soft: u64,
    hard: u64,
}

impl Pair {
    /// Unprivileged processes cannot raise a hard limit, so stay under the
    /// worker's own ceiling for `resource`.
    fn clamped(resource: Resource, soft: u64, hard: u64) -> Self {
        let ceiling = getrlimit(resource)
            .map(|(_, hard)| hard as u64)
            .unwrap_or(u64::MAX);
        let hard = hard.min(ceiling);
        Self {
            soft: soft.min(hard),
            hard,
        }
    }
}

/// Plain-value snapshot of the rlimits for one spawn.
///
/// Built in the parent so the pre-exec hook does no allocation or parsing.
#[derive(Debug, Clone, Copy)]
pub struct RlimitSet {
    cpu: Pair,
    address_space: Option<Pair>,
    open_files: Pair,
    file_size: Pair,
    processes: Option<Pair>,
}

impl RlimitSet {
    /// `user_tasks` is the number of threads the worker's uid already runs.
    /// RLIMIT_NPROC counts every one of them, so the ceiling sits above them.
    pub fn new(limits: &ExecLimits, user_tasks: Option<u64>) -> Self {
        let cpu_secs = (limits.cpu_time_ms.saturating_add(999) / 1000).max(1);
        let address_space = limits.address_space_bytes();
        let file_size = limits.file_size_mb.saturating_mul(1024 * 1024);

        Self {
            cpu: Pair::clamped(Resource::RLIMIT_CPU, cpu_secs, cpu_secs.saturating_add(1)),
            address_space: (address_space > 0)
                .then(|| Pair::clamped(Resource::RLIMIT_AS, address_space, address_space)),
            open_files: Pair::clamped(
                Resource::RLIMIT_NOFILE,
                limits.open_files,
                limits.open_files,
            ),
            file_size: Pair::clamped(Resource::RLIMIT_FSIZE, file_size, file_size),
            processes: user_tasks.map(|n| {
                let nproc = n
                    .saturating_add(limits.max_processes)
                    .saturating_add(NPROC_HEADROOM);
                Pair::clamped(Resource::RLIMIT_NPROC, nproc, nproc)
            }),
        }
    }

    /// Put the child in its own process group and apply every limit.
    ///
    /// Runs in the forked child; must stay async-signal-safe.
    pub fn apply(&self) -> std::io::Result<()> {
        setpgid(Pid::from_raw(0), Pid::from_raw(0))?;

        setrlimit(Resource::RLIMIT_CPU, self.cpu.soft as _, self.cpu.hard as _)?;
        if let Some(pair) = self.address_space {
            setrlimit(Resource::RLIMIT_AS, pair.soft as _, pair.hard as _)?;
        }
        setrlimit(
            Resource::RLIMIT_NOFILE,
            self.open_files.soft as _,
            self.open_files.hard as _,
        )?;
        setrlimit(
            Resource::RLIMIT_FSIZE,
            self.file_size.soft as _,
            self.file_size.hard as _,
        )?;
        setrlimit(Resource::RLIMIT_CORE, 0, 0)?;
        if let Some(pair) = self.processes {
            setrlimit(Resource::RLIMIT_NPROC, pair.soft as _, pair.hard as _)?;
        }

        Ok(())
    }
}
