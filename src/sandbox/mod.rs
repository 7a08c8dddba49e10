//! Sandboxed executor
//!
//! Runs one external program under hard limits and always reaps the whole
//! process tree it started:
//! - the child becomes the leader of a fresh process group before `exec`
//! - rlimits bound CPU, address space, open files, file size and process count
//! - a monitor sums usage over the group and kills it on any violation
//! - wall-clock timeout and cancellation kill the group as well
//!
//! The sandbox module does NOT interpret results as grades; callers map
//! `ExecOutcome` to their own notion of success.

pub mod limits;
pub mod monitor;

use std::fmt;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use nix::sys::signal::Signal;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::Command;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::ExecError;
use limits::RlimitSet;

/// Exit code reported when the executor killed the process group
pub const LIMIT_KILL_RETCODE: i32 = 128 + 9;

const SANDBOX_PATH: &str = "/usr/local/bin:/usr/bin:/bin";
const MONITOR_INTERVAL: Duration = Duration::from_millis(20);
const DRAIN_TIMEOUT: Duration = Duration::from_millis(500);
const READ_CHUNK: usize = 8192;
const SPAWN_RETRIES: u32 = 5;

/// Resource limits for one execution
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecLimits {
    /// Wall-clock budget in milliseconds
    pub wall_time_ms: u64,
    /// CPU budget in milliseconds, summed over the process group
    pub cpu_time_ms: u64,
    /// Maximum live processes (and threads) in the group
    pub max_processes: u64,
    /// Resident memory ceiling in MB, summed over the group
    pub memory_mb: u64,
    /// Per-process address-space rlimit in MB, 0 for none. Runtimes reserve
    /// far more virtual memory than they touch, so this is only a backstop;
    /// `memory_mb` is what the monitor enforces.
    pub address_space_mb: u64,
    /// Captured output is truncated past this many bytes
    pub output_limit_bytes: usize,
    pub open_files: u64,
    pub file_size_mb: u64,
}

impl Default for ExecLimits {
    fn default() -> Self {
        Self {
            wall_time_ms: 15_000,
            cpu_time_ms: 10_000,
            max_processes: 32,
            memory_mb: 512,
            address_space_mb: 4096,
            output_limit_bytes: 64 * 1024,
            open_files: 256,
            file_size_mb: 64,
        }
    }
}

impl ExecLimits {
    /// Defaults for build tools, which fork compilers and need more headroom
    pub fn build_profile() -> Self {
        Self {
            wall_time_ms: 60_000,
            cpu_time_ms: 30_000,
            max_processes: 64,
            memory_mb: 1024,
            ..Self::default()
        }
    }

    /// Address-space rlimit in bytes, kept at least twice the resident
    /// ceiling so an allocation never fails before the monitor sees it
    pub fn address_space_bytes(&self) -> u64 {
        if self.address_space_mb == 0 {
            return 0;
        }
        self.address_space_mb
            .max(self.memory_mb.saturating_mul(2))
            .saturating_mul(1024 * 1024)
    }
}

/// Which limit made the executor kill the group
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LimitKind {
    WallTime,
    CpuTime,
    Processes,
    Memory,
}

impl fmt::Display for LimitKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            LimitKind::WallTime => "wall time limit exceeded",
            LimitKind::CpuTime => "cpu time limit exceeded",
            LimitKind::Processes => "process limit exceeded",
            LimitKind::Memory => "memory limit exceeded",
        };
        write!(f, "{}", s)
    }
}

/// Execution status (raw, no grading interpretation)
#[derive(Debug, Clone, PartialEq)]
pub enum ExecStatus {
    /// Program exited normally with given exit code
    Exited(i32),
    /// Killed by a signal the executor did not send
    Signaled(i32),
    /// Killed by the executor for breaking a limit
    LimitExceeded(LimitKind),
    /// Killed because the caller cancelled the execution
    Cancelled,
}

#[derive(Debug, Clone)]
pub struct ExecOutcome {
    pub status: ExecStatus,
    /// Exit code, `128 + signal` for signal deaths, `LIMIT_KILL_RETCODE` for kills
    pub retcode: i32,
    /// Combined stdout and stderr
    pub output: String,
    /// Set when a time, CPU, process or memory limit was hit
    pub timed_out: bool,
    pub truncated: bool,
    pub wall_time_ms: u64,
}

impl ExecOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self.status, ExecStatus::Exited(0))
    }
}

#[derive(Debug, Clone)]
pub struct ExecSpec {
    pub program: String,
    pub args: Vec<String>,
    pub work_dir: PathBuf,
    /// Extra environment on top of the minimal sandbox environment
    pub env: Vec<(String, String)>,
    pub limits: ExecLimits,
    pub stdin: Option<Vec<u8>>,
    pub cancel: Option<CancellationToken>,
}

impl ExecSpec {
    pub fn new(program: impl Into<String>, work_dir: impl AsRef<Path>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            work_dir: work_dir.as_ref().to_path_buf(),
            env: Vec::new(),
            limits: ExecLimits::default(),
            stdin: None,
            cancel: None,
        }
    }

    pub fn with_args(mut self, args: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    pub fn with_limits(mut self, limits: ExecLimits) -> Self {
        self.limits = limits;
        self
    }

    pub fn with_stdin(mut self, stdin: impl Into<Vec<u8>>) -> Self {
        self.stdin = Some(stdin.into());
        self
    }

    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = Some(cancel);
        self
    }
}

/// Bounded sink shared by the stdout and stderr readers
#[derive(Debug)]
struct Capture {
    buf: Vec<u8>,
    limit: usize,
    truncated: bool,
}

impl Capture {
    fn push(&mut self, chunk: &[u8]) {
        let room = self.limit.saturating_sub(self.buf.len());
        if chunk.len() > room {
            self.truncated = true;
        }
        self.buf.extend_from_slice(&chunk[..chunk.len().min(room)]);
    }
}

/// Keep reading after the cap so the child never blocks on a full pipe
fn pump<R>(mut reader: R, capture: Arc<Mutex<Capture>>) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut chunk = [0u8; READ_CHUNK];
        loop {
            match reader.read(&mut chunk).await {
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    if let Ok(mut capture) = capture.lock() {
                        capture.push(&chunk[..n]);
                    }
                }
            }
        }
    })
}

enum Ending {
    Exited(std::process::ExitStatus),
    Killed(ExecStatus),
}

/// Run a command under `spec.limits`.
///
/// A program that cannot be started at all is an `Err`; everything that
/// happens after a successful spawn is reported through `ExecOutcome`.
pub async fn execute(spec: &ExecSpec) -> Result<ExecOutcome, ExecError> {
    if spec.program.is_empty() {
        return Err(ExecError::EmptyCommand);
    }

    let started = Instant::now();
    let user_tasks = Some(monitor::count_user_tasks(nix::unistd::getuid().as_raw()));
    let rlimits = RlimitSet::new(&spec.limits, user_tasks);

    let mut cmd = Command::new(&spec.program);
    cmd.args(&spec.args)
        .current_dir(&spec.work_dir)
        .env_clear()
        .env("PATH", SANDBOX_PATH)
        .env("HOME", &spec.work_dir)
        .env("LANG", "C.UTF-8")
        .envs(spec.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
        .stdin(if spec.stdin.is_some() {
            Stdio::piped()
        } else {
            Stdio::null()
        })
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    // SAFETY: the hook only calls setpgid/setrlimit, both async-signal-safe.
    unsafe {
        cmd.pre_exec(move || rlimits.apply());
    }

    let mut child = spawn(&mut cmd).await.map_err(|source| match source.kind() {
        std::io::ErrorKind::NotFound | std::io::ErrorKind::PermissionDenied => {
            ExecError::NotRunnable {
                program: spec.program.clone(),
                source,
            }
        }
        _ => ExecError::Spawn {
            program: spec.program.clone(),
            source,
        },
    })?;

    let pgid = child.id().map(|id| id as i32).ok_or_else(|| {
        ExecError::Io(std::io::Error::other("child exited before supervision began"))
    })?;
    debug!(
        "Spawned {} {:?} as process group {}",
        spec.program, spec.args, pgid
    );

    let capture = Arc::new(Mutex::new(Capture {
        buf: Vec::new(),
        limit: spec.limits.output_limit_bytes,
        truncated: false,
    }));
    let mut readers = Vec::with_capacity(2);
    if let Some(stdout) = child.stdout.take() {
        readers.push(pump(stdout, capture.clone()));
    }
    if let Some(stderr) = child.stderr.take() {
        readers.push(pump(stderr, capture.clone()));
    }

    if let (Some(mut stdin), Some(data)) = (child.stdin.take(), spec.stdin.clone()) {
        tokio::spawn(async move {
            // The program may exit without reading its input
            let _ = stdin.write_all(&data).await;
        });
    }

    let cancel = spec.cancel.clone().unwrap_or_default();
    let deadline = tokio::time::sleep(Duration::from_millis(spec.limits.wall_time_ms));
    tokio::pin!(deadline);
    let mut ticker = tokio::time::interval(MONITOR_INTERVAL);

    let ending = loop {
        tokio::select! {
            status = child.wait() => break Ending::Exited(status?),
            _ = &mut deadline => break Ending::Killed(ExecStatus::LimitExceeded(LimitKind::WallTime)),
            _ = cancel.cancelled() => break Ending::Killed(ExecStatus::Cancelled),
            _ = ticker.tick() => {
                if let Some(kind) = monitor::scan_group(pgid).violation(&spec.limits) {
                    break Ending::Killed(ExecStatus::LimitExceeded(kind));
                }
            }
        }
    };

    // Always sweep the group: a clean exit can still leave orphans behind
    monitor::kill_group(pgid).await;

    let status = match ending {
        Ending::Exited(exit) => exit_to_status(exit),
        Ending::Killed(status) => {
            if let ExecStatus::LimitExceeded(kind) = &status {
                warn!("Process group {} killed: {}", pgid, kind);
            }
            child.wait().await?;
            status
        }
    };

    // Escaped grandchildren may hold the pipes open; don't wait on them forever
    for mut reader in readers {
        if tokio::time::timeout(DRAIN_TIMEOUT, &mut reader).await.is_err() {
            reader.abort();
        }
    }

    let (mut output, truncated) = match capture.lock() {
        Ok(capture) => (
            String::from_utf8_lossy(&capture.buf).into_owned(),
            capture.truncated,
        ),
        Err(_) => (String::new(), false),
    };
    if truncated {
        output.push_str("\n[output truncated]");
    }
    if let ExecStatus::LimitExceeded(kind) = &status {
        output.push_str(&format!("\n[{}]", kind));
    }

    let retcode = match status {
        ExecStatus::Exited(code) => code,
        ExecStatus::Signaled(sig) => 128 + sig,
        ExecStatus::LimitExceeded(_) | ExecStatus::Cancelled => LIMIT_KILL_RETCODE,
    };

    Ok(ExecOutcome {
        timed_out: matches!(status, ExecStatus::LimitExceeded(_)),
        status,
        retcode,
        output,
        truncated,
        wall_time_ms: started.elapsed().as_millis() as u64,
    })
}

/// Spawn, retrying while a just-written executable is still open for writing
/// in a concurrently forked child (ETXTBSY)
async fn spawn(cmd: &mut Command) -> std::io::Result<tokio::process::Child> {
    let mut attempts = 0;
    loop {
        match cmd.spawn() {
            Err(e) if e.raw_os_error() == Some(nix::libc::ETXTBSY) && attempts < SPAWN_RETRIES => {
                attempts += 1;
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
            result => return result,
        }
    }
}

fn exit_to_status(exit: std::process::ExitStatus) -> ExecStatus {
    use std::os::unix::process::ExitStatusExt;

    if let Some(code) = exit.code() {
        return ExecStatus::Exited(code);
    }
    match exit.signal() {
        // RLIMIT_CPU delivers SIGXCPU at the soft limit and SIGKILL at the hard one
        Some(sig) if sig == Signal::SIGXCPU as i32 => ExecStatus::LimitExceeded(LimitKind::CpuTime),
        Some(sig) => ExecStatus::Signaled(sig),
        None => ExecStatus::Exited(-1),
    }
}
