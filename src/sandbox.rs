//! Supervised execution of untrusted scripts.
//!
//! A request passes validation and then rate admission before anything touches the
//! disk, is staged into its own scratch file, runs under a wall-clock limit
//! with both pipes drained as output arrives, and always has its scratch file
//! removed afterwards. Execution failures come back as an [`ExecutionResult`],
//! never as an error.

use crate::config::SandboxConfig;
use crate::models::{ExecutionRequest, ExecutionResult, FailureKind};
use chrono::Utc;
use log::{debug, info, warn};
use std::collections::{HashMap, VecDeque};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::fs as tokio_fs;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;
use tokio::task::JoinHandle;

/// How long to keep reading pipes after the child is gone. A grandchild that
/// inherited the pipes can hold them open indefinitely.
const READER_GRACE: Duration = Duration::from_millis(500);
const TRUNCATION_MARKER: &str = "\n[output truncated]";

pub trait Clock: Send + Sync {
    fn now(&self) -> Instant;
}

pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }
}

/// Reasons a request is turned away before any file or process exists.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rejection {
    #[error("Rate limit exceeded: at most {limit} executions per {window_secs}s")]
    RateLimited { limit: usize, window_secs: u64 },

    #[error("Source must be non-empty text")]
    InvalidInput,

    #[error("Source is {size} bytes, the limit is {limit}")]
    TooLarge { size: usize, limit: usize },
}

impl Rejection {
    pub fn kind(&self) -> FailureKind {
        match self {
            Rejection::RateLimited { .. } => FailureKind::RateLimited,
            Rejection::InvalidInput => FailureKind::InvalidInput,
            Rejection::TooLarge { .. } => FailureKind::TooLarge,
        }
    }
}

impl From<Rejection> for ExecutionResult {
    fn from(rejection: Rejection) -> Self {
        ExecutionResult::failed(rejection.kind(), rejection.to_string())
    }
}

/// Per-requester trailing windows of accepted executions.
pub struct RateLimiter {
    limit: usize,
    window: Duration,
    clock: Arc<dyn Clock>,
    windows: Mutex<HashMap<String, VecDeque<Instant>>>,
}

impl RateLimiter {
    pub fn new(limit: usize, window: Duration, clock: Arc<dyn Clock>) -> Self {
        RateLimiter {
            limit,
            window,
            clock,
            windows: Mutex::new(HashMap::new()),
        }
    }

    /// Prunes, checks and records in one critical section. A rejected request
    /// leaves the window untouched.
    pub fn try_admit(&self, requester: &str) -> Result<(), Rejection> {
        let now = self.clock.now();
        let mut windows = self.windows.lock().unwrap_or_else(|p| p.into_inner());
        // Requesters are never evicted; the table grows with distinct ids.
        let window = windows.entry(requester.to_string()).or_default();
        while let Some(oldest) = window.front() {
            if now.duration_since(*oldest) >= self.window {
                window.pop_front();
            } else {
                break;
            }
        }
        if window.len() >= self.limit {
            return Err(Rejection::RateLimited {
                limit: self.limit,
                window_secs: self.window.as_secs(),
            });
        }
        window.push_back(now);
        Ok(())
    }
}

/// Removes its file when dropped unless [`ScratchFile::remove`] already did,
/// so cancellation of an in-flight execution cannot leak it.
struct ScratchFile {
    path: PathBuf,
    removed: bool,
}

impl ScratchFile {
    async fn remove(mut self) {
        self.removed = true;
        match tokio_fs::remove_file(&self.path).await {
            Ok(()) => debug!("Removed scratch file {}", self.path.display()),
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => warn!("Failed to remove scratch file {}: {}", self.path.display(), e),
        }
    }
}

impl Drop for ScratchFile {
    fn drop(&mut self) {
        if self.removed {
            return;
        }
        if let Err(e) = std::fs::remove_file(&self.path) {
            if e.kind() != ErrorKind::NotFound {
                warn!("Failed to remove scratch file {}: {}", self.path.display(), e);
            }
        }
    }
}

struct Captured {
    bytes: Vec<u8>,
    truncated: bool,
}

/// Output collected so far from one pipe. Shared with the reader task so a
/// timed-out run still returns what was produced before the kill.
#[derive(Clone)]
struct OutputBuffer {
    inner: Arc<Mutex<Captured>>,
    limit: usize,
}

impl OutputBuffer {
    fn new(limit: usize) -> Self {
        OutputBuffer {
            inner: Arc::new(Mutex::new(Captured {
                bytes: Vec::new(),
                truncated: false,
            })),
            limit,
        }
    }

    fn push(&self, chunk: &[u8]) {
        let mut captured = self.inner.lock().unwrap_or_else(|p| p.into_inner());
        let room = self.limit.saturating_sub(captured.bytes.len());
        if chunk.len() > room {
            captured.truncated = true;
        }
        let take = chunk.len().min(room);
        captured.bytes.extend_from_slice(&chunk[..take]);
    }

    fn text(&self) -> String {
        let captured = self.inner.lock().unwrap_or_else(|p| p.into_inner());
        let mut text = String::from_utf8_lossy(&captured.bytes).into_owned();
        if captured.truncated {
            text.push_str(TRUNCATION_MARKER);
        }
        text
    }
}

/// Reads until EOF. Past the capture limit the bytes are discarded but the
/// pipe keeps being drained so the child never blocks on a full buffer.
async fn capture<R>(mut pipe: R, buffer: OutputBuffer)
where
    R: AsyncRead + Unpin,
{
    let mut chunk = [0u8; 8192];
    loop {
        match pipe.read(&mut chunk).await {
            Ok(0) => break,
            Ok(n) => buffer.push(&chunk[..n]),
            Err(e) => {
                debug!("Stopped reading child output: {}", e);
                break;
            }
        }
    }
}

async fn finish_reader(reader: Option<JoinHandle<()>>) {
    if let Some(mut handle) = reader {
        if tokio::time::timeout(READER_GRACE, &mut handle).await.is_err() {
            debug!("Output pipe still open after exit, abandoning reader");
            handle.abort();
        }
    }
}

#[cfg(unix)]
fn kill_process_group(pid: u32) {
    use nix::sys::signal::{killpg, Signal};
    use nix::unistd::Pid;

    if let Err(e) = killpg(Pid::from_raw(pid as i32), Signal::SIGKILL) {
        debug!("Process group {} already gone: {}", pid, e);
    }
}

#[cfg(not(unix))]
fn kill_process_group(_pid: u32) {}

enum Outcome {
    Exited(ExitStatus),
    WaitFailed(std::io::Error),
    TimedOut,
}

fn sanitize_label(label: &str) -> String {
    let cleaned: String = label
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || *c == '-' || *c == '_')
        .take(64)
        .collect();
    if cleaned.is_empty() {
        "script".to_string()
    } else {
        cleaned
    }
}

pub struct Sandbox {
    config: SandboxConfig,
    limiter: RateLimiter,
    sequence: AtomicU64,
}

impl Sandbox {
    pub fn new(config: SandboxConfig) -> Self {
        Self::with_clock(config, Arc::new(SystemClock))
    }

    pub fn with_clock(mut config: SandboxConfig, clock: Arc<dyn Clock>) -> Self {
        // The interpreter runs inside the scratch dir and is handed the script
        // path, so a relative dir would be resolved twice.
        if config.scratch_dir.is_relative() {
            match std::env::current_dir() {
                Ok(cwd) => config.scratch_dir = cwd.join(&config.scratch_dir),
                Err(e) => warn!(
                    "Cannot resolve scratch dir {}: {}",
                    config.scratch_dir.display(),
                    e
                ),
            }
        }
        let limiter = RateLimiter::new(config.rate_limit, config.rate_window, clock);
        Sandbox {
            config,
            limiter,
            sequence: AtomicU64::new(0),
        }
    }

    /// Validation followed by rate admission. Neither step touches the disk,
    /// and only a request that passes validation takes a slot in the window.
    pub fn admit<'a>(&self, request: &'a ExecutionRequest) -> Result<&'a str, Rejection> {
        let source = match request.source_text.as_deref() {
            Some(s) if !s.trim().is_empty() && !s.contains('\0') => s,
            _ => return Err(Rejection::InvalidInput),
        };
        let size = request.size_bytes.max(source.len());
        if size > self.config.max_source_bytes {
            return Err(Rejection::TooLarge {
                size,
                limit: self.config.max_source_bytes,
            });
        }
        self.limiter.try_admit(&request.requester_id)?;
        Ok(source)
    }

    pub async fn execute(&self, request: ExecutionRequest) -> ExecutionResult {
        let source = match self.admit(&request) {
            Ok(source) => source,
            Err(rejection) => {
                info!("Rejected execution from {}: {}", request.requester_id, rejection);
                return rejection.into();
            }
        };

        let scratch = match self.stage(&request.label, source).await {
            Ok(scratch) => scratch,
            Err(e) => {
                warn!("Failed to stage script '{}': {}", request.label, e);
                return ExecutionResult::failed(
                    FailureKind::SpawnError,
                    format!("Failed to stage script: {}", e),
                );
            }
        };

        info!(
            "Executing '{}' for {} ({} bytes)",
            request.label,
            request.requester_id,
            source.len()
        );
        let result = self.run(&scratch.path).await;
        scratch.remove().await;
        info!(
            "Execution '{}' finished in {}ms: {:?}",
            request.label,
            result.duration_ms,
            result.failure_kind
        );
        result
    }

    async fn stage(&self, label: &str, source: &str) -> std::io::Result<ScratchFile> {
        tokio_fs::create_dir_all(&self.config.scratch_dir).await?;
        let name = format!(
            "{}_{}_{}.{}",
            sanitize_label(label),
            Utc::now().format("%Y%m%d%H%M%S%3f"),
            self.sequence.fetch_add(1, Ordering::Relaxed),
            self.config.script_extension
        );
        let scratch = ScratchFile {
            path: self.config.scratch_dir.join(name),
            removed: false,
        };
        tokio_fs::write(&scratch.path, source).await?;
        debug!("Staged script at {}", scratch.path.display());
        Ok(scratch)
    }

    async fn run(&self, script: &Path) -> ExecutionResult {
        let started = Instant::now();
        let mut command = Command::new(&self.config.interpreter);
        command
            .arg(script)
            .current_dir(&self.config.scratch_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        // Own process group, so a timeout can take down everything the
        // script started along with the interpreter.
        #[cfg(unix)]
        command.process_group(0);
        let spawned = command.spawn();
        let mut child = match spawned {
            Ok(child) => child,
            Err(e) => {
                warn!("Failed to spawn '{}': {}", self.config.interpreter, e);
                let mut result = ExecutionResult::failed(
                    FailureKind::SpawnError,
                    format!("Failed to start {}: {}", self.config.interpreter, e),
                );
                result.duration_ms = started.elapsed().as_millis() as u64;
                return result;
            }
        };
        let pid = child.id();

        let stdout = OutputBuffer::new(self.config.max_output_bytes);
        let stderr = OutputBuffer::new(self.config.max_output_bytes);
        let stdout_reader = child
            .stdout
            .take()
            .map(|pipe| tokio::spawn(capture(pipe, stdout.clone())));
        let stderr_reader = child
            .stderr
            .take()
            .map(|pipe| tokio::spawn(capture(pipe, stderr.clone())));

        let outcome = match tokio::time::timeout(self.config.timeout, child.wait()).await {
            Ok(Ok(status)) => Outcome::Exited(status),
            Ok(Err(e)) => Outcome::WaitFailed(e),
            Err(_) => {
                warn!(
                    "Script {} exceeded {:?}, killing it",
                    script.display(),
                    self.config.timeout
                );
                if let Some(pid) = pid {
                    kill_process_group(pid);
                }
                if let Err(e) = child.kill().await {
                    warn!("Failed to kill timed out child: {}", e);
                }
                Outcome::TimedOut
            }
        };

        finish_reader(stdout_reader).await;
        finish_reader(stderr_reader).await;

        let mut result = ExecutionResult {
            succeeded: false,
            stdout: stdout.text(),
            stderr: stderr.text(),
            exit_code: None,
            failure_kind: None,
            duration_ms: started.elapsed().as_millis() as u64,
        };
        match outcome {
            Outcome::Exited(status) if status.success() => {
                result.succeeded = true;
                result.exit_code = status.code();
            }
            Outcome::Exited(status) => {
                debug!("Script exited with {}", status);
                result.exit_code = status.code();
                result.failure_kind = Some(FailureKind::RuntimeError);
            }
            Outcome::WaitFailed(e) => {
                warn!("Failed waiting for child: {}", e);
                result.failure_kind = Some(FailureKind::RuntimeError);
            }
            Outcome::TimedOut => {
                result.failure_kind = Some(FailureKind::Timeout);
                result.stderr.push_str(&format!(
                    "\nExecution timed out after {}s",
                    self.config.timeout.as_secs_f64()
                ));
            }
        }
        result
    }
}
