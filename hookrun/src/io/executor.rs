//! Executor abstraction for job commands.
//!
//! The [`Executor`] trait decouples the job tree evaluator from process
//! spawning. Tests use scripted executors that return predetermined outcomes
//! without spawning processes.

use std::collections::BTreeMap;
use std::fmt;
use std::io::{Read, Write};
use std::path::PathBuf;
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use tracing::{debug, info, instrument, warn};

use crate::core::signal::CancelToken;
use crate::io::process::{ProcessSpec, StdinMode, run_command, shell_command};

/// Captured output kept per command before it is printed.
const OUTPUT_LIMIT_BYTES: usize = 1024 * 1024;

/// Parameters for running one job's commands.
#[derive(Debug, Clone)]
pub struct ExecRequest {
    /// Display name of the job.
    pub name: String,
    /// Commands run in order; the first failure stops the rest.
    pub commands: Vec<String>,
    /// Working directory for every command.
    pub root: PathBuf,
    pub env: BTreeMap<String, String>,
    pub stdin: StdinMode,
    /// Child owns the terminal; output is never captured.
    pub interactive: bool,
    /// Stream output live instead of printing it after completion.
    pub follow: bool,
    pub timeout: Option<Duration>,
    pub cancel: CancelToken,
}

/// Abstraction over command execution backends.
pub trait Executor: Send + Sync {
    /// Run every command in the request. `Ok(false)` means a command failed;
    /// `Err` means a command could not be run at all.
    fn execute(&self, request: &ExecRequest) -> Result<bool>;
}

/// Executor that runs each command through the platform shell.
#[derive(Debug, Default)]
pub struct ShellExecutor {
    /// Serializes printing of captured output between parallel jobs.
    print_lock: Mutex<()>,
}

impl ShellExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    fn print_captured(&self, name: &str, stdout: &[u8], stderr: &[u8], notice: &str) {
        if stdout.is_empty() && stderr.is_empty() {
            return;
        }
        let _guard = match self.print_lock.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let mut out = std::io::stdout().lock();
        let mut buf = Vec::new();
        buf.extend_from_slice(format!("┃ {name}\n").as_bytes());
        buf.extend_from_slice(stdout);
        buf.extend_from_slice(stderr);
        buf.extend_from_slice(notice.as_bytes());
        if let Err(e) = out.write_all(&buf).and_then(|()| out.flush()) {
            warn!(job = name, err = %e, "failed to print job output");
        }
    }
}

impl Executor for ShellExecutor {
    #[instrument(skip_all, fields(job = %request.name, commands = request.commands.len()))]
    fn execute(&self, request: &ExecRequest) -> Result<bool> {
        let capture = !(request.interactive || request.follow);
        let spec = ProcessSpec {
            stdin: request.stdin.clone(),
            capture_limit: capture.then_some(OUTPUT_LIMIT_BYTES),
            timeout: request.timeout,
            cancel: request.cancel.clone(),
        };

        for line in &request.commands {
            info!(command = %line, root = %request.root.display(), "running");
            let mut cmd = shell_command(line)?;
            cmd.current_dir(&request.root).envs(&request.env);
            let output = run_command(cmd, &spec).with_context(|| format!("run `{line}`"))?;
            self.print_captured(
                &request.name,
                &output.stdout,
                &output.stderr,
                &output.truncated_notice(),
            );
            if output.timed_out {
                warn!(timeout = ?request.timeout, "command timed out");
                return Ok(false);
            }
            if !output.success() {
                debug!(exit_code = ?output.status.code(), "command failed");
                return Ok(false);
            }
        }
        Ok(true)
    }
}

/// Hook standard input, read at most once and shared by every job using it.
pub struct CachedStdin {
    reader: Mutex<Option<Box<dyn Read + Send>>>,
    bytes: OnceLock<Arc<Vec<u8>>>,
}

impl CachedStdin {
    pub fn new(reader: impl Read + Send + 'static) -> Self {
        Self {
            reader: Mutex::new(Some(Box::new(reader))),
            bytes: OnceLock::new(),
        }
    }

    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        let cell = OnceLock::new();
        let _ = cell.set(Arc::new(bytes));
        Self {
            reader: Mutex::new(None),
            bytes: cell,
        }
    }

    /// Everything read from the source; the first call drains it.
    pub fn bytes(&self) -> Result<Arc<Vec<u8>>> {
        if let Some(bytes) = self.bytes.get() {
            return Ok(Arc::clone(bytes));
        }
        let mut reader = self
            .reader
            .lock()
            .map_err(|_| anyhow!("stdin lock poisoned"))?;
        if let Some(bytes) = self.bytes.get() {
            return Ok(Arc::clone(bytes));
        }
        let mut buf = Vec::new();
        if let Some(mut source) = reader.take() {
            source.read_to_end(&mut buf).context("read hook stdin")?;
        }
        Ok(Arc::clone(self.bytes.get_or_init(|| Arc::new(buf))))
    }
}

impl Default for CachedStdin {
    fn default() -> Self {
        Self::from_bytes(Vec::new())
    }
}

impl fmt::Debug for CachedStdin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CachedStdin")
            .field("read", &self.bytes.get().is_some())
            .finish()
    }
}
