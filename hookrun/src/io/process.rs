//! Helpers for running child processes with timeouts, cancellation and bounded output.

use std::io::{Read, Write};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, Result, anyhow};
use tracing::{debug, error, instrument, warn};
use wait_timeout::ChildExt;

use crate::core::signal::CancelToken;

/// How often a waiting child is checked for cancellation.
const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Where a child's standard input comes from.
#[derive(Debug, Clone, Default)]
pub enum StdinMode {
    #[default]
    Null,
    /// The parent's terminal, for interactive jobs.
    Inherit,
    Bytes(Arc<Vec<u8>>),
}

/// How a child process is run.
#[derive(Debug, Clone)]
pub struct ProcessSpec {
    pub stdin: StdinMode,
    /// Capture stdout/stderr up to this many bytes each; `None` streams live.
    pub capture_limit: Option<usize>,
    pub timeout: Option<Duration>,
    pub cancel: CancelToken,
}

/// Child process outcome. Streams are empty when output was not captured.
#[derive(Debug)]
pub struct CommandOutput {
    pub status: ExitStatus,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub stdout_truncated: usize,
    pub stderr_truncated: usize,
    pub timed_out: bool,
    pub cancelled: bool,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.status.success() && !self.timed_out && !self.cancelled
    }

    pub fn truncated_notice(&self) -> String {
        let mut notice = String::new();
        if self.stdout_truncated > 0 {
            notice.push_str(&format!("\n[stdout truncated {} bytes]\n", self.stdout_truncated));
        }
        if self.stderr_truncated > 0 {
            notice.push_str(&format!("\n[stderr truncated {} bytes]\n", self.stderr_truncated));
        }
        notice
    }
}

/// Build a command running `line` through `sh -c`, or split on whitespace
/// where no POSIX shell is expected.
pub fn shell_command(line: &str) -> Result<Command> {
    if cfg!(windows) {
        let mut parts = line.split_whitespace();
        let program = parts.next().ok_or_else(|| anyhow!("empty command"))?;
        let mut cmd = Command::new(program);
        cmd.args(parts);
        return Ok(cmd);
    }
    let mut cmd = Command::new("sh");
    cmd.arg("-c").arg(line);
    Ok(cmd)
}

/// Run a command to completion, killing it on timeout or cancellation.
///
/// Captured output is read concurrently while the child runs so full pipes
/// never deadlock it; bytes beyond the limit are drained and discarded.
#[instrument(skip_all, fields(timeout = ?spec.timeout, capture = spec.capture_limit.is_some()))]
pub fn run_command(mut cmd: Command, spec: &ProcessSpec) -> Result<CommandOutput> {
    match spec.stdin {
        StdinMode::Null => cmd.stdin(Stdio::null()),
        StdinMode::Inherit => cmd.stdin(Stdio::inherit()),
        StdinMode::Bytes(_) => cmd.stdin(Stdio::piped()),
    };
    if spec.capture_limit.is_some() {
        cmd.stdout(Stdio::piped()).stderr(Stdio::piped());
    } else {
        cmd.stdout(Stdio::inherit()).stderr(Stdio::inherit());
    }
    // Interactive children stay in the terminal's foreground group.
    let grouped = !matches!(spec.stdin, StdinMode::Inherit);
    #[cfg(unix)]
    if grouped {
        use std::os::unix::process::CommandExt;
        cmd.process_group(0);
    }

    debug!("spawning child process");
    let mut child = match cmd.spawn() {
        Ok(c) => c,
        Err(e) => {
            error!(err = %e, "failed to spawn command");
            return Err(e).context("spawn command");
        }
    };

    let stdin_handle = match &spec.stdin {
        StdinMode::Bytes(input) => {
            let mut child_stdin = child
                .stdin
                .take()
                .ok_or_else(|| anyhow!("stdin was not piped"))?;
            let input = Arc::clone(input);
            Some(thread::spawn(move || {
                // The child may exit without reading everything.
                if let Err(e) = child_stdin.write_all(&input) {
                    debug!(err = %e, "stdin closed early");
                }
            }))
        }
        _ => None,
    };

    let readers = match spec.capture_limit {
        Some(limit) => {
            let stdout = child
                .stdout
                .take()
                .ok_or_else(|| anyhow!("stdout was not piped"))?;
            let stderr = child
                .stderr
                .take()
                .ok_or_else(|| anyhow!("stderr was not piped"))?;
            Some((
                thread::spawn(move || read_stream_limited(stdout, limit)),
                thread::spawn(move || read_stream_limited(stderr, limit)),
            ))
        }
        None => None,
    };

    let waited = wait_with_cancel(&mut child, spec, grouped)?;

    if let Some(handle) = stdin_handle
        && handle.join().is_err()
    {
        warn!("stdin writer thread panicked");
    }

    let ((stdout, stdout_truncated), (stderr, stderr_truncated)) = match readers {
        Some((out, err)) => (
            join_output(out).context("join stdout")?,
            join_output(err).context("join stderr")?,
        ),
        None => ((Vec::new(), 0), (Vec::new(), 0)),
    };

    if stdout_truncated > 0 || stderr_truncated > 0 {
        warn!(stdout_truncated, stderr_truncated, "output truncated");
    }

    debug!(
        exit_code = ?waited.status.code(),
        timed_out = waited.timed_out,
        cancelled = waited.cancelled,
        "command finished"
    );
    Ok(CommandOutput {
        status: waited.status,
        stdout,
        stderr,
        stdout_truncated,
        stderr_truncated,
        timed_out: waited.timed_out,
        cancelled: waited.cancelled,
    })
}

struct Waited {
    status: ExitStatus,
    timed_out: bool,
    cancelled: bool,
}

fn wait_with_cancel(child: &mut Child, spec: &ProcessSpec, grouped: bool) -> Result<Waited> {
    let deadline = spec.timeout.map(|timeout| Instant::now() + timeout);
    loop {
        if let Some(status) = child
            .wait_timeout(POLL_INTERVAL)
            .context("wait for command")?
        {
            return Ok(Waited {
                status,
                timed_out: false,
                cancelled: false,
            });
        }
        let cancelled = spec.cancel.is_cancelled();
        let timed_out = deadline.is_some_and(|deadline| Instant::now() >= deadline);
        if cancelled || timed_out {
            warn!(cancelled, timed_out, "stopping command, killing");
            kill_tree(child, grouped)?;
            let status = child.wait().context("wait command after kill")?;
            return Ok(Waited {
                status,
                timed_out,
                cancelled,
            });
        }
    }
}

/// Kill the child and, when it leads its own process group, everything it spawned.
/// Grandchildren holding the output pipes would otherwise keep the readers blocked.
#[cfg(unix)]
fn kill_tree(child: &mut Child, grouped: bool) -> Result<()> {
    use nix::sys::signal::{Signal, killpg};
    use nix::unistd::Pid;

    if grouped {
        let pgid = i32::try_from(child.id()).context("process id out of range")?;
        match killpg(Pid::from_raw(pgid), Signal::SIGKILL) {
            Ok(()) => return Ok(()),
            Err(err) => debug!(err = %err, "killpg failed, killing leader only"),
        }
    }
    child.kill().context("kill command")
}

#[cfg(not(unix))]
fn kill_tree(child: &mut Child, _grouped: bool) -> Result<()> {
    child.kill().context("kill command")
}

fn join_output(handle: thread::JoinHandle<Result<(Vec<u8>, usize)>>) -> Result<(Vec<u8>, usize)> {
    match handle.join() {
        Ok(result) => result,
        Err(_) => Err(anyhow!("output reader thread panicked")),
    }
}

fn read_stream_limited<R: Read>(mut reader: R, limit: usize) -> Result<(Vec<u8>, usize)> {
    let mut buf = Vec::new();
    let mut truncated = 0usize;
    let mut chunk = [0u8; 8192];

    loop {
        let n = reader.read(&mut chunk).context("read output")?;
        if n == 0 {
            break;
        }
        let remaining = limit.saturating_sub(buf.len());
        if remaining > 0 {
            let keep = n.min(remaining);
            buf.extend_from_slice(&chunk[..keep]);
            truncated += n.saturating_sub(keep);
        } else {
            truncated += n;
        }
    }

    Ok((buf, truncated))
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    fn sh(script: &str) -> Command {
        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg(script);
        cmd
    }

    fn captured(limit: usize) -> ProcessSpec {
        ProcessSpec {
            stdin: StdinMode::Null,
            capture_limit: Some(limit),
            timeout: None,
            cancel: CancelToken::default(),
        }
    }

    #[test]
    fn captures_output_and_status() {
        let output = run_command(sh("echo out; echo err >&2; exit 3"), &captured(1024))
            .expect("run");
        assert_eq!(output.status.code(), Some(3));
        assert!(!output.success());
        assert_eq!(String::from_utf8_lossy(&output.stdout), "out\n");
        assert_eq!(String::from_utf8_lossy(&output.stderr), "err\n");
    }

    #[test]
    fn truncates_beyond_limit() {
        let output = run_command(sh("printf 0123456789"), &captured(4)).expect("run");
        assert_eq!(output.stdout, b"0123");
        assert_eq!(output.stdout_truncated, 6);
        assert!(output.truncated_notice().contains("stdout truncated 6 bytes"));
    }

    #[test]
    fn feeds_stdin_bytes() {
        let spec = ProcessSpec {
            stdin: StdinMode::Bytes(Arc::new(b"hello".to_vec())),
            ..captured(1024)
        };
        let output = run_command(sh("cat"), &spec).expect("run");
        assert_eq!(output.stdout, b"hello");
    }

    #[test]
    fn kills_on_timeout() {
        let spec = ProcessSpec {
            timeout: Some(Duration::from_millis(100)),
            ..captured(1024)
        };
        let started = Instant::now();
        let output = run_command(sh("exec sleep 5"), &spec).expect("run");
        assert!(output.timed_out);
        assert!(!output.success());
        assert!(started.elapsed() < Duration::from_secs(4));
    }

    #[test]
    fn kills_on_cancel() {
        let spec = captured(1024);
        let cancel = spec.cancel.clone();
        let trigger = thread::spawn(move || {
            thread::sleep(Duration::from_millis(100));
            cancel.cancel();
        });
        let output = run_command(sh("exec sleep 5"), &spec).expect("run");
        trigger.join().expect("join");
        assert!(output.cancelled);
        assert!(!output.success());
    }

    #[test]
    fn timeout_kills_grandchildren_holding_pipes() {
        let spec = ProcessSpec {
            timeout: Some(Duration::from_millis(100)),
            ..captured(1024)
        };
        let started = Instant::now();
        let output = run_command(sh("sleep 3; true"), &spec).expect("run");
        assert!(output.timed_out);
        assert!(started.elapsed() < Duration::from_secs(2), "{:?}", started.elapsed());
    }

    #[test]
    fn cancel_kills_pipelines() {
        let spec = captured(1024);
        let cancel = spec.cancel.clone();
        let trigger = thread::spawn(move || {
            thread::sleep(Duration::from_millis(100));
            cancel.cancel();
        });
        let started = Instant::now();
        let output = run_command(sh("sleep 3 | cat; echo done"), &spec).expect("run");
        trigger.join().expect("join");
        assert!(output.cancelled);
        assert!(output.stdout.is_empty());
        assert!(started.elapsed() < Duration::from_secs(2), "{:?}", started.elapsed());
    }
}
