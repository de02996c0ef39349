//! Context-aware subprocess execution with bounded capture.
//!
//! Single entry point for every external command. Output is read concurrently
//! while the child runs (no pipe deadlocks) and bounded in memory; the wait
//! loop polls in short slices so cancellation and timeout are observed
//! promptly. On cancellation the child's process group receives SIGINT, then
//! SIGKILL after a short grace period.

use std::fmt;
use std::io::Read;
use std::os::unix::process::CommandExt;
use std::path::Path;
use std::process::{Child, Command, Stdio};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{anyhow, Context, Result};
use tracing::{debug, warn};
use wait_timeout::ChildExt;

use crate::core::cancel::CancelToken;

/// Wait-loop granularity; bounds how late a cancel/timeout is noticed.
const POLL_SLICE: Duration = Duration::from_millis(50);
/// Grace between SIGINT and SIGKILL on cancellation.
const INT_GRACE: Duration = Duration::from_millis(500);

/// Why a command run failed before producing an exit status (or with one the
/// caller asked to treat as fatal).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandErrorKind {
    /// Program missing from PATH.
    NotFound,
    /// Process exited non-zero (only from [`run_checked`]).
    NonZeroExit,
    /// The cancellation scope was signalled while the process ran.
    Cancelled,
    /// The configured ceiling elapsed.
    Timeout,
    /// Pipe/spawn/wait I/O failure.
    Io,
}

/// Typed subprocess failure; discriminated by the retry classifiers.
#[derive(Debug, Clone)]
pub struct CommandError {
    pub kind: CommandErrorKind,
    pub program: String,
    pub detail: String,
}

impl fmt::Display for CommandError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind {
            CommandErrorKind::NotFound => write!(f, "{} not found", self.program),
            CommandErrorKind::NonZeroExit => {
                write!(f, "{} failed: {}", self.program, self.detail)
            }
            CommandErrorKind::Cancelled => write!(f, "{} cancelled", self.program),
            CommandErrorKind::Timeout => {
                write!(f, "{} timed out after {}", self.program, self.detail)
            }
            CommandErrorKind::Io => write!(f, "{} io error: {}", self.program, self.detail),
        }
    }
}

impl std::error::Error for CommandError {}

/// Captured output of a completed command.
#[derive(Debug, Clone)]
pub struct CommandOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
    pub duration: Duration,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// Run a command to completion, capturing bounded stdout/stderr.
///
/// Returns `Ok` for any exit code once the process ran; `Err(CommandError)`
/// with kind `not_found`/`io`/`cancelled`/`timeout` when it did not.
pub fn run_command(
    cancel: &CancelToken,
    workdir: &Path,
    program: &str,
    args: &[&str],
    timeout: Duration,
    output_limit_bytes: usize,
) -> Result<CommandOutput> {
    cancel.check()?;
    let start = Instant::now();

    let mut cmd = Command::new(program);
    cmd.args(args)
        .current_dir(workdir)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        // Own process group so cancellation can signal the whole tree.
        .process_group(0);

    debug!(program, ?args, workdir = %workdir.display(), "spawning command");
    let mut child = cmd.spawn().map_err(|err| spawn_error(program, err))?;

    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| anyhow!("stdout was not piped"))?;
    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| anyhow!("stderr was not piped"))?;
    let stdout_handle = thread::spawn(move || read_stream_limited(stdout, output_limit_bytes));
    let stderr_handle = thread::spawn(move || read_stream_limited(stderr, output_limit_bytes));

    let deadline = start + timeout;
    let status = loop {
        if cancel.is_cancelled() {
            interrupt_then_kill(&mut child, program)?;
            drain(stdout_handle, stderr_handle);
            // Root the chain in AtlasError::Cancelled so engine-level
            // discrimination sees a cancellation; the CommandError context
            // keeps the subprocess-level kind observable.
            return Err(
                anyhow::Error::new(crate::core::error::AtlasError::Cancelled)
                    .context(command_error(program, CommandErrorKind::Cancelled, "")),
            );
        }
        if Instant::now() >= deadline {
            warn!(program, timeout_secs = timeout.as_secs(), "command timed out");
            kill_group(&mut child);
            child.wait().ok();
            drain(stdout_handle, stderr_handle);
            return Err(
                command_error(program, CommandErrorKind::Timeout, &format!("{timeout:?}")).into(),
            );
        }
        let slice = POLL_SLICE.min(deadline.saturating_duration_since(Instant::now()));
        match child
            .wait_timeout(slice)
            .map_err(|err| command_error(program, CommandErrorKind::Io, &err.to_string()))?
        {
            Some(status) => break status,
            None => continue,
        }
    };

    let (stdout, stdout_truncated) = join_output(stdout_handle).context("join stdout")?;
    let (stderr, stderr_truncated) = join_output(stderr_handle).context("join stderr")?;

    Ok(CommandOutput {
        stdout: render_output(stdout, stdout_truncated),
        stderr: render_output(stderr, stderr_truncated),
        exit_code: status.code().unwrap_or(-1),
        duration: start.elapsed(),
    })
}

/// Like [`run_command`] but a non-zero exit becomes a `NonZeroExit` error
/// carrying the stderr tail.
pub fn run_checked(
    cancel: &CancelToken,
    workdir: &Path,
    program: &str,
    args: &[&str],
    timeout: Duration,
    output_limit_bytes: usize,
) -> Result<CommandOutput> {
    let output = run_command(cancel, workdir, program, args, timeout, output_limit_bytes)?;
    if !output.success() {
        let detail = format!(
            "exit code {}: {}",
            output.exit_code,
            output.stderr.trim().lines().last().unwrap_or("")
        );
        return Err(anyhow::Error::new(command_error(
            program,
            CommandErrorKind::NonZeroExit,
            &detail,
        ))
        .context(format!("{program} {}", args.join(" "))));
    }
    Ok(output)
}

fn spawn_error(program: &str, err: std::io::Error) -> anyhow::Error {
    let kind = if err.kind() == std::io::ErrorKind::NotFound {
        CommandErrorKind::NotFound
    } else {
        CommandErrorKind::Io
    };
    command_error(program, kind, &err.to_string()).into()
}

fn command_error(program: &str, kind: CommandErrorKind, detail: &str) -> CommandError {
    CommandError {
        kind,
        program: program.to_string(),
        detail: detail.to_string(),
    }
}

fn interrupt_then_kill(child: &mut Child, program: &str) -> Result<()> {
    debug!(program, "cancellation: interrupting process group");
    // SAFETY: plain syscall on a pid we own; negative pid targets the group.
    unsafe {
        libc::kill(-(child.id() as i32), libc::SIGINT);
    }
    match child
        .wait_timeout(INT_GRACE)
        .with_context(|| format!("wait after interrupt of {program}"))?
    {
        Some(_) => {}
        None => {
            warn!(program, "process ignored SIGINT, killing");
            kill_group(child);
            child.wait().ok();
        }
    }
    Ok(())
}

fn kill_group(child: &mut Child) {
    // SAFETY: see interrupt_then_kill.
    unsafe {
        libc::kill(-(child.id() as i32), libc::SIGKILL);
    }
    let _ = child.kill();
}

fn drain(
    stdout: thread::JoinHandle<Result<(Vec<u8>, usize)>>,
    stderr: thread::JoinHandle<Result<(Vec<u8>, usize)>>,
) {
    let _ = stdout.join();
    let _ = stderr.join();
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

fn render_output(bytes: Vec<u8>, truncated: usize) -> String {
    let mut out = String::from_utf8_lossy(&bytes).to_string();
    if truncated > 0 {
        out.push_str(&format!("\n[truncated {truncated} bytes]\n"));
    }
    out
}
