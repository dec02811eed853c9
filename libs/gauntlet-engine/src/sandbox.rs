/// Subprocess Sandbox - Bounded Child Process Execution
///
/// **Core Responsibility:**
/// Run one interpreter/compiler invocation and capture both output
/// channels under hard ceilings.
///
/// **Ceilings:**
/// - Wall clock: SIGTERM on expiry, SIGKILL after the grace window
/// - Output: stdout + stderr combined, the process is killed outright
///   as soon as the ceiling is crossed
/// - No stdin, cleared environment (PATH only), `kill_on_drop` so a
///   cancelled future never leaks a child
///
/// Memory ceilings are language-specific and passed in as arguments
/// by the runners.
use anyhow::{Context, Result};
use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::{Child, Command};
use tokio::sync::Notify;
use tracing::{debug, warn};

const DEFAULT_PATH: &str = "/usr/local/bin:/usr/bin:/bin";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SandboxLimits {
    pub timeout: Duration,
    pub max_output_bytes: usize,
    pub kill_grace: Duration,
}

/// Raw process outcome, before any result parsing
#[derive(Debug, Clone, Default)]
pub struct ProcessOutcome {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: Option<i32>,
    pub timed_out: bool,
    pub output_exceeded: bool,
    pub duration: Duration,
}

impl ProcessOutcome {
    /// Exited on its own with status 0
    pub fn succeeded(&self) -> bool {
        !self.timed_out && !self.output_exceeded && self.exit_code == Some(0)
    }
}

/// A single command to run inside a working directory
#[derive(Debug, Clone)]
pub struct SandboxCommand {
    pub program: String,
    pub args: Vec<String>,
    pub working_dir: PathBuf,
}

impl SandboxCommand {
    pub fn new(program: &str, working_dir: &Path) -> Self {
        Self {
            program: program.to_string(),
            args: Vec::new(),
            working_dir: working_dir.to_path_buf(),
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }
}

enum Finish {
    Exited(Option<i32>),
    TimedOut,
    OutputExceeded,
}

/// Spawn and supervise a child process. Errors only when the process
/// cannot be started; every runtime condition is reported in the outcome.
pub async fn run(command: &SandboxCommand, limits: &SandboxLimits) -> Result<ProcessOutcome> {
    let path_env = std::env::var("PATH").unwrap_or_else(|_| DEFAULT_PATH.to_string());

    let mut child = Command::new(&command.program)
        .args(&command.args)
        .current_dir(&command.working_dir)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .env_clear()
        .env("PATH", path_env)
        .env("HOME", &command.working_dir)
        .env("LANG", "C.UTF-8")
        .kill_on_drop(true)
        .spawn()
        .with_context(|| format!("Failed to start '{}'", command.program))?;

    let start = Instant::now();

    let stdout = child.stdout.take().context("Child stdout was not captured")?;
    let stderr = child.stderr.take().context("Child stderr was not captured")?;

    let total = Arc::new(AtomicUsize::new(0));
    let overflow = Arc::new(Notify::new());

    let stdout_reader = tokio::spawn(read_capped(
        stdout,
        total.clone(),
        limits.max_output_bytes,
        overflow.clone(),
    ));
    let stderr_reader = tokio::spawn(read_capped(
        stderr,
        total.clone(),
        limits.max_output_bytes,
        overflow.clone(),
    ));

    let finish = tokio::select! {
        status = child.wait() => match status {
            Ok(status) => Finish::Exited(status.code()),
            Err(e) => {
                warn!(program = %command.program, error = %e, "Failed to wait for child");
                Finish::Exited(None)
            }
        },
        _ = tokio::time::sleep(limits.timeout) => Finish::TimedOut,
        _ = overflow.notified() => Finish::OutputExceeded,
    };

    let mut outcome = ProcessOutcome::default();
    match finish {
        Finish::Exited(code) => outcome.exit_code = code,
        Finish::TimedOut => {
            debug!(program = %command.program, timeout_ms = limits.timeout.as_millis() as u64, "Process timed out");
            outcome.timed_out = true;
            terminate(&mut child, limits.kill_grace).await;
        }
        Finish::OutputExceeded => {
            debug!(program = %command.program, limit = limits.max_output_bytes, "Output ceiling exceeded");
            outcome.output_exceeded = true;
            force_kill(&mut child).await;
        }
    }
    outcome.duration = start.elapsed();

    // Grandchildren may keep the pipes open; never wait on them for long
    let drain = limits.kill_grace.max(Duration::from_millis(100));
    outcome.stdout = collect(stdout_reader, drain).await;
    outcome.stderr = collect(stderr_reader, drain).await;

    Ok(outcome)
}

async fn read_capped<R>(mut reader: R, total: Arc<AtomicUsize>, limit: usize, overflow: Arc<Notify>) -> Vec<u8>
where
    R: AsyncRead + Unpin,
{
    let mut buffer = Vec::new();
    let mut chunk = [0u8; 8192];

    loop {
        match reader.read(&mut chunk).await {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                let seen = total.fetch_add(n, Ordering::SeqCst) + n;
                if seen > limit {
                    let keep = n.saturating_sub(seen - limit);
                    buffer.extend_from_slice(&chunk[..keep]);
                    overflow.notify_one();
                    break;
                }
                buffer.extend_from_slice(&chunk[..n]);
            }
        }
    }

    buffer
}

async fn collect(reader: tokio::task::JoinHandle<Vec<u8>>, wait: Duration) -> String {
    match tokio::time::timeout(wait, reader).await {
        Ok(Ok(bytes)) => String::from_utf8_lossy(&bytes).into_owned(),
        Ok(Err(e)) => {
            warn!(error = %e, "Output reader task failed");
            String::new()
        }
        Err(_) => {
            warn!("Output pipe still open after process exit, discarding");
            String::new()
        }
    }
}

/// Graceful-then-forceful termination
async fn terminate(child: &mut Child, grace: Duration) {
    if let Some(pid) = child.id() {
        match signal::kill(Pid::from_raw(pid as i32), Signal::SIGTERM) {
            Ok(()) => {
                if tokio::time::timeout(grace, child.wait()).await.is_ok() {
                    return;
                }
                debug!(pid, "Process ignored SIGTERM, escalating to SIGKILL");
            }
            Err(e) => warn!(pid, error = %e, "Failed to send SIGTERM"),
        }
    }
    force_kill(child).await;
}

async fn force_kill(child: &mut Child) {
    if let Err(e) = child.kill().await {
        warn!(error = %e, "Failed to kill child process");
    }
}
