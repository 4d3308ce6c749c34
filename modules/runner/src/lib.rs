//! Supervised execution of one external tool process: argv spawn, cleared
//! environment, bounded output capture, timeout and cancellation.

mod capture;
mod terminate;

use async_trait::async_trait;
use rand::{thread_rng, Rng};
use serde::{Deserialize, Serialize};
use std::io;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tool_registry::Invocation;
use tracing::{debug, info, warn};

use crate::capture::{read_bounded, Captured, Sink};

pub const DEFAULT_ENV_ALLOWLIST: &[&str] = &["PATH", "HOME", "LANG", "LC_ALL", "TMPDIR"];

/// stderr is diagnostics only and gets a smaller cap than stdout.
const STDERR_CAP: usize = 64 * 1024;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OverflowPolicy {
    /// Keep reading and discard, the tool runs to completion.
    #[default]
    Drain,
    /// Stop reading and terminate the tool.
    Kill,
}

#[derive(Debug, Clone)]
pub struct RunnerOptions {
    pub working_dir: Option<PathBuf>,
    pub env_allowlist: Vec<String>,
    pub grace: Duration,
    pub overflow: OverflowPolicy,
    pub spawn_retries: u32,
    pub retry_delay: Duration,
}

impl Default for RunnerOptions {
    fn default() -> Self {
        RunnerOptions {
            working_dir: None,
            env_allowlist: DEFAULT_ENV_ALLOWLIST.iter().map(|s| s.to_string()).collect(),
            grace: Duration::from_secs(2),
            overflow: OverflowPolicy::Drain,
            spawn_retries: 2,
            retry_delay: Duration::from_millis(100),
        }
    }
}

/// What happened to one process. A non-zero exit is an outcome, not an error.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunOutcome {
    pub exit_code: Option<i32>,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    /// stdout hit `max_output_bytes`.
    pub truncated: bool,
    pub stderr_truncated: bool,
    pub timed_out: bool,
    pub cancelled: bool,
    pub duration_ms: u64,
    /// None when no process was started.
    pub pid: Option<u32>,
}

impl RunOutcome {
    pub fn stdout_lossy(&self) -> String {
        String::from_utf8_lossy(&self.stdout).into_owned()
    }

    pub fn stderr_lossy(&self) -> String {
        String::from_utf8_lossy(&self.stderr).into_owned()
    }
}

#[derive(Debug, Error)]
pub enum RunError {
    #[error("failed to spawn {executable}: {source}")]
    Spawn {
        executable: String,
        #[source]
        source: io::Error,
    },
    #[error("failed to reap {executable}: {source}")]
    Wait {
        executable: String,
        #[source]
        source: io::Error,
    },
}

/// Seam between scheduling and process execution.
#[async_trait]
pub trait ToolExecutor: Send + Sync {
    async fn execute(&self, inv: &Invocation, timeout: Duration, cancel: &CancellationToken) -> Result<RunOutcome, RunError>;
}

#[derive(Debug, Clone, Default)]
pub struct ProcessRunner {
    opts: RunnerOptions,
}

enum Ended {
    Exited(io::Result<std::process::ExitStatus>),
    TimedOut,
    Cancelled,
    Overflow,
}

impl ProcessRunner {
    pub fn new(opts: RunnerOptions) -> Self {
        ProcessRunner { opts }
    }

    pub fn options(&self) -> &RunnerOptions {
        &self.opts
    }

    pub async fn run(&self, inv: &Invocation, timeout: Duration, cancel: &CancellationToken) -> Result<RunOutcome, RunError> {
        if cancel.is_cancelled() {
            return Ok(RunOutcome { cancelled: true, ..RunOutcome::default() });
        }
        let started = Instant::now();
        let executable = inv.spec.executable.clone();
        let mut child = self.spawn_with_retry(inv).await?;
        let pid = child.id();
        info!(
            capability = %inv.spec.capability,
            executable = %executable,
            args = ?inv.args,
            pid = ?pid,
            timeout_ms = timeout.as_millis() as u64,
            "audit: launching external tool"
        );

        let overflow = CancellationToken::new();
        let limit = inv.spec.max_output_bytes;
        let (out_sink, err_sink) = (Sink::default(), Sink::default());
        let stdout_task = child
            .stdout
            .take()
            .map(|s| tokio::spawn(read_bounded(s, limit, self.opts.overflow, overflow.clone(), out_sink.clone())));
        let stderr_task = child
            .stderr
            .take()
            .map(|s| tokio::spawn(read_bounded(s, limit.min(STDERR_CAP), OverflowPolicy::Drain, overflow.clone(), err_sink.clone())));

        let deadline = tokio::time::sleep(timeout);
        tokio::pin!(deadline);
        let ended = tokio::select! {
            status = child.wait() => Ended::Exited(status),
            _ = &mut deadline => Ended::TimedOut,
            _ = cancel.cancelled() => Ended::Cancelled,
            _ = overflow.cancelled() => Ended::Overflow,
        };

        let (timed_out, cancelled) = match &ended {
            Ended::TimedOut => (true, false),
            Ended::Cancelled => (false, true),
            _ => (false, false),
        };
        let status = match ended {
            Ended::Exited(Ok(status)) => {
                if let Some(pid) = pid {
                    terminate::sweep_group(pid);
                }
                Ok(status)
            }
            Ended::Exited(Err(e)) => {
                warn!(error = %e, executable = %executable, "wait failed, terminating");
                terminate::terminate(&mut child, self.opts.grace).await
            }
            Ended::TimedOut | Ended::Cancelled | Ended::Overflow => terminate::terminate(&mut child, self.opts.grace).await,
        }
        .map_err(|source| RunError::Wait { executable: executable.clone(), source })?;

        let out = collect(stdout_task, &out_sink, self.opts.grace).await;
        let err = collect(stderr_task, &err_sink, self.opts.grace).await;
        let duration_ms = started.elapsed().as_millis() as u64;
        debug!(
            executable = %executable,
            exit_code = ?status.code(),
            timed_out,
            cancelled,
            truncated = out.truncated,
            duration_ms,
            "tool finished"
        );
        Ok(RunOutcome {
            exit_code: status.code(),
            stdout: out.bytes,
            stderr: err.bytes,
            truncated: out.truncated,
            stderr_truncated: err.truncated,
            timed_out,
            cancelled,
            duration_ms,
            pid,
        })
    }

    fn command(&self, inv: &Invocation) -> Command {
        let mut cmd = Command::new(&inv.spec.executable);
        cmd.args(&inv.args)
            .env_clear()
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        for key in &self.opts.env_allowlist {
            if let Some(v) = std::env::var_os(key) {
                cmd.env(key, v);
            }
        }
        if let Some(dir) = &self.opts.working_dir {
            cmd.current_dir(dir);
        }
        #[cfg(unix)]
        cmd.process_group(0);
        cmd
    }

    async fn spawn_with_retry(&self, inv: &Invocation) -> Result<Child, RunError> {
        let mut attempts = 0u32;
        loop {
            match self.command(inv).spawn() {
                Ok(child) => return Ok(child),
                Err(e) if attempts < self.opts.spawn_retries && is_transient(&e) => {
                    attempts += 1;
                    let base = self.opts.retry_delay.as_millis() as u64;
                    let exp = base.saturating_mul(1u64 << attempts.min(6));
                    let jitter = thread_rng().gen_range(0..(exp / 4 + 1));
                    warn!(error = %e, attempt = attempts, executable = %inv.spec.executable, "spawn failed, retrying");
                    tokio::time::sleep(Duration::from_millis(exp + jitter)).await;
                }
                Err(source) => return Err(RunError::Spawn { executable: inv.spec.executable.clone(), source }),
            }
        }
    }
}

#[async_trait]
impl ToolExecutor for ProcessRunner {
    async fn execute(&self, inv: &Invocation, timeout: Duration, cancel: &CancellationToken) -> Result<RunOutcome, RunError> {
        self.run(inv, timeout, cancel).await
    }
}

fn is_transient(e: &io::Error) -> bool {
    if matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted) {
        return true;
    }
    #[cfg(unix)]
    if matches!(e.raw_os_error(), Some(libc::EAGAIN) | Some(libc::EMFILE) | Some(libc::ENFILE)) {
        return true;
    }
    false
}

/// Pipes close once the process group is gone; `grace` bounds the wait for
/// anything that escaped the group and still holds them. Bytes read before
/// the reader is abandoned are kept and marked truncated.
async fn collect(task: Option<JoinHandle<()>>, sink: &Sink, grace: Duration) -> Captured {
    let Some(mut task) = task else {
        return Captured::default();
    };
    match tokio::time::timeout(grace, &mut task).await {
        Ok(Ok(())) => sink.take(false),
        Ok(Err(e)) => {
            warn!(error = %e, "output reader task failed");
            sink.take(true)
        }
        Err(_) => {
            warn!("output pipe still open after tool exit, abandoning reader");
            task.abort();
            sink.take(true)
        }
    }
}
