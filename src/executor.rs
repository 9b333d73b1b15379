//! One-shot command execution.
//!
//! Each request validates the command, spawns a single shell process in
//! the caller's confinement root, drains stdout and stderr into separate
//! buffers and returns once the process is gone. Every failure, including
//! a policy block or a failed spawn, is folded into an [`ExecutionResult`]
//! so callers only ever inspect fields.
//!
//! The shell leads its own process group. A timeout kills the whole group,
//! and the time limit also bounds how long pipes held open by background
//! children are read.

use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::Serialize;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::plans::PlanTier;
use crate::process_group::kill_process_group;
use crate::sandbox::SandboxedPath;
use crate::security;
use crate::shell::ShellSpec;

/// How long pipes may stay open after the process group was killed.
const PIPE_GRACE: Duration = Duration::from_millis(500);

const PIPE_CHUNK_SIZE: usize = 8192;

type SharedBuf = Arc<Mutex<Vec<u8>>>;

/// Outcome of one command. `exit_code` is `None` only when the process was
/// killed by a signal (including our own timeout kill) before reporting a code.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionResult {
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub exit_code: Option<i32>,
}

impl ExecutionResult {
    fn failed(stderr: impl Into<String>) -> Self {
        Self {
            stdout: Vec::new(),
            stderr: stderr.into().into_bytes(),
            exit_code: Some(1),
        }
    }

    /// Result for a body the endpoint could not parse.
    pub fn invalid_payload() -> Self {
        Self::failed("Invalid JSON payload.")
    }
}

/// Wire shape of an [`ExecutionResult`]: `{stdout, stderr, code}`.
#[derive(Debug, Serialize, PartialEq, Eq)]
pub struct ExecuteResponse {
    pub stdout: String,
    pub stderr: String,
    pub code: Option<i32>,
}

impl From<ExecutionResult> for ExecuteResponse {
    fn from(result: ExecutionResult) -> Self {
        Self {
            stdout: String::from_utf8_lossy(&result.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&result.stderr).into_owned(),
            code: result.exit_code,
        }
    }
}

pub struct CommandExecutor {
    shell: ShellSpec,
    timeout: Option<Duration>,
}

impl CommandExecutor {
    /// `timeout: None` lets commands run until they exit on their own.
    pub fn new(shell: ShellSpec, timeout: Option<Duration>) -> Self {
        Self { shell, timeout }
    }

    pub async fn execute(&self, command: &str, tier: PlanTier, root: &SandboxedPath) -> ExecutionResult {
        let verdict = security::validate(command, tier);
        if !verdict.is_allowed() {
            return ExecutionResult::failed(verdict.message());
        }

        let started = Instant::now();
        let mut process = Command::new(&self.shell.program);
        process
            .args(self.shell.one_shot_args(command))
            .current_dir(root.as_path())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        #[cfg(unix)]
        process.process_group(0);

        let mut child = match process.spawn() {
            Ok(child) => child,
            Err(e) => {
                warn!("Failed to spawn {}: {e}", self.shell.program);
                return ExecutionResult::failed(format!("Failed to spawn shell: {e}"));
            }
        };
        // Group id of the shell and everything it starts
        let pgid = child.id();
        debug!("Spawned one-shot command (pid {pgid:?}) in {root}");

        let stdout_buf = SharedBuf::default();
        let stderr_buf = SharedBuf::default();
        let mut pipes = [
            Some(drain(child.stdout.take(), Arc::clone(&stdout_buf))),
            Some(drain(child.stderr.take(), Arc::clone(&stderr_buf))),
        ];

        let deadline = self.timeout.map(|limit| started + limit);
        let mut timed_out = false;
        let status = match deadline {
            None => child.wait().await,
            Some(deadline) => match tokio::time::timeout_at(deadline, child.wait()).await {
                Ok(status) => status,
                Err(_) => {
                    timed_out = true;
                    warn!("One-shot command exceeded its time limit, killing");
                    kill_tree(&mut child, pgid);
                    child.wait().await
                }
            },
        };

        // The shell is gone; background children may still hold the pipes
        let pipe_deadline = if timed_out {
            Some(Instant::now() + PIPE_GRACE)
        } else {
            deadline
        };
        let mut pipes_closed = join_pipes(&mut pipes, pipe_deadline).await;
        if !pipes_closed && !timed_out {
            timed_out = true;
            warn!("Background processes outlived the one-shot time limit, killing");
            kill_tree(&mut child, pgid);
            pipes_closed = join_pipes(&mut pipes, Some(Instant::now() + PIPE_GRACE)).await;
        }
        if !pipes_closed {
            debug!("Pipes still open after the group kill, abandoning readers");
            for pipe in pipes.iter().flatten() {
                pipe.abort();
            }
        }

        let stdout = take(&stdout_buf);
        let mut stderr = take(&stderr_buf);

        let exit_code = match status {
            Ok(status) if timed_out => {
                debug!("Timed out command reaped: {status}");
                None
            }
            Ok(status) => status.code(),
            Err(e) => {
                stderr.extend_from_slice(format!("\nFailed to wait for shell: {e}").as_bytes());
                None
            }
        };
        if let (true, Some(limit)) = (timed_out, self.timeout) {
            stderr.extend_from_slice(
                format!("\nCommand timed out after {} seconds", limit.as_secs()).as_bytes(),
            );
        }

        info!(
            "One-shot command finished in {}ms (exit {:?}, {}B out, {}B err)",
            started.elapsed().as_millis(),
            exit_code,
            stdout.len(),
            stderr.len()
        );

        ExecutionResult {
            stdout,
            stderr,
            exit_code,
        }
    }
}

/// `SIGKILL`s the shell's process group, then the shell itself.
fn kill_tree(child: &mut Child, pgid: Option<u32>) {
    if let Some(pgid) = pgid {
        if let Err(e) = kill_process_group(pgid) {
            debug!("Group kill (pgid {pgid}) failed: {e}");
        }
    }
    let _ = child.start_kill();
}

/// Reads a child pipe to EOF on its own task. Output lands in `sink` chunk
/// by chunk, so it survives the task being aborted.
fn drain<R>(pipe: Option<R>, sink: SharedBuf) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let Some(mut pipe) = pipe else {
            return;
        };
        let mut chunk = [0u8; PIPE_CHUNK_SIZE];
        loop {
            match pipe.read(&mut chunk).await {
                Ok(0) => break,
                Ok(n) => sink
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .extend_from_slice(&chunk[..n]),
                Err(e) => {
                    debug!("Pipe read ended with error: {e}");
                    break;
                }
            }
        }
    })
}

/// Waits for both readers to hit EOF, clearing each finished slot.
/// Returns `false` if `deadline` passed first.
async fn join_pipes(pipes: &mut [Option<JoinHandle<()>>; 2], deadline: Option<Instant>) -> bool {
    let join = async {
        for slot in pipes.iter_mut() {
            if let Some(pipe) = slot.as_mut() {
                if let Err(e) = pipe.await {
                    debug!("Pipe reader failed: {e}");
                }
                *slot = None;
            }
        }
    };
    match deadline {
        None => {
            join.await;
            true
        }
        Some(deadline) => tokio::time::timeout_at(deadline, join).await.is_ok(),
    }
}

fn take(buf: &SharedBuf) -> Vec<u8> {
    std::mem::take(&mut *buf.lock().unwrap_or_else(|e| e.into_inner()))
}
