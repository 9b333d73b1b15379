//! A shell process attached to a pseudo-terminal.
//!
//! `portable-pty` exposes blocking handles, so each process gets three
//! small threads: a reader forwarding output chunks into a bounded tokio
//! channel, a writer draining a stdin channel, and a waiter reporting the
//! exit code. The async side never blocks on the PTY. When the consumer
//! falls behind, the reader blocks and the shell blocks on its writes.

use std::io::{ErrorKind, Read, Write};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use portable_pty::{native_pty_system, Child, ChildKiller, CommandBuilder, MasterPty, PtySize};
use serde::Serialize;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, trace, warn};

#[cfg(unix)]
use crate::process_group::kill_process_group;

const READ_CHUNK_SIZE: usize = 4096;

/// Output chunks buffered between the reader thread and the session.
const OUTPUT_BUFFER_CHUNKS: usize = 64;

#[derive(Debug, Error)]
pub enum PtyError {
    #[error("PTY setup failed: {0}")]
    Setup(String),
    #[error("PTY size must have non-zero rows and columns")]
    InvalidSize,
    #[error("PTY stdin is closed")]
    Closed,
    #[error("PTY lock poisoned")]
    Poisoned,
}

fn setup_error(e: impl std::fmt::Display) -> PtyError {
    PtyError::Setup(e.to_string())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct TerminalSize {
    pub cols: u16,
    pub rows: u16,
}

impl TerminalSize {
    pub fn new(cols: u16, rows: u16) -> Result<Self, PtyError> {
        if cols == 0 || rows == 0 {
            return Err(PtyError::InvalidSize);
        }
        Ok(Self { cols, rows })
    }
}

impl From<TerminalSize> for PtySize {
    fn from(size: TerminalSize) -> Self {
        PtySize {
            cols: size.cols,
            rows: size.rows,
            pixel_width: 0,
            pixel_height: 0,
        }
    }
}

#[derive(Debug, Clone)]
pub struct PtySpawnSpec {
    pub program: String,
    pub args: Vec<String>,
    pub cwd: PathBuf,
    pub env: Vec<(String, String)>,
    pub size: TerminalSize,
}

/// Receiving ends of a process's output and exit notification.
pub struct PtyStreams {
    /// Output chunks in the order the process wrote them. Closes at EOF.
    pub output: mpsc::Receiver<Vec<u8>>,
    /// Exit code, `None` if the process died from a signal or could not
    /// be waited on.
    pub exit: oneshot::Receiver<Option<i32>>,
}

pub struct PtyProcess {
    master: Mutex<Box<dyn MasterPty + Send>>,
    stdin_tx: mpsc::UnboundedSender<Vec<u8>>,
    killer: Mutex<Box<dyn ChildKiller + Send + Sync>>,
    kill_sent: AtomicBool,
    exited: Arc<AtomicBool>,
    pid: Option<u32>,
}

struct Spawned {
    master: Box<dyn MasterPty + Send>,
    reader: Box<dyn Read + Send>,
    writer: Box<dyn Write + Send>,
    child: Box<dyn Child + Send + Sync>,
}

impl PtyProcess {
    pub async fn spawn(spec: PtySpawnSpec) -> Result<(Self, PtyStreams), PtyError> {
        let spawned = tokio::task::spawn_blocking(move || open_and_spawn(spec))
            .await
            .map_err(setup_error)??;

        let pid = spawned.child.process_id();
        let killer = spawned.child.clone_killer();
        let exited = Arc::new(AtomicBool::new(false));

        let (output_tx, output) = mpsc::channel(OUTPUT_BUFFER_CHUNKS);
        let (stdin_tx, stdin_rx) = mpsc::unbounded_channel();
        let (exit_tx, exit) = oneshot::channel();

        spawn_read_loop(spawned.reader, output_tx);
        spawn_write_loop(spawned.writer, stdin_rx);
        spawn_wait_loop(spawned.child, exit_tx, Arc::clone(&exited));

        debug!("PTY process started (pid {pid:?})");
        let process = Self {
            master: Mutex::new(spawned.master),
            stdin_tx,
            killer: Mutex::new(killer),
            kill_sent: AtomicBool::new(false),
            exited,
            pid,
        };
        Ok((process, PtyStreams { output, exit }))
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Queues bytes for the process's stdin.
    pub fn write(&self, bytes: &[u8]) -> Result<(), PtyError> {
        if bytes.is_empty() {
            return Ok(());
        }
        self.stdin_tx
            .send(bytes.to_vec())
            .map_err(|_| PtyError::Closed)
    }

    pub fn resize(&self, size: TerminalSize) -> Result<(), PtyError> {
        let master = self.master.lock().map_err(|_| PtyError::Poisoned)?;
        master.resize(size.into()).map_err(setup_error)
    }

    /// Geometry as the PTY itself reports it.
    #[cfg(test)]
    pub fn size(&self) -> Result<TerminalSize, PtyError> {
        let master = self.master.lock().map_err(|_| PtyError::Poisoned)?;
        let size = master.get_size().map_err(setup_error)?;
        Ok(TerminalSize {
            cols: size.cols,
            rows: size.rows,
        })
    }

    /// Kills the process immediately with `SIGKILL`, together with its
    /// process group and the terminal's foreground job. Only the first call
    /// sends signals. After a natural exit only leftover group members
    /// (background jobs) are killed.
    pub fn kill(&self) {
        if self.kill_sent.swap(true, Ordering::SeqCst) {
            return;
        }
        #[cfg(unix)]
        if let Some(pid) = self.pid {
            // With job control the foreground job has a group of its own
            if let Some(leader) = self.foreground_group() {
                if leader != pid {
                    if let Err(e) = kill_process_group(leader) {
                        debug!("PTY foreground kill (pgid {leader}): {e}");
                    }
                }
            }
            match kill_process_group(pid) {
                Ok(()) => return,
                Err(e) => debug!("PTY group kill (pid {pid}): {e}"),
            }
        }
        if self.has_exited() {
            return;
        }
        match self.killer.lock() {
            Ok(mut killer) => {
                if let Err(e) = killer.kill() {
                    // Usually a race with a natural exit
                    debug!("PTY kill (pid {:?}): {e}", self.pid);
                }
            }
            Err(_) => warn!("PTY killer lock poisoned (pid {:?})", self.pid),
        }
    }

    pub fn has_exited(&self) -> bool {
        self.exited.load(Ordering::SeqCst)
    }

    #[cfg(unix)]
    fn foreground_group(&self) -> Option<u32> {
        let master = self.master.lock().ok()?;
        master
            .process_group_leader()
            .and_then(|pgid| u32::try_from(pgid).ok())
    }
}

impl Drop for PtyProcess {
    fn drop(&mut self) {
        self.kill();
    }
}

fn open_and_spawn(spec: PtySpawnSpec) -> Result<Spawned, PtyError> {
    let pair = native_pty_system()
        .openpty(spec.size.into())
        .map_err(setup_error)?;

    let mut command = CommandBuilder::new(&spec.program);
    command.args(&spec.args);
    command.cwd(&spec.cwd);
    for (key, value) in &spec.env {
        command.env(key, value);
    }

    let mut child = pair.slave.spawn_command(command).map_err(setup_error)?;
    // Keep no slave handle open here, or the reader never sees EOF
    drop(pair.slave);

    let handles = pair
        .master
        .try_clone_reader()
        .and_then(|reader| Ok((reader, pair.master.take_writer()?)));
    match handles {
        Ok((reader, writer)) => Ok(Spawned {
            master: pair.master,
            reader,
            writer,
            child,
        }),
        Err(e) => {
            let _ = child.kill();
            let _ = child.wait();
            Err(setup_error(e))
        }
    }
}

fn spawn_read_loop(mut reader: Box<dyn Read + Send>, output_tx: mpsc::Sender<Vec<u8>>) {
    std::thread::spawn(move || {
        let mut buf = [0u8; READ_CHUNK_SIZE];
        loop {
            match reader.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => {
                    trace!("PTY read {n} bytes");
                    // Blocks while the channel is full
                    if output_tx.blocking_send(buf[..n].to_vec()).is_err() {
                        break;
                    }
                }
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                // EIO once the child side is gone
                Err(_) => break,
            }
        }
    });
}

fn spawn_write_loop(mut writer: Box<dyn Write + Send>, mut stdin_rx: mpsc::UnboundedReceiver<Vec<u8>>) {
    std::thread::spawn(move || {
        while let Some(input) = stdin_rx.blocking_recv() {
            if writer.write_all(&input).is_err() || writer.flush().is_err() {
                break;
            }
        }
    });
}

fn spawn_wait_loop(
    mut child: Box<dyn Child + Send + Sync>,
    exit_tx: oneshot::Sender<Option<i32>>,
    exited: Arc<AtomicBool>,
) {
    std::thread::spawn(move || {
        let code = match child.wait() {
            Ok(status) if status.signal().is_some() => None,
            Ok(status) => i32::try_from(status.exit_code()).ok(),
            Err(e) => {
                warn!("Waiting on PTY child failed: {e}");
                None
            }
        };
        exited.store(true, Ordering::SeqCst);
        let _ = exit_tx.send(code);
    });
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::time::Duration;

    fn spec(args: &[&str]) -> PtySpawnSpec {
        PtySpawnSpec {
            program: "sh".to_string(),
            args: args.iter().map(|s| s.to_string()).collect(),
            cwd: std::env::temp_dir(),
            env: vec![("TERM".to_string(), "dumb".to_string())],
            size: TerminalSize::new(100, 28).unwrap(),
        }
    }

    #[test]
    fn test_zero_size_rejected() {
        assert!(matches!(TerminalSize::new(0, 10), Err(PtyError::InvalidSize)));
        assert!(matches!(TerminalSize::new(10, 0), Err(PtyError::InvalidSize)));
    }

    #[tokio::test]
    async fn test_output_and_exit_code() {
        let (process, mut streams) = PtyProcess::spawn(spec(&["-c", "echo pty-ok; exit 5"]))
            .await
            .unwrap();

        let code = tokio::time::timeout(Duration::from_secs(10), &mut streams.exit)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(code, Some(5));
        assert!(process.has_exited());

        let mut output = Vec::new();
        while let Ok(Some(chunk)) =
            tokio::time::timeout(Duration::from_secs(2), streams.output.recv()).await
        {
            output.extend(chunk);
        }
        assert!(String::from_utf8_lossy(&output).contains("pty-ok"));
    }

    #[tokio::test]
    async fn test_resize_reports_new_geometry() {
        let (process, _streams) = PtyProcess::spawn(spec(&[])).await.unwrap();
        assert_eq!(process.size().unwrap(), TerminalSize { cols: 100, rows: 28 });

        process.resize(TerminalSize::new(120, 40).unwrap()).unwrap();
        assert_eq!(process.size().unwrap(), TerminalSize { cols: 120, rows: 40 });
        process.kill();
    }

    #[tokio::test]
    async fn test_kill_is_idempotent() {
        let (process, streams) = PtyProcess::spawn(spec(&[])).await.unwrap();
        process.kill();
        process.kill();

        tokio::time::timeout(Duration::from_secs(10), streams.exit)
            .await
            .expect("process should die after kill")
            .unwrap();
        assert!(process.has_exited());
        process.kill();
    }

    #[tokio::test]
    async fn test_kill_reaches_shell_ignoring_hangup() {
        let (process, mut streams) =
            PtyProcess::spawn(spec(&["-c", "trap '' HUP; echo armed; sleep 30"]))
                .await
                .unwrap();
        let armed = tokio::time::timeout(Duration::from_secs(10), async {
            let mut seen = Vec::new();
            while let Some(chunk) = streams.output.recv().await {
                seen.extend(chunk);
                if String::from_utf8_lossy(&seen).contains("armed") {
                    return true;
                }
            }
            false
        })
        .await
        .unwrap();
        assert!(armed);

        process.kill();
        let code = tokio::time::timeout(Duration::from_secs(5), streams.exit)
            .await
            .expect("shell ignoring SIGHUP should still die")
            .unwrap();
        assert_eq!(code, None);
    }

    #[tokio::test]
    async fn test_slow_consumer_loses_no_output() {
        let (_process, mut streams) =
            PtyProcess::spawn(spec(&["-c", "seq 1 20000; echo done"]))
                .await
                .unwrap();
        // Let the reader fill the channel and stall
        tokio::time::sleep(Duration::from_millis(300)).await;

        let mut output = Vec::new();
        while let Ok(Some(chunk)) =
            tokio::time::timeout(Duration::from_secs(5), streams.output.recv()).await
        {
            output.extend(chunk);
            if String::from_utf8_lossy(&output).contains("done") {
                break;
            }
        }
        let text = String::from_utf8_lossy(&output);
        assert!(text.contains("20000"));
        assert!(text.contains("done"));
    }
}
