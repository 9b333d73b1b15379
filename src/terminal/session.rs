//! One interactive shell bound 1:1 to a transport connection.
//!
//! Lifecycle:
//!
//! ```text
//! Init ──run()──▶ Running ──process exits──▶ Exited   (exit sent, transport closed)
//!                    │
//!                    └──transport closes──▶ Closed   (process killed)
//! ```
//!
//! Whichever side dies first drives the other down. Both paths are
//! idempotent: closing twice, or closing after an exit, is a no-op.

use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::protocol::{ClientMessage, ServerMessage};
#[cfg(test)]
use super::pty::PtyError;
use super::pty::{PtyProcess, PtyStreams, TerminalSize};
use crate::sandbox::SandboxedPath;
use crate::security::{self, Verdict};

/// How long output is still forwarded after the process exits, in total.
/// Background jobs may keep the PTY open past the shell's exit.
const EXIT_DRAIN_GRACE: Duration = Duration::from_millis(200);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Init,
    Running,
    Exited(Option<i32>),
    Closed,
}

impl SessionState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, SessionState::Exited(_) | SessionState::Closed)
    }
}

/// What the transport reports to the session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// One text frame from the client.
    Frame(String),
    Closed,
}

pub struct TerminalSession {
    id: String,
    user_id: String,
    cwd: SandboxedPath,
    state: SessionState,
    process: PtyProcess,
    streams: Option<PtyStreams>,
}

impl TerminalSession {
    pub(super) fn new(
        id: String,
        user_id: String,
        cwd: SandboxedPath,
        process: PtyProcess,
        streams: PtyStreams,
    ) -> Self {
        Self {
            id,
            user_id,
            cwd,
            state: SessionState::Init,
            process,
            streams: Some(streams),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    #[cfg(test)]
    pub fn cwd(&self) -> &SandboxedPath {
        &self.cwd
    }

    #[cfg(test)]
    pub fn state(&self) -> SessionState {
        self.state
    }

    #[cfg(test)]
    pub fn size(&self) -> Result<TerminalSize, PtyError> {
        self.process.size()
    }

    #[cfg(test)]
    pub fn process_exited(&self) -> bool {
        self.process.has_exited()
    }

    /// Applies one client frame. Returns the reply to send back, if any.
    ///
    /// Malformed frames are dropped. Only `command` frames are validated;
    /// `input` is raw keystrokes into a shell that already runs confined.
    pub fn handle_frame(&mut self, frame: &str) -> Option<ServerMessage> {
        if self.state.is_terminal() {
            return None;
        }
        match ClientMessage::parse(frame)? {
            ClientMessage::Input { data } => {
                self.write(data.as_bytes());
                None
            }
            ClientMessage::Resize { cols, rows } => {
                match TerminalSize::new(cols, rows).and_then(|size| self.process.resize(size)) {
                    Ok(()) => debug!("Session {} resized to {cols}x{rows}", self.id),
                    Err(e) => debug!("Session {} ignored resize: {e}", self.id),
                }
                None
            }
            ClientMessage::Command { data, plan } => {
                let verdict = security::validate(&data, plan.unwrap_or_default());
                match verdict {
                    Verdict::Allowed => {
                        self.write(format!("{data}\n").as_bytes());
                        None
                    }
                    Verdict::Blocked { reason, suggestion } => Some(ServerMessage::Error {
                        message: reason.to_string(),
                        suggestion: suggestion.map(str::to_string),
                    }),
                }
            }
        }
    }

    fn write(&self, bytes: &[u8]) {
        if let Err(e) = self.process.write(bytes) {
            debug!("Session {} dropped input: {e}", self.id);
        }
    }

    /// Tears the session down after the transport went away: kills the
    /// process at once. Safe to call any number of times.
    pub fn close(&mut self) {
        self.process.kill();
        if !self.state.is_terminal() {
            info!("Session {} closed by transport", self.id);
            self.state = SessionState::Closed;
        }
    }

    /// Drives the session until the process exits or the transport closes.
    ///
    /// `outbound` is dropped on return, which is the signal for the
    /// transport adapter to close the connection.
    pub async fn run(
        &mut self,
        mut inbound: mpsc::Receiver<TransportEvent>,
        outbound: mpsc::Sender<ServerMessage>,
    ) -> SessionState {
        let Some(PtyStreams { mut output, mut exit }) = self.streams.take() else {
            warn!("Session {} was already run", self.id);
            return self.state;
        };

        let hello = ServerMessage::Session {
            session_id: self.id.clone(),
        };
        if outbound.send(hello).await.is_err() {
            self.close();
            return self.state;
        }
        self.state = SessionState::Running;
        info!("Session {} running for {} in {}", self.id, self.user_id, self.cwd);

        let mut decoder = Utf8Decoder::default();
        let mut output_open = true;
        let mut exit_code: Option<Option<i32>> = None;
        // Set when the process exits
        let mut drain_deadline: Option<Instant> = None;

        loop {
            tokio::select! {
                // Transport first: after a close, nothing else is forwarded
                biased;

                event = inbound.recv() => match event {
                    Some(TransportEvent::Frame(frame)) => {
                        if let Some(reply) = self.handle_frame(&frame) {
                            if outbound.send(reply).await.is_err() {
                                self.close();
                                break;
                            }
                        }
                    }
                    Some(TransportEvent::Closed) | None => {
                        self.close();
                        break;
                    }
                },

                chunk = output.recv(), if output_open => match chunk {
                    Some(bytes) => {
                        let data = decoder.decode(&bytes);
                        if !data.is_empty() && outbound.send(ServerMessage::Output { data }).await.is_err() {
                            self.close();
                            break;
                        }
                        if drain_deadline.is_some_and(|deadline| Instant::now() >= deadline) {
                            break;
                        }
                    }
                    None => {
                        output_open = false;
                        if exit_code.is_some() {
                            break;
                        }
                    }
                },

                code = &mut exit, if exit_code.is_none() => {
                    exit_code = Some(code.unwrap_or(None));
                    if !output_open {
                        break;
                    }
                    drain_deadline = Some(Instant::now() + EXIT_DRAIN_GRACE);
                }

                _ = tokio::time::sleep_until(drain_deadline.unwrap_or_else(Instant::now)),
                    if drain_deadline.is_some() => break,
            }
        }

        if let Some(code) = exit_code {
            if !self.state.is_terminal() {
                let tail = decoder.finish();
                if !tail.is_empty() {
                    let _ = outbound.send(ServerMessage::Output { data: tail }).await;
                }
                let _ = outbound.send(ServerMessage::Exit { exit_code: code }).await;
                info!("Session {} shell exited with {code:?}", self.id);
                self.state = SessionState::Exited(code);
            }
        }
        self.state
    }
}

impl Drop for TerminalSession {
    fn drop(&mut self) {
        self.close();
    }
}

/// Turns a byte stream into UTF-8 text without splitting multi-byte
/// characters that straddle two reads.
#[derive(Default)]
struct Utf8Decoder {
    pending: Vec<u8>,
}

impl Utf8Decoder {
    fn decode(&mut self, bytes: &[u8]) -> String {
        self.pending.extend_from_slice(bytes);
        match std::str::from_utf8(&self.pending) {
            Ok(text) => {
                let text = text.to_string();
                self.pending.clear();
                text
            }
            // Incomplete sequence at the end: hold it back for the next read
            Err(e) if e.error_len().is_none() => {
                let valid = e.valid_up_to();
                let text = String::from_utf8_lossy(&self.pending[..valid]).into_owned();
                self.pending.drain(..valid);
                text
            }
            Err(_) => {
                let text = String::from_utf8_lossy(&self.pending).into_owned();
                self.pending.clear();
                text
            }
        }
    }

    fn finish(&mut self) -> String {
        let text = String::from_utf8_lossy(&self.pending).into_owned();
        self.pending.clear();
        text
    }
}
