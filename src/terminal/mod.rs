//! Interactive terminal sessions over WebSocket.
//!
//! The [`SessionManager`] mints a session per connection: it ensures the
//! user's confinement root, starts a login shell on a PTY inside it, and
//! bridges the socket to the session through two channels so the session
//! logic never sees the transport type.

pub mod protocol;
pub mod pty;
pub mod session;

use std::collections::HashMap;
use std::sync::Mutex;

use anyhow::Result;
use axum::extract::ws::{Message, WebSocket};
use chrono::{DateTime, Utc};
use futures::{SinkExt, StreamExt};
use serde::Serialize;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::config::TerminalConfig;
use crate::sandbox::Sandbox;
use crate::shell::ShellSpec;
use protocol::ServerMessage;
use pty::{PtyProcess, PtySpawnSpec, TerminalSize};
use session::{TerminalSession, TransportEvent};

const INBOUND_BUFFER: usize = 64;
const OUTBOUND_BUFFER: usize = 256;

/// Registry entry for a live session.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionInfo {
    pub id: String,
    pub user_id: String,
    pub started_at: DateTime<Utc>,
}

pub struct SessionManager {
    sandbox: Sandbox,
    shell: ShellSpec,
    config: TerminalConfig,
    live: Mutex<HashMap<String, SessionInfo>>,
}

impl SessionManager {
    pub fn new(sandbox: Sandbox, shell: ShellSpec, config: TerminalConfig) -> Self {
        Self {
            sandbox,
            shell,
            config,
            live: Mutex::new(HashMap::new()),
        }
    }

    /// Creates a session in the `Init` state: new id, confinement root
    /// ensured, shell spawned at the default geometry.
    pub async fn open(&self, user_id: &str) -> Result<TerminalSession> {
        let id = uuid::Uuid::new_v4().to_string();
        let root = self.sandbox.ensure_root(user_id).await?;

        let spec = PtySpawnSpec {
            program: self.shell.program.clone(),
            args: self.shell.interactive_args(),
            cwd: root.as_path().to_path_buf(),
            env: vec![("TERM".to_string(), self.config.term.clone())],
            size: TerminalSize::new(self.config.cols, self.config.rows)?,
        };
        let (process, streams) = PtyProcess::spawn(spec).await?;
        info!(
            "Session {id} opened for {user_id} ({}, pid {:?})",
            self.shell.program,
            process.pid()
        );
        Ok(TerminalSession::new(
            id,
            user_id.to_string(),
            root,
            process,
            streams,
        ))
    }

    pub fn live_sessions(&self) -> Vec<SessionInfo> {
        let live = self.live.lock().unwrap_or_else(|e| e.into_inner());
        live.values().cloned().collect()
    }

    fn register(&self, session: &TerminalSession) {
        let info = SessionInfo {
            id: session.id().to_string(),
            user_id: session.user_id().to_string(),
            started_at: Utc::now(),
        };
        let mut live = self.live.lock().unwrap_or_else(|e| e.into_inner());
        live.insert(info.id.clone(), info);
    }

    fn unregister(&self, id: &str) {
        let mut live = self.live.lock().unwrap_or_else(|e| e.into_inner());
        live.remove(id);
    }

    /// Runs a full session over an upgraded WebSocket.
    pub async fn serve(&self, mut socket: WebSocket, user_id: String) {
        let mut session = match self.open(&user_id).await {
            Ok(session) => session,
            Err(e) => {
                warn!("Could not start terminal for {user_id}: {e:#}");
                let error = ServerMessage::Error {
                    message: "Failed to start terminal session.".to_string(),
                    suggestion: None,
                };
                let _ = socket.send(Message::Text(error.to_json().into())).await;
                let _ = socket.send(Message::Close(None)).await;
                return;
            }
        };

        let (mut ws_tx, mut ws_rx) = socket.split();
        let (inbound_tx, inbound_rx) = mpsc::channel(INBOUND_BUFFER);
        let (outbound_tx, mut outbound_rx) = mpsc::channel::<ServerMessage>(OUTBOUND_BUFFER);

        let session_id = session.id().to_string();
        let reader = tokio::spawn(async move {
            while let Some(message) = ws_rx.next().await {
                let frame = match message {
                    Ok(Message::Text(text)) => text.as_str().to_string(),
                    Ok(Message::Binary(bytes)) => match String::from_utf8(bytes.to_vec()) {
                        Ok(text) => text,
                        Err(_) => continue,
                    },
                    Ok(Message::Close(_)) => break,
                    Ok(_) => continue,
                    Err(e) => {
                        debug!("Session {session_id} socket error: {e}");
                        break;
                    }
                };
                if inbound_tx.send(TransportEvent::Frame(frame)).await.is_err() {
                    return;
                }
            }
            let _ = inbound_tx.send(TransportEvent::Closed).await;
        });

        let writer = tokio::spawn(async move {
            while let Some(message) = outbound_rx.recv().await {
                if ws_tx.send(Message::Text(message.to_json().into())).await.is_err() {
                    return;
                }
            }
            let _ = ws_tx.send(Message::Close(None)).await;
            let _ = ws_tx.close().await;
        });

        self.register(&session);
        let state = session.run(inbound_rx, outbound_tx).await;
        self.unregister(session.id());
        drop(session);

        let _ = writer.await;
        reader.abort();
        debug!("Terminal connection finished in state {state:?}");
    }
}
