//! HTTP and WebSocket surface.
//!
//! Routes:
//!
//! | Method | Path                    | Purpose                                  |
//! |--------|-------------------------|------------------------------------------|
//! | GET    | `/api/terminal/ws`      | upgrade into an interactive session      |
//! | POST   | `/api/terminal/execute` | one-shot command                         |
//! | GET    | `/api/files`            | list a directory or read a file          |
//! | POST   | `/api/files`            | save, rename or delete                   |
//! | GET    | `/api/plans`            | plan catalog                             |
//! | POST   | `/api/ai`               | quota-gated assistant request            |
//! | GET    | `/health`               | liveness and live session count          |
//!
//! The caller is identified by the `x-workspace-user` header, falling back
//! to the configured default user.

use std::io::ErrorKind;
use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::{Query, State, WebSocketUpgrade};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{debug, warn};

use crate::assistant::{Assistant, AssistantError};
use crate::config::Config;
use crate::executor::{CommandExecutor, ExecuteResponse, ExecutionResult};
use crate::llm::{CompletionRequest, OpenRouterClient};
use crate::plans::{PlanPolicy, PlanTier};
use crate::quota::QuotaTracker;
use crate::sandbox::{Sandbox, SandboxError};
use crate::shell::ShellSpec;
use crate::terminal::SessionManager;

pub const USER_HEADER: &str = "x-workspace-user";

#[derive(Clone)]
pub struct AppState {
    pub sandbox: Arc<Sandbox>,
    pub executor: Arc<CommandExecutor>,
    pub sessions: Arc<SessionManager>,
    pub quota: Arc<QuotaTracker>,
    pub assistant: Arc<Assistant>,
    pub default_user: Arc<str>,
}

impl AppState {
    pub fn from_config(config: &Config) -> Self {
        let sandbox = Sandbox::new(config.workspace.root.clone());
        let shell = ShellSpec::resolve(&config.shell);
        let quota = Arc::new(QuotaTracker::new());
        let provider = OpenRouterClient::new(config.assistant.clone().unwrap_or_default());

        Self {
            executor: Arc::new(CommandExecutor::new(shell.clone(), config.executor.timeout())),
            sessions: Arc::new(SessionManager::new(
                sandbox.clone(),
                shell,
                config.terminal.clone(),
            )),
            assistant: Arc::new(Assistant::new(Arc::clone(&quota), Arc::new(provider))),
            sandbox: Arc::new(sandbox),
            quota,
            default_user: Arc::from(config.workspace.default_user.as_str()),
        }
    }

    fn user_id(&self, headers: &HeaderMap) -> String {
        headers
            .get(USER_HEADER)
            .and_then(|value| value.to_str().ok())
            .map(str::trim)
            .filter(|user| !user.is_empty())
            .unwrap_or(&*self.default_user)
            .to_string()
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/terminal/ws", get(terminal_ws))
        .route("/api/terminal/execute", post(execute))
        .route("/api/files", get(read_files).post(modify_files))
        .route("/api/plans", get(plans))
        .route("/api/ai", post(ask_assistant))
        .route("/health", get(health))
        .with_state(state)
}

/// Error rendered as `{"error": message}`.
#[derive(Debug)]
struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }
}

impl From<SandboxError> for ApiError {
    fn from(err: SandboxError) -> Self {
        let status = match &err {
            SandboxError::PathTraversal | SandboxError::InvalidUser => StatusCode::BAD_REQUEST,
            SandboxError::Io(e) if e.kind() == ErrorKind::NotFound => StatusCode::NOT_FOUND,
            SandboxError::Io(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        Self::new(status, err.to_string())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(json!({ "error": self.message }))).into_response()
    }
}

async fn terminal_ws(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    headers: HeaderMap,
) -> impl IntoResponse {
    let user_id = state.user_id(&headers);
    ws.on_upgrade(move |socket| async move {
        state.sessions.serve(socket, user_id).await;
    })
}

#[derive(Debug, Deserialize)]
struct ExecuteRequest {
    #[serde(default)]
    command: String,
    #[serde(default)]
    plan: Option<PlanTier>,
}

/// The body is parsed by hand: a malformed payload still gets the usual
/// `{stdout, stderr, code}` shape rather than an extractor rejection.
async fn execute(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<ExecuteResponse>, ApiError> {
    let request: ExecuteRequest = match serde_json::from_slice(&body) {
        Ok(request) => request,
        Err(e) => {
            debug!("Rejected execute payload: {e}");
            return Ok(Json(ExecutionResult::invalid_payload().into()));
        }
    };
    let user_id = state.user_id(&headers);
    let root = state.sandbox.ensure_root(&user_id).await?;
    let result = state
        .executor
        .execute(&request.command, request.plan.unwrap_or_default(), &root)
        .await;
    Ok(Json(result.into()))
}

#[derive(Debug, Deserialize)]
struct FilesQuery {
    #[serde(default)]
    path: String,
    #[serde(default, rename = "type")]
    kind: Option<String>,
}

async fn read_files(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<FilesQuery>,
) -> Result<Json<Value>, ApiError> {
    let user_id = state.user_id(&headers);
    if query.kind.as_deref() == Some("file") {
        let content = state.sandbox.read_file(&user_id, &query.path).await?;
        return Ok(Json(json!({ "path": query.path, "content": content })));
    }
    let entries = state.sandbox.list_dir(&user_id, &query.path).await?;
    Ok(Json(json!({ "path": query.path, "entries": entries })))
}

#[derive(Debug, Deserialize)]
#[serde(tag = "action", rename_all = "lowercase")]
enum FileAction {
    Save {
        path: String,
        #[serde(default)]
        content: String,
    },
    Rename {
        #[serde(rename = "fromPath")]
        from_path: String,
        #[serde(rename = "toPath")]
        to_path: String,
    },
    Delete {
        path: String,
    },
}

async fn modify_files(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(action): Json<FileAction>,
) -> Result<Json<Value>, ApiError> {
    let user_id = state.user_id(&headers);
    match action {
        FileAction::Save { path, content } => {
            state.sandbox.write_file(&user_id, &path, &content).await?
        }
        FileAction::Rename { from_path, to_path } => {
            state.sandbox.rename(&user_id, &from_path, &to_path).await?
        }
        FileAction::Delete { path } => state.sandbox.remove(&user_id, &path).await?,
    }
    Ok(Json(json!({ "success": true })))
}

async fn plans() -> Json<Vec<&'static PlanPolicy>> {
    Json(PlanPolicy::catalog())
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AiRequest {
    #[serde(default)]
    prompt: String,
    #[serde(default)]
    plan: Option<PlanTier>,
    #[serde(default)]
    model: Option<String>,
    #[serde(default)]
    api_key: Option<String>,
}

async fn ask_assistant(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(request): Json<AiRequest>,
) -> Result<Json<Value>, ApiError> {
    let user_id = state.user_id(&headers);
    let completion = CompletionRequest {
        prompt: request.prompt,
        model: request.model,
        api_key: request.api_key,
    };
    match state
        .assistant
        .ask(&user_id, request.plan.unwrap_or_default(), &completion)
        .await
    {
        Ok(reply) => Ok(Json(json!({ "reply": reply }))),
        Err(err @ AssistantError::QuotaExceeded) => {
            Err(ApiError::new(StatusCode::TOO_MANY_REQUESTS, err.to_string()))
        }
        Err(AssistantError::Provider(e)) => {
            warn!("Assistant request for {user_id} failed: {e:#}");
            Err(ApiError::new(StatusCode::BAD_GATEWAY, e.to_string()))
        }
    }
}

async fn health(State(state): State<AppState>) -> Json<Value> {
    Json(json!({
        "status": "ok",
        "sessions": state.sessions.live_sessions().len(),
    }))
}
