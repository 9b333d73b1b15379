use serde::Deserialize;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub workspace: WorkspaceConfig,
    #[serde(default)]
    pub shell: ShellConfig,
    #[serde(default)]
    pub executor: ExecutorConfig,
    #[serde(default)]
    pub terminal: TerminalConfig,
    #[serde(default)]
    pub quota: QuotaConfig,
    /// Absent section disables the assistant endpoint's default provider
    /// (requests can still bring their own key).
    #[serde(default)]
    pub assistant: Option<AssistantConfig>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

#[derive(Debug, Deserialize, Clone)]
pub struct WorkspaceConfig {
    /// Parent directory of every per-user confinement root.
    #[serde(default = "default_workspace_root")]
    pub root: PathBuf,
    /// User id assumed when a request carries no `x-workspace-user` header.
    #[serde(default = "default_user")]
    pub default_user: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ShellConfig {
    /// Shell binary. Falls back to `$SHELL`, then `bash`.
    #[serde(default)]
    pub program: Option<String>,
    /// Start shells as login shells (`-l`).
    #[serde(default = "default_true")]
    pub login: bool,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ExecutorConfig {
    /// Wall-clock limit for one-shot commands. 0 disables the limit.
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

#[derive(Debug, Deserialize, Clone)]
pub struct TerminalConfig {
    #[serde(default = "default_cols")]
    pub cols: u16,
    #[serde(default = "default_rows")]
    pub rows: u16,
    /// Value of `TERM` inside interactive sessions.
    #[serde(default = "default_term")]
    pub term: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct QuotaConfig {
    /// How often stale usage records are pruned. 0 disables pruning.
    #[serde(default = "default_prune_interval")]
    pub prune_interval_secs: u64,
}

#[derive(Debug, Deserialize, Clone)]
pub struct AssistantConfig {
    /// Supports ${ENV_VAR} substitution
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default = "default_assistant_base_url")]
    pub base_url: String,
    #[serde(default = "default_assistant_model")]
    pub default_model: String,
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    3000
}

fn default_workspace_root() -> PathBuf {
    PathBuf::from("/workspace")
}

fn default_user() -> String {
    "demo-user".to_string()
}

fn default_true() -> bool {
    true
}

fn default_timeout_secs() -> u64 {
    300
}

fn default_cols() -> u16 {
    100
}

fn default_rows() -> u16 {
    28
}

fn default_term() -> String {
    "xterm-256color".to_string()
}

fn default_prune_interval() -> u64 {
    3600
}

fn default_assistant_base_url() -> String {
    "https://openrouter.ai/api/v1".to_string()
}

fn default_assistant_model() -> String {
    "openai/gpt-4o-mini".to_string()
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

impl Default for WorkspaceConfig {
    fn default() -> Self {
        Self {
            root: default_workspace_root(),
            default_user: default_user(),
        }
    }
}

impl Default for ShellConfig {
    fn default() -> Self {
        Self {
            program: None,
            login: true,
        }
    }
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            timeout_secs: default_timeout_secs(),
        }
    }
}

impl Default for TerminalConfig {
    fn default() -> Self {
        Self {
            cols: default_cols(),
            rows: default_rows(),
            term: default_term(),
        }
    }
}

impl Default for QuotaConfig {
    fn default() -> Self {
        Self {
            prune_interval_secs: default_prune_interval(),
        }
    }
}

impl Default for AssistantConfig {
    fn default() -> Self {
        Self {
            api_key: None,
            base_url: default_assistant_base_url(),
            default_model: default_assistant_model(),
        }
    }
}

impl ServerConfig {
    pub fn listen_addr(&self) -> anyhow::Result<SocketAddr> {
        let addr = format!("{}:{}", self.host, self.port);
        addr.parse()
            .map_err(|e| anyhow::anyhow!("Invalid listen address {addr}: {e}"))
    }
}

impl ExecutorConfig {
    pub fn timeout(&self) -> Option<Duration> {
        (self.timeout_secs > 0).then(|| Duration::from_secs(self.timeout_secs))
    }
}

impl QuotaConfig {
    pub fn prune_interval(&self) -> Option<Duration> {
        (self.prune_interval_secs > 0).then(|| Duration::from_secs(self.prune_interval_secs))
    }
}

impl Config {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> anyhow::Result<Self> {
        // Expand environment variables like ${OPENROUTER_API_KEY}
        let expanded = shellexpand::env(content)?;
        let config: Config = toml::from_str(&expanded)?;
        if config.terminal.cols == 0 || config.terminal.rows == 0 {
            anyhow::bail!("terminal.cols and terminal.rows must be non-zero");
        }
        Ok(config)
    }
}
