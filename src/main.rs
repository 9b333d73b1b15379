mod assistant;
mod config;
mod executor;
mod llm;
mod plans;
mod process_group;
mod quota;
mod sandbox;
mod security;
mod server;
mod shell;
mod terminal;

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

use crate::config::Config;
use crate::quota::QuotaTracker;
use crate::server::AppState;

const DEFAULT_CONFIG_PATH: &str = "config/tiershell.toml";

fn print_help() {
    println!(
        "\
tiershell v{}

Plan-tiered workspace shell service: sandboxed files, one-shot commands,
interactive terminals over WebSocket and a quota-gated assistant.

USAGE:
    tiershell [OPTIONS] [CONFIG_PATH]

ARGUMENTS:
    CONFIG_PATH    Path to TOML configuration file [default: config/tiershell.toml]

OPTIONS:
    -h, --help       Print this help message and exit
    -V, --version    Print version and exit

ENVIRONMENT VARIABLES:
    Variables are referenced in the config file via ${{VAR_NAME}} syntax.

    RUST_LOG              Log level filter for tracing
                          (e.g. debug, tiershell=debug,axum=warn)
    OPENROUTER_API_KEY    Default key for the assistant endpoint
                          (from https://openrouter.ai/keys)

EXAMPLES:
    tiershell                              # uses config/tiershell.toml
    tiershell /etc/tiershell/config.toml   # custom config path
    RUST_LOG=debug tiershell               # with debug logging",
        env!("CARGO_PKG_VERSION"),
    );
}

/// Loads the config file. Only the default path may be missing, in which
/// case built-in defaults apply.
fn load_config(path: Option<String>) -> Result<Config> {
    match path {
        Some(path) => {
            info!("Loading configuration from {path}");
            Config::load(Path::new(&path)).with_context(|| format!("Cannot load {path}"))
        }
        None if Path::new(DEFAULT_CONFIG_PATH).exists() => {
            info!("Loading configuration from {DEFAULT_CONFIG_PATH}");
            Config::load(Path::new(DEFAULT_CONFIG_PATH))
                .with_context(|| format!("Cannot load {DEFAULT_CONFIG_PATH}"))
        }
        None => {
            warn!("No {DEFAULT_CONFIG_PATH} found, using built-in defaults");
            Ok(Config::default())
        }
    }
}

/// Drops usage records from past days so the map stays bounded by the
/// number of users active today.
fn spawn_quota_pruning(quota: Arc<QuotaTracker>, every: Duration) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(every);
        // First tick fires immediately; nothing to prune yet
        ticker.tick().await;
        loop {
            ticker.tick().await;
            let pruned = quota.prune_stale();
            if pruned > 0 {
                debug!(
                    "Pruned {pruned} stale quota records ({} users tracked today)",
                    quota.tracked_users()
                );
            }
        }
    });
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!("Cannot listen for ctrl-c: {e}");
        std::future::pending::<()>().await;
    }
    info!("Shutdown signal received, exiting");
}

#[tokio::main]
async fn main() -> Result<()> {
    // Handle --help / --version before anything else
    for arg in std::env::args().skip(1) {
        match arg.as_str() {
            "--version" | "-V" => {
                println!("tiershell v{}", env!("CARGO_PKG_VERSION"));
                std::process::exit(0);
            }
            "--help" | "-h" => {
                print_help();
                std::process::exit(0);
            }
            _ => {}
        }
    }

    // Initialize logging (RUST_LOG=debug for debug mode)
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("tiershell=info")),
        )
        .init();

    let config = load_config(std::env::args().nth(1))?;
    let addr = config.server.listen_addr()?;

    info!("Workspace root: {}", config.workspace.root.display());
    info!("Default user: {}", config.workspace.default_user);
    match config.executor.timeout() {
        Some(timeout) => info!("One-shot timeout: {}s", timeout.as_secs()),
        None => info!("One-shot timeout: disabled"),
    }
    if config.assistant.as_ref().and_then(|a| a.api_key.as_ref()).is_none() {
        info!("Assistant: no default API key, requests must bring their own");
    }

    tokio::fs::create_dir_all(&config.workspace.root)
        .await
        .with_context(|| format!("Cannot create {}", config.workspace.root.display()))?;

    let state = AppState::from_config(&config);
    if let Some(every) = config.quota.prune_interval() {
        spawn_quota_pruning(Arc::clone(&state.quota), every);
    }

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("Cannot bind {addr}"))?;
    info!("Listening on http://{addr}");

    axum::serve(listener, server::router(state))
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    Ok(())
}
