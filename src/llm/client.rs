//! `LlmClient` trait: abstraction over chat-completion backends.
//!
//! The assistant endpoint only needs "prompt in, text out"; providers
//! implement this trait so the quota gate and the HTTP layer stay
//! independent of any particular vendor.

use anyhow::Result;
use async_trait::async_trait;

/// One prompt for the assistant.
#[derive(Debug, Clone, Default)]
pub struct CompletionRequest {
    pub prompt: String,
    /// Provider model id; `None` uses the client's default.
    pub model: Option<String>,
    /// Caller-supplied key overriding the configured one.
    pub api_key: Option<String>,
}

#[async_trait]
pub trait LlmClient: Send + Sync {
    /// Sends the prompt as a single user message and returns the reply text.
    async fn complete(&self, request: &CompletionRequest) -> Result<String>;

    /// Human-readable description of the provider and default model.
    fn description(&self) -> String;
}
