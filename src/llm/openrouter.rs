use anyhow::{anyhow, Result};
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use super::client::{CompletionRequest, LlmClient};
use crate::config::AssistantConfig;

/// Request timeout for a single completion.
const REQUEST_TIMEOUT_SECS: u64 = 60;

/// Fallback text when the provider answers without any content.
const EMPTY_REPLY: &str = "No response.";

/// Client for OpenRouter's OpenAI-compatible chat completions API.
pub struct OpenRouterClient {
    client: Client,
    config: AssistantConfig,
}

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
}

#[derive(Debug, Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    #[serde(default)]
    choices: Vec<Choice>,
    usage: Option<Usage>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: Option<ChoiceMessage>,
}

#[derive(Debug, Deserialize)]
struct ChoiceMessage {
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Usage {
    prompt_tokens: u32,
    completion_tokens: u32,
}

impl OpenRouterClient {
    pub fn new(config: AssistantConfig) -> Self {
        let client = Client::builder()
            .timeout(std::time::Duration::from_secs(REQUEST_TIMEOUT_SECS))
            .build()
            .unwrap_or_else(|_| Client::new());
        Self { client, config }
    }

    fn endpoint(&self) -> String {
        format!("{}/chat/completions", self.config.base_url.trim_end_matches('/'))
    }
}

/// First non-empty message content of the response.
fn reply_text(response: ChatResponse) -> String {
    response
        .choices
        .into_iter()
        .filter_map(|choice| choice.message.and_then(|m| m.content))
        .find(|text| !text.is_empty())
        .unwrap_or_else(|| EMPTY_REPLY.to_string())
}

#[async_trait]
impl LlmClient for OpenRouterClient {
    async fn complete(&self, request: &CompletionRequest) -> Result<String> {
        let api_key = request
            .api_key
            .as_deref()
            .or(self.config.api_key.as_deref())
            .filter(|key| !key.is_empty())
            .ok_or_else(|| anyhow!("OpenRouter API key is missing."))?;
        let model = request
            .model
            .as_deref()
            .unwrap_or(&self.config.default_model);

        let body = ChatRequest {
            model,
            messages: vec![ChatMessage {
                role: "user",
                content: &request.prompt,
            }],
        };

        debug!("Calling OpenRouter ({model}) with a {}-char prompt", request.prompt.len());

        let response = self
            .client
            .post(self.endpoint())
            .bearer_auth(api_key)
            .json(&body)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await?;
            anyhow::bail!("OpenRouter API error ({status}): {body}");
        }

        let resp: ChatResponse = response.json().await?;
        if let Some(usage) = &resp.usage {
            info!(
                "Assistant response: {} in / {} out tokens",
                usage.prompt_tokens, usage.completion_tokens
            );
        }
        Ok(reply_text(resp))
    }

    fn description(&self) -> String {
        format!("openrouter ({})", self.config.default_model)
    }
}
