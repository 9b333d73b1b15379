//! Assistant requests, gated by the daily quota.
//!
//! The quota is consumed before the provider is contacted; an exhausted
//! quota short-circuits and the provider is never called.

use std::sync::Arc;

use thiserror::Error;
use tracing::{info, warn};

use crate::llm::{CompletionRequest, LlmClient};
use crate::plans::PlanTier;
use crate::quota::QuotaTracker;

#[derive(Debug, Error)]
pub enum AssistantError {
    #[error("Daily AI quota exceeded.")]
    QuotaExceeded,
    #[error("{0}")]
    Provider(#[from] anyhow::Error),
}

pub struct Assistant {
    quota: Arc<QuotaTracker>,
    client: Arc<dyn LlmClient>,
}

impl Assistant {
    pub fn new(quota: Arc<QuotaTracker>, client: Arc<dyn LlmClient>) -> Self {
        info!("Assistant provider: {}", client.description());
        Self { quota, client }
    }

    pub async fn ask(
        &self,
        user_id: &str,
        tier: PlanTier,
        request: &CompletionRequest,
    ) -> Result<String, AssistantError> {
        if !self.quota.consume(user_id, tier) {
            return Err(AssistantError::QuotaExceeded);
        }
        self.client.complete(request).await.map_err(|e| {
            warn!("Assistant provider failed for {user_id}: {e}");
            AssistantError::Provider(e)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Provider stub that counts calls.
    #[derive(Default)]
    struct CountingClient {
        calls: AtomicUsize,
        fail: bool,
    }

    #[async_trait]
    impl LlmClient for CountingClient {
        async fn complete(&self, request: &CompletionRequest) -> anyhow::Result<String> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                anyhow::bail!("provider down");
            }
            Ok(format!("echo: {}", request.prompt))
        }

        fn description(&self) -> String {
            "counting".to_string()
        }
    }

    fn request(prompt: &str) -> CompletionRequest {
        CompletionRequest {
            prompt: prompt.to_string(),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_reply_passes_through() {
        let client = Arc::new(CountingClient::default());
        let assistant = Assistant::new(Arc::new(QuotaTracker::new()), client.clone());
        let reply = assistant.ask("u1", PlanTier::Free, &request("hi")).await.unwrap();
        assert_eq!(reply, "echo: hi");
        assert_eq!(client.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_exhausted_quota_never_calls_provider() {
        let client = Arc::new(CountingClient::default());
        let assistant = Assistant::new(Arc::new(QuotaTracker::new()), client.clone());

        for _ in 0..10 {
            assistant.ask("u1", PlanTier::Free, &request("q")).await.unwrap();
        }
        let err = assistant.ask("u1", PlanTier::Free, &request("q")).await.unwrap_err();
        assert!(matches!(err, AssistantError::QuotaExceeded));
        assert_eq!(err.to_string(), "Daily AI quota exceeded.");
        assert_eq!(client.calls.load(Ordering::SeqCst), 10);
    }

    #[tokio::test]
    async fn test_provider_failure_still_counts() {
        let client = Arc::new(CountingClient {
            fail: true,
            ..Default::default()
        });
        let quota = Arc::new(QuotaTracker::new());
        let assistant = Assistant::new(quota.clone(), client);

        let err = assistant.ask("u1", PlanTier::Free, &request("q")).await.unwrap_err();
        assert!(matches!(err, AssistantError::Provider(_)));
        assert_eq!(quota.usage("u1").unwrap().count, 1);
    }
}
