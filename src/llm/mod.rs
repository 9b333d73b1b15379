pub mod client;
pub mod openrouter;

pub use client::{CompletionRequest, LlmClient};
pub use openrouter::OpenRouterClient;
