//! LLM client module
//!
//! Plain completion requests against a configurable provider. The
//! orchestrator only uses completions for reply interpretation, plan
//! drafting and reactivation scoring, so there is no tool or streaming
//! surface here.

mod anthropic;
mod client;
mod error;

pub use anthropic::AnthropicClient;
pub use client::{CompletionRequest, CompletionResponse, LlmClient, LlmMessage};
pub use error::LlmError;

#[cfg(test)]
pub use client::mock::MockLlmClient;

use std::sync::Arc;

use crate::config::LlmConfig;

/// Create an LLM client from configuration
///
/// Returns None when no API key is configured; callers treat the model as
/// an optional refinement and fall back to rule-based behavior.
pub fn create_client(config: &LlmConfig) -> Option<Arc<dyn LlmClient>> {
    match AnthropicClient::from_config(config) {
        Ok(client) => Some(Arc::new(client)),
        Err(e) => {
            tracing::warn!(error = %e, "LLM client unavailable, using rule-based analysis only");
            None
        }
    }
}
