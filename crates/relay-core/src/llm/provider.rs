//! LlmProvider trait definition.
//!
//! The transport abstraction the router calls through. Adapters (Anthropic,
//! OpenAI-compatible) live in relay-infra; tests use in-memory mocks.

use std::time::Duration;

use relay_types::llm::{CompletionRequest, CompletionResponse, LlmError, ProviderCapabilities};

/// Trait for LLM provider backends.
///
/// Uses native async fn in traits (RPITIT, Rust 2024 edition). Wrap an
/// implementation in [`BoxLlmProvider`](super::box_provider::BoxLlmProvider)
/// to register it with the router.
pub trait LlmProvider: Send + Sync {
    /// Provider name as used in candidate lists.
    fn name(&self) -> &str;

    fn capabilities(&self) -> &ProviderCapabilities;

    /// Send a completion request and receive the full response.
    ///
    /// `timeout` is the time the router is willing to wait for this call.
    /// Adapters may pass it to their HTTP client; the router enforces it
    /// regardless.
    fn invoke(
        &self,
        request: &CompletionRequest,
        timeout: Duration,
    ) -> impl std::future::Future<Output = Result<CompletionResponse, LlmError>> + Send;
}
