//! Type erasure for [`LlmProvider`], so the registry can hold adapters of
//! different concrete types side by side.
//!
//! `LlmProvider::invoke` returns `impl Future`, which is not object safe.
//! [`LlmProviderDyn`] boxes that future and is implemented for every
//! provider; [`BoxLlmProvider`] owns one behind a `Box<dyn _>`.

use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use relay_types::llm::{CompletionRequest, CompletionResponse, LlmError, ProviderCapabilities};

use super::provider::LlmProvider;

/// Object-safe version of [`LlmProvider`] with boxed futures.
pub trait LlmProviderDyn: Send + Sync {
    fn name(&self) -> &str;

    fn capabilities(&self) -> &ProviderCapabilities;

    fn invoke_boxed<'a>(
        &'a self,
        request: &'a CompletionRequest,
        timeout: Duration,
    ) -> Pin<Box<dyn Future<Output = Result<CompletionResponse, LlmError>> + Send + 'a>>;
}

impl<T: LlmProvider> LlmProviderDyn for T {
    fn name(&self) -> &str {
        LlmProvider::name(self)
    }

    fn capabilities(&self) -> &ProviderCapabilities {
        LlmProvider::capabilities(self)
    }

    fn invoke_boxed<'a>(
        &'a self,
        request: &'a CompletionRequest,
        timeout: Duration,
    ) -> Pin<Box<dyn Future<Output = Result<CompletionResponse, LlmError>> + Send + 'a>> {
        Box::pin(self.invoke(request, timeout))
    }
}

/// Type-erased LLM provider for runtime provider selection.
///
/// `LlmProvider` uses RPITIT and cannot be a trait object directly, so the
/// registry stores providers as `BoxLlmProvider`.
pub struct BoxLlmProvider {
    inner: Box<dyn LlmProviderDyn + Send + Sync>,
}

impl BoxLlmProvider {
    /// Wrap a concrete `LlmProvider` in a type-erased box.
    pub fn new<T: LlmProvider + 'static>(provider: T) -> Self {
        Self {
            inner: Box::new(provider),
        }
    }

    pub fn name(&self) -> &str {
        self.inner.name()
    }

    pub fn capabilities(&self) -> &ProviderCapabilities {
        self.inner.capabilities()
    }

    /// Send a completion request and receive the full response.
    pub async fn invoke(
        &self,
        request: &CompletionRequest,
        timeout: Duration,
    ) -> Result<CompletionResponse, LlmError> {
        self.inner.invoke_boxed(request, timeout).await
    }
}

impl std::fmt::Debug for BoxLlmProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BoxLlmProvider")
            .field("name", &self.name())
            .finish()
    }
}
