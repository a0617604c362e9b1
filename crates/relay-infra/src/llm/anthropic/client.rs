//! AnthropicProvider -- concrete [`LlmProvider`] implementation for Anthropic Claude.
//!
//! Sends requests to the Anthropic Messages API (`/v1/messages`) with
//! proper authentication headers.
//!
//! The API key is wrapped in [`secrecy::SecretString`] and is never logged
//! or included in `Debug` output.

use std::str::FromStr;
use std::time::Duration;

use secrecy::{ExposeSecret, SecretString};

use relay_core::llm::provider::LlmProvider;
use relay_types::llm::{
    CompletionRequest, CompletionResponse, LlmError, ProviderCapabilities, StopReason, Usage,
};

use super::types::{AnthropicContentBlock, AnthropicMessage, AnthropicRequest, AnthropicResponse};
use crate::llm::http;

/// Anthropic Claude LLM provider.
///
/// The API key is only exposed when constructing HTTP request headers.
pub struct AnthropicProvider {
    client: reqwest::Client,
    api_key: SecretString,
    name: String,
    base_url: String,
    model: String,
    capabilities: ProviderCapabilities,
}

impl AnthropicProvider {
    /// The Anthropic API version header value.
    const API_VERSION: &'static str = "2023-06-01";

    pub const DEFAULT_BASE_URL: &'static str = "https://api.anthropic.com";

    /// Create a new Anthropic provider.
    ///
    /// `name` is the router-facing provider name; `model` is used whenever
    /// a request leaves its model empty.
    pub fn new(
        name: impl Into<String>,
        api_key: SecretString,
        model: impl Into<String>,
    ) -> Result<Self, LlmError> {
        let model = model.into();
        Ok(Self {
            client: http::build_client()?,
            api_key,
            name: name.into(),
            base_url: Self::DEFAULT_BASE_URL.to_string(),
            capabilities: Self::capabilities_for_model(&model),
            model,
        })
    }

    /// The default model for this provider.
    pub fn model(&self) -> &str {
        &self.model
    }

    /// Override the base URL (useful for testing or proxies).
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into().trim_end_matches('/').to_string();
        self
    }

    /// Override the model-derived capabilities.
    pub fn with_capabilities(mut self, capabilities: ProviderCapabilities) -> Self {
        self.capabilities = capabilities;
        self
    }

    /// Determine capabilities based on model name.
    fn capabilities_for_model(model: &str) -> ProviderCapabilities {
        if model.contains("opus") {
            ProviderCapabilities {
                tool_calling: true,
                vision: true,
                max_context_tokens: 200_000,
                max_output_tokens: 32_000,
            }
        } else if model.contains("sonnet") || model.contains("haiku") {
            ProviderCapabilities {
                tool_calling: true,
                vision: true,
                max_context_tokens: 200_000,
                max_output_tokens: 8_192,
            }
        } else {
            // Conservative defaults for unknown models
            ProviderCapabilities {
                tool_calling: true,
                vision: false,
                max_context_tokens: 200_000,
                max_output_tokens: 4_096,
            }
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    /// Convert a generic [`CompletionRequest`] into an [`AnthropicRequest`].
    fn to_anthropic_request(&self, request: &CompletionRequest) -> AnthropicRequest {
        let messages = request
            .messages
            .iter()
            .map(|m| AnthropicMessage {
                role: m.role.to_string(),
                content: m.content.clone(),
            })
            .collect();

        let model = if request.model.is_empty() {
            self.model.clone()
        } else {
            request.model.clone()
        };

        AnthropicRequest {
            model,
            max_tokens: request.max_tokens,
            messages,
            system: request.system.clone(),
            temperature: request.temperature,
            stop_sequences: request.stop_sequences.clone(),
        }
    }

    fn from_anthropic_response(resp: AnthropicResponse) -> CompletionResponse {
        let content = resp
            .content
            .iter()
            .filter_map(|block| match block {
                AnthropicContentBlock::Text { text } => Some(text.as_str()),
                _ => None,
            })
            .collect::<Vec<_>>()
            .join("");

        let stop_reason = resp
            .stop_reason
            .as_deref()
            .and_then(|s| StopReason::from_str(s).ok())
            .unwrap_or(StopReason::EndTurn);

        CompletionResponse {
            id: resp.id,
            content,
            model: resp.model,
            stop_reason,
            usage: Usage {
                input_tokens: resp.usage.input_tokens,
                output_tokens: resp.usage.output_tokens,
            },
        }
    }
}

impl LlmProvider for AnthropicProvider {
    fn name(&self) -> &str {
        &self.name
    }

    fn capabilities(&self) -> &ProviderCapabilities {
        &self.capabilities
    }

    async fn invoke(
        &self,
        request: &CompletionRequest,
        timeout: Duration,
    ) -> Result<CompletionResponse, LlmError> {
        let body = self.to_anthropic_request(request);
        let url = self.url("/v1/messages");

        let response = self
            .client
            .post(&url)
            .timeout(timeout)
            .header("x-api-key", self.api_key.expose_secret())
            .header("anthropic-version", Self::API_VERSION)
            .header("content-type", "application/json")
            .json(&body)
            .send()
            .await
            .map_err(|e| http::map_send_error(e, timeout))?;

        if !response.status().is_success() {
            return Err(http::error_from_response(response).await);
        }

        let resp: AnthropicResponse = response
            .json()
            .await
            .map_err(|e| LlmError::Deserialization(format!("failed to parse response: {e}")))?;

        Ok(Self::from_anthropic_response(resp))
    }
}
