//! OpenAI-compatible LLM provider implementation.
//!
//! A single [`OpenAiCompatibleProvider`] serves OpenAI, Google Gemini,
//! Mistral, and any self-hosted server exposing `/chat/completions`, via
//! configurable base URLs and factory functions.
//!
//! Uses [`async_openai`] for the wire types and transport. The client's own
//! retries on 429 and 5xx responses run inside the router's per-call
//! timeout, so a call never outlives its budget.

pub mod config;

use std::time::Duration;

use async_openai::Client;
use async_openai::config::OpenAIConfig;
use async_openai::error::{ApiError, OpenAIError};
use async_openai::types::chat::{
    ChatCompletionRequestAssistantMessage, ChatCompletionRequestAssistantMessageContent,
    ChatCompletionRequestMessage, ChatCompletionRequestSystemMessage,
    ChatCompletionRequestSystemMessageContent, ChatCompletionRequestUserMessage,
    ChatCompletionRequestUserMessageContent, CreateChatCompletionRequest,
    CreateChatCompletionResponse, FinishReason, StopConfiguration,
};
use secrecy::ExposeSecret;

use relay_core::llm::provider::LlmProvider;
use relay_types::llm::{
    CompletionRequest, CompletionResponse, LlmError, MessageRole, ProviderCapabilities,
    StopReason, Usage,
};

use self::config::OpenAiCompatConfig;
use crate::llm::http;

/// Unified provider for any OpenAI-compatible API.
///
/// Does NOT derive Debug, so the API key held by the `async_openai`
/// client can never end up in logs.
pub struct OpenAiCompatibleProvider {
    client: Client<OpenAIConfig>,
    provider_name: String,
    base_url: String,
    model: String,
    capabilities: ProviderCapabilities,
}

impl OpenAiCompatibleProvider {
    /// Create a new OpenAI-compatible provider from a configuration.
    ///
    /// Keyless configurations (local servers) send an empty bearer token.
    pub fn new(config: OpenAiCompatConfig) -> Result<Self, LlmError> {
        let base_url = config.base_url.trim_end_matches('/').to_string();
        let api_key = config
            .api_key
            .as_ref()
            .map(|key| key.expose_secret().to_string())
            .unwrap_or_default();
        let openai_config = OpenAIConfig::new()
            .with_api_key(api_key)
            .with_api_base(&base_url);

        Ok(Self {
            client: Client::with_config(openai_config),
            provider_name: config.provider_name,
            base_url,
            model: config.model,
            capabilities: config.capabilities,
        })
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Build a [`CreateChatCompletionRequest`] from a generic [`CompletionRequest`].
    fn build_request(&self, request: &CompletionRequest) -> CreateChatCompletionRequest {
        let mut messages = Vec::with_capacity(request.messages.len() + 1);
        if let Some(ref system) = request.system {
            messages.push(system_message(system));
        }
        for msg in &request.messages {
            let oai_msg = match msg.role {
                MessageRole::System => system_message(&msg.content),
                MessageRole::User => {
                    ChatCompletionRequestMessage::User(ChatCompletionRequestUserMessage {
                        content: ChatCompletionRequestUserMessageContent::Text(msg.content.clone()),
                        name: None,
                    })
                }
                MessageRole::Assistant => {
                    #[allow(deprecated)]
                    ChatCompletionRequestMessage::Assistant(ChatCompletionRequestAssistantMessage {
                        content: Some(ChatCompletionRequestAssistantMessageContent::Text(
                            msg.content.clone(),
                        )),
                        refusal: None,
                        name: None,
                        audio: None,
                        tool_calls: None,
                        function_call: None,
                    })
                }
            };
            messages.push(oai_msg);
        }

        let model = if request.model.is_empty() {
            self.model.clone()
        } else {
            request.model.clone()
        };

        let mut req = CreateChatCompletionRequest {
            model,
            messages,
            max_completion_tokens: Some(request.max_tokens),
            temperature: request.temperature.map(|t| t as f32),
            ..Default::default()
        };
        if let Some(ref stops) = request.stop_sequences {
            if !stops.is_empty() {
                req.stop = Some(StopConfiguration::StringArray(stops.clone()));
            }
        }
        req
    }

    fn from_response(resp: CreateChatCompletionResponse) -> Result<CompletionResponse, LlmError> {
        let choice = resp
            .choices
            .into_iter()
            .next()
            .ok_or_else(|| LlmError::Deserialization("response contained no choices".to_string()))?;

        let stop_reason = choice
            .finish_reason
            .map(|reason| match reason {
                FinishReason::Stop | FinishReason::ContentFilter => StopReason::EndTurn,
                FinishReason::Length => StopReason::MaxTokens,
                FinishReason::ToolCalls | FinishReason::FunctionCall => StopReason::ToolUse,
            })
            .unwrap_or(StopReason::EndTurn);
        let usage = resp
            .usage
            .map(|u| Usage {
                input_tokens: u.prompt_tokens,
                output_tokens: u.completion_tokens,
            })
            .unwrap_or_default();

        Ok(CompletionResponse {
            id: resp.id,
            content: choice.message.content.unwrap_or_default(),
            model: resp.model,
            stop_reason,
            usage,
        })
    }
}

fn system_message(content: &str) -> ChatCompletionRequestMessage {
    ChatCompletionRequestMessage::System(ChatCompletionRequestSystemMessage {
        content: ChatCompletionRequestSystemMessageContent::Text(content.to_string()),
        name: None,
    })
}

impl LlmProvider for OpenAiCompatibleProvider {
    fn name(&self) -> &str {
        &self.provider_name
    }

    fn capabilities(&self) -> &ProviderCapabilities {
        &self.capabilities
    }

    async fn invoke(
        &self,
        request: &CompletionRequest,
        timeout: Duration,
    ) -> Result<CompletionResponse, LlmError> {
        let body = self.build_request(request);

        let response = tokio::time::timeout(timeout, self.client.chat().create(body))
            .await
            .map_err(|_elapsed| LlmError::Timeout {
                elapsed_ms: timeout.as_millis() as u64,
            })?
            .map_err(|e| map_openai_error(e, timeout))?;

        Self::from_response(response)
    }
}

/// Classify an API error body by its `code` and `type` fields.
fn map_api_error(api_err: &ApiError) -> LlmError {
    let code = api_err.code.as_deref().unwrap_or("");
    let error_type = api_err.r#type.as_deref().unwrap_or("");
    let is = |name: &str| code == name || error_type == name;
    let message = api_err.message.clone();

    if is("invalid_api_key")
        || is("authentication_error")
        || message.contains("Incorrect API key")
        || message.contains("Invalid API key")
    {
        LlmError::AuthenticationFailed
    } else if is("insufficient_quota") {
        LlmError::QuotaExceeded(message)
    } else if is("rate_limit_exceeded") || is("rate_limit_error") {
        LlmError::RateLimited {
            retry_after_ms: None,
        }
    } else if is("context_length_exceeded") || message.contains("maximum context length") {
        LlmError::ContextLengthExceeded {
            max: 0,
            requested: 0,
        }
    } else if is("model_not_found") {
        LlmError::ModelNotFound(message)
    } else if is("invalid_request_error") {
        LlmError::InvalidRequest(message)
    } else if is("server_error") || is("overloaded_error") {
        LlmError::Overloaded(message)
    } else {
        LlmError::Provider { message }
    }
}

/// Map an `async_openai` error to a classified [`LlmError`].
fn map_openai_error(err: OpenAIError, timeout: Duration) -> LlmError {
    match &err {
        OpenAIError::ApiError(api_err) => map_api_error(api_err),
        OpenAIError::Reqwest(reqwest_err) if reqwest_err.is_timeout() => LlmError::Timeout {
            elapsed_ms: timeout.as_millis() as u64,
        },
        OpenAIError::Reqwest(reqwest_err) => match reqwest_err.status() {
            Some(status) => http::classify_http_error(status.as_u16(), None, &err.to_string()),
            None => LlmError::Provider {
                message: format!("HTTP request failed: {err}"),
            },
        },
        OpenAIError::JSONDeserialize(_, content) => {
            LlmError::Deserialization(format!("failed to parse response: {content}"))
        }
        OpenAIError::InvalidArgument(msg) => LlmError::InvalidRequest(msg.clone()),
        _ => LlmError::Provider {
            message: err.to_string(),
        },
    }
}

#[cfg(test)]
mod tests {
    use secrecy::SecretString;

    use super::*;
    use crate::llm::test_server::{serve_once, serve_silently};
    use relay_types::llm::{ErrorClass, Message};

    fn provider(base_url: &str) -> OpenAiCompatibleProvider {
        let mut config = config::openai_defaults(Some(SecretString::from("sk-test")), "gpt-4o");
        config.base_url = base_url.to_string();
        OpenAiCompatibleProvider::new(config).unwrap()
    }

    fn request() -> CompletionRequest {
        CompletionRequest {
            messages: vec![Message::user("Hello")],
            system: Some("Be brief".to_string()),
            max_tokens: 64,
            stop_sequences: Some(vec!["END".to_string()]),
            ..Default::default()
        }
    }

    fn api_error(json: &str) -> LlmError {
        let err: ApiError = serde_json::from_str(json).unwrap();
        map_api_error(&err)
    }

    #[test]
    fn test_build_request_prepends_system_message() {
        let provider = provider("https://api.openai.com/v1/");
        let req = provider.build_request(&request());
        assert_eq!(req.model, "gpt-4o");
        assert_eq!(req.messages.len(), 2);
        assert!(matches!(
            req.messages[0],
            ChatCompletionRequestMessage::System(_)
        ));
        assert!(matches!(req.messages[1], ChatCompletionRequestMessage::User(_)));
        assert_eq!(req.max_completion_tokens, Some(64));
        assert!(matches!(req.stop, Some(StopConfiguration::StringArray(ref s)) if s == &["END"]));
        assert_eq!(provider.base_url(), "https://api.openai.com/v1");
    }

    #[test]
    fn test_explicit_model_overrides_default() {
        let provider = provider("https://api.openai.com/v1");
        let mut req = request();
        req.model = "gpt-4o-mini".to_string();
        req.stop_sequences = Some(Vec::new());
        let built = provider.build_request(&req);
        assert_eq!(built.model, "gpt-4o-mini");
        assert!(built.stop.is_none());
    }

    #[test]
    fn test_empty_choices_is_deserialization_error() {
        let resp: CreateChatCompletionResponse = serde_json::from_str(
            r#"{"id":"c1","object":"chat.completion","created":1700000000,"model":"gpt-4o","choices":[]}"#,
        )
        .unwrap();
        assert!(matches!(
            OpenAiCompatibleProvider::from_response(resp),
            Err(LlmError::Deserialization(_))
        ));
    }

    #[test]
    fn test_api_error_classification() {
        assert!(matches!(
            api_error(r#"{"message":"Incorrect API key provided","type":"invalid_request_error","param":null,"code":"invalid_api_key"}"#),
            LlmError::AuthenticationFailed
        ));
        assert!(matches!(
            api_error(r#"{"message":"You exceeded your current quota","type":"insufficient_quota","param":null,"code":"insufficient_quota"}"#),
            LlmError::QuotaExceeded(_)
        ));
        assert!(matches!(
            api_error(r#"{"message":"Slow down","type":"requests","param":null,"code":"rate_limit_exceeded"}"#),
            LlmError::RateLimited { .. }
        ));
        assert!(matches!(
            api_error(r#"{"message":"too long","type":"invalid_request_error","param":"messages","code":"context_length_exceeded"}"#),
            LlmError::ContextLengthExceeded { .. }
        ));
        assert!(matches!(
            api_error(r#"{"message":"The model `gpt-5o` does not exist","type":"invalid_request_error","param":null,"code":"model_not_found"}"#),
            LlmError::ModelNotFound(_)
        ));
        assert!(matches!(
            api_error(r#"{"message":"messages must not be empty","type":"invalid_request_error","param":"messages","code":null}"#),
            LlmError::InvalidRequest(_)
        ));
        assert!(matches!(
            api_error(r#"{"message":"The server had an error","type":"server_error","param":null,"code":null}"#),
            LlmError::Overloaded(_)
        ));
        assert_eq!(
            api_error(r#"{"message":"???","type":null,"param":null,"code":null}"#).class(),
            ErrorClass::Recoverable
        );
    }

    #[test]
    fn test_invalid_argument_is_request_fatal() {
        let err = map_openai_error(
            OpenAIError::InvalidArgument("bad".to_string()),
            Duration::from_secs(1),
        );
        assert_eq!(err.class(), ErrorClass::RequestFatal);
    }

    #[tokio::test]
    async fn test_invoke_parses_success() {
        let body = r#"{"id":"chatcmpl-1","object":"chat.completion","created":1700000000,"model":"gpt-4o","choices":[{"index":0,"message":{"role":"assistant","content":"Hi!"},"finish_reason":"length"}],"usage":{"prompt_tokens":9,"completion_tokens":2,"total_tokens":11}}"#;
        let base_url = serve_once("200 OK", &[], body).await;

        let resp = provider(&base_url)
            .invoke(&request(), Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(resp.content, "Hi!");
        assert_eq!(resp.stop_reason, StopReason::MaxTokens);
        assert_eq!(resp.usage.input_tokens, 9);
        assert_eq!(resp.usage.output_tokens, 2);
    }

    #[tokio::test]
    async fn test_invoke_classifies_quota_error() {
        let body = r#"{"error":{"message":"You exceeded your current quota","type":"insufficient_quota","param":null,"code":"insufficient_quota"}}"#;
        let base_url = serve_once("429 Too Many Requests", &[], body).await;
        let err = provider(&base_url)
            .invoke(&request(), Duration::from_secs(5))
            .await
            .unwrap_err();
        assert!(matches!(err, LlmError::QuotaExceeded(_)));
    }

    #[tokio::test]
    async fn test_invoke_times_out() {
        let base_url = serve_silently().await;
        let err = provider(&base_url)
            .invoke(&request(), Duration::from_millis(100))
            .await
            .unwrap_err();
        assert!(matches!(err, LlmError::Timeout { elapsed_ms: 100 }));
    }
}
