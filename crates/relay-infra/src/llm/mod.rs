//! LLM provider implementations.
//!
//! Contains concrete implementations of the [`LlmProvider`] trait defined in
//! `relay-core`: the Anthropic Messages API and OpenAI-compatible chat
//! completions.
//!
//! Also provides a provider factory ([`create_provider`]) and
//! [`build_router`], which turns a validated [`RouterConfig`] into a ready
//! [`Router`]. [`build_router_with_events`] additionally publishes every
//! call outcome on a broadcast channel sized by `metrics_channel_capacity`.
//!
//! [`LlmProvider`]: relay_core::llm::provider::LlmProvider

pub mod anthropic;
pub mod http;
pub mod openai_compat;

use std::sync::Arc;

use secrecy::SecretString;

use relay_core::llm::box_provider::BoxLlmProvider;
use relay_core::llm::clock::{MonotonicClock, SharedClock};
use relay_core::llm::metrics::{BroadcastRecorder, FanoutRecorder, MetricsRecorder};
use relay_core::llm::registry::ProviderRegistry;
use relay_core::llm::router::Router;
use relay_types::config::{ProviderConfig, RouterConfig};
use relay_types::llm::{LlmError, ProviderCapabilities, ProviderType};

use self::anthropic::AnthropicProvider;
use self::openai_compat::OpenAiCompatibleProvider;
use self::openai_compat::config::{OpenAiCompatConfig, defaults_for_name};
use crate::config::{ConfigError, validate_router_config};

/// Environment variable consulted when a provider sets no `api_key_env`.
pub fn default_api_key_env(provider_type: &ProviderType) -> &'static str {
    match provider_type {
        ProviderType::Anthropic => "ANTHROPIC_API_KEY",
        ProviderType::OpenAiCompatible => "OPENAI_API_KEY",
    }
}

/// Name of the environment variable holding this provider's API key.
pub fn api_key_env(config: &ProviderConfig) -> String {
    config
        .api_key_env
        .clone()
        .unwrap_or_else(|| default_api_key_env(&config.provider_type).to_string())
}

/// Resolve the provider's API key through `lookup` (normally `std::env::var`).
///
/// Empty values count as missing.
pub fn resolve_api_key(
    config: &ProviderConfig,
    lookup: impl Fn(&str) -> Option<String>,
) -> Option<SecretString> {
    lookup(&api_key_env(config))
        .filter(|key| !key.trim().is_empty())
        .map(SecretString::from)
}

/// Create a [`BoxLlmProvider`] from a [`ProviderConfig`].
///
/// # Errors
///
/// Returns [`LlmError::AuthenticationFailed`] if the provider needs an API
/// key and none is given. OpenAI-compatible providers with an explicit
/// `base_url` (self-hosted servers) may run without one.
pub fn create_provider(
    config: &ProviderConfig,
    api_key: Option<SecretString>,
) -> Result<BoxLlmProvider, LlmError> {
    let custom_capabilities =
        (config.capabilities != ProviderCapabilities::default()).then(|| config.capabilities.clone());

    match config.provider_type {
        ProviderType::Anthropic => {
            let key = api_key.ok_or(LlmError::AuthenticationFailed)?;
            let mut provider = AnthropicProvider::new(&config.name, key, &config.model)?;
            if let Some(ref base_url) = config.base_url {
                provider = provider.with_base_url(base_url);
            }
            if let Some(capabilities) = custom_capabilities {
                provider = provider.with_capabilities(capabilities);
            }
            Ok(BoxLlmProvider::new(provider))
        }
        ProviderType::OpenAiCompatible => {
            let oai_config = match config.base_url.as_deref() {
                Some(base_url) => OpenAiCompatConfig {
                    provider_name: config.name.clone(),
                    base_url: base_url.to_string(),
                    api_key,
                    model: config.model.clone(),
                    capabilities: config.capabilities.clone(),
                },
                None => {
                    let key = api_key.ok_or(LlmError::AuthenticationFailed)?;
                    let mut defaults = defaults_for_name(&config.name, Some(key), &config.model);
                    if let Some(capabilities) = custom_capabilities {
                        defaults.capabilities = capabilities;
                    }
                    defaults
                }
            };
            Ok(BoxLlmProvider::new(OpenAiCompatibleProvider::new(oai_config)?))
        }
    }
}

/// Build a registry with one adapter per configured provider, reading API
/// keys from the process environment.
pub fn build_registry(config: &RouterConfig) -> Result<ProviderRegistry, ConfigError> {
    build_registry_with(config, Arc::new(MonotonicClock), |var| std::env::var(var).ok())
}

/// Build a registry on `clock`, resolving API keys through `lookup`.
pub fn build_registry_with(
    config: &RouterConfig,
    clock: SharedClock,
    lookup: impl Fn(&str) -> Option<String>,
) -> Result<ProviderRegistry, ConfigError> {
    validate_router_config(config)?;

    let mut registry = ProviderRegistry::with_clock(clock);
    for provider_config in &config.providers {
        let key = resolve_api_key(provider_config, &lookup);
        let provider = create_provider(provider_config, key).map_err(|err| match err {
            LlmError::AuthenticationFailed => ConfigError::MissingApiKey {
                provider: provider_config.name.clone(),
                var: api_key_env(provider_config),
            },
            other => ConfigError::Provider {
                provider: provider_config.name.clone(),
                message: other.to_string(),
            },
        })?;
        registry
            .register(provider_config.clone(), provider)
            .map_err(|err| ConfigError::Invalid(err.to_string()))?;
    }

    tracing::info!(providers = ?registry.list_names(), "Provider registry ready");
    Ok(registry)
}

/// Build a router from configuration.
pub fn build_router(
    config: &RouterConfig,
    recorder: Arc<dyn MetricsRecorder>,
) -> Result<Router, ConfigError> {
    let registry = build_registry(config)?;
    Ok(Router::new(registry, recorder).with_config(config))
}

/// Build a router that also publishes outcome events for subscribers.
///
/// Events go to `recorder` first, then to the returned
/// [`BroadcastRecorder`], whose channel holds `metrics_channel_capacity`
/// events per subscriber.
pub fn build_router_with_events(
    config: &RouterConfig,
    recorder: Arc<dyn MetricsRecorder>,
) -> Result<(Router, BroadcastRecorder), ConfigError> {
    let registry = build_registry(config)?;
    Ok(router_with_events(registry, config, recorder))
}

fn router_with_events(
    registry: ProviderRegistry,
    config: &RouterConfig,
    recorder: Arc<dyn MetricsRecorder>,
) -> (Router, BroadcastRecorder) {
    let events = BroadcastRecorder::new(config.metrics_channel_capacity);
    let fanout = FanoutRecorder::new()
        .with(recorder)
        .with(Arc::new(events.clone()));
    let router = Router::new(registry, Arc::new(fanout)).with_config(config);
    (router, events)
}

#[cfg(test)]
pub(crate) mod test_server {
    //! One-shot HTTP responders for adapter tests.

    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    /// Serve a single canned response and return the base URL.
    pub async fn serve_once(status: &str, headers: &[(&str, &str)], body: &str) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let mut response = format!(
            "HTTP/1.1 {status}\r\ncontent-type: application/json\r\ncontent-length: {}\r\nconnection: close\r\n",
            body.len()
        );
        for (name, value) in headers {
            response.push_str(&format!("{name}: {value}\r\n"));
        }
        response.push_str("\r\n");
        response.push_str(body);

        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            read_request(&mut socket).await;
            socket.write_all(response.as_bytes()).await.unwrap();
            let _ = socket.shutdown().await;
        });

        format!("http://{addr}")
    }

    /// Accept a connection and never answer.
    pub async fn serve_silently() -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            read_request(&mut socket).await;
            tokio::time::sleep(std::time::Duration::from_secs(30)).await;
        });
        format!("http://{addr}")
    }

    /// Read one request (head plus `content-length` body bytes).
    async fn read_request(socket: &mut tokio::net::TcpStream) {
        let mut buf = Vec::new();
        let mut chunk = [0u8; 4096];
        loop {
            let n = socket.read(&mut chunk).await.unwrap_or(0);
            if n == 0 {
                return;
            }
            buf.extend_from_slice(&chunk[..n]);
            if let Some(pos) = buf.windows(4).position(|w| w == b"\r\n\r\n") {
                let head = String::from_utf8_lossy(&buf[..pos]).to_lowercase();
                let len = head
                    .lines()
                    .find_map(|line| line.strip_prefix("content-length:"))
                    .and_then(|v| v.trim().parse::<usize>().ok())
                    .unwrap_or(0);
                if buf.len() >= pos + 4 + len {
                    return;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;
    use relay_core::llm::clock::ManualClock;
    use relay_core::llm::metrics::{NoopRecorder, StatsRecorder};
    use relay_core::llm::router::RequestContext;
    use relay_types::llm::{CompletionRequest, Message};
    use relay_types::routing::CallOutcome;

    fn config(name: &str, provider_type: ProviderType, model: &str) -> ProviderConfig {
        ProviderConfig::new(name, provider_type, model)
    }

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |var| map.get(var).cloned()
    }

    #[test]
    fn test_create_provider_anthropic() {
        let cfg = config("anthropic", ProviderType::Anthropic, "claude-sonnet-4-20250514");
        let provider = create_provider(&cfg, Some(SecretString::from("sk-test"))).unwrap();
        assert_eq!(provider.name(), "anthropic");
        assert_eq!(provider.capabilities().max_output_tokens, 8_192);
    }

    #[test]
    fn test_create_provider_anthropic_missing_key() {
        let cfg = config("anthropic", ProviderType::Anthropic, "claude-sonnet-4-20250514");
        match create_provider(&cfg, None) {
            Err(LlmError::AuthenticationFailed) => {}
            Err(other) => panic!("Expected AuthenticationFailed, got: {other}"),
            Ok(_) => panic!("Expected error but got Ok"),
        }
    }

    #[test]
    fn test_create_provider_openai_compatible_by_name() {
        let cfg = config("gemini", ProviderType::OpenAiCompatible, "gemini-2.5-pro");
        let provider = create_provider(&cfg, Some(SecretString::from("key"))).unwrap();
        assert_eq!(provider.name(), "gemini");
        assert_eq!(provider.capabilities().max_context_tokens, 1_000_000);
    }

    #[test]
    fn test_create_provider_self_hosted_without_key() {
        let mut cfg = config("local", ProviderType::OpenAiCompatible, "llama3");
        cfg.base_url = Some("http://localhost:11434/v1".to_string());
        let provider = create_provider(&cfg, None).unwrap();
        assert_eq!(provider.name(), "local");
    }

    #[test]
    fn test_configured_capabilities_override_model_defaults() {
        let mut cfg = config("anthropic", ProviderType::Anthropic, "claude-sonnet-4-20250514");
        cfg.capabilities.max_output_tokens = 1_000;
        let provider = create_provider(&cfg, Some(SecretString::from("k"))).unwrap();
        assert_eq!(provider.capabilities().max_output_tokens, 1_000);
    }

    #[test]
    fn test_resolve_api_key_uses_configured_or_default_var() {
        let lookup = env(&[("ANTHROPIC_API_KEY", "a-key"), ("MY_KEY", ""), ("OTHER", "o")]);

        let cfg = config("a", ProviderType::Anthropic, "m");
        assert!(resolve_api_key(&cfg, &lookup).is_some());

        let mut cfg = config("a", ProviderType::Anthropic, "m");
        cfg.api_key_env = Some("MY_KEY".to_string());
        assert!(resolve_api_key(&cfg, &lookup).is_none());

        cfg.api_key_env = Some("OTHER".to_string());
        assert!(resolve_api_key(&cfg, &lookup).is_some());
    }

    #[test]
    fn test_build_registry_reports_missing_key() {
        let router_config = RouterConfig {
            providers: vec![config("anthropic", ProviderType::Anthropic, "m")],
            ..RouterConfig::default()
        };
        let err = build_registry_with(&router_config, Arc::new(ManualClock::new()), env(&[]))
            .unwrap_err();
        match err {
            ConfigError::MissingApiKey { provider, var } => {
                assert_eq!(provider, "anthropic");
                assert_eq!(var, "ANTHROPIC_API_KEY");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_build_registry_registers_every_provider() {
        let mut local = config("local", ProviderType::OpenAiCompatible, "llama3");
        local.base_url = Some("http://localhost:11434/v1".to_string());
        let router_config = RouterConfig {
            providers: vec![config("anthropic", ProviderType::Anthropic, "m"), local],
            ..RouterConfig::default()
        };

        let registry = build_registry_with(
            &router_config,
            Arc::new(ManualClock::new()),
            env(&[("ANTHROPIC_API_KEY", "sk")]),
        )
        .unwrap();
        assert_eq!(registry.list_names(), vec!["anthropic", "local"]);
    }

    #[test]
    fn test_build_registry_validates_first() {
        let router_config = RouterConfig {
            providers: vec![
                config("a", ProviderType::Anthropic, "m"),
                config("a", ProviderType::Anthropic, "m"),
            ],
            ..RouterConfig::default()
        };
        let err = build_registry_with(
            &router_config,
            Arc::new(ManualClock::new()),
            env(&[("ANTHROPIC_API_KEY", "sk")]),
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn test_build_router_with_no_providers() {
        let router = build_router(&RouterConfig::default(), Arc::new(NoopRecorder)).unwrap();
        assert!(router.registry().is_empty());
        assert!(router.health_status().is_empty());
    }

    #[test]
    fn test_event_channel_uses_configured_capacity() {
        let config = RouterConfig {
            metrics_channel_capacity: 7,
            ..RouterConfig::default()
        };
        let (_router, events) = build_router_with_events(&config, Arc::new(NoopRecorder)).unwrap();
        assert_eq!(events.capacity(), 7);
    }

    #[tokio::test]
    async fn test_router_publishes_outcome_events() {
        let body = r#"{"id":"chatcmpl-1","object":"chat.completion","created":1700000000,"model":"llama3","choices":[{"index":0,"message":{"role":"assistant","content":"pong"},"finish_reason":"stop"}],"usage":{"prompt_tokens":5,"completion_tokens":1,"total_tokens":6}}"#;
        let base_url = test_server::serve_once("200 OK", &[], body).await;

        let mut local = config("local", ProviderType::OpenAiCompatible, "llama3");
        local.base_url = Some(base_url);
        let router_config = RouterConfig {
            providers: vec![local],
            metrics_channel_capacity: 16,
            ..RouterConfig::default()
        };

        let registry =
            build_registry_with(&router_config, Arc::new(ManualClock::new()), env(&[])).unwrap();
        let stats = Arc::new(StatsRecorder::new());
        let (router, events) = router_with_events(registry, &router_config, stats.clone());
        assert_eq!(events.capacity(), 16);
        let mut rx = events.subscribe();

        let request = CompletionRequest {
            messages: vec![Message::user("ping")],
            max_tokens: 16,
            ..Default::default()
        };
        let result = router
            .route(RequestContext::new(request, ["local"]))
            .await
            .unwrap();
        assert_eq!(result.response.content, "pong");

        let event = rx.recv().await.unwrap();
        assert_eq!(event.provider, "local");
        assert_eq!(event.outcome, CallOutcome::Success);
        assert_eq!(event.usage.map(|u| u.input_tokens), Some(5));
        assert_eq!(stats.snapshot("local").unwrap().successes, 1);
    }
}
