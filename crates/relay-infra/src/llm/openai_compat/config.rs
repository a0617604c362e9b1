//! Configuration types and per-provider defaults for OpenAI-compatible providers.
//!
//! Each well-known provider that speaks the OpenAI chat completions protocol
//! gets a factory function returning an [`OpenAiCompatConfig`] with the
//! correct base URL and capabilities.

use secrecy::SecretString;

use relay_types::llm::ProviderCapabilities;

/// Configuration for an OpenAI-compatible LLM provider.
///
/// Used to construct an [`super::OpenAiCompatibleProvider`].
pub struct OpenAiCompatConfig {
    /// Router-facing provider name (e.g., "openai", "gemini").
    pub provider_name: String,
    /// Base URL for the API (e.g., "https://api.openai.com/v1").
    pub base_url: String,
    /// Bearer token. Local servers may not need one.
    pub api_key: Option<SecretString>,
    /// Model used when a request leaves its model empty.
    pub model: String,
    pub capabilities: ProviderCapabilities,
}

/// OpenAI default configuration.
///
/// Base URL: `https://api.openai.com/v1`
/// Capabilities: tool calling, vision; 128K context, 16K output.
pub fn openai_defaults(api_key: Option<SecretString>, model: &str) -> OpenAiCompatConfig {
    OpenAiCompatConfig {
        provider_name: "openai".into(),
        base_url: "https://api.openai.com/v1".into(),
        api_key,
        model: model.into(),
        capabilities: ProviderCapabilities {
            tool_calling: true,
            vision: true,
            max_context_tokens: 128_000,
            max_output_tokens: 16_384,
        },
    }
}

/// Google Gemini default configuration (OpenAI-compatible beta endpoint).
///
/// Base URL: `https://generativelanguage.googleapis.com/v1beta/openai`
/// Capabilities: tool calling, vision; 1M context, 64K output.
pub fn gemini_defaults(api_key: Option<SecretString>, model: &str) -> OpenAiCompatConfig {
    OpenAiCompatConfig {
        provider_name: "gemini".into(),
        base_url: "https://generativelanguage.googleapis.com/v1beta/openai".into(),
        api_key,
        model: model.into(),
        capabilities: ProviderCapabilities {
            tool_calling: true,
            vision: true,
            max_context_tokens: 1_000_000,
            max_output_tokens: 65_536,
        },
    }
}

/// Mistral AI default configuration.
///
/// Base URL: `https://api.mistral.ai/v1`
/// Capabilities: tool calling, vision; 128K context, 32K output.
pub fn mistral_defaults(api_key: Option<SecretString>, model: &str) -> OpenAiCompatConfig {
    OpenAiCompatConfig {
        provider_name: "mistral".into(),
        base_url: "https://api.mistral.ai/v1".into(),
        api_key,
        model: model.into(),
        capabilities: ProviderCapabilities {
            tool_calling: true,
            vision: true,
            max_context_tokens: 128_000,
            max_output_tokens: 32_768,
        },
    }
}

/// Defaults for a provider known by name, falling back to OpenAI's endpoint.
pub fn defaults_for_name(name: &str, api_key: Option<SecretString>, model: &str) -> OpenAiCompatConfig {
    let mut config = match name {
        "gemini" => gemini_defaults(api_key, model),
        "mistral" => mistral_defaults(api_key, model),
        _ => openai_defaults(api_key, model),
    };
    config.provider_name = name.to_string();
    config
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_openai_defaults() {
        let config = openai_defaults(None, "gpt-4o");
        assert_eq!(config.base_url, "https://api.openai.com/v1");
        assert_eq!(config.capabilities.max_context_tokens, 128_000);
        assert_eq!(config.model, "gpt-4o");
    }

    #[test]
    fn test_defaults_for_name() {
        let gemini = defaults_for_name("gemini", None, "gemini-2.5-pro");
        assert!(gemini.base_url.contains("generativelanguage"));
        assert_eq!(gemini.capabilities.max_context_tokens, 1_000_000);

        let unknown = defaults_for_name("openai-eu", None, "gpt-4o");
        assert_eq!(unknown.provider_name, "openai-eu");
        assert_eq!(unknown.base_url, "https://api.openai.com/v1");
    }
}
