//! Router configuration loader.
//!
//! Reads `relay.toml` and deserializes it into [`RouterConfig`]. A missing
//! file yields the defaults (no providers); a file that fails to parse or
//! validate is an error, since routing with a half-read provider list would
//! silently drop fallbacks.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use relay_types::config::RouterConfig;

/// File name looked up by [`load_router_config_from_dir`].
pub const CONFIG_FILE_NAME: &str = "relay.toml";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse {}: {source}", path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("invalid configuration: {0}")]
    Invalid(String),

    #[error("provider '{provider}' needs an API key in ${var}")]
    MissingApiKey { provider: String, var: String },

    #[error("failed to set up provider '{provider}': {message}")]
    Provider { provider: String, message: String },
}

/// Load router configuration from `path`.
///
/// - If the file does not exist, returns [`RouterConfig::default()`].
/// - If the file exists but fails to read, parse, or validate, returns an error.
pub async fn load_router_config(path: &Path) -> Result<RouterConfig, ConfigError> {
    let content = match tokio::fs::read_to_string(path).await {
        Ok(content) => content,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            tracing::debug!("No config found at {}, using defaults", path.display());
            return Ok(RouterConfig::default());
        }
        Err(source) => {
            return Err(ConfigError::Io {
                path: path.to_path_buf(),
                source,
            });
        }
    };

    let config = toml::from_str::<RouterConfig>(&content).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })?;
    validate_router_config(&config)?;

    tracing::info!(
        path = %path.display(),
        providers = config.providers.len(),
        "Loaded router configuration"
    );
    Ok(config)
}

/// Load `{dir}/relay.toml`.
pub async fn load_router_config_from_dir(dir: &Path) -> Result<RouterConfig, ConfigError> {
    load_router_config(&dir.join(CONFIG_FILE_NAME)).await
}

/// Reject configurations the router cannot run with.
pub fn validate_router_config(config: &RouterConfig) -> Result<(), ConfigError> {
    let mut seen = HashSet::new();

    if config.default_total_timeout_ms == 0 {
        return Err(invalid("default_total_timeout_ms must be greater than 0"));
    }
    if config.default_per_call_timeout_ms == 0 {
        return Err(invalid("default_per_call_timeout_ms must be greater than 0"));
    }
    if config.metrics_channel_capacity == 0 {
        return Err(invalid("metrics_channel_capacity must be greater than 0"));
    }

    for provider in &config.providers {
        let name = provider.name.as_str();
        if name.trim().is_empty() {
            return Err(invalid("provider name must not be empty"));
        }
        if !seen.insert(name) {
            return Err(invalid(format!("duplicate provider name '{name}'")));
        }
        if provider.model.trim().is_empty() {
            return Err(invalid(format!("provider '{name}': model must not be empty")));
        }

        let circuit = &provider.circuit;
        if circuit.failure_threshold == 0 {
            return Err(invalid(format!(
                "provider '{name}': circuit.failure_threshold must be greater than 0"
            )));
        }
        if circuit.half_open_trial_limit == 0 {
            return Err(invalid(format!(
                "provider '{name}': circuit.half_open_trial_limit must be greater than 0"
            )));
        }

        let rate = &provider.rate_limit;
        if rate.capacity == 0 {
            return Err(invalid(format!(
                "provider '{name}': rate_limit.capacity must be greater than 0"
            )));
        }
        if !rate.refill_per_sec.is_finite() || rate.refill_per_sec < 0.0 {
            return Err(invalid(format!(
                "provider '{name}': rate_limit.refill_per_sec must be a non-negative number"
            )));
        }
        if !(0.0..=1.0).contains(&rate.error_rate_threshold) {
            return Err(invalid(format!(
                "provider '{name}': rate_limit.error_rate_threshold must be within [0, 1]"
            )));
        }
        if rate.adaptive_window == 0 {
            return Err(invalid(format!(
                "provider '{name}': rate_limit.adaptive_window must be greater than 0"
            )));
        }

        let retry = &provider.retry;
        if retry.max_attempts_per_provider == 0 {
            return Err(invalid(format!(
                "provider '{name}': retry.max_attempts_per_provider must be greater than 0"
            )));
        }
        if !(0.0..=1.0).contains(&retry.jitter_fraction) {
            return Err(invalid(format!(
                "provider '{name}': retry.jitter_fraction must be within [0, 1]"
            )));
        }
        if retry.max_delay_ms < retry.base_delay_ms {
            return Err(invalid(format!(
                "provider '{name}': retry.max_delay_ms must not be less than retry.base_delay_ms"
            )));
        }
    }

    Ok(())
}

fn invalid(message: impl Into<String>) -> ConfigError {
    ConfigError::Invalid(message.into())
}
