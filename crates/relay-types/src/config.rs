//! Router configuration types.
//!
//! `RouterConfig` represents the top-level `relay.toml`: one `[[providers]]`
//! table per provider with optional `circuit`, `rate_limit` and `retry`
//! sub-tables. Every tuning field has a default.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::llm::{ProviderCapabilities, ProviderType};

/// Top-level router configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouterConfig {
    /// Providers known to the router. Order here is registration order only;
    /// callers choose the candidate order per request.
    #[serde(default)]
    pub providers: Vec<ProviderConfig>,

    /// Wall-clock budget for a request when the caller does not supply one.
    #[serde(default = "default_total_timeout_ms")]
    pub default_total_timeout_ms: u64,

    /// Timeout for a single provider call when the caller does not supply one.
    #[serde(default = "default_per_call_timeout_ms")]
    pub default_per_call_timeout_ms: u64,

    /// Upper bound on provider-reported retry-after hints.
    #[serde(default = "default_max_retry_after_ms")]
    pub max_retry_after_ms: u64,

    /// Capacity of the broadcast channel carrying call outcome events.
    #[serde(default = "default_metrics_channel_capacity")]
    pub metrics_channel_capacity: usize,
}

fn default_total_timeout_ms() -> u64 {
    120_000
}

fn default_per_call_timeout_ms() -> u64 {
    60_000
}

fn default_max_retry_after_ms() -> u64 {
    60_000
}

fn default_metrics_channel_capacity() -> usize {
    1024
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            providers: Vec::new(),
            default_total_timeout_ms: default_total_timeout_ms(),
            default_per_call_timeout_ms: default_per_call_timeout_ms(),
            max_retry_after_ms: default_max_retry_after_ms(),
            metrics_channel_capacity: default_metrics_channel_capacity(),
        }
    }
}

impl RouterConfig {
    pub fn default_total_timeout(&self) -> Duration {
        Duration::from_millis(self.default_total_timeout_ms)
    }

    pub fn default_per_call_timeout(&self) -> Duration {
        Duration::from_millis(self.default_per_call_timeout_ms)
    }

    pub fn max_retry_after(&self) -> Duration {
        Duration::from_millis(self.max_retry_after_ms)
    }

    /// Look up a provider configuration by name.
    pub fn provider(&self, name: &str) -> Option<&ProviderConfig> {
        self.providers.iter().find(|p| p.name == name)
    }
}

/// Configuration for a single provider.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    /// Unique name used in candidate lists (e.g., "anthropic", "openai").
    pub name: String,
    /// Adapter backing this provider.
    pub provider_type: ProviderType,
    /// Default model identifier sent when a request leaves `model` empty.
    pub model: String,
    /// Every model this provider can serve (capability metadata).
    #[serde(default)]
    pub models: Vec<String>,
    /// Override the adapter's default base URL.
    #[serde(default)]
    pub base_url: Option<String>,
    /// Environment variable holding the API key.
    #[serde(default)]
    pub api_key_env: Option<String>,
    /// Relative cost score (lower is cheaper). Used by caller-side ranking only.
    #[serde(default = "default_score")]
    pub cost_score: f64,
    /// Relative latency score (lower is faster). Used by caller-side ranking only.
    #[serde(default = "default_score")]
    pub latency_score: f64,
    #[serde(default)]
    pub capabilities: ProviderCapabilities,
    #[serde(default)]
    pub circuit: CircuitBreakerConfig,
    #[serde(default)]
    pub rate_limit: RateLimitConfig,
    #[serde(default)]
    pub retry: RetryConfig,
}

fn default_score() -> f64 {
    1.0
}

impl ProviderConfig {
    /// Minimal configuration with default tuning, mostly for tests and tooling.
    pub fn new(name: impl Into<String>, provider_type: ProviderType, model: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            provider_type,
            model: model.into(),
            models: Vec::new(),
            base_url: None,
            api_key_env: None,
            cost_score: default_score(),
            latency_score: default_score(),
            capabilities: ProviderCapabilities::default(),
            circuit: CircuitBreakerConfig::default(),
            rate_limit: RateLimitConfig::default(),
            retry: RetryConfig::default(),
        }
    }

    /// Whether this provider advertises the given model.
    pub fn supports_model(&self, model: &str) -> bool {
        self.model == model || self.models.iter().any(|m| m == model)
    }
}

/// Circuit breaker tuning for one provider.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures in `Closed` that open the circuit.
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
    /// How long the circuit stays `Open` before admitting trial calls.
    #[serde(default = "default_open_timeout_ms")]
    pub open_timeout_ms: u64,
    /// Trial calls admitted while `HalfOpen` (minimum 1).
    #[serde(default = "default_half_open_trial_limit")]
    pub half_open_trial_limit: u32,
}

fn default_failure_threshold() -> u32 {
    3
}

fn default_open_timeout_ms() -> u64 {
    30_000
}

fn default_half_open_trial_limit() -> u32 {
    1
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: default_failure_threshold(),
            open_timeout_ms: default_open_timeout_ms(),
            half_open_trial_limit: default_half_open_trial_limit(),
        }
    }
}

impl CircuitBreakerConfig {
    pub fn open_timeout(&self) -> Duration {
        Duration::from_millis(self.open_timeout_ms)
    }
}

/// Token bucket tuning for one provider.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RateLimitConfig {
    /// Maximum tokens in the bucket (burst size).
    #[serde(default = "default_rate_capacity")]
    pub capacity: u32,
    /// Tokens added per second.
    #[serde(default = "default_refill_per_sec")]
    pub refill_per_sec: f64,
    /// Shrink the budget while the provider is failing and grow it back once
    /// it recovers.
    #[serde(default)]
    pub adaptive: bool,
    /// Error rate over one window above which the budget is halved.
    #[serde(default = "default_error_rate_threshold")]
    pub error_rate_threshold: f64,
    /// Dispatched calls per adaptive evaluation window.
    #[serde(default = "default_adaptive_window")]
    pub adaptive_window: u32,
}

fn default_rate_capacity() -> u32 {
    60
}

fn default_refill_per_sec() -> f64 {
    1.0
}

fn default_error_rate_threshold() -> f64 {
    0.1
}

fn default_adaptive_window() -> u32 {
    20
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            capacity: default_rate_capacity(),
            refill_per_sec: default_refill_per_sec(),
            adaptive: false,
            error_rate_threshold: default_error_rate_threshold(),
            adaptive_window: default_adaptive_window(),
        }
    }
}

/// Growth curve of the delay between retries on the same provider.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffStrategy {
    /// `base * 2^n`
    #[default]
    Exponential,
    /// `base * (n + 1)`
    Linear,
    /// `base` every time.
    Constant,
    /// `base * fib(n + 1)`: 1, 1, 2, 3, 5, ...
    Fibonacci,
}

/// Retry and backoff tuning for one provider.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryConfig {
    #[serde(default)]
    pub strategy: BackoffStrategy,
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    /// Jitter upper bound as a fraction of the computed delay, in `[0, 1]`.
    #[serde(default = "default_jitter_fraction")]
    pub jitter_fraction: f64,
    /// Total attempts (first call included) on this provider per request.
    #[serde(default = "default_max_attempts_per_provider")]
    pub max_attempts_per_provider: u32,
}

fn default_base_delay_ms() -> u64 {
    500
}

fn default_max_delay_ms() -> u64 {
    30_000
}

fn default_jitter_fraction() -> f64 {
    0.1
}

fn default_max_attempts_per_provider() -> u32 {
    3
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            strategy: BackoffStrategy::default(),
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            jitter_fraction: default_jitter_fraction(),
            max_attempts_per_provider: default_max_attempts_per_provider(),
        }
    }
}

impl RetryConfig {
    pub fn base_delay(&self) -> Duration {
        Duration::from_millis(self.base_delay_ms)
    }

    pub fn max_delay(&self) -> Duration {
        Duration::from_millis(self.max_delay_ms)
    }
}
