//! Provider registry for runtime provider lookup.
//!
//! Each registered provider carries its own circuit breaker, rate budget
//! and retry policy, built once from its configuration and kept for the
//! registry's lifetime.

use std::collections::HashMap;
use std::sync::Arc;

use relay_types::config::ProviderConfig;
use relay_types::llm::ProviderStatusInfo;

use super::backoff::BackoffController;
use super::box_provider::BoxLlmProvider;
use super::clock::{MonotonicClock, SharedClock};
use super::health::CircuitBreaker;
use super::rate_limiter::RateLimiter;

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("provider '{0}' is already registered")]
    Duplicate(String),
}

/// A registered provider and its resilience state.
#[derive(Debug)]
pub struct ProviderEntry {
    pub config: ProviderConfig,
    pub provider: BoxLlmProvider,
    pub breaker: CircuitBreaker,
    pub limiter: RateLimiter,
    pub backoff: BackoffController,
}

impl ProviderEntry {
    pub fn status(&self) -> ProviderStatusInfo {
        self.breaker.status_info(self.limiter.available_tokens())
    }
}

/// Registry of available LLM providers, indexed by name.
#[derive(Debug)]
pub struct ProviderRegistry {
    clock: SharedClock,
    providers: HashMap<String, ProviderEntry>,
    /// Names in registration order, for stable listings.
    order: Vec<String>,
}

impl ProviderRegistry {
    /// Create an empty registry on the process monotonic clock.
    pub fn new() -> Self {
        Self::with_clock(Arc::new(MonotonicClock))
    }

    /// Create an empty registry whose breakers and budgets read `clock`.
    pub fn with_clock(clock: SharedClock) -> Self {
        Self {
            clock,
            providers: HashMap::new(),
            order: Vec::new(),
        }
    }

    /// Register a provider under `config.name`.
    pub fn register(
        &mut self,
        config: ProviderConfig,
        provider: BoxLlmProvider,
    ) -> Result<(), RegistryError> {
        if self.providers.contains_key(&config.name) {
            return Err(RegistryError::Duplicate(config.name));
        }

        let entry = ProviderEntry {
            breaker: CircuitBreaker::new(&config.name, &config.circuit, self.clock.clone()),
            limiter: RateLimiter::new(&config.rate_limit, self.clock.clone()),
            backoff: BackoffController::new(&config.retry),
            provider,
            config,
        };

        tracing::debug!(
            provider = %entry.config.name,
            model = %entry.config.model,
            "Registered provider"
        );
        self.order.push(entry.config.name.clone());
        self.providers.insert(entry.config.name.clone(), entry);
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<&ProviderEntry> {
        self.providers.get(name)
    }

    /// All registered provider names, in registration order.
    pub fn list_names(&self) -> Vec<&str> {
        self.order.iter().map(|s| s.as_str()).collect()
    }

    pub fn len(&self) -> usize {
        self.providers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.providers.is_empty()
    }

    pub fn clock(&self) -> &SharedClock {
        &self.clock
    }

    /// Status snapshot of every provider, in registration order.
    pub fn status(&self) -> Vec<ProviderStatusInfo> {
        self.order
            .iter()
            .filter_map(|name| self.providers.get(name))
            .map(ProviderEntry::status)
            .collect()
    }

    /// Order `candidates` by descending score, for callers that want
    /// score-based selection before routing.
    ///
    /// The sort is stable, so equal scores keep their given order. Unknown
    /// names are kept at the end.
    pub fn rank_by_score<S, F>(&self, candidates: &[S], scorer: F) -> Vec<String>
    where
        S: AsRef<str>,
        F: Fn(&ProviderConfig, &ProviderStatusInfo) -> f64,
    {
        let mut scored: Vec<(String, f64)> = candidates
            .iter()
            .map(|name| {
                let name = name.as_ref();
                let score = self
                    .get(name)
                    .map(|entry| scorer(&entry.config, &entry.status()))
                    .filter(|score| !score.is_nan())
                    .unwrap_or(f64::NEG_INFINITY);
                (name.to_string(), score)
            })
            .collect();
        scored.sort_by(|a, b| b.1.total_cmp(&a.1));
        scored.into_iter().map(|(name, _)| name).collect()
    }
}

impl Default for ProviderRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Reliability score in `[0, 1.2]`: success rate so far, halved when the
/// provider cannot produce `required_output_tokens`, with a bonus for
/// providers that support tool calling.
pub fn reliability_score(
    config: &ProviderConfig,
    status: &ProviderStatusInfo,
    required_output_tokens: Option<u32>,
) -> f64 {
    let mut score = 1.0;
    if status.total_calls > 0 {
        let failure_rate = status.total_failures as f64 / status.total_calls as f64;
        score *= 1.0 - failure_rate;
    }
    if config.capabilities.tool_calling {
        score *= 1.2;
    }
    if required_output_tokens.is_some_and(|needed| config.capabilities.max_output_tokens < needed) {
        score *= 0.5;
    }
    score
}
