//! LLM provider routing.
//!
//! - `LlmProvider`: RPITIT trait implemented by provider adapters
//! - `BoxLlmProvider`: object-safe wrapper for dynamic dispatch
//! - `RateLimiter`, `CircuitBreaker`, `BackoffController`: per-provider guards
//! - `ProviderRegistry` + `Router`: candidate-ordered routing with fallback

pub mod backoff;
pub mod box_provider;
pub mod clock;
pub mod health;
pub mod metrics;
pub mod provider;
pub mod rate_limiter;
pub mod registry;
pub mod router;
