//! Backoff with jitter and the per-error retry policy.
//!
//! The delay curve is selectable per provider; exponential is the default.

use std::time::Duration;

use rand::Rng;

use relay_types::config::{BackoffStrategy, RetryConfig};
use relay_types::llm::ErrorClass;

/// What the router should do after a failed call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Sleep for the given delay, then call the same provider again.
    RetrySameProvider(Duration),
    /// Give up on this provider and fall back to the next candidate.
    NextProvider,
    /// Give up on the whole request.
    Abort,
}

/// Retry policy for one provider.
#[derive(Debug, Clone)]
pub struct BackoffController {
    strategy: BackoffStrategy,
    base_delay: Duration,
    max_delay: Duration,
    jitter_fraction: f64,
    max_attempts: u32,
}

impl BackoffController {
    pub fn new(config: &RetryConfig) -> Self {
        let jitter_fraction = if config.jitter_fraction.is_finite() {
            config.jitter_fraction.clamp(0.0, 1.0)
        } else {
            0.0
        };
        Self {
            strategy: config.strategy,
            base_delay: config.base_delay(),
            max_delay: config.max_delay(),
            jitter_fraction,
            max_attempts: config.max_attempts_per_provider.max(1),
        }
    }

    /// Copy of this policy with the attempt limit overridden for one request.
    pub fn with_max_attempts(&self, max_attempts: Option<u32>) -> Self {
        let mut policy = self.clone();
        if let Some(max) = max_attempts {
            policy.max_attempts = max.max(1);
        }
        policy
    }

    /// Total attempts (first call included) allowed on this provider.
    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// `min(max_delay, base_delay * factor(n))` for the 0-indexed retry `n`,
    /// where the factor follows the configured strategy.
    pub fn base_delay(&self, n: u32) -> Duration {
        let factor = match self.strategy {
            BackoffStrategy::Exponential => 2u32.checked_pow(n).unwrap_or(u32::MAX),
            BackoffStrategy::Linear => n.saturating_add(1),
            BackoffStrategy::Constant => 1,
            BackoffStrategy::Fibonacci => fibonacci(n.saturating_add(1)),
        };
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }

    /// Backoff delay with jitter drawn from `unit`, a value in `[0, 1)`.
    pub fn delay_with_jitter(&self, n: u32, unit: f64) -> Duration {
        let capped = self.base_delay(n);
        let unit = if unit.is_finite() { unit.clamp(0.0, 1.0) } else { 0.0 };
        let jitter = capped.mul_f64(self.jitter_fraction * unit);
        capped.saturating_add(jitter)
    }

    /// Backoff delay for retry `n` with random jitter in `[0, jitter_fraction * capped]`.
    pub fn delay(&self, n: u32) -> Duration {
        let unit = if self.jitter_fraction > 0.0 {
            rand::thread_rng().gen_range(0.0..1.0)
        } else {
            0.0
        };
        self.delay_with_jitter(n, unit)
    }

    /// Whether a failure of `class` after `attempts_made` calls may be retried here.
    pub fn should_retry(&self, class: ErrorClass, attempts_made: u32) -> bool {
        class == ErrorClass::Recoverable && attempts_made < self.max_attempts
    }

    /// Decide the next step after the `attempts_made`-th call failed with `class`.
    pub fn decide(&self, class: ErrorClass, attempts_made: u32) -> RetryDecision {
        match class {
            ErrorClass::RequestFatal => RetryDecision::Abort,
            ErrorClass::RateLimited | ErrorClass::ProviderFatal => RetryDecision::NextProvider,
            ErrorClass::Recoverable if self.should_retry(class, attempts_made) => {
                RetryDecision::RetrySameProvider(self.delay(attempts_made.saturating_sub(1)))
            }
            ErrorClass::Recoverable => RetryDecision::NextProvider,
        }
    }
}

/// `fib(1) = fib(2) = 1`, saturating at `u32::MAX`.
fn fibonacci(n: u32) -> u32 {
    let (mut previous, mut current) = (0u32, 1u32);
    for _ in 1..n {
        if current == u32::MAX {
            break;
        }
        (previous, current) = (current, previous.saturating_add(current));
    }
    current
}

#[cfg(test)]
mod tests {
    use super::*;

    fn controller(base_ms: u64, max_ms: u64, jitter: f64, attempts: u32) -> BackoffController {
        BackoffController::new(&RetryConfig {
            base_delay_ms: base_ms,
            max_delay_ms: max_ms,
            jitter_fraction: jitter,
            max_attempts_per_provider: attempts,
            ..Default::default()
        })
    }

    fn with_strategy(strategy: BackoffStrategy) -> BackoffController {
        BackoffController::new(&RetryConfig {
            strategy,
            base_delay_ms: 100,
            max_delay_ms: 1_000,
            jitter_fraction: 0.0,
            max_attempts_per_provider: 3,
        })
    }

    fn millis(backoff: &BackoffController, upto: u32) -> Vec<u64> {
        (0..upto)
            .map(|n| backoff.base_delay(n).as_millis() as u64)
            .collect()
    }

    #[test]
    fn test_linear_constant_and_fibonacci_strategies() {
        assert_eq!(
            millis(&with_strategy(BackoffStrategy::Linear), 6),
            vec![100, 200, 300, 400, 500, 600]
        );
        assert_eq!(
            millis(&with_strategy(BackoffStrategy::Constant), 4),
            vec![100, 100, 100, 100]
        );
        assert_eq!(
            millis(&with_strategy(BackoffStrategy::Fibonacci), 8),
            vec![100, 100, 200, 300, 500, 800, 1_000, 1_000]
        );
    }

    #[test]
    fn test_every_strategy_is_capped_and_never_overflows() {
        for strategy in [
            BackoffStrategy::Exponential,
            BackoffStrategy::Linear,
            BackoffStrategy::Constant,
            BackoffStrategy::Fibonacci,
        ] {
            let backoff = with_strategy(strategy);
            let mut previous = Duration::ZERO;
            for n in [0, 1, 10, 50, 100, u32::MAX - 1, u32::MAX] {
                let delay = backoff.base_delay(n);
                assert!(delay <= Duration::from_secs(1), "{strategy:?} at n={n}");
                assert!(delay >= previous, "{strategy:?} shrank at n={n}");
                previous = delay;
            }
        }
    }

    #[test]
    fn test_strategy_feeds_retry_decision() {
        let backoff = with_strategy(BackoffStrategy::Linear);
        assert_eq!(
            backoff.decide(ErrorClass::Recoverable, 2),
            RetryDecision::RetrySameProvider(Duration::from_millis(200))
        );
    }

    #[test]
    fn test_base_delay_doubles_until_cap() {
        let backoff = controller(100, 1_000, 0.0, 3);
        assert_eq!(backoff.base_delay(0), Duration::from_millis(100));
        assert_eq!(backoff.base_delay(1), Duration::from_millis(200));
        assert_eq!(backoff.base_delay(2), Duration::from_millis(400));
        assert_eq!(backoff.base_delay(3), Duration::from_millis(800));
        assert_eq!(backoff.base_delay(4), Duration::from_millis(1_000));
        assert_eq!(backoff.base_delay(63), Duration::from_millis(1_000));
    }

    #[test]
    fn test_base_delay_is_monotonic_and_never_overflows() {
        let backoff = controller(7, u64::MAX, 0.0, 3);
        let mut previous = Duration::ZERO;
        for n in 0..200 {
            let delay = backoff.base_delay(n);
            assert!(delay >= previous, "delay shrank at n={n}");
            previous = delay;
        }
    }

    #[test]
    fn test_jitter_stays_within_bounds() {
        let backoff = controller(1_000, 10_000, 0.5, 3);
        for n in 0..6 {
            let capped = backoff.base_delay(n);
            for _ in 0..50 {
                let delay = backoff.delay(n);
                assert!(delay >= capped);
                assert!(delay <= capped + capped.mul_f64(0.5));
            }
        }
        assert_eq!(
            backoff.delay_with_jitter(0, 1.0),
            Duration::from_millis(1_500)
        );
        assert_eq!(backoff.delay_with_jitter(0, 0.0), Duration::from_secs(1));
    }

    #[test]
    fn test_jitter_fraction_is_clamped() {
        let backoff = controller(100, 1_000, 4.0, 3);
        assert_eq!(
            backoff.delay_with_jitter(0, 1.0),
            Duration::from_millis(200)
        );
        let backoff = controller(100, 1_000, -1.0, 3);
        assert_eq!(backoff.delay(0), Duration::from_millis(100));
    }

    #[test]
    fn test_recoverable_retries_until_max_attempts() {
        let backoff = controller(10, 100, 0.0, 3);
        assert_eq!(
            backoff.decide(ErrorClass::Recoverable, 1),
            RetryDecision::RetrySameProvider(Duration::from_millis(10))
        );
        assert_eq!(
            backoff.decide(ErrorClass::Recoverable, 2),
            RetryDecision::RetrySameProvider(Duration::from_millis(20))
        );
        assert_eq!(
            backoff.decide(ErrorClass::Recoverable, 3),
            RetryDecision::NextProvider
        );
    }

    #[test]
    fn test_non_recoverable_classes_never_retry() {
        let backoff = controller(10, 100, 0.0, 5);
        assert!(!backoff.should_retry(ErrorClass::RateLimited, 1));
        assert_eq!(
            backoff.decide(ErrorClass::RateLimited, 1),
            RetryDecision::NextProvider
        );
        assert_eq!(
            backoff.decide(ErrorClass::ProviderFatal, 1),
            RetryDecision::NextProvider
        );
        assert_eq!(
            backoff.decide(ErrorClass::RequestFatal, 1),
            RetryDecision::Abort
        );
    }

    #[test]
    fn test_max_attempts_override() {
        let backoff = controller(10, 100, 0.0, 3);
        let single = backoff.with_max_attempts(Some(1));
        assert_eq!(single.max_attempts(), 1);
        assert!(!single.should_retry(ErrorClass::Recoverable, 1));

        assert_eq!(backoff.with_max_attempts(None).max_attempts(), 3);
        assert_eq!(backoff.with_max_attempts(Some(0)).max_attempts(), 1);
    }
}
