//! Per-provider token bucket.
//!
//! Tokens refill continuously at `refill_per_sec` up to `capacity`. Each
//! admitted call consumes one token. Admission never waits: a refused call
//! is reported to the router as `RateLimited` and the router moves on.
//!
//! With `adaptive` enabled the bucket also tracks the error rate of
//! dispatched calls. Each full window above the threshold halves the
//! effective capacity (and refill rate); each healthy window grows it back
//! by one token, never past the configured capacity.

use std::sync::Mutex;
use std::time::{Duration, Instant};

use relay_types::config::RateLimitConfig;

use super::clock::{SharedClock, lock};

#[derive(Debug)]
struct TokenBucket {
    tokens: f64,
    last_refill: Instant,
    /// Set when the provider itself asked us to back off.
    blocked_until: Option<Instant>,
    /// Current ceiling, equal to the configured capacity unless adaptive
    /// limiting has shrunk it.
    effective: f64,
    window_calls: u32,
    window_errors: u32,
}

impl TokenBucket {
    fn refill(&mut self, now: Instant, capacity: f64, refill_rate: f64) {
        if now <= self.last_refill {
            return;
        }
        let elapsed = now.duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * refill_rate).min(capacity);
        self.last_refill = now;
    }
}

#[derive(Debug, Clone, Copy)]
struct AdaptivePolicy {
    error_rate_threshold: f64,
    window: u32,
}

/// Token bucket guarding calls to one provider.
#[derive(Debug)]
pub struct RateLimiter {
    capacity: f64,
    refill_rate: f64,
    adaptive: Option<AdaptivePolicy>,
    clock: SharedClock,
    bucket: Mutex<TokenBucket>,
}

impl RateLimiter {
    /// Create a full bucket.
    pub fn new(config: &RateLimitConfig, clock: SharedClock) -> Self {
        let capacity = f64::from(config.capacity);
        let refill_rate = config.refill_per_sec.max(0.0);
        let adaptive = config.adaptive.then(|| AdaptivePolicy {
            error_rate_threshold: config.error_rate_threshold.clamp(0.0, 1.0),
            window: config.adaptive_window.max(1),
        });
        let now = clock.now();
        Self {
            capacity,
            refill_rate,
            adaptive,
            clock,
            bucket: Mutex::new(TokenBucket {
                tokens: capacity,
                last_refill: now,
                blocked_until: None,
                effective: capacity,
                window_calls: 0,
                window_errors: 0,
            }),
        }
    }

    fn refill(&self, bucket: &mut TokenBucket, now: Instant) {
        let rate = if self.capacity > 0.0 {
            self.refill_rate * bucket.effective / self.capacity
        } else {
            0.0
        };
        let ceiling = bucket.effective;
        bucket.refill(now, ceiling, rate);
    }

    /// Take one token if available. Never blocks.
    pub fn try_acquire(&self) -> bool {
        let now = self.clock.now();
        let mut bucket = lock(&self.bucket);

        if let Some(until) = bucket.blocked_until {
            if now < until {
                return false;
            }
            bucket.blocked_until = None;
        }

        self.refill(&mut bucket, now);
        if bucket.tokens >= 1.0 {
            bucket.tokens -= 1.0;
            true
        } else {
            false
        }
    }

    /// Whole tokens currently available, after refill.
    pub fn available_tokens(&self) -> u32 {
        let now = self.clock.now();
        let mut bucket = lock(&self.bucket);
        if bucket.blocked_until.is_some_and(|until| now < until) {
            return 0;
        }
        self.refill(&mut bucket, now);
        bucket.tokens.floor() as u32
    }

    /// Honor a provider-reported rate limit.
    ///
    /// Drains the bucket and refuses admission for `retry_after`. Refill
    /// resumes from the end of the penalty window.
    pub fn penalize(&self, retry_after: Duration) {
        let until = self.clock.now() + retry_after;
        let mut bucket = lock(&self.bucket);
        bucket.tokens = 0.0;
        bucket.blocked_until = Some(bucket.blocked_until.map_or(until, |b| b.max(until)));
        bucket.last_refill = bucket.last_refill.max(until);
        tracing::debug!(retry_after_ms = retry_after.as_millis() as u64, "Rate budget penalized");
    }

    /// Feed the result of a dispatched call into adaptive limiting.
    ///
    /// No-op unless the limiter was built with `adaptive = true`.
    pub fn record_outcome(&self, success: bool) {
        let Some(policy) = self.adaptive else {
            return;
        };
        let now = self.clock.now();
        let mut bucket = lock(&self.bucket);
        bucket.window_calls += 1;
        if !success {
            bucket.window_errors += 1;
        }
        if bucket.window_calls < policy.window {
            return;
        }

        // Settle what was earned at the old rate before changing it.
        self.refill(&mut bucket, now);
        let error_rate = f64::from(bucket.window_errors) / f64::from(bucket.window_calls);
        let previous = bucket.effective;
        bucket.effective = if error_rate > policy.error_rate_threshold {
            (previous / 2.0).floor().max(1.0).min(self.capacity)
        } else {
            (previous + 1.0).min(self.capacity)
        };
        bucket.tokens = bucket.tokens.min(bucket.effective);
        bucket.window_calls = 0;
        bucket.window_errors = 0;

        if bucket.effective != previous {
            tracing::debug!(
                error_rate,
                from = previous as u32,
                to = bucket.effective as u32,
                "Adaptive rate budget adjusted"
            );
        }
    }

    /// Refill to capacity and clear any penalty and adaptive reduction.
    pub fn reset(&self) {
        let now = self.clock.now();
        let mut bucket = lock(&self.bucket);
        bucket.tokens = self.capacity;
        bucket.last_refill = now;
        bucket.blocked_until = None;
        bucket.effective = self.capacity;
        bucket.window_calls = 0;
        bucket.window_errors = 0;
    }

    pub fn capacity(&self) -> u32 {
        self.capacity as u32
    }

    /// Current burst ceiling. Equals [`capacity`](Self::capacity) unless
    /// adaptive limiting has reduced it.
    pub fn effective_capacity(&self) -> u32 {
        lock(&self.bucket).effective as u32
    }
}
