//! Provider health tracking via a three-state circuit breaker.
//!
//! ```text
//! Closed   --(failure_threshold consecutive failures)--> Open
//! Open     --(open_timeout elapsed)--------------------> HalfOpen
//! HalfOpen --(trial success)---------------------------> Closed
//! HalfOpen --(trial failure)---------------------------> Open
//! ```
//!
//! Admission and outcome recording each take the breaker lock briefly; the
//! lock is never held while the provider call is in flight. A
//! [`BreakerPermit`] ties the two halves together so a half-open trial slot
//! is handed back on every exit path, including cancellation.

use std::sync::Mutex;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};

use relay_types::config::CircuitBreakerConfig;
use relay_types::llm::ProviderStatusInfo;

use super::clock::{SharedClock, lock};

/// Circuit breaker state for a provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    /// Normal operation. Consecutive failures count toward the threshold.
    Closed,
    /// Provider is disabled until the open timeout elapses.
    Open,
    /// A limited number of trial calls check whether the provider recovered.
    HalfOpen,
}

impl CircuitState {
    pub fn as_str(&self) -> &'static str {
        match self {
            CircuitState::Closed => "closed",
            CircuitState::Open => "open",
            CircuitState::HalfOpen => "half_open",
        }
    }
}

#[derive(Debug)]
struct BreakerState {
    state: CircuitState,
    consecutive_failures: u32,
    last_failure_at: Option<Instant>,
    transitioned_at: Instant,
    /// Trial calls admitted in the current half-open episode.
    trials_admitted: u32,
    /// Bumped on every state transition so stale permits can be recognized.
    episode: u64,

    last_error: Option<String>,
    last_success: Option<Instant>,
    last_latency: Option<Duration>,
    total_latency: Duration,
    total_calls: u64,
    total_failures: u64,
    uptime_since: Option<DateTime<Utc>>,
}

impl BreakerState {
    fn transition(&mut self, to: CircuitState, now: Instant) {
        self.state = to;
        self.transitioned_at = now;
        self.trials_admitted = 0;
        self.episode += 1;
    }
}

/// Circuit breaker guarding one provider.
#[derive(Debug)]
pub struct CircuitBreaker {
    name: String,
    failure_threshold: u32,
    open_timeout: Duration,
    half_open_trial_limit: u32,
    clock: SharedClock,
    inner: Mutex<BreakerState>,
}

impl CircuitBreaker {
    /// Create a closed breaker. Zero thresholds and limits are raised to 1.
    pub fn new(name: impl Into<String>, config: &CircuitBreakerConfig, clock: SharedClock) -> Self {
        let now = clock.now();
        Self {
            name: name.into(),
            failure_threshold: config.failure_threshold.max(1),
            open_timeout: config.open_timeout(),
            half_open_trial_limit: config.half_open_trial_limit.max(1),
            clock,
            inner: Mutex::new(BreakerState {
                state: CircuitState::Closed,
                consecutive_failures: 0,
                last_failure_at: None,
                transitioned_at: now,
                trials_admitted: 0,
                episode: 0,
                last_error: None,
                last_success: None,
                last_latency: None,
                total_latency: Duration::ZERO,
                total_calls: 0,
                total_failures: 0,
                uptime_since: Some(Utc::now()),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Current state, after applying a due `Open -> HalfOpen` transition.
    pub fn state(&self) -> CircuitState {
        let now = self.clock.now();
        let mut inner = lock(&self.inner);
        self.refresh(&mut inner, now);
        inner.state
    }

    pub fn consecutive_failures(&self) -> u32 {
        lock(&self.inner).consecutive_failures
    }

    /// Check whether a call may proceed, consuming a trial slot in `HalfOpen`.
    ///
    /// Every `true` must be followed by [`record_outcome`](Self::record_outcome)
    /// or [`release_trial`](Self::release_trial). Prefer
    /// [`try_acquire`](Self::try_acquire), which enforces that pairing.
    pub fn allow(&self) -> bool {
        self.admit().is_some()
    }

    /// Record the outcome of a call admitted by [`allow`](Self::allow).
    pub fn record_outcome(&self, success: bool) {
        if success {
            self.settle(None, Ok(None));
        } else {
            self.settle(None, Err(("call failed".to_string(), None)));
        }
    }

    /// Hand back a half-open trial slot without recording an outcome.
    pub fn release_trial(&self) {
        let mut inner = lock(&self.inner);
        if inner.state == CircuitState::HalfOpen && inner.trials_admitted > 0 {
            inner.trials_admitted -= 1;
        }
    }

    /// Admit a call and return a permit that must be settled with its outcome.
    ///
    /// Returns `None` when the circuit rejects the call.
    pub fn try_acquire(&self) -> Option<BreakerPermit<'_>> {
        let (episode, trial) = self.admit()?;
        Some(BreakerPermit {
            breaker: self,
            episode,
            trial,
            settled: false,
        })
    }

    /// Force the circuit closed and clear the failure counter.
    pub fn reset(&self) {
        let now = self.clock.now();
        let mut inner = lock(&self.inner);
        if inner.state != CircuitState::Closed {
            inner.transition(CircuitState::Closed, now);
            inner.uptime_since = Some(Utc::now());
        }
        inner.consecutive_failures = 0;
        tracing::info!(provider = %self.name, "Circuit manually reset");
    }

    /// Snapshot for status display.
    pub fn status_info(&self, available_tokens: u32) -> ProviderStatusInfo {
        let now = self.clock.now();
        let mut inner = lock(&self.inner);
        self.refresh(&mut inner, now);

        let last_success_ago = inner.last_success.map(|s| {
            let elapsed = now.saturating_duration_since(s);
            if elapsed.as_secs() < 60 {
                format!("{}s ago", elapsed.as_secs())
            } else if elapsed.as_secs() < 3600 {
                format!("{}m ago", elapsed.as_secs() / 60)
            } else {
                format!("{}h ago", elapsed.as_secs() / 3600)
            }
        });

        let avg_latency_ms = (inner.total_calls > 0)
            .then(|| inner.total_latency.as_millis() as u64 / inner.total_calls);

        ProviderStatusInfo {
            name: self.name.clone(),
            circuit_state: inner.state.as_str().to_string(),
            consecutive_failures: inner.consecutive_failures,
            last_error: inner.last_error.clone(),
            last_success_ago,
            total_calls: inner.total_calls,
            total_failures: inner.total_failures,
            avg_latency_ms,
            available_tokens,
            uptime_since: inner.uptime_since.map(|t| t.to_rfc3339()),
        }
    }

    /// Latency of the most recent completed call.
    pub fn last_latency(&self) -> Option<Duration> {
        lock(&self.inner).last_latency
    }

    /// Apply the lazy `Open -> HalfOpen` transition.
    fn refresh(&self, inner: &mut BreakerState, now: Instant) {
        if inner.state == CircuitState::Open
            && now.saturating_duration_since(inner.transitioned_at) >= self.open_timeout
        {
            inner.transition(CircuitState::HalfOpen, now);
            tracing::info!(provider = %self.name, "Circuit half-open, admitting trial calls");
        }
    }

    /// Returns the episode and whether the admitted call is a half-open trial.
    fn admit(&self) -> Option<(u64, bool)> {
        let now = self.clock.now();
        let mut inner = lock(&self.inner);
        self.refresh(&mut inner, now);

        match inner.state {
            CircuitState::Closed => Some((inner.episode, false)),
            CircuitState::Open => None,
            CircuitState::HalfOpen => {
                if inner.trials_admitted < self.half_open_trial_limit {
                    inner.trials_admitted += 1;
                    Some((inner.episode, true))
                } else {
                    None
                }
            }
        }
    }

    /// Record an outcome. `episode` is `Some` for permit-tracked calls; a
    /// half-open outcome from a call admitted in an earlier episode only
    /// updates statistics.
    fn settle(
        &self,
        episode: Option<u64>,
        outcome: Result<Option<Duration>, (String, Option<Duration>)>,
    ) {
        let now = self.clock.now();
        let mut inner = lock(&self.inner);
        inner.total_calls += 1;

        let current_episode = episode.is_none_or(|e| e == inner.episode);

        match outcome {
            Ok(latency) => {
                inner.last_success = Some(now);
                if let Some(latency) = latency {
                    inner.last_latency = Some(latency);
                    inner.total_latency += latency;
                }

                match inner.state {
                    CircuitState::Closed => inner.consecutive_failures = 0,
                    CircuitState::HalfOpen if current_episode => {
                        inner.transition(CircuitState::Closed, now);
                        inner.consecutive_failures = 0;
                        inner.uptime_since = Some(Utc::now());
                        tracing::info!(provider = %self.name, "Circuit closed, provider recovered");
                    }
                    // Late completion from before the circuit opened.
                    CircuitState::HalfOpen | CircuitState::Open => {}
                }
            }
            Err((message, latency)) => {
                inner.total_failures += 1;
                inner.last_failure_at = Some(now);
                inner.last_error = Some(message);
                if let Some(latency) = latency {
                    inner.last_latency = Some(latency);
                    inner.total_latency += latency;
                }

                match inner.state {
                    CircuitState::Closed => {
                        inner.consecutive_failures += 1;
                        if inner.consecutive_failures >= self.failure_threshold {
                            inner.transition(CircuitState::Open, now);
                            inner.uptime_since = None;
                            tracing::warn!(
                                provider = %self.name,
                                failures = inner.consecutive_failures,
                                "Circuit opened"
                            );
                        }
                    }
                    CircuitState::HalfOpen if current_episode => {
                        inner.transition(CircuitState::Open, now);
                        inner.uptime_since = None;
                        tracing::warn!(provider = %self.name, "Trial call failed, circuit re-opened");
                    }
                    CircuitState::HalfOpen | CircuitState::Open => {}
                }
            }
        }
    }

    fn release_episode(&self, episode: u64) {
        let mut inner = lock(&self.inner);
        if inner.state == CircuitState::HalfOpen
            && inner.episode == episode
            && inner.trials_admitted > 0
        {
            inner.trials_admitted -= 1;
        }
    }
}

/// An admitted call that has not reported its outcome yet.
///
/// Settle it with [`record_success`](Self::record_success) or
/// [`record_failure`](Self::record_failure). Dropping it unsettled leaves the
/// circuit state untouched and returns a half-open trial slot.
#[derive(Debug)]
pub struct BreakerPermit<'a> {
    breaker: &'a CircuitBreaker,
    episode: u64,
    trial: bool,
    settled: bool,
}

impl BreakerPermit<'_> {
    /// Whether this call is a half-open trial.
    pub fn is_trial(&self) -> bool {
        self.trial
    }

    pub fn record_success(mut self, latency: Duration) {
        self.settled = true;
        self.breaker.settle(Some(self.episode), Ok(Some(latency)));
    }

    pub fn record_failure(mut self, message: impl Into<String>, latency: Duration) {
        self.settled = true;
        self.breaker
            .settle(Some(self.episode), Err((message.into(), Some(latency))));
    }
}

impl Drop for BreakerPermit<'_> {
    fn drop(&mut self) {
        if !self.settled && self.trial {
            self.breaker.release_episode(self.episode);
        }
    }
}
