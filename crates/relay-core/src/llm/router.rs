//! Multi-provider request router.
//!
//! Routes a request through the caller's candidate providers in order. For
//! each candidate the router checks the wall-clock budget, asks the circuit
//! breaker and then the rate budget for admission, calls the provider, and
//! lets the retry policy decide between retrying, falling back and aborting.
//! A request fails only when every candidate gave up, the budget ran out,
//! the caller cancelled, or a provider rejected the request as malformed.

use std::borrow::Cow;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;
use uuid::Uuid;

use relay_types::config::RouterConfig;
use relay_types::llm::{
    CompletionRequest, CompletionResponse, ErrorClass, LlmError, ProviderStatusInfo, Usage,
};
use relay_types::routing::{
    AggregatedError, CallAttempt, CallOutcome, CallOutcomeEvent, FailureCause, ProviderFailure,
    TerminalReason,
};

use super::backoff::RetryDecision;
use super::metrics::MetricsRecorder;
use super::registry::{ProviderEntry, ProviderRegistry};

/// A request plus the caller's routing constraints.
#[derive(Debug, Clone)]
pub struct RequestContext {
    /// Correlates log lines and metric events for one routed request.
    pub request_id: Uuid,
    pub request: CompletionRequest,
    /// Providers to try, in order. The router never reorders them; a name
    /// listed twice is only tried at its first position.
    pub candidates: Vec<String>,
    /// Overrides each provider's configured `max_attempts_per_provider`.
    pub max_attempts_per_provider: Option<u32>,
    /// Wall-clock budget for the whole request.
    pub total_timeout: Option<Duration>,
    /// Upper bound for a single provider call.
    pub per_call_timeout: Option<Duration>,
    pub cancel: CancellationToken,
}

impl RequestContext {
    pub fn new<I, S>(request: CompletionRequest, candidates: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            request_id: Uuid::now_v7(),
            request,
            candidates: candidates.into_iter().map(Into::into).collect(),
            max_attempts_per_provider: None,
            total_timeout: None,
            per_call_timeout: None,
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts_per_provider = Some(max_attempts);
        self
    }

    pub fn with_total_timeout(mut self, timeout: Duration) -> Self {
        self.total_timeout = Some(timeout);
        self
    }

    pub fn with_per_call_timeout(mut self, timeout: Duration) -> Self {
        self.per_call_timeout = Some(timeout);
        self
    }

    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }
}

/// Result of a successfully routed request.
#[derive(Debug)]
pub struct RouteResult {
    pub response: CompletionResponse,
    /// Name of the provider that served the request.
    pub provider: String,
    /// Every attempt made or skipped, in order, ending with the success.
    pub attempts: Vec<CallAttempt>,
    /// Set when a provider other than the first candidate served the request.
    pub failover_warning: Option<String>,
}

/// How one candidate ended.
enum Verdict {
    Served(CompletionResponse),
    Next(TerminalReason),
    Abort(FailureCause, TerminalReason),
}

/// Attempts and per-provider failures collected while routing one request.
struct RouteRun<'a> {
    request_id: Uuid,
    recorder: &'a dyn MetricsRecorder,
    attempts: Vec<CallAttempt>,
    failures: Vec<ProviderFailure>,
}

impl RouteRun<'_> {
    fn record(
        &mut self,
        provider: &str,
        attempt: u32,
        started_at: Instant,
        outcome: CallOutcome,
        latency: Duration,
        detail: Option<String>,
    ) {
        self.record_with_usage(provider, attempt, started_at, outcome, latency, detail, None);
    }

    #[allow(clippy::too_many_arguments)]
    fn record_with_usage(
        &mut self,
        provider: &str,
        attempt: u32,
        started_at: Instant,
        outcome: CallOutcome,
        latency: Duration,
        detail: Option<String>,
        usage: Option<Usage>,
    ) {
        self.recorder.record(CallOutcomeEvent {
            request_id: self.request_id,
            provider: provider.to_string(),
            outcome,
            latency,
            timestamp: Utc::now(),
            usage,
        });
        self.attempts.push(CallAttempt {
            provider: provider.to_string(),
            attempt,
            started_at,
            outcome,
            latency,
            detail,
        });
    }

    fn give_up(&mut self, provider: &str, reason: TerminalReason, attempts: u32) {
        self.failures.push(ProviderFailure {
            provider: provider.to_string(),
            reason,
            attempts,
        });
    }

    fn into_error(self, cause: FailureCause) -> AggregatedError {
        AggregatedError {
            cause,
            failures: self.failures,
            attempts: self.attempts,
        }
    }
}

/// Routes requests across the providers of a [`ProviderRegistry`].
///
/// `route` takes `&self`; share the router behind an `Arc` to serve
/// concurrent requests.
pub struct Router {
    registry: ProviderRegistry,
    recorder: Arc<dyn MetricsRecorder>,
    default_total_timeout: Duration,
    default_per_call_timeout: Duration,
    max_retry_after: Duration,
}

impl Router {
    pub fn new(registry: ProviderRegistry, recorder: Arc<dyn MetricsRecorder>) -> Self {
        let defaults = RouterConfig::default();
        Self {
            registry,
            recorder,
            default_total_timeout: defaults.default_total_timeout(),
            default_per_call_timeout: defaults.default_per_call_timeout(),
            max_retry_after: defaults.max_retry_after(),
        }
    }

    /// Apply router-level timeouts from configuration.
    pub fn with_config(mut self, config: &RouterConfig) -> Self {
        self.default_total_timeout = config.default_total_timeout();
        self.default_per_call_timeout = config.default_per_call_timeout();
        self.max_retry_after = config.max_retry_after();
        self
    }

    pub fn registry(&self) -> &ProviderRegistry {
        &self.registry
    }

    /// Health of every registered provider (for status display).
    pub fn health_status(&self) -> Vec<ProviderStatusInfo> {
        self.registry.status()
    }

    /// Close the provider's circuit and refill its rate budget.
    ///
    /// Returns `false` if no provider has that name.
    pub fn reset_provider(&self, name: &str) -> bool {
        match self.registry.get(name) {
            Some(entry) => {
                entry.breaker.reset();
                entry.limiter.reset();
                true
            }
            None => false,
        }
    }

    /// Route a request through its candidate providers.
    pub async fn route(&self, ctx: RequestContext) -> Result<RouteResult, AggregatedError> {
        // Name must match relay_observe::relay_attrs::SPAN_ROUTE.
        let span = tracing::info_span!(
            "relay.route",
            request_id = %ctx.request_id,
            candidates = ctx.candidates.len(),
        );
        self.route_inner(ctx).instrument(span).await
    }

    async fn route_inner(&self, ctx: RequestContext) -> Result<RouteResult, AggregatedError> {
        let mut run = RouteRun {
            request_id: ctx.request_id,
            recorder: self.recorder.as_ref(),
            attempts: Vec::new(),
            failures: Vec::new(),
        };

        if ctx.candidates.is_empty() {
            return Err(run.into_error(FailureCause::NoCandidates));
        }

        let budget = ctx.total_timeout.unwrap_or(self.default_total_timeout);
        let deadline = self.registry.clock().now().checked_add(budget);

        let mut seen = HashSet::new();
        for (index, name) in ctx.candidates.iter().enumerate() {
            if !seen.insert(name.as_str()) {
                tracing::debug!(provider = %name, "Duplicate candidate, skipping");
                continue;
            }
            let Some(entry) = self.registry.get(name) else {
                tracing::warn!(provider = %name, "Unknown provider in candidate list, skipping");
                run.give_up(name, TerminalReason::UnknownProvider, 0);
                continue;
            };

            let (verdict, calls) = self.try_provider(entry, &ctx, deadline, &mut run).await;
            match verdict {
                Verdict::Served(response) => {
                    let failover_warning =
                        (index > 0).then(|| self.failover_warning(&ctx.candidates[0], entry));
                    if let Some(ref warning) = failover_warning {
                        tracing::warn!(%warning, "Failover occurred");
                    }
                    return Ok(RouteResult {
                        response,
                        provider: name.clone(),
                        attempts: run.attempts,
                        failover_warning,
                    });
                }
                Verdict::Next(reason) => {
                    tracing::warn!(
                        provider = %name,
                        reason = %reason,
                        attempts = calls,
                        "Provider failed, trying next candidate"
                    );
                    run.give_up(name, reason, calls);
                }
                Verdict::Abort(cause, reason) => {
                    tracing::error!(provider = %name, reason = %reason, %cause, "Request aborted");
                    run.give_up(name, reason, calls);
                    return Err(run.into_error(cause));
                }
            }
        }

        Err(run.into_error(FailureCause::Exhausted))
    }

    /// Drive one candidate until it serves the request or gives up.
    ///
    /// Returns the verdict and the number of calls that reached the provider.
    async fn try_provider(
        &self,
        entry: &ProviderEntry,
        ctx: &RequestContext,
        deadline: Option<Instant>,
        run: &mut RouteRun<'_>,
    ) -> (Verdict, u32) {
        let clock = self.registry.clock();
        let name = entry.config.name.as_str();
        let policy = entry.backoff.with_max_attempts(ctx.max_attempts_per_provider);
        let per_call_timeout = ctx.per_call_timeout.unwrap_or(self.default_per_call_timeout);

        let request = if ctx.request.model.is_empty() {
            Cow::Owned(CompletionRequest {
                model: entry.config.model.clone(),
                ..ctx.request.clone()
            })
        } else {
            Cow::Borrowed(&ctx.request)
        };

        let mut calls = 0u32;
        loop {
            if ctx.cancel.is_cancelled() {
                return (Verdict::Abort(FailureCause::Cancelled, TerminalReason::Cancelled), calls);
            }

            let now = clock.now();
            let remaining = deadline.map_or(Duration::MAX, |d| d.saturating_duration_since(now));
            if remaining.is_zero() {
                return (Verdict::Abort(FailureCause::Timeout, TerminalReason::Timeout), calls);
            }

            let attempt = calls + 1;
            let Some(permit) = entry.breaker.try_acquire() else {
                tracing::debug!(provider = %name, "Circuit open, skipping");
                run.record(name, attempt, now, CallOutcome::CircuitOpen, Duration::ZERO, None);
                return (Verdict::Next(TerminalReason::CircuitOpen), calls);
            };

            if !entry.limiter.try_acquire() {
                // No call is made, so a trial slot goes back unused.
                drop(permit);
                tracing::debug!(provider = %name, "Rate budget exhausted, skipping");
                run.record(name, attempt, now, CallOutcome::RateLimited, Duration::ZERO, None);
                return (Verdict::Next(TerminalReason::RateLimited), calls);
            }

            let call_timeout = per_call_timeout.min(remaining);
            let started = clock.now();
            let result = tokio::select! {
                biased;
                _ = ctx.cancel.cancelled() => None,
                result = tokio::time::timeout(
                    call_timeout,
                    entry.provider.invoke(&request, call_timeout),
                ) => Some(result),
            };
            let latency = clock.now().saturating_duration_since(started);

            let result = match result {
                None => {
                    // The provider never answered, so the breaker learns nothing.
                    drop(permit);
                    calls += 1;
                    run.record(
                        name,
                        attempt,
                        started,
                        CallOutcome::Cancelled,
                        latency,
                        Some("cancelled".to_string()),
                    );
                    return (Verdict::Abort(FailureCause::Cancelled, TerminalReason::Cancelled), calls);
                }
                Some(Ok(result)) => result,
                Some(Err(_elapsed)) => Err(LlmError::Timeout {
                    elapsed_ms: call_timeout.as_millis() as u64,
                }),
            };
            calls += 1;

            let err = match result {
                Ok(response) => {
                    permit.record_success(latency);
                    entry.limiter.record_outcome(true);
                    run.record_with_usage(
                        name,
                        attempt,
                        started,
                        CallOutcome::Success,
                        latency,
                        None,
                        Some(response.usage),
                    );
                    tracing::debug!(
                        provider = %name,
                        attempt,
                        latency_ms = latency.as_millis() as u64,
                        "Provider call succeeded"
                    );
                    return (Verdict::Served(response), calls);
                }
                Err(err) => err,
            };

            let class = err.class();
            let message = err.to_string();
            let outcome = match class {
                ErrorClass::Recoverable => CallOutcome::RecoverableError,
                ErrorClass::RateLimited => CallOutcome::RateLimited,
                ErrorClass::ProviderFatal | ErrorClass::RequestFatal => CallOutcome::FatalError,
            };

            if class == ErrorClass::RequestFatal {
                // The provider is healthy; the request is not.
                drop(permit);
            } else {
                permit.record_failure(message.clone(), latency);
                entry.limiter.record_outcome(false);
            }
            if let LlmError::RateLimited { retry_after_ms } = err {
                let wait = retry_after_ms
                    .map(Duration::from_millis)
                    .unwrap_or(self.max_retry_after)
                    .min(self.max_retry_after);
                entry.limiter.penalize(wait);
            }
            run.record(name, attempt, started, outcome, latency, Some(message.clone()));

            match policy.decide(class, calls) {
                RetryDecision::Abort => {
                    return (
                        Verdict::Abort(
                            FailureCause::InvalidRequest,
                            TerminalReason::InvalidRequest(message),
                        ),
                        calls,
                    );
                }
                RetryDecision::NextProvider => {
                    let reason = match class {
                        ErrorClass::RateLimited => TerminalReason::RateLimited,
                        ErrorClass::ProviderFatal => TerminalReason::Fatal(message),
                        _ => TerminalReason::RetriesExhausted(message),
                    };
                    return (Verdict::Next(reason), calls);
                }
                RetryDecision::RetrySameProvider(delay) => {
                    let now = clock.now();
                    if let Some(deadline) = deadline {
                        if now >= deadline {
                            return (Verdict::Abort(FailureCause::Timeout, TerminalReason::Timeout), calls);
                        }
                        if now.checked_add(delay).is_none_or(|wake| wake >= deadline) {
                            tracing::debug!(
                                provider = %name,
                                delay_ms = delay.as_millis() as u64,
                                "Backoff would exceed request budget, giving up on provider"
                            );
                            return (Verdict::Next(TerminalReason::RetriesExhausted(message)), calls);
                        }
                    }

                    tracing::debug!(
                        provider = %name,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %message,
                        "Retrying after backoff"
                    );
                    tokio::select! {
                        biased;
                        _ = ctx.cancel.cancelled() => {
                            return (Verdict::Abort(FailureCause::Cancelled, TerminalReason::Cancelled), calls);
                        }
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
            }
        }
    }

    fn failover_warning(&self, primary: &str, used: &ProviderEntry) -> String {
        let mut parts = vec![format!("Switched to {}", used.config.name)];
        if let Some(primary) = self.registry.get(primary) {
            let pc = &primary.config.capabilities;
            let uc = &used.config.capabilities;
            if uc.max_context_tokens < pc.max_context_tokens
                || uc.max_output_tokens < pc.max_output_tokens
            {
                parts.push("Running on a smaller model -- responses may be less detailed".to_string());
            }
            if primary.config.cost_score > 0.0 {
                let ratio = used.config.cost_score / primary.config.cost_score;
                if ratio > 1.0 {
                    parts.push(format!(
                        "Note: {} costs ~{ratio:.1}x more than {}",
                        used.config.name, primary.config.name
                    ));
                }
            }
        }
        parts.join(". ")
    }
}

impl std::fmt::Debug for Router {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Router")
            .field("providers", &self.registry.list_names())
            .field("default_total_timeout", &self.default_total_timeout)
            .field("default_per_call_timeout", &self.default_per_call_timeout)
            .finish()
    }
}
