//! Per-request routing records: call attempts, outcome events, and the
//! aggregated failure returned when no candidate provider could serve a request.

use std::fmt;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::llm::Usage;

/// Outcome of one attempt against one provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallOutcome {
    Success,
    RecoverableError,
    FatalError,
    /// Refused by the local rate budget or by the provider itself. No retry.
    RateLimited,
    /// Refused by the circuit breaker. No call was made.
    CircuitOpen,
    /// The caller cancelled the request while this call was in flight.
    Cancelled,
}

impl fmt::Display for CallOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CallOutcome::Success => write!(f, "success"),
            CallOutcome::RecoverableError => write!(f, "recoverable_error"),
            CallOutcome::FatalError => write!(f, "fatal_error"),
            CallOutcome::RateLimited => write!(f, "rate_limited"),
            CallOutcome::CircuitOpen => write!(f, "circuit_open"),
            CallOutcome::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// Ephemeral record of one attempt, kept for the lifetime of a request.
#[derive(Debug, Clone)]
pub struct CallAttempt {
    pub provider: String,
    /// 1-based attempt number on this provider within the request.
    pub attempt: u32,
    pub started_at: Instant,
    pub outcome: CallOutcome,
    pub latency: Duration,
    /// Error message for failed attempts.
    pub detail: Option<String>,
}

/// Fire-and-forget event emitted to the metrics collaborator after each attempt.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallOutcomeEvent {
    pub request_id: Uuid,
    pub provider: String,
    pub outcome: CallOutcome,
    pub latency: Duration,
    pub timestamp: DateTime<Utc>,
    /// Token usage reported by the provider, present on successful calls.
    #[serde(default)]
    pub usage: Option<Usage>,
}

/// Why a provider was given up on within one request.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TerminalReason {
    #[error("retries exhausted ({0})")]
    RetriesExhausted(String),

    #[error("fatal error ({0})")]
    Fatal(String),

    #[error("rate limited")]
    RateLimited,

    #[error("circuit open")]
    CircuitOpen,

    #[error("request budget timed out")]
    Timeout,

    #[error("invalid request ({0})")]
    InvalidRequest(String),

    #[error("unknown provider")]
    UnknownProvider,

    #[error("cancelled")]
    Cancelled,
}

/// Terminal result for one provider within a failed request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderFailure {
    pub provider: String,
    pub reason: TerminalReason,
    /// Provider calls actually made (skips are not counted).
    pub attempts: u32,
}

/// Why the request as a whole failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureCause {
    /// Every candidate was tried and gave up.
    Exhausted,
    /// The wall-clock budget ran out.
    Timeout,
    /// The caller's cancellation signal fired.
    Cancelled,
    /// A provider rejected the request as malformed; no other provider was tried.
    InvalidRequest,
    /// The request named no candidate providers.
    NoCandidates,
}

impl fmt::Display for FailureCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailureCause::Exhausted => write!(f, "all providers exhausted"),
            FailureCause::Timeout => write!(f, "request timed out"),
            FailureCause::Cancelled => write!(f, "request cancelled"),
            FailureCause::InvalidRequest => write!(f, "request rejected as invalid"),
            FailureCause::NoCandidates => write!(f, "no candidate providers supplied"),
        }
    }
}

/// Final failure of a routed request, with a terminal reason per provider.
#[derive(Debug, Clone, thiserror::Error)]
#[error("{cause}: {}", summarize(.failures))]
pub struct AggregatedError {
    pub cause: FailureCause,
    /// One entry per provider considered, in candidate order.
    pub failures: Vec<ProviderFailure>,
    /// Every attempt made or skipped, in the order it happened.
    pub attempts: Vec<CallAttempt>,
}

impl AggregatedError {
    /// Terminal reason recorded for the named provider, if it was considered.
    pub fn reason_for(&self, provider: &str) -> Option<&TerminalReason> {
        self.failures
            .iter()
            .find(|f| f.provider == provider)
            .map(|f| &f.reason)
    }

    pub fn is_cancelled(&self) -> bool {
        self.cause == FailureCause::Cancelled
    }

    pub fn is_timeout(&self) -> bool {
        self.cause == FailureCause::Timeout
    }
}

fn summarize(failures: &[ProviderFailure]) -> String {
    if failures.is_empty() {
        return "no provider was attempted".to_string();
    }
    failures
        .iter()
        .map(|f| format!("{}: {}", f.provider, f.reason))
        .collect::<Vec<_>>()
        .join("; ")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn failure(provider: &str, reason: TerminalReason) -> ProviderFailure {
        ProviderFailure {
            provider: provider.to_string(),
            reason,
            attempts: 0,
        }
    }

    #[test]
    fn test_aggregated_error_lists_every_provider() {
        let err = AggregatedError {
            cause: FailureCause::Exhausted,
            failures: vec![
                failure("a", TerminalReason::Fatal("authentication failed".to_string())),
                failure("b", TerminalReason::CircuitOpen),
                failure("c", TerminalReason::RateLimited),
            ],
            attempts: Vec::new(),
        };
        let msg = err.to_string();
        assert_eq!(
            msg,
            "all providers exhausted: a: fatal error (authentication failed); b: circuit open; c: rate limited"
        );
        assert_eq!(err.reason_for("b"), Some(&TerminalReason::CircuitOpen));
        assert!(err.reason_for("z").is_none());
    }

    #[test]
    fn test_aggregated_error_without_failures_is_still_descriptive() {
        let err = AggregatedError {
            cause: FailureCause::NoCandidates,
            failures: Vec::new(),
            attempts: Vec::new(),
        };
        assert_eq!(
            err.to_string(),
            "no candidate providers supplied: no provider was attempted"
        );
    }

    #[test]
    fn test_cause_predicates() {
        let err = AggregatedError {
            cause: FailureCause::Cancelled,
            failures: Vec::new(),
            attempts: Vec::new(),
        };
        assert!(err.is_cancelled());
        assert!(!err.is_timeout());
    }

    #[test]
    fn test_call_outcome_serde() {
        let json = serde_json::to_string(&CallOutcome::CircuitOpen).unwrap();
        assert_eq!(json, "\"circuit_open\"");
    }
}
