//! Fire-and-forget sinks for per-call outcome events.
//!
//! The router emits one [`CallOutcomeEvent`] per attempt (calls and skips
//! alike). Recorders must never block the routing path.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::broadcast;

use relay_types::routing::{CallOutcome, CallOutcomeEvent};

/// Sink for call outcome events.
pub trait MetricsRecorder: Send + Sync {
    fn record(&self, event: CallOutcomeEvent);
}

/// Discards every event.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopRecorder;

impl MetricsRecorder for NoopRecorder {
    fn record(&self, _event: CallOutcomeEvent) {}
}

/// Publishes events on a broadcast channel.
///
/// Publishing with no active subscribers is a no-op; slow subscribers see
/// `Lagged` instead of slowing the router down.
pub struct BroadcastRecorder {
    sender: broadcast::Sender<CallOutcomeEvent>,
    capacity: usize,
}

impl BroadcastRecorder {
    /// Channel buffering up to `capacity` events per subscriber (minimum 1).
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let (sender, _) = broadcast::channel(capacity);
        Self { sender, capacity }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn subscribe(&self) -> broadcast::Receiver<CallOutcomeEvent> {
        self.sender.subscribe()
    }
}

impl MetricsRecorder for BroadcastRecorder {
    fn record(&self, event: CallOutcomeEvent) {
        let _ = self.sender.send(event);
    }
}

impl Clone for BroadcastRecorder {
    fn clone(&self) -> Self {
        Self {
            sender: self.sender.clone(),
            capacity: self.capacity,
        }
    }
}

impl std::fmt::Debug for BroadcastRecorder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BroadcastRecorder")
            .field("capacity", &self.capacity)
            .field("receiver_count", &self.sender.receiver_count())
            .finish()
    }
}

/// Forwards every event to each inner recorder, in order.
#[derive(Default)]
pub struct FanoutRecorder {
    recorders: Vec<Arc<dyn MetricsRecorder>>,
}

impl FanoutRecorder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, recorder: Arc<dyn MetricsRecorder>) -> Self {
        self.recorders.push(recorder);
        self
    }

    pub fn len(&self) -> usize {
        self.recorders.len()
    }

    pub fn is_empty(&self) -> bool {
        self.recorders.is_empty()
    }
}

impl MetricsRecorder for FanoutRecorder {
    fn record(&self, event: CallOutcomeEvent) {
        let Some((last, rest)) = self.recorders.split_last() else {
            return;
        };
        for recorder in rest {
            recorder.record(event.clone());
        }
        last.record(event);
    }
}

impl std::fmt::Debug for FanoutRecorder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FanoutRecorder")
            .field("recorders", &self.recorders.len())
            .finish()
    }
}

/// Aggregated counters for one provider.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OutcomeStats {
    pub successes: u64,
    pub recoverable_errors: u64,
    pub fatal_errors: u64,
    pub rate_limited: u64,
    pub circuit_open: u64,
    /// Calls abandoned in flight because the caller cancelled.
    pub cancelled: u64,
    /// Summed latency of calls that reached the provider.
    pub total_latency: Duration,
    pub input_tokens: u64,
    pub output_tokens: u64,
}

impl OutcomeStats {
    /// Attempts that reached the provider.
    pub fn calls(&self) -> u64 {
        self.successes + self.recoverable_errors + self.fatal_errors + self.cancelled
    }

    pub fn total_tokens(&self) -> u64 {
        self.input_tokens + self.output_tokens
    }

    pub fn avg_latency(&self) -> Option<Duration> {
        let calls = u32::try_from(self.calls()).ok().filter(|c| *c > 0)?;
        Some(self.total_latency / calls)
    }

    fn apply(&mut self, event: &CallOutcomeEvent) {
        match event.outcome {
            CallOutcome::Success => self.successes += 1,
            CallOutcome::RecoverableError => self.recoverable_errors += 1,
            CallOutcome::FatalError => self.fatal_errors += 1,
            CallOutcome::RateLimited => self.rate_limited += 1,
            CallOutcome::CircuitOpen => self.circuit_open += 1,
            CallOutcome::Cancelled => self.cancelled += 1,
        }
        if !matches!(event.outcome, CallOutcome::RateLimited | CallOutcome::CircuitOpen) {
            self.total_latency += event.latency;
        }
        if let Some(usage) = event.usage {
            self.input_tokens += u64::from(usage.input_tokens);
            self.output_tokens += u64::from(usage.output_tokens);
        }
    }
}

/// In-process per-provider counters.
#[derive(Debug, Default)]
pub struct StatsRecorder {
    stats: DashMap<String, OutcomeStats>,
}

impl StatsRecorder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Counters recorded for `provider` so far.
    pub fn snapshot(&self, provider: &str) -> Option<OutcomeStats> {
        self.stats.get(provider).map(|s| s.clone())
    }

    /// Providers with at least one recorded event, sorted by name.
    pub fn providers(&self) -> Vec<String> {
        let mut names: Vec<String> = self.stats.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }
}

impl MetricsRecorder for StatsRecorder {
    fn record(&self, event: CallOutcomeEvent) {
        self.stats
            .entry(event.provider.clone())
            .or_default()
            .apply(&event);
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;
    use relay_types::llm::Usage;
    use uuid::Uuid;

    use super::*;

    fn event(provider: &str, outcome: CallOutcome, latency_ms: u64) -> CallOutcomeEvent {
        CallOutcomeEvent {
            request_id: Uuid::now_v7(),
            provider: provider.to_string(),
            outcome,
            latency: Duration::from_millis(latency_ms),
            timestamp: Utc::now(),
            usage: None,
        }
    }

    #[tokio::test]
    async fn broadcast_delivers_to_subscriber() {
        let recorder = BroadcastRecorder::new(16);
        let mut rx = recorder.subscribe();

        recorder.record(event("a", CallOutcome::Success, 12));

        let received = rx.recv().await.unwrap();
        assert_eq!(received.provider, "a");
        assert_eq!(received.outcome, CallOutcome::Success);
    }

    #[test]
    fn broadcast_without_subscribers_does_not_panic() {
        let recorder = BroadcastRecorder::new(1);
        for _ in 0..10 {
            recorder.record(event("a", CallOutcome::FatalError, 1));
        }
    }

    #[test]
    fn broadcast_lagging_subscriber_is_not_blocking() {
        let recorder = BroadcastRecorder::new(2);
        let mut rx = recorder.subscribe();
        for i in 0..10 {
            recorder.record(event("a", CallOutcome::Success, i));
        }
        assert!(matches!(
            rx.try_recv(),
            Err(broadcast::error::TryRecvError::Lagged(_))
        ));
    }

    #[test]
    fn stats_recorder_counts_per_provider() {
        let recorder = StatsRecorder::new();
        recorder.record(event("a", CallOutcome::Success, 100));
        recorder.record(event("a", CallOutcome::RecoverableError, 300));
        recorder.record(event("a", CallOutcome::CircuitOpen, 0));
        recorder.record(event("b", CallOutcome::RateLimited, 0));

        let a = recorder.snapshot("a").unwrap();
        assert_eq!(a.successes, 1);
        assert_eq!(a.recoverable_errors, 1);
        assert_eq!(a.circuit_open, 1);
        assert_eq!(a.calls(), 2);
        assert_eq!(a.avg_latency(), Some(Duration::from_millis(200)));

        let b = recorder.snapshot("b").unwrap();
        assert_eq!(b.rate_limited, 1);
        assert_eq!(b.avg_latency(), None);

        assert_eq!(recorder.providers(), vec!["a", "b"]);
        assert!(recorder.snapshot("c").is_none());
    }

    #[test]
    fn stats_recorder_accumulates_token_usage() {
        let recorder = StatsRecorder::new();
        for (input, output) in [(120, 30), (80, 20)] {
            recorder.record(CallOutcomeEvent {
                usage: Some(Usage {
                    input_tokens: input,
                    output_tokens: output,
                }),
                ..event("a", CallOutcome::Success, 10)
            });
        }
        recorder.record(event("a", CallOutcome::RecoverableError, 10));

        let a = recorder.snapshot("a").unwrap();
        assert_eq!(a.input_tokens, 200);
        assert_eq!(a.output_tokens, 50);
        assert_eq!(a.total_tokens(), 250);
    }

    #[test]
    fn stats_recorder_counts_cancelled_calls_as_dispatched() {
        let recorder = StatsRecorder::new();
        recorder.record(event("a", CallOutcome::Cancelled, 40));

        let a = recorder.snapshot("a").unwrap();
        assert_eq!(a.cancelled, 1);
        assert_eq!(a.calls(), 1);
        assert_eq!(a.avg_latency(), Some(Duration::from_millis(40)));
    }

    #[test]
    fn broadcast_reports_its_capacity() {
        assert_eq!(BroadcastRecorder::new(64).capacity(), 64);
        assert_eq!(BroadcastRecorder::new(0).capacity(), 1);
        assert_eq!(BroadcastRecorder::new(8).clone().capacity(), 8);
    }

    #[test]
    fn noop_recorder_accepts_events() {
        NoopRecorder.record(event("a", CallOutcome::Success, 1));
    }

    #[test]
    fn fanout_feeds_every_recorder() {
        let first = Arc::new(StatsRecorder::new());
        let second = Arc::new(StatsRecorder::new());
        let fanout = FanoutRecorder::new()
            .with(first.clone())
            .with(Arc::new(NoopRecorder))
            .with(second.clone());
        assert_eq!(fanout.len(), 3);

        fanout.record(event("a", CallOutcome::Success, 5));

        assert_eq!(first.snapshot("a").unwrap().successes, 1);
        assert_eq!(second.snapshot("a").unwrap().successes, 1);
        FanoutRecorder::new().record(event("a", CallOutcome::Success, 5));
    }
}
