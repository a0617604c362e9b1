//! Recorders that export call outcome events as logs and OpenTelemetry spans.

use std::time::SystemTime;

use opentelemetry::KeyValue;
use opentelemetry::global::BoxedTracer;
use opentelemetry::trace::{Span, SpanKind, Status, Tracer};

use relay_core::llm::metrics::MetricsRecorder;
use relay_types::routing::{CallOutcome, CallOutcomeEvent};

use crate::relay_attrs::{
    GEN_AI_OPERATION_NAME, GEN_AI_PROVIDER_NAME, GEN_AI_USAGE_INPUT_TOKENS,
    GEN_AI_USAGE_OUTPUT_TOKENS, OP_CHAT, RELAY_CALL_DISPATCHED, RELAY_CALL_LATENCY_MS,
    RELAY_CALL_OUTCOME, RELAY_REQUEST_ID, SPAN_CALL,
};

fn dispatched(outcome: CallOutcome) -> bool {
    !matches!(outcome, CallOutcome::RateLimited | CallOutcome::CircuitOpen)
}

/// Logs one structured event per call outcome.
///
/// Successes and skips log at `debug`, provider errors at `warn`.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingRecorder;

impl MetricsRecorder for TracingRecorder {
    fn record(&self, event: CallOutcomeEvent) {
        let latency_ms = event.latency.as_millis() as u64;
        match event.outcome {
            CallOutcome::RecoverableError | CallOutcome::FatalError => tracing::warn!(
                target: "relay::outcome",
                request_id = %event.request_id,
                provider = %event.provider,
                outcome = %event.outcome,
                latency_ms,
                "Provider call failed"
            ),
            _ => tracing::debug!(
                target: "relay::outcome",
                request_id = %event.request_id,
                provider = %event.provider,
                outcome = %event.outcome,
                latency_ms,
                "Provider call recorded"
            ),
        }
    }
}

/// OTel attributes describing one outcome event.
pub fn outcome_attributes(event: &CallOutcomeEvent) -> Vec<KeyValue> {
    let mut attrs = vec![
        KeyValue::new(GEN_AI_OPERATION_NAME, OP_CHAT),
        KeyValue::new(GEN_AI_PROVIDER_NAME, event.provider.clone()),
        KeyValue::new(RELAY_REQUEST_ID, event.request_id.to_string()),
        KeyValue::new(RELAY_CALL_OUTCOME, event.outcome.to_string()),
        KeyValue::new(
            RELAY_CALL_LATENCY_MS,
            i64::try_from(event.latency.as_millis()).unwrap_or(i64::MAX),
        ),
        KeyValue::new(RELAY_CALL_DISPATCHED, dispatched(event.outcome)),
    ];
    if let Some(usage) = event.usage {
        attrs.push(KeyValue::new(
            GEN_AI_USAGE_INPUT_TOKENS,
            i64::from(usage.input_tokens),
        ));
        attrs.push(KeyValue::new(
            GEN_AI_USAGE_OUTPUT_TOKENS,
            i64::from(usage.output_tokens),
        ));
    }
    attrs
}

/// Exports each outcome event as a client span on an OpenTelemetry tracer.
///
/// The span ends at the event timestamp and starts `latency` earlier.
/// `record` runs on the routing path, so the tracer should sit on a batch
/// span processor such as the one built by
/// [`batch_tracer_provider`](crate::tracing_setup::batch_tracer_provider);
/// with a simple processor every call waits for the exporter.
pub struct OtelRecorder<T = BoxedTracer> {
    tracer: T,
}

impl OtelRecorder<BoxedTracer> {
    /// Record on the globally installed tracer provider.
    pub fn global() -> Self {
        Self {
            tracer: opentelemetry::global::tracer("relay"),
        }
    }
}

impl<T: Tracer> OtelRecorder<T> {
    pub fn with_tracer(tracer: T) -> Self {
        Self { tracer }
    }
}

impl<T> MetricsRecorder for OtelRecorder<T>
where
    T: Tracer + Send + Sync,
{
    fn record(&self, event: CallOutcomeEvent) {
        let end = SystemTime::from(event.timestamp);
        let start = end.checked_sub(event.latency).unwrap_or(end);

        let mut span = self
            .tracer
            .span_builder(SPAN_CALL)
            .with_kind(SpanKind::Client)
            .with_start_time(start)
            .with_attributes(outcome_attributes(&event))
            .start(&self.tracer);

        match event.outcome {
            CallOutcome::Success => span.set_status(Status::Ok),
            other => span.set_status(Status::error(other.to_string())),
        }
        span.end_with_timestamp(end);
    }
}

impl<T> std::fmt::Debug for OtelRecorder<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OtelRecorder").finish_non_exhaustive()
    }
}
