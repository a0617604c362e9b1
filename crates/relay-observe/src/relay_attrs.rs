//! Attribute and span name constants for router telemetry.
//!
//! Names follow the OTel GenAI Semantic Conventions where one exists and use
//! a `relay.` prefix otherwise.

// --- Span names ---

/// Span wrapping one routed request, opened by `Router::route`.
pub const SPAN_ROUTE: &str = "relay.route";

/// Span exported for one provider call (or skip).
pub const SPAN_CALL: &str = "relay.call";

// --- GenAI attributes ---

/// The name of the operation being performed.
pub const GEN_AI_OPERATION_NAME: &str = "gen_ai.operation.name";

/// The name of the GenAI provider (the router-facing provider name).
pub const GEN_AI_PROVIDER_NAME: &str = "gen_ai.provider.name";

/// Prompt tokens consumed by a successful call.
pub const GEN_AI_USAGE_INPUT_TOKENS: &str = "gen_ai.usage.input_tokens";

/// Completion tokens produced by a successful call.
pub const GEN_AI_USAGE_OUTPUT_TOKENS: &str = "gen_ai.usage.output_tokens";

// --- Router attributes ---

/// Router-assigned request identifier (UUID v7).
pub const RELAY_REQUEST_ID: &str = "relay.request.id";

/// Outcome of a call: `success`, `recoverable_error`, `fatal_error`,
/// `rate_limited`, `circuit_open` or `cancelled`.
pub const RELAY_CALL_OUTCOME: &str = "relay.call.outcome";

/// Wall-clock latency of the call in milliseconds. Zero for skips.
pub const RELAY_CALL_LATENCY_MS: &str = "relay.call.latency_ms";

/// Whether the call reached the provider (false for breaker and rate-budget skips).
pub const RELAY_CALL_DISPATCHED: &str = "relay.call.dispatched";

// --- Operation name values ---

/// Chat completion operation.
pub const OP_CHAT: &str = "chat";

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use tracing::Subscriber;
    use tracing::span;
    use tracing_subscriber::Layer;
    use tracing_subscriber::layer::{Context, SubscriberExt};

    use relay_core::llm::metrics::NoopRecorder;
    use relay_core::llm::registry::ProviderRegistry;
    use relay_core::llm::router::{RequestContext, Router};
    use relay_types::llm::CompletionRequest;

    use super::*;

    #[derive(Clone, Default)]
    struct SpanNames(Arc<Mutex<Vec<&'static str>>>);

    impl<S: Subscriber> Layer<S> for SpanNames {
        fn on_new_span(&self, attrs: &span::Attributes<'_>, _id: &span::Id, _ctx: Context<'_, S>) {
            self.0.lock().unwrap().push(attrs.metadata().name());
        }
    }

    #[tokio::test(flavor = "current_thread")]
    async fn test_router_opens_route_span_by_this_name() {
        let names = SpanNames::default();
        let subscriber = tracing_subscriber::registry().with(names.clone());
        let _guard = tracing::subscriber::set_default(subscriber);

        let router = Router::new(ProviderRegistry::new(), Arc::new(NoopRecorder));
        let candidates: [&str; 0] = [];
        let _ = router
            .route(RequestContext::new(CompletionRequest::default(), candidates))
            .await;

        assert!(names.0.lock().unwrap().contains(&SPAN_ROUTE));
    }
}
