//! Observability for Relay: subscriber setup, OpenTelemetry export, and
//! recorders that turn per-call outcome events into logs and spans.

pub mod outcome;
pub mod relay_attrs;
pub mod tracing_setup;
