//! Observability setup for jobflow: structured logging and optional
//! OpenTelemetry span export.

pub mod tracing_setup;
