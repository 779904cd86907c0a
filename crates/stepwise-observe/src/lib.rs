//! Observability for Stepwise.
//!
//! - `tracing_setup` -- global subscriber with optional OpenTelemetry export
//! - `propagation` -- W3C `traceparent` propagation over bus message headers

pub mod propagation;
pub mod tracing_setup;

pub use propagation::OtelTracePropagator;
pub use tracing_setup::{TracingOptions, init_tracing, shutdown_tracing};
