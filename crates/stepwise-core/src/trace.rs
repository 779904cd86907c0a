//! Trace-context propagation across bus messages.
//!
//! The coordinator injects the current span's context into the headers of
//! every message it publishes; workers extract it and parent their
//! processing span on it, so a run's steps form one distributed trace even
//! though they execute as separate deliveries. `stepwise-observe` provides
//! the W3C `traceparent` implementation.

use std::sync::Arc;

use crate::message::Headers;

/// Injects and extracts trace context on message headers.
pub trait TracePropagator: Send + Sync {
    /// Write the current span's context into `headers`.
    fn inject(&self, headers: &mut Headers);

    /// Make the context carried by `headers` the parent of `span`.
    fn extract(&self, headers: &Headers, span: &tracing::Span);
}

/// Propagator that carries nothing. Used when tracing export is disabled.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopPropagator;

impl TracePropagator for NoopPropagator {
    fn inject(&self, _headers: &mut Headers) {}

    fn extract(&self, _headers: &Headers, _span: &tracing::Span) {}
}

/// Shared handle used by the engine and workers.
pub type SharedPropagator = Arc<dyn TracePropagator>;

pub fn noop() -> SharedPropagator {
    Arc::new(NoopPropagator)
}
