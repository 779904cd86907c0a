//! W3C trace-context propagation over bus message headers.
//!
//! Publishing code injects a `traceparent` (and `tracestate`, when present)
//! header derived from the current tracing span; consumers extract it and
//! make it the parent of their processing span. Spans only carry an
//! OpenTelemetry context when the `tracing-opentelemetry` layer is
//! installed, otherwise injection writes nothing.

use opentelemetry::propagation::TextMapPropagator;
use opentelemetry_sdk::propagation::TraceContextPropagator;
use stepwise_core::message::Headers;
use stepwise_core::trace::TracePropagator;
use tracing_opentelemetry::OpenTelemetrySpanExt;

/// `TracePropagator` speaking the W3C `traceparent` header format.
#[derive(Debug, Default)]
pub struct OtelTracePropagator {
    inner: TraceContextPropagator,
}

impl OtelTracePropagator {
    pub fn new() -> Self {
        Self::default()
    }
}

impl TracePropagator for OtelTracePropagator {
    fn inject(&self, headers: &mut Headers) {
        let context = tracing::Span::current().context();
        self.inner.inject_context(&context, headers);
    }

    fn extract(&self, headers: &Headers, span: &tracing::Span) {
        if !headers.contains_key("traceparent") {
            return;
        }
        let parent = self.inner.extract(headers);
        let _ = span.set_parent(parent);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use opentelemetry::trace::{TraceContextExt, TracerProvider as _};
    use opentelemetry_sdk::trace::SdkTracerProvider;
    use tracing_subscriber::layer::SubscriberExt;

    const TRACEPARENT: &str = "00-4bf92f3577b34da6a3ce929d0e0e4736-00f067aa0ba902b7-01";

    fn with_otel<F: FnOnce()>(f: F) {
        let provider = SdkTracerProvider::builder().build();
        let subscriber = tracing_subscriber::registry()
            .with(tracing_opentelemetry::layer().with_tracer(provider.tracer("test")));
        tracing::subscriber::with_default(subscriber, f);
    }

    fn trace_id_of(headers: &Headers) -> Option<String> {
        headers
            .get("traceparent")
            .and_then(|value| value.split('-').nth(1))
            .map(String::from)
    }

    #[test]
    fn test_inject_without_otel_layer_writes_nothing() {
        let propagator = OtelTracePropagator::new();
        let mut headers = Headers::new();
        propagator.inject(&mut headers);
        assert!(headers.is_empty());
    }

    #[test]
    fn test_inject_writes_current_span_context() {
        with_otel(|| {
            let propagator = OtelTracePropagator::new();
            let span = tracing::info_span!("publish");
            let _guard = span.enter();

            let mut headers = Headers::new();
            propagator.inject(&mut headers);

            let expected = span.context().span().span_context().trace_id().to_string();
            assert_eq!(trace_id_of(&headers), Some(expected));
            assert!(headers["traceparent"].starts_with("00-"));
        });
    }

    #[test]
    fn test_extract_parents_span_on_remote_trace() {
        with_otel(|| {
            let propagator = OtelTracePropagator::new();
            let mut incoming = Headers::new();
            incoming.insert("traceparent".into(), TRACEPARENT.into());

            let span = tracing::info_span!("step_task");
            propagator.extract(&incoming, &span);
            let _guard = span.enter();

            let mut outgoing = Headers::new();
            propagator.inject(&mut outgoing);
            assert_eq!(
                trace_id_of(&outgoing).as_deref(),
                Some("4bf92f3577b34da6a3ce929d0e0e4736")
            );
        });
    }

    #[test]
    fn test_extract_ignores_missing_header() {
        with_otel(|| {
            let propagator = OtelTracePropagator::new();
            let span = tracing::info_span!("step_task");
            propagator.extract(&Headers::new(), &span);
            let _guard = span.enter();

            let mut outgoing = Headers::new();
            propagator.inject(&mut outgoing);
            assert_ne!(
                trace_id_of(&outgoing).as_deref(),
                Some("4bf92f3577b34da6a3ce929d0e0e4736")
            );
        });
    }
}
