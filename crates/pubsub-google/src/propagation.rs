//! Trace context carried in message attributes.
//!
//! Both directions go through the globally installed text-map propagator, so
//! nothing is written or read until the application installs one.

use opentelemetry::{Context, global};
use tidings_pubsub::Metadata;

/// Writes the trace context of `cx` into `attributes`.
pub fn inject(cx: &Context, attributes: &mut Metadata) {
    global::get_text_map_propagator(|propagator| propagator.inject_context(cx, attributes));
}

/// Reads a parent trace context from `attributes`.
#[must_use]
pub fn extract(attributes: &Metadata) -> Context {
    global::get_text_map_propagator(|propagator| propagator.extract(attributes))
}

#[cfg(test)]
mod tests {
    use super::*;

    use opentelemetry::trace::{
        SpanContext, SpanId, TraceContextExt, TraceFlags, TraceId, TraceState,
    };
    use opentelemetry_sdk::propagation::TraceContextPropagator;

    fn remote_parent() -> Context {
        Context::new().with_remote_span_context(SpanContext::new(
            TraceId::from_hex("4bf92f3577b34da6a3ce929d0e0e4736").unwrap(),
            SpanId::from_hex("00f067aa0ba902b7").unwrap(),
            TraceFlags::SAMPLED,
            true,
            TraceState::default(),
        ))
    }

    #[test]
    fn test_trace_context_round_trips_through_attributes() {
        global::set_text_map_propagator(TraceContextPropagator::new());

        let mut attributes = Metadata::from([("tenant".to_string(), "acme".to_string())]);
        inject(&remote_parent(), &mut attributes);

        assert_eq!(
            attributes["traceparent"],
            "00-4bf92f3577b34da6a3ce929d0e0e4736-00f067aa0ba902b7-01"
        );
        assert_eq!(attributes["tenant"], "acme");

        let extracted = extract(&attributes);
        let span = extracted.span();
        assert_eq!(
            span.span_context().trace_id(),
            TraceId::from_hex("4bf92f3577b34da6a3ce929d0e0e4736").unwrap()
        );
        assert!(span.span_context().is_remote());
    }

    #[test]
    fn test_missing_trace_context_extracts_empty() {
        global::set_text_map_propagator(TraceContextPropagator::new());

        let extracted = extract(&Metadata::new());
        assert!(!extracted.span().span_context().is_valid());
    }
}
