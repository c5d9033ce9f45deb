use crate::core::correlation::span::{SpanOutcome, SpanRecord, SpanSink};
use opentelemetry::global::{self, BoxedTracer};
use opentelemetry::trace::{
    SamplingDecision, SamplingResult, Span, SpanContext, SpanKind, Status, TraceContextExt,
    TraceFlags, TraceState, Tracer,
};
use opentelemetry::{Context, KeyValue};
use tracing::trace;

const ATTR_OUTCOME: &str = "spanprof.outcome";
const ATTR_DEGRADED: &str = "spanprof.degraded_reason";

/// Hands closed span records to the global otel tracer, keeping the
/// exact ids and timestamps they were recorded with so they line up
/// with the labels attributed to profile samples. Unsampled records
/// are only logged
pub struct OtelSpanSink {
    tracer: BoxedTracer,
}

impl OtelSpanSink {
    /// Must be created after the global tracer provider is installed
    pub fn new() -> Self {
        OtelSpanSink {
            tracer: global::tracer(env!("CARGO_PKG_NAME")),
        }
    }
}

impl Default for OtelSpanSink {
    fn default() -> Self {
        Self::new()
    }
}

fn parent_context(record: &SpanRecord) -> Context {
    match record.parent_span_id() {
        Some(parent) => Context::new().with_remote_span_context(SpanContext::new(
            record.carrier.trace_id().to_otel(),
            parent.to_otel(),
            TraceFlags::SAMPLED,
            true,
            TraceState::default(),
        )),
        None => Context::new(),
    }
}

/// Request roots are server spans even when they continue a remote
/// parent, everything derived below them is internal
fn span_kind(record: &SpanRecord) -> SpanKind {
    if record.carrier.is_request_root() {
        SpanKind::Server
    } else {
        SpanKind::Internal
    }
}

fn attributes(record: &SpanRecord) -> Vec<KeyValue> {
    let mut attrs: Vec<KeyValue> = record
        .carrier
        .tags()
        .iter()
        .map(|(k, v)| KeyValue::new(k.clone(), v.clone()))
        .collect();

    let outcome = match &record.outcome {
        SpanOutcome::Ok => "ok",
        SpanOutcome::Error(_) => "error",
        SpanOutcome::Degraded(reason) => {
            attrs.push(KeyValue::new(ATTR_DEGRADED, reason.clone()));
            "degraded"
        }
    };
    attrs.push(KeyValue::new(ATTR_OUTCOME, outcome));

    attrs
}

impl SpanSink for OtelSpanSink {
    fn submit(&self, record: SpanRecord) {
        trace!(
            trace_id = %record.carrier.trace_id(),
            span_id = %record.carrier.span_id(),
            operation = record.carrier.operation_name(),
            sampled = record.carrier.is_sampled(),
            duration = ?record.duration(),
            "Span submitted"
        );

        if !record.carrier.is_sampled() {
            return;
        }

        // the sampling decision was made when the trace root was created
        let decided = SamplingResult {
            decision: SamplingDecision::RecordAndSample,
            attributes: Vec::new(),
            trace_state: TraceState::default(),
        };

        let mut span = self
            .tracer
            .span_builder(record.carrier.operation_name().to_string())
            .with_trace_id(record.carrier.trace_id().to_otel())
            .with_span_id(record.carrier.span_id().to_otel())
            .with_kind(span_kind(&record))
            .with_start_time(record.start)
            .with_attributes(attributes(&record))
            .with_sampling_result(decided)
            .start_with_context(&self.tracer, &parent_context(&record));

        if let SpanOutcome::Error(err) = &record.outcome {
            span.set_status(Status::error(err.clone()));
        }

        match record.end {
            Some(end) => span.end_with_timestamp(end),
            None => span.end(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::correlation::carrier::{Carrier, TraceSettings};
    use crate::core::correlation::span::SpanState;
    use std::collections::HashMap;
    use std::time::SystemTime;

    fn record(outcome: SpanOutcome, child: bool) -> SpanRecord {
        let root = Carrier::root(
            "root",
            [("service".to_string(), "svc-1".to_string())],
            &TraceSettings::default(),
        );
        let carrier = if child {
            root.derive("child", Vec::new())
        } else {
            root
        };

        SpanRecord {
            carrier,
            start: SystemTime::now(),
            end: Some(SystemTime::now()),
            state: SpanState::Closed,
            outcome,
        }
    }

    #[test]
    fn test_attributes_carry_tags_and_outcome() {
        let attrs = attributes(&record(SpanOutcome::Degraded("join timeout".into()), false));

        let find = |key: &str| {
            attrs
                .iter()
                .find(|kv| kv.key.as_str() == key)
                .map(|kv| kv.value.to_string())
        };

        assert_eq!(find("service"), Some("svc-1".to_string()));
        assert_eq!(find(ATTR_OUTCOME), Some("degraded".to_string()));
        assert_eq!(find(ATTR_DEGRADED), Some("join timeout".to_string()));
    }

    #[test]
    fn test_parent_context_only_for_children() {
        let root = record(SpanOutcome::Ok, false);
        assert!(!parent_context(&root).has_active_span());

        let child = record(SpanOutcome::Ok, true);
        let cx = parent_context(&child);
        let parent = cx.span().span_context().clone();

        assert!(parent.is_remote());
        assert_eq!(parent.span_id(), child.parent_span_id().unwrap().to_otel());
        assert_eq!(parent.trace_id(), child.carrier.trace_id().to_otel());
    }

    #[test]
    fn test_continued_request_root_is_a_server_span() {
        let headers = HashMap::from([(
            "traceparent".to_string(),
            "00-4bf92f3577b34da6a3ce929d0e0e4736-00f067aa0ba902b7-01".to_string(),
        )]);
        let root = Carrier::root_from(&headers, "/movies", Vec::new(), &TraceSettings::default());
        let child = root.derive("fibonacci", Vec::new());

        let as_record = |carrier: Carrier| SpanRecord {
            carrier,
            start: SystemTime::now(),
            end: Some(SystemTime::now()),
            state: SpanState::Closed,
            outcome: SpanOutcome::Ok,
        };

        let root = as_record(root);
        assert!(root.parent_span_id().is_some());
        assert_eq!(span_kind(&root), SpanKind::Server);
        assert_eq!(span_kind(&as_record(child)), SpanKind::Internal);
        assert_eq!(span_kind(&record(SpanOutcome::Ok, false)), SpanKind::Server);
    }

    #[test]
    fn test_submit_without_provider_is_harmless() {
        let sink = OtelSpanSink::new();
        sink.submit(record(SpanOutcome::Error("boom".into()), true));
        sink.submit(record(SpanOutcome::Ok, false));
    }
}
