use crate::core::correlation::carrier::{Carrier, SpanId, TraceSettings};
use crate::core::correlation::labels::{ExecutionUnit, LabelBinder, LabelToken};
use opentelemetry::propagation::Extractor;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use strum::Display;
use tracing::{debug, trace};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
#[strum(serialize_all = "lowercase")]
pub enum SpanState {
    Created,
    Open,
    Closed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SpanOutcome {
    Ok,
    /// The work under the span failed
    Error(String),
    /// The span closed without everything under it finishing, e.g. a
    /// fan-out join that hit its deadline
    Degraded(String),
}

/// The finished (or in flight) record of a span
#[derive(Debug, Clone)]
pub struct SpanRecord {
    pub carrier: Carrier,
    pub start: SystemTime,
    pub end: Option<SystemTime>,
    pub state: SpanState,
    pub outcome: SpanOutcome,
}

impl SpanRecord {
    /// None only for the root span of a trace
    pub fn parent_span_id(&self) -> Option<SpanId> {
        self.carrier.parent_span_id()
    }

    pub fn duration(&self) -> Option<Duration> {
        self.end
            .and_then(|end| end.duration_since(self.start).ok())
    }
}

/// Destination of closed spans, e.g. the otlp exporter. Must accept
/// submissions from many tasks at once and never block for long
pub trait SpanSink: Send + Sync {
    fn submit(&self, record: SpanRecord);
}

/// Opens spans, keeps their profiler labels bound on the owning
/// execution unit while open, and hands closed records to the sink
pub struct SpanManager {
    binder: Arc<dyn LabelBinder>,
    sink: Arc<dyn SpanSink>,
    settings: TraceSettings,
}

impl SpanManager {
    pub fn new(
        binder: Arc<dyn LabelBinder>,
        sink: Arc<dyn SpanSink>,
        settings: TraceSettings,
    ) -> Self {
        SpanManager {
            binder,
            sink,
            settings,
        }
    }

    pub fn settings(&self) -> &TraceSettings {
        &self.settings
    }

    pub fn binder_name(&self) -> &'static str {
        self.binder.name()
    }

    /// The carrier for an inbound request, continuing any propagated trace
    pub fn root_carrier(&self, extractor: &dyn Extractor, operation_name: &str) -> Carrier {
        Carrier::root_from(extractor, operation_name, Vec::new(), &self.settings)
    }

    /// Open a span for an already derived carrier and bind its labels
    /// on `unit`. The span must be ended on that same unit
    pub fn open(&self, unit: &ExecutionUnit, carrier: Carrier) -> ActiveSpan {
        let mut record = SpanRecord {
            carrier,
            start: SystemTime::now(),
            end: None,
            state: SpanState::Created,
            outcome: SpanOutcome::Ok,
        };

        let token = self.binder.bind(unit, &record.carrier);
        record.state = SpanState::Open;

        debug!(
            trace_id = %record.carrier.trace_id(),
            span_id = %record.carrier.span_id(),
            operation = record.carrier.operation_name(),
            "Span opened"
        );

        ActiveSpan {
            record,
            unit: unit.clone(),
            token: Some(token),
            binder: self.binder.clone(),
            sink: self.sink.clone(),
        }
    }

    /// Derive a carrier from `parent` (or start a new trace if there is
    /// none) and open a span for it. The returned carrier is what spawned
    /// sub tasks should be handed
    pub fn start<I>(
        &self,
        unit: &ExecutionUnit,
        parent: Option<&Carrier>,
        operation_name: &str,
        tags: I,
    ) -> (ActiveSpan, Carrier)
    where
        I: IntoIterator<Item = (String, String)>,
    {
        let carrier = match parent {
            Some(parent) => parent.derive(operation_name, tags),
            None => Carrier::root(operation_name, tags, &self.settings),
        };

        (self.open(unit, carrier.clone()), carrier)
    }
}

/// An open span. Ending is idempotent, and a span dropped while still
/// open is ended on drop (as an error if the drop is due to a panic)
pub struct ActiveSpan {
    record: SpanRecord,
    unit: ExecutionUnit,
    token: Option<LabelToken>,
    binder: Arc<dyn LabelBinder>,
    sink: Arc<dyn SpanSink>,
}

impl ActiveSpan {
    pub fn carrier(&self) -> &Carrier {
        &self.record.carrier
    }

    pub fn state(&self) -> SpanState {
        self.record.state
    }

    pub fn outcome(&self) -> &SpanOutcome {
        &self.record.outcome
    }

    pub fn is_closed(&self) -> bool {
        self.record.state == SpanState::Closed
    }

    /// Mark the span failed, the first error wins
    pub fn record_error(&mut self, err: impl fmt::Display) {
        if self.is_closed() || matches!(self.record.outcome, SpanOutcome::Error(_)) {
            return;
        }

        self.record.outcome = SpanOutcome::Error(err.to_string());
    }

    /// Mark the span degraded unless it already failed
    pub fn mark_degraded(&mut self, reason: impl fmt::Display) {
        if self.is_closed() || self.record.outcome != SpanOutcome::Ok {
            return;
        }

        self.record.outcome = SpanOutcome::Degraded(reason.to_string());
    }

    /// Close the span: stamp the end time, put back the labels bound
    /// before it opened and submit the record. No-op once closed
    pub fn end(&mut self) {
        let Some(token) = self.token.take() else {
            trace!(span_id = %self.record.carrier.span_id(), "Span already closed");
            return;
        };

        self.record.end = Some(SystemTime::now());
        self.record.state = SpanState::Closed;
        self.binder.restore(&self.unit, token);

        debug!(
            trace_id = %self.record.carrier.trace_id(),
            span_id = %self.record.carrier.span_id(),
            operation = self.record.carrier.operation_name(),
            outcome = ?self.record.outcome,
            "Span closed"
        );

        self.sink.submit(self.record.clone());
    }
}

impl Drop for ActiveSpan {
    fn drop(&mut self) {
        if self.is_closed() {
            return;
        }

        if std::thread::panicking() {
            self.record_error("panicked");
        }

        self.end();
    }
}
