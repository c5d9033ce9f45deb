use crate::core::correlation::carrier::Carrier;
use crate::core::correlation::labels::ExecutionUnit;
use crate::core::correlation::span::{ActiveSpan, SpanManager};
use std::sync::Arc;

/// What a piece of work needs to open spans of its own: the span
/// manager, the execution unit it runs as, and the carrier of the span
/// it runs under. Passed explicitly through every call that may suspend
/// or spawn, nothing is looked up from ambient state
#[derive(Clone)]
pub struct TaskContext {
    spans: Arc<SpanManager>,
    unit: ExecutionUnit,
    carrier: Carrier,
}

impl TaskContext {
    pub fn new(spans: Arc<SpanManager>, unit: ExecutionUnit, carrier: Carrier) -> Self {
        TaskContext {
            spans,
            unit,
            carrier,
        }
    }

    pub fn spans(&self) -> &Arc<SpanManager> {
        &self.spans
    }

    pub fn unit(&self) -> &ExecutionUnit {
        &self.unit
    }

    pub fn carrier(&self) -> &Carrier {
        &self.carrier
    }

    /// Open a nested span on the same execution unit. The returned
    /// context is for work running under the new span
    pub fn child_span<I>(&self, operation_name: &str, tags: I) -> (ActiveSpan, TaskContext)
    where
        I: IntoIterator<Item = (String, String)>,
    {
        let (span, carrier) = self
            .spans
            .start(&self.unit, Some(&self.carrier), operation_name, tags);

        let ctx = TaskContext {
            spans: self.spans.clone(),
            unit: self.unit.clone(),
            carrier,
        };

        (span, ctx)
    }

    /// Context for work handed to another task, which gets its own
    /// execution unit so it can never clobber this one's labels
    pub fn fork(&self, carrier: Carrier) -> TaskContext {
        TaskContext {
            spans: self.spans.clone(),
            unit: self.unit.fork(),
            carrier,
        }
    }
}
