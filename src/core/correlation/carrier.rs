use crate::core::correlation::sequence::SequenceNamer;
use opentelemetry::propagation::{Extractor, Injector, TextMapPropagator};
use opentelemetry::trace::{
    SpanContext, SpanId as OtelSpanId, TraceContextExt, TraceFlags, TraceId as OtelTraceId,
    TraceState,
};
use opentelemetry::Context;
use opentelemetry_sdk::propagation::TraceContextPropagator;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::debug;

/// 128 bit trace identifier, shared by every span of a request tree
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TraceId(u128);

impl TraceId {
    pub fn new(value: u128) -> Self {
        TraceId(value)
    }

    pub fn value(&self) -> u128 {
        self.0
    }

    pub fn to_otel(self) -> OtelTraceId {
        OtelTraceId::from_bytes(self.0.to_be_bytes())
    }
}

impl fmt::Display for TraceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:032x}", self.0)
    }
}

/// 64 bit span identifier, unique within its trace
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SpanId(u64);

impl SpanId {
    pub fn new(value: u64) -> Self {
        SpanId(value)
    }

    pub fn value(&self) -> u64 {
        self.0
    }

    pub fn to_otel(self) -> OtelSpanId {
        OtelSpanId::from_bytes(self.0.to_be_bytes())
    }
}

impl fmt::Display for SpanId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

/// Settings applied whenever a new trace root is created
#[derive(Debug, Clone)]
pub struct TraceSettings {
    /// Prefix used by the per request ['SequenceNamer']
    pub service_prefix: String,
    /// Fraction (0.0 to 1.0) of fresh roots which are sampled for export.
    /// Roots continuing an inbound trace keep the inbound decision
    pub sample_rate: f32,
}

impl Default for TraceSettings {
    fn default() -> Self {
        Self {
            service_prefix: env!("CARGO_PKG_NAME").to_string(),
            sample_rate: 1.0,
        }
    }
}

/// Generates span ids which never repeat within one trace. An atomic
/// counter is pushed through the splitmix64 finalizer, which is a
/// bijection on u64, from a random per trace starting point
#[derive(Debug)]
struct SpanIdGenerator {
    seed: u64,
    counter: AtomicU64,
}

impl SpanIdGenerator {
    fn new() -> Self {
        SpanIdGenerator {
            seed: rand::random(),
            counter: AtomicU64::new(0),
        }
    }

    fn next(&self) -> SpanId {
        loop {
            let n = self.counter.fetch_add(1, Ordering::Relaxed);
            let id = mix64(self.seed.wrapping_add(n));

            // zero is the invalid span id in w3c trace context
            if id != 0 {
                return SpanId(id);
            }
        }
    }
}

const TRACEPARENT_HEADER: &str = "traceparent";

/// `version-trace_id-parent_id-flags` as lowercase hex of widths 2, 32,
/// 16 and 2. Version 00 is exactly 55 bytes, later versions may append
/// `-` separated fields and version ff is invalid
fn is_well_formed_traceparent(value: &str) -> bool {
    let value = value.trim().as_bytes();

    if value.len() < 55 || (value.len() > 55 && value[55] != b'-') {
        return false;
    }

    let mut fields = value[..55].split(|b| *b == b'-');
    let widths = [2, 32, 16, 2];

    let shaped = widths.iter().all(|width| {
        fields.next().is_some_and(|field| {
            field.len() == *width && field.iter().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f'))
        })
    });

    let version = &value[..2];

    shaped && fields.next().is_none() && version != b"ff" && (version != b"00" || value.len() == 55)
}

fn mix64(mut z: u64) -> u64 {
    z = (z ^ (z >> 30)).wrapping_mul(0xbf58_476d_1ce4_e5b9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94d0_49bb_1331_11eb);
    z ^ (z >> 31)
}

/// State shared by every carrier of one trace tree within this process
#[derive(Debug)]
struct TraceScope {
    span_ids: SpanIdGenerator,
    sequence: SequenceNamer,
}

impl TraceScope {
    fn new(settings: &TraceSettings) -> Arc<Self> {
        Arc::new(TraceScope {
            span_ids: SpanIdGenerator::new(),
            sequence: SequenceNamer::new(settings.service_prefix.clone()),
        })
    }
}

/// Immutable bundle of trace/span identity and tags which travels
/// alongside a unit of work. New operations never modify a carrier,
/// they ['derive'] a new one with a fresh span id and the same trace id.
/// Cloning is cheap, all heap data is shared
#[derive(Debug, Clone)]
pub struct Carrier {
    trace_id: TraceId,
    span_id: SpanId,
    parent_span_id: Option<SpanId>,
    operation_name: Arc<str>,
    tags: Arc<BTreeMap<String, String>>,
    sampled: bool,
    request_root: bool,
    scope: Arc<TraceScope>,
}

impl Carrier {
    /// Create a fresh root carrier with a new random trace id
    pub fn root<I>(operation_name: &str, tags: I, settings: &TraceSettings) -> Carrier
    where
        I: IntoIterator<Item = (String, String)>,
    {
        let scope = TraceScope::new(settings);

        let mut trace_id: u128 = rand::random();
        while trace_id == 0 {
            trace_id = rand::random();
        }

        Carrier {
            trace_id: TraceId(trace_id),
            span_id: scope.span_ids.next(),
            parent_span_id: None,
            operation_name: Arc::from(operation_name),
            tags: Arc::new(tags.into_iter().collect()),
            sampled: rand::random::<f32>() < settings.sample_rate,
            request_root: true,
            scope,
        }
    }

    /// Create the root carrier of a request, continuing the trace described
    /// by an inbound w3c `traceparent` if one is present and well formed.
    /// Missing or malformed context falls back to a fresh root
    pub fn root_from<I>(
        extractor: &dyn Extractor,
        operation_name: &str,
        tags: I,
        settings: &TraceSettings,
    ) -> Carrier
    where
        I: IntoIterator<Item = (String, String)>,
    {
        let Some(traceparent) = extractor.get(TRACEPARENT_HEADER) else {
            return Carrier::root(operation_name, tags, settings);
        };

        // the propagator parses ids without checking their width
        if !is_well_formed_traceparent(traceparent) {
            debug!(traceparent, "Ignoring malformed inbound traceparent, starting fresh trace");
            return Carrier::root(operation_name, tags, settings);
        }

        let inbound = TraceContextPropagator::new().extract(extractor);
        let remote = inbound.span().span_context().clone();

        if !remote.is_valid() {
            debug!(traceparent, "Ignoring invalid inbound traceparent, starting fresh trace");
            return Carrier::root(operation_name, tags, settings);
        }

        let scope = TraceScope::new(settings);

        Carrier {
            trace_id: TraceId(u128::from_be_bytes(remote.trace_id().to_bytes())),
            span_id: scope.span_ids.next(),
            parent_span_id: Some(SpanId(u64::from_be_bytes(remote.span_id().to_bytes()))),
            operation_name: Arc::from(operation_name),
            tags: Arc::new(tags.into_iter().collect()),
            sampled: remote.is_sampled(),
            request_root: true,
            scope,
        }
    }

    /// Derive a child carrier: same trace, fresh span id, this carrier as
    /// parent and `extra_tags` merged over the inherited tags
    pub fn derive<I>(&self, operation_name: &str, extra_tags: I) -> Carrier
    where
        I: IntoIterator<Item = (String, String)>,
    {
        let mut extra = extra_tags.into_iter().peekable();

        let tags = if extra.peek().is_none() {
            self.tags.clone()
        } else {
            let mut merged = (*self.tags).clone();
            merged.extend(extra);
            Arc::new(merged)
        };

        Carrier {
            trace_id: self.trace_id,
            span_id: self.scope.span_ids.next(),
            parent_span_id: Some(self.span_id),
            operation_name: Arc::from(operation_name),
            tags,
            sampled: self.sampled,
            request_root: false,
            scope: self.scope.clone(),
        }
    }

    /// Write this carrier as the parent of an outbound call
    pub fn inject(&self, injector: &mut dyn Injector) {
        let flags = if self.sampled {
            TraceFlags::SAMPLED
        } else {
            TraceFlags::default()
        };

        let span_context = SpanContext::new(
            self.trace_id.to_otel(),
            self.span_id.to_otel(),
            flags,
            false,
            TraceState::default(),
        );

        let cx = Context::new().with_remote_span_context(span_context);
        TraceContextPropagator::new().inject_context(&cx, injector);
    }

    pub fn trace_id(&self) -> TraceId {
        self.trace_id
    }

    pub fn span_id(&self) -> SpanId {
        self.span_id
    }

    pub fn parent_span_id(&self) -> Option<SpanId> {
        self.parent_span_id
    }

    pub fn operation_name(&self) -> &str {
        &self.operation_name
    }

    pub fn tags(&self) -> &BTreeMap<String, String> {
        &self.tags
    }

    pub fn tag(&self, key: &str) -> Option<&str> {
        self.tags.get(key).map(String::as_str)
    }

    pub fn is_sampled(&self) -> bool {
        self.sampled
    }

    /// True for the entry span of this process's part of the trace, even
    /// when it continues a remote parent
    pub fn is_request_root(&self) -> bool {
        self.request_root
    }

    /// The sequence namer of the request this carrier belongs to
    pub fn sequence(&self) -> &SequenceNamer {
        &self.scope.sequence
    }
}
