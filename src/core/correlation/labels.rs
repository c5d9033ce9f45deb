use crate::core::correlation::carrier::Carrier;
use crate::core::profiling::timeline;
use parking_lot::Mutex;
use smallvec::SmallVec;
use std::cell::RefCell;
use std::fmt;
use std::future::Future;
use std::marker::PhantomData;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use tracing::warn;

pub const LABEL_SPAN_ID: &str = "span_id";
pub const LABEL_TRACE_ID: &str = "trace_id";
pub const LABEL_OPERATION_NAME: &str = "operation_name";

/// The profiler visible projection of a ['Carrier']
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LabelSet(Arc<SmallVec<[(&'static str, String); 3]>>);

impl LabelSet {
    pub fn from_carrier(carrier: &Carrier) -> Self {
        let mut labels = SmallVec::new();
        labels.push((LABEL_SPAN_ID, carrier.span_id().to_string()));
        labels.push((LABEL_TRACE_ID, carrier.trace_id().to_string()));
        labels.push((LABEL_OPERATION_NAME, carrier.operation_name().to_string()));

        LabelSet(Arc::new(labels))
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.0
            .iter()
            .find(|(k, _)| *k == key)
            .map(|(_, v)| v.as_str())
    }

    pub fn span_id(&self) -> &str {
        self.get(LABEL_SPAN_ID).unwrap_or_default()
    }

    pub fn trace_id(&self) -> &str {
        self.get(LABEL_TRACE_ID).unwrap_or_default()
    }

    pub fn operation_name(&self) -> &str {
        self.get(LABEL_OPERATION_NAME).unwrap_or_default()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&'static str, &str)> {
        self.0.iter().map(|(k, v)| (*k, v.as_str()))
    }
}

impl fmt::Display for LabelSet {
    /// `span_id=..,trace_id=..,operation_name=..`
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (idx, (key, value)) in self.iter().enumerate() {
            if idx > 0 {
                f.write_str(",")?;
            }
            write!(f, "{}={}", key, value)?;
        }

        Ok(())
    }
}

static NEXT_UNIT_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Debug)]
struct UnitState {
    id: u64,
    labels: Mutex<Option<LabelSet>>,
}

/// One logical task, e.g. a request handler or a fan-out branch, owning
/// exactly one bound label set at a time. Tasks hop between threads, so
/// the label slot lives here and is only published to the OS thread
/// (where the sampler can see it) while the unit is entered.
/// Clones refer to the same unit
#[derive(Debug, Clone)]
pub struct ExecutionUnit {
    inner: Arc<UnitState>,
}

thread_local! {
    static CURRENT_UNIT: RefCell<Option<ExecutionUnit>> = const { RefCell::new(None) };
}

impl ExecutionUnit {
    pub fn new() -> Self {
        Self::with_labels(None)
    }

    fn with_labels(labels: Option<LabelSet>) -> Self {
        ExecutionUnit {
            inner: Arc::new(UnitState {
                id: NEXT_UNIT_ID.fetch_add(1, Ordering::Relaxed),
                labels: Mutex::new(labels),
            }),
        }
    }

    /// A new, independent unit for a spawned task which starts out
    /// with whatever this unit currently has bound
    pub fn fork(&self) -> Self {
        Self::with_labels(self.labels())
    }

    pub fn id(&self) -> u64 {
        self.inner.id
    }

    /// The currently bound label set, if any
    pub fn labels(&self) -> Option<LabelSet> {
        self.inner.labels.lock().clone()
    }

    /// Replace the bound labels, returning what was bound before.
    /// Published to the sampler straight away if the calling thread
    /// is currently running this unit
    pub(crate) fn swap_labels(&self, labels: Option<LabelSet>) -> Option<LabelSet> {
        let previous = std::mem::replace(&mut *self.inner.labels.lock(), labels.clone());

        if self.is_entered() {
            timeline::record(labels);
        }

        previous
    }

    /// Whether the calling thread is currently running this unit
    pub fn is_entered(&self) -> bool {
        CURRENT_UNIT
            .try_with(|current| {
                current
                    .borrow()
                    .as_ref()
                    .is_some_and(|unit| unit.id() == self.id())
            })
            .unwrap_or(false)
    }

    /// Make this unit the one running on the calling thread until the
    /// guard drops. Used for synchronous sections such as blocking pool
    /// work, async code should use ['WithExecutionUnit::with_unit']
    pub fn enter(&self) -> UnitGuard {
        let previous = CURRENT_UNIT
            .try_with(|current| current.replace(Some(self.clone())))
            .ok()
            .flatten();

        timeline::record(self.labels());

        UnitGuard {
            previous,
            _not_send: PhantomData,
        }
    }
}

impl Default for ExecutionUnit {
    fn default() -> Self {
        Self::new()
    }
}

/// Leaves an entered ['ExecutionUnit'], handing the thread back to
/// whichever unit (if any) ran before
pub struct UnitGuard {
    previous: Option<ExecutionUnit>,
    _not_send: PhantomData<*const ()>,
}

impl Drop for UnitGuard {
    fn drop(&mut self) {
        let previous = self.previous.take();
        let labels = previous.as_ref().and_then(ExecutionUnit::labels);

        let _ = CURRENT_UNIT.try_with(|current| current.replace(previous));
        timeline::record(labels);
    }
}

/// Captures what was bound on a unit before a ['LabelBinder::bind'].
/// Must be handed back to ['LabelBinder::restore'] exactly once
#[must_use = "a label token must be restored or the unit stays mislabeled"]
#[derive(Debug)]
pub struct LabelToken {
    unit_id: u64,
    previous: Option<LabelSet>,
}

impl LabelToken {
    pub(crate) fn new(unit: &ExecutionUnit, previous: Option<LabelSet>) -> Self {
        LabelToken {
            unit_id: unit.id(),
            previous,
        }
    }

    pub fn unit_id(&self) -> u64 {
        self.unit_id
    }

    /// What was bound before, `None` if nothing was
    pub fn previous(&self) -> Option<&LabelSet> {
        self.previous.as_ref()
    }

    /// Splits the token, checking it is being handed back to the unit
    /// it was taken from
    pub(crate) fn into_previous(self, unit: &ExecutionUnit) -> Result<Option<LabelSet>, Self> {
        if self.unit_id != unit.id() {
            return Err(self);
        }

        Ok(self.previous)
    }
}

/// Applies carrier labels to an execution unit for the profiler and
/// puts back the previous ones. Calls nest as a stack per unit
pub trait LabelBinder: Send + Sync {
    fn bind(&self, unit: &ExecutionUnit, carrier: &Carrier) -> LabelToken;

    fn restore(&self, unit: &ExecutionUnit, token: LabelToken);

    fn name(&self) -> &'static str;
}

/// Binder used when profiling is unavailable. Nothing is ever bound,
/// spans and fan-out behave exactly the same
#[derive(Debug, Default)]
pub struct NoopBinder;

impl LabelBinder for NoopBinder {
    fn bind(&self, unit: &ExecutionUnit, _carrier: &Carrier) -> LabelToken {
        LabelToken::new(unit, unit.labels())
    }

    fn restore(&self, unit: &ExecutionUnit, token: LabelToken) {
        if let Err(token) = token.into_previous(unit) {
            warn!(
                token_unit = token.unit_id(),
                unit = unit.id(),
                "Label token restored on a foreign execution unit, ignoring"
            );
        }
    }

    fn name(&self) -> &'static str {
        "noop"
    }
}

/// Future which enters its ['ExecutionUnit'] for the duration of every
/// poll, so whichever worker thread polls it carries its labels
pub struct LabeledFuture<F> {
    unit: ExecutionUnit,
    inner: Pin<Box<F>>,
}

impl<F: Future> Future for LabeledFuture<F> {
    type Output = F::Output;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        let _entered = this.unit.enter();

        this.inner.as_mut().poll(cx)
    }
}

pub trait WithExecutionUnit: Future + Sized {
    /// Run this future as `unit`
    fn with_unit(self, unit: ExecutionUnit) -> LabeledFuture<Self> {
        LabeledFuture {
            unit,
            inner: Box::pin(self),
        }
    }
}

impl<F: Future> WithExecutionUnit for F {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::correlation::carrier::TraceSettings;
    use crate::core::profiling::binder::SamplerBinder;

    fn carrier(op: &str) -> Carrier {
        Carrier::root(op, Vec::new(), &TraceSettings::default())
    }

    #[test]
    fn test_label_set_projection() {
        let c = carrier("op");
        let labels = LabelSet::from_carrier(&c);

        assert_eq!(labels.span_id(), c.span_id().to_string());
        assert_eq!(labels.trace_id(), c.trace_id().to_string());
        assert_eq!(labels.operation_name(), "op");
        assert_eq!(
            labels.to_string(),
            format!(
                "span_id={},trace_id={},operation_name=op",
                c.span_id(),
                c.trace_id()
            )
        );
    }

    #[test]
    fn test_nested_bind_restore_unwinds_to_initial_state() {
        let binder = SamplerBinder::new();

        for initial in [None, Some(LabelSet::from_carrier(&carrier("outer")))] {
            let unit = ExecutionUnit::new();
            unit.swap_labels(initial.clone());

            let carriers: Vec<_> = (0..8).map(|i| carrier(&format!("level-{}", i))).collect();
            let mut tokens = Vec::new();

            for c in &carriers {
                tokens.push(binder.bind(&unit, c));
                assert_eq!(unit.labels(), Some(LabelSet::from_carrier(c)));
            }

            while let Some(token) = tokens.pop() {
                binder.restore(&unit, token);

                let expected = match tokens.len() {
                    0 => initial.clone(),
                    n => Some(LabelSet::from_carrier(&carriers[n - 1])),
                };
                assert_eq!(unit.labels(), expected);
            }

            assert_eq!(unit.labels(), initial);
        }
    }

    #[test]
    fn test_units_do_not_share_labels() {
        let binder = SamplerBinder::new();
        let a = ExecutionUnit::new();
        let b = a.fork();

        let token = binder.bind(&a, &carrier("a"));
        assert!(b.labels().is_none());
        assert_eq!(a.labels().unwrap().operation_name(), "a");

        binder.restore(&a, token);
        assert!(a.labels().is_none());
    }

    #[test]
    fn test_fork_inherits_current_labels() {
        let binder = SamplerBinder::new();
        let parent = ExecutionUnit::new();
        let token = binder.bind(&parent, &carrier("parent"));

        let child = parent.fork();
        assert_ne!(child.id(), parent.id());
        assert_eq!(child.labels(), parent.labels());

        binder.restore(&parent, token);
        assert!(parent.labels().is_none());
        assert_eq!(child.labels().unwrap().operation_name(), "parent");
    }

    #[test]
    fn test_foreign_token_is_ignored() {
        let binder = SamplerBinder::new();
        let a = ExecutionUnit::new();
        let b = ExecutionUnit::new();

        let token_a = binder.bind(&a, &carrier("a"));
        let token_b = binder.bind(&b, &carrier("b"));

        binder.restore(&b, token_a);
        assert_eq!(b.labels().unwrap().operation_name(), "b");

        binder.restore(&b, token_b);
        assert!(b.labels().is_none());
    }

    #[test]
    fn test_noop_binder_never_binds() {
        let binder = NoopBinder;
        let unit = ExecutionUnit::new();

        let token = binder.bind(&unit, &carrier("op"));
        assert!(unit.labels().is_none());
        assert!(token.previous().is_none());

        binder.restore(&unit, token);
        assert!(unit.labels().is_none());
    }

    #[test]
    fn test_enter_tracks_current_unit() {
        let outer = ExecutionUnit::new();
        let inner = ExecutionUnit::new();

        assert!(!outer.is_entered());
        {
            let _outer = outer.enter();
            assert!(outer.is_entered());
            {
                let _inner = inner.enter();
                assert!(inner.is_entered());
                assert!(!outer.is_entered());
            }
            assert!(outer.is_entered());
        }
        assert!(!outer.is_entered());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_labeled_future_enters_unit_while_polled() {
        let unit = ExecutionUnit::new();
        let observer = unit.clone();

        let entered = tokio::spawn(
            async move {
                let before = observer.is_entered();
                tokio::task::yield_now().await;
                before && observer.is_entered()
            }
            .with_unit(unit.clone()),
        )
        .await
        .unwrap();

        assert!(entered);
        assert!(!unit.is_entered());
    }
}
