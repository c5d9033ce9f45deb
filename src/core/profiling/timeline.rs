//! Per thread history of which label set was bound while the thread ran.
//!
//! pprof samples carry the OS thread id and the time they were taken, but
//! the report is only resolved later. Every time an execution unit is
//! entered, left, or rebinds while entered, the new label set is appended
//! to the running thread's log so a sample can be attributed afterwards
//! by looking up the last transition at or before its timestamp.

use crate::core::correlation::labels::LabelSet;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, LazyLock};
use std::time::SystemTime;

/// Oldest transitions are dropped past this, samples older than the
/// retained window come out unlabeled
const MAX_TRANSITIONS: usize = 4096;

static ENABLED: AtomicBool = AtomicBool::new(false);

static REGISTRY: LazyLock<DashMap<u64, Arc<ThreadTimeline>>> = LazyLock::new(DashMap::new);

struct Transition {
    at: SystemTime,
    labels: Option<LabelSet>,
}

#[derive(Default)]
struct ThreadTimeline {
    transitions: Mutex<VecDeque<Transition>>,
}

impl ThreadTimeline {
    fn push(&self, labels: Option<LabelSet>) {
        let mut transitions = self.transitions.lock();

        if transitions.len() == MAX_TRANSITIONS {
            transitions.pop_front();
        }

        transitions.push_back(Transition {
            at: SystemTime::now(),
            labels,
        });
    }

    fn labels_at(&self, at: SystemTime) -> Option<LabelSet> {
        let transitions = self.transitions.lock();
        let idx = transitions.partition_point(|t| t.at <= at);

        if idx == 0 {
            return None;
        }

        transitions[idx - 1].labels.clone()
    }
}

thread_local! {
    static LOCAL: Arc<ThreadTimeline> = register_current_thread();
}

fn register_current_thread() -> Arc<ThreadTimeline> {
    let timeline = Arc::new(ThreadTimeline::default());
    // pthread ids are recycled, a new thread simply takes over the slot
    REGISTRY.insert(current_thread_id(), timeline.clone());
    timeline
}

/// Thread id in the same form the pprof sampler records it
pub fn current_thread_id() -> u64 {
    // SAFETY: pthread_self has no preconditions and cannot fail
    unsafe { libc::pthread_self() as u64 }
}

/// Start recording transitions, called when the sampler starts
pub fn enable() {
    ENABLED.store(true, Ordering::Release);
}

/// Stop recording and forget all history
pub fn disable() {
    ENABLED.store(false, Ordering::Release);

    for entry in REGISTRY.iter() {
        entry.value().transitions.lock().clear();
    }
}

pub fn is_enabled() -> bool {
    ENABLED.load(Ordering::Acquire)
}

/// Record that the calling thread now runs with `labels` bound
pub fn record(labels: Option<LabelSet>) {
    if !is_enabled() {
        return;
    }

    // thread local may already be gone during thread teardown
    let _ = LOCAL.try_with(|timeline| timeline.push(labels));
}

/// The labels bound on `thread_id` at time `at`, if known
pub fn labels_at(thread_id: u64, at: SystemTime) -> Option<LabelSet> {
    REGISTRY
        .get(&thread_id)
        .and_then(|timeline| timeline.labels_at(at))
}

/// Serializes tests which toggle the process wide timeline
#[cfg(test)]
pub(crate) static TEST_LOCK: Mutex<()> = Mutex::new(());
