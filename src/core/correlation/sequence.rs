use std::sync::atomic::{AtomicU64, Ordering};

/// Hands out request-scoped sequence numbers so concurrently running
/// branches of the same request get distinct, readable names such as
/// `spanprof-1`, `spanprof-2`. Owned by the root carrier of a request,
/// so overlapping requests never observe each others values
#[derive(Debug)]
pub struct SequenceNamer {
    prefix: String,
    counter: AtomicU64,
}

impl SequenceNamer {
    pub fn new(prefix: impl Into<String>) -> Self {
        SequenceNamer {
            prefix: prefix.into(),
            counter: AtomicU64::new(0),
        }
    }

    /// Sets the counter back to zero. Only meaningful before any
    /// name has been allocated for the owning request
    pub fn reset(&self) {
        self.counter.store(0, Ordering::Release);
    }

    /// Atomically increments and returns the new value
    pub fn next(&self) -> u64 {
        self.counter.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// The last value handed out by ['next'], zero if none yet
    pub fn current(&self) -> u64 {
        self.counter.load(Ordering::Acquire)
    }

    pub fn name_of(&self, seq: u64) -> String {
        format!("{}-{}", self.prefix, seq)
    }

    pub fn next_name(&self) -> String {
        self.name_of(self.next())
    }

    pub fn current_name(&self) -> String {
        self.name_of(self.current())
    }
}
