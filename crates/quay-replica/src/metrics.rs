//! Dispatch and transition counters.

use std::sync::atomic::{AtomicU64, Ordering};

/// Shared atomic counters incremented by the dispatch and transition paths.
///
/// All reads and writes use `Ordering::Relaxed`; counters are advisory,
/// not transactional.
#[derive(Debug, Default)]
pub struct ReplicaCounters {
    /// Read commands dispatched.
    pub reads: AtomicU64,
    /// Write commands dispatched.
    pub writes: AtomicU64,
    /// Batch requests completed in full.
    pub batches: AtomicU64,
    /// Checkpoints that produced a new durable snapshot.
    pub checkpoints: AtomicU64,
    /// Learn transfers applied (both modes).
    pub learns: AtomicU64,
}

impl ReplicaCounters {
    /// Creates zeroed counters.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Takes a point-in-time snapshot of all counters.
    #[must_use]
    pub fn snapshot(&self) -> CounterSnapshot {
        CounterSnapshot {
            reads: self.reads.load(Ordering::Relaxed),
            writes: self.writes.load(Ordering::Relaxed),
            batches: self.batches.load(Ordering::Relaxed),
            checkpoints: self.checkpoints.load(Ordering::Relaxed),
            learns: self.learns.load(Ordering::Relaxed),
        }
    }
}

/// A point-in-time snapshot of [`ReplicaCounters`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CounterSnapshot {
    /// Read commands dispatched.
    pub reads: u64,
    /// Write commands dispatched.
    pub writes: u64,
    /// Batch requests completed in full.
    pub batches: u64,
    /// Checkpoints that produced a new durable snapshot.
    pub checkpoints: u64,
    /// Learn transfers applied (both modes).
    pub learns: u64,
}
