//! All counters use `Relaxed` ordering. Individual counter values are
//! eventually consistent. Cross-counter snapshots may be transiently
//! inconsistent (e.g., total may briefly disagree with the sum of
//! per-family counters). This is acceptable for diagnostic display.
//! Do NOT use these values for allocation decisions.

use crate::sync::atomic::{AtomicIsize, Ordering};

/// Diagnostic-only gauge counter.
///
/// Under contention, subtract-before-add races are tolerated and the raw value
/// may transiently dip below zero. Readers should always use `load()`/`get()`,
/// which clamp negative values to zero.
pub struct Counter(AtomicIsize);

impl Counter {
    #[cfg(not(loom))]
    pub const fn new() -> Self {
        Self(AtomicIsize::new(0))
    }

    #[cfg(loom)]
    pub fn new() -> Self {
        Self(AtomicIsize::new(0))
    }

    #[inline]
    fn delta(val: usize) -> isize {
        // Diagnostic counters only: clamp absurd deltas instead of panicking.
        std::cmp::min(val, isize::MAX as usize).cast_signed()
    }

    #[inline]
    pub fn add(&self, val: usize) {
        self.0.fetch_add(Self::delta(val), Ordering::Relaxed);
    }

    #[inline]
    pub fn sub(&self, val: usize) {
        self.0.fetch_sub(Self::delta(val), Ordering::Relaxed);
    }

    #[inline]
    pub fn get(&self) -> usize {
        self.0.load(Ordering::Relaxed).max(0).cast_unsigned()
    }
}

// Address space reserved from the VM provider, all zones.
crate::sync::static_atomic! {
    pub static TOTAL_RESERVED: Counter = Counter::new();
}
// Pages committed (read/write) out of those reservations.
crate::sync::static_atomic! {
    pub static TOTAL_COMMITTED: Counter = Counter::new();
}

// Breakdown
crate::sync::static_atomic! {
    pub static REGION_COMMITTED: Counter = Counter::new();
}
crate::sync::static_atomic! {
    pub static LARGE_COMMITTED: Counter = Counter::new();
}
// Bytes parked on large-allocation death rows (decommitted, still reserved).
crate::sync::static_atomic! {
    pub static DEATH_ROW_BYTES: Counter = Counter::new();
}

/// Snapshot of the process-wide counters.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct MemoryStats {
    pub total_reserved: usize,
    pub total_committed: usize,
    pub region_committed: usize,
    pub large_committed: usize,
    pub death_row_bytes: usize,
}

#[must_use]
pub fn snapshot() -> MemoryStats {
    MemoryStats {
        total_reserved: TOTAL_RESERVED.get(),
        total_committed: TOTAL_COMMITTED.get(),
        region_committed: REGION_COMMITTED.get(),
        large_committed: LARGE_COMMITTED.get(),
        death_row_bytes: DEATH_ROW_BYTES.get(),
    }
}
