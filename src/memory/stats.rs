//! All counters use `Relaxed` ordering. Individual counter values are
//! eventually consistent. Cross-counter snapshots may be transiently
//! inconsistent (e.g. granted bytes may briefly exceed managed bytes while
//! an allocator is being dropped). This is acceptable for diagnostic display.
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
        self.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn load(&self, ordering: Ordering) -> usize {
        self.0.load(ordering).max(0).cast_unsigned()
    }
}

// Bytes of backing buffer bound to live block allocators
crate::sync::static_atomic! {
    pub static BLOCK_POOL_MANAGED: Counter = Counter::new();
}
// Bytes currently handed out to callers (allocate/allocate_largest/extend minus free)
crate::sync::static_atomic! {
    pub static BLOCK_POOL_GRANTED: Counter = Counter::new();
}
// Bytes dropped from bookkeeping because the free table was full
crate::sync::static_atomic! {
    pub static BLOCK_POOL_LEAKED: Counter = Counter::new();
}
// Number of times a blocking allocation went to sleep on the free-event
crate::sync::static_atomic! {
    pub static BLOCK_POOL_WAITS: Counter = Counter::new();
}

/// Point-in-time copy of the process-wide block pool gauges.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryStats {
    pub managed: usize,
    pub granted: usize,
    pub leaked: usize,
    pub waits: usize,
}

#[must_use]
pub fn snapshot() -> MemoryStats {
    MemoryStats {
        managed: BLOCK_POOL_MANAGED.get(),
        granted: BLOCK_POOL_GRANTED.get(),
        leaked: BLOCK_POOL_LEAKED.get(),
        waits: BLOCK_POOL_WAITS.get(),
    }
}
