//! Capacity tracking.
//!
//! The tracker is an advisory record count used for the O(1) fullness
//! check on the write path. It only ever grows: once the store is full,
//! each admission is paired with an eviction and the size stays at the cap,
//! so evictions are not counted separately.

use std::sync::atomic::{AtomicU64, Ordering};

/// Atomic record counter capped at `max_records`.
#[derive(Debug)]
pub struct CapacityTracker {
    count: AtomicU64,
    max_records: u64,
}

impl CapacityTracker {
    /// Creates a tracker starting at `initial`, clamped to `max_records`.
    pub fn new(max_records: u64, initial: u64) -> Self {
        Self {
            count: AtomicU64::new(initial.min(max_records)),
            max_records,
        }
    }

    /// Returns true when `count >= max_records`.
    #[inline]
    pub fn is_full(&self) -> bool {
        self.count.load(Ordering::Acquire) >= self.max_records
    }

    /// Counts one newly stored record.
    ///
    /// Increments only if the current value is below the cap and returns the
    /// new value; returns `None` when the tracker is already at the cap.
    pub fn try_admit(&self) -> Option<u64> {
        self.count
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                (current < self.max_records).then_some(current + 1)
            })
            .ok()
            .map(|previous| previous + 1)
    }

    /// Returns the current count.
    #[inline]
    pub fn snapshot(&self) -> u64 {
        self.count.load(Ordering::Acquire)
    }

    /// Returns the configured cap.
    pub fn max_records(&self) -> u64 {
        self.max_records
    }
}
