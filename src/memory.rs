//! Byte accounting for in-process aggregates.
//!
//! The engine never loads the whole graph, but each batch and page still
//! materializes ids and small maps. `MemoryBudget` tracks the estimated bytes
//! of those aggregates. When a batch would exceed the limit, the caller
//! shrinks it instead of failing.

use std::sync::atomic::{AtomicUsize, Ordering};

use tracing::debug;

/// Rough per-node footprint of a batch entry (id string, order, map slot).
pub const ESTIMATED_BYTES_PER_NODE: usize = 256;

/// Shared memory budget.
#[derive(Debug)]
pub struct MemoryBudget {
    limit_bytes: usize,
    in_use: AtomicUsize,
}

impl MemoryBudget {
    /// Create a budget with a byte limit.
    pub fn new(limit_bytes: usize) -> Self {
        Self {
            limit_bytes,
            in_use: AtomicUsize::new(0),
        }
    }

    /// Budget that never applies backpressure.
    pub fn unlimited() -> Self {
        Self::new(usize::MAX)
    }

    /// Configured limit.
    pub fn limit_bytes(&self) -> usize {
        self.limit_bytes
    }

    /// Bytes currently reserved.
    pub fn in_use(&self) -> usize {
        self.in_use.load(Ordering::Acquire)
    }

    /// Largest batch not above `requested` that fits the remaining budget,
    /// halving on each miss. Never returns less than 1, so a run always
    /// makes progress.
    pub fn fit_batch(&self, requested: usize, bytes_per_item: usize) -> usize {
        let available = self.limit_bytes.saturating_sub(self.in_use());
        let mut size = requested.max(1);
        while size > 1 && size.saturating_mul(bytes_per_item) > available {
            size /= 2;
        }
        if size < requested {
            debug!(
                requested,
                granted = size,
                in_use = self.in_use(),
                limit = self.limit_bytes,
                "Memory pressure, reducing batch size"
            );
        }
        size
    }

    /// Reserve bytes until the returned guard is dropped.
    pub fn reserve(&self, bytes: usize) -> MemoryReservation<'_> {
        self.in_use.fetch_add(bytes, Ordering::AcqRel);
        MemoryReservation { budget: self, bytes }
    }
}

impl Default for MemoryBudget {
    fn default() -> Self {
        Self::unlimited()
    }
}

/// Releases its bytes on drop.
#[derive(Debug)]
pub struct MemoryReservation<'a> {
    budget: &'a MemoryBudget,
    bytes: usize,
}

impl Drop for MemoryReservation<'_> {
    fn drop(&mut self) {
        self.budget.in_use.fetch_sub(self.bytes, Ordering::AcqRel);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fit_batch_halves_under_pressure() {
        let budget = MemoryBudget::new(1000);
        assert_eq!(budget.fit_batch(8, 100), 8);
        assert_eq!(budget.fit_batch(16, 100), 8);

        let _held = budget.reserve(700);
        assert_eq!(budget.fit_batch(16, 100), 2);
    }

    #[test]
    fn test_fit_batch_floor_is_one() {
        let budget = MemoryBudget::new(0);
        assert_eq!(budget.fit_batch(1000, ESTIMATED_BYTES_PER_NODE), 1);
        assert_eq!(budget.fit_batch(0, 1), 1);
    }

    #[test]
    fn test_reservation_released_on_drop() {
        let budget = MemoryBudget::new(1000);
        {
            let _r = budget.reserve(400);
            assert_eq!(budget.in_use(), 400);
        }
        assert_eq!(budget.in_use(), 0);
    }
}
