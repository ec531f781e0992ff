use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::futures::Notified;
use tokio::sync::Notify;

use super::{SessionLease, Tier};

/// Process-wide occupancy counters, one per tier.
///
/// Shared by reference between every session handler. All reads and updates
/// go through one mutex so the registry stays consistent on a multi-threaded
/// runtime.
#[derive(Debug)]
pub struct CapacityRegistry {
    counts: Mutex<Vec<usize>>,
    released: Notify,
}

impl CapacityRegistry {
    /// Registry with `tiers` tiers. Total capacity equals the number of tiers.
    pub fn new(tiers: usize) -> Self {
        Self {
            counts: Mutex::new(vec![0; tiers]),
            released: Notify::new(),
        }
    }

    pub fn tiers(&self) -> usize {
        self.lock().len()
    }

    pub fn capacity(&self) -> usize {
        self.tiers()
    }

    /// Sum of the counters of every tier strictly below `tier`.
    pub fn occupancy_below(&self, tier: Tier) -> usize {
        Self::sum_below(&self.lock(), tier)
    }

    /// Snapshot of every counter.
    pub fn counts(&self) -> Vec<usize> {
        self.lock().clone()
    }

    /// Sessions holding capacity across all tiers.
    pub fn total(&self) -> usize {
        self.lock().iter().sum()
    }

    /// Atomically check admission for `tier` and reserve a slot if it passes.
    pub fn try_reserve(self: &Arc<Self>, tier: Tier) -> Option<SessionLease> {
        {
            let mut counts = self.lock();
            let capacity = counts.len();
            if Self::sum_below(&counts, tier) >= tier.headroom(capacity) {
                return None;
            }
            counts[tier.index()] += 1;
        }
        Some(SessionLease::adopt(self.clone(), tier))
    }

    /// Resolves on the next decrement of any counter after this call.
    pub fn released(&self) -> Notified<'_> {
        self.released.notified()
    }

    pub(crate) fn increment(&self, tier: Tier) {
        let mut counts = self.lock();
        counts[tier.index()] += 1;
    }

    pub(crate) fn decrement(&self, tier: Tier) {
        {
            let mut counts = self.lock();
            let count = &mut counts[tier.index()];
            debug_assert!(*count > 0, "decrement of empty tier {}", tier);
            if *count == 0 {
                tracing::error!("Ignoring decrement of empty tier {}", tier);
                return;
            }
            *count -= 1;
        }
        self.released.notify_waiters();
    }

    fn sum_below(counts: &[usize], tier: Tier) -> usize {
        counts.iter().take(tier.index()).sum()
    }

    fn lock(&self) -> MutexGuard<'_, Vec<usize>> {
        // Counters are updated in one step, so a poisoned guard still holds
        // consistent values.
        self.counts.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
