use std::sync::Arc;

use super::{CapacityRegistry, Tier};

/// One unit of tiered capacity, held while a session generates.
///
/// The tier counter is decremented exactly once: on the first `release`, or
/// on drop if the lease was never released explicitly. Dropping covers
/// errors and cancelled futures.
#[derive(Debug)]
pub struct SessionLease {
    registry: Arc<CapacityRegistry>,
    tier: Tier,
    released: bool,
}

impl SessionLease {
    /// Take a slot in `tier` unconditionally.
    pub fn acquire(registry: Arc<CapacityRegistry>, tier: Tier) -> Self {
        registry.increment(tier);
        Self::adopt(registry, tier)
    }

    /// Wrap a slot that was already counted.
    pub(crate) fn adopt(registry: Arc<CapacityRegistry>, tier: Tier) -> Self {
        tracing::debug!(tier = %tier, "Lease acquired");
        Self {
            registry,
            tier,
            released: false,
        }
    }

    pub fn tier(&self) -> Tier {
        self.tier
    }

    pub fn is_released(&self) -> bool {
        self.released
    }

    /// Give the slot back. Calling this more than once has no further effect.
    pub fn release(&mut self) {
        if self.released {
            return;
        }
        self.released = true;
        self.registry.decrement(self.tier);
        tracing::debug!(tier = %self.tier, "Lease released");
    }
}

impl Drop for SessionLease {
    fn drop(&mut self) {
        self.release();
    }
}
