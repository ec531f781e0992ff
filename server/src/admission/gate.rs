use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use tiergate_common::QueueStatus;
use tokio::time::{sleep_until, Instant};

use super::{CapacityRegistry, SessionLease, Tier};
use crate::error::Result;

/// How the admission check and the slot reservation are combined.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReservationMode {
    /// Check and reserve under one lock. Concurrent sessions can never both
    /// pass a check that only one of them fits.
    #[default]
    Atomic,
    /// Check occupancy, then take the slot as a separate step. Two sessions
    /// racing between the steps can both be admitted.
    CheckThenAcquire,
}

/// How a session got through the gate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// Admitted on arrival without waiting.
    Immediate,
    /// Occupancy dropped while waiting.
    Freed { waited: u64 },
    /// The wait budget ran out; admitted regardless of occupancy.
    Forced { waited: u64 },
}

impl Admission {
    /// Ticks spent waiting.
    pub fn waited(&self) -> u64 {
        match self {
            Admission::Immediate => 0,
            Admission::Freed { waited } | Admission::Forced { waited } => *waited,
        }
    }
}

/// Receives progress reports while a session waits for capacity.
#[async_trait]
pub trait QueueObserver: Send {
    /// Report the current wait. An error aborts the wait.
    async fn queued(&mut self, status: QueueStatus) -> Result<()>;
}

/// Decides whether a session may start generating and carries it through
/// backoff until it may.
#[derive(Debug, Clone)]
pub struct AdmissionGate {
    registry: Arc<CapacityRegistry>,
    tick: Duration,
    mode: ReservationMode,
    wake_on_release: bool,
}

impl AdmissionGate {
    pub fn new(registry: Arc<CapacityRegistry>, tick: Duration) -> Self {
        Self {
            registry,
            tick,
            mode: ReservationMode::default(),
            wake_on_release: false,
        }
    }

    pub fn with_mode(mut self, mode: ReservationMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn with_wake_on_release(mut self, wake_on_release: bool) -> Self {
        self.wake_on_release = wake_on_release;
        self
    }

    pub fn registry(&self) -> &Arc<CapacityRegistry> {
        &self.registry
    }

    /// The admission rule: `occupancy < capacity - tier`.
    pub fn is_admissible(occupancy: usize, tier: Tier, capacity: usize) -> bool {
        occupancy < tier.headroom(capacity)
    }

    /// Ticks a session may wait before it is admitted anyway.
    pub fn wait_budget(occupancy: usize, tier: Tier) -> u64 {
        (occupancy as u64 + 1) * tier.index() as u64
    }

    /// Wait until `tier` may generate and return the lease that holds its slot.
    ///
    /// The observer hears one `QueueStatus` per tick while waiting. Dropping
    /// the returned future stops the wait without touching the counters.
    pub async fn admit<O>(&self, tier: Tier, observer: &mut O) -> Result<(SessionLease, Admission)>
    where
        O: QueueObserver + ?Sized,
    {
        if let Some(lease) = self.try_admit(tier) {
            return Ok((lease, Admission::Immediate));
        }

        let mut occupancy = self.registry.occupancy_below(tier);
        let mut remaining = Self::wait_budget(occupancy, tier);
        let mut waited = 0;
        tracing::debug!(
            tier = %tier,
            occupancy,
            budget = remaining,
            "Session queued"
        );

        while remaining > 0 {
            observer
                .queued(QueueStatus {
                    occupancy,
                    remaining_secs: self.ticks_to_secs(remaining),
                })
                .await?;

            let admitted = self.wait_tick(tier).await;
            waited += 1;
            if let Some(lease) = admitted {
                return Ok((lease, Admission::Freed { waited }));
            }

            occupancy = self.registry.occupancy_below(tier);
            remaining -= 1;
        }

        tracing::info!(tier = %tier, occupancy, waited, "Wait budget exhausted, admitting anyway");
        Ok((
            SessionLease::acquire(self.registry.clone(), tier),
            Admission::Forced { waited },
        ))
    }

    fn try_admit(&self, tier: Tier) -> Option<SessionLease> {
        match self.mode {
            ReservationMode::Atomic => self.registry.try_reserve(tier),
            ReservationMode::CheckThenAcquire => {
                let occupancy = self.registry.occupancy_below(tier);
                Self::is_admissible(occupancy, tier, self.registry.capacity())
                    .then(|| SessionLease::acquire(self.registry.clone(), tier))
            }
        }
    }

    /// Sleep one tick, then try to admit. With `wake_on_release` every release
    /// inside the tick triggers an early attempt.
    async fn wait_tick(&self, tier: Tier) -> Option<SessionLease> {
        let deadline = Instant::now() + self.tick;

        if self.wake_on_release {
            loop {
                let released = self.registry.released();
                tokio::select! {
                    _ = sleep_until(deadline) => break,
                    _ = released => {
                        if let Some(lease) = self.try_admit(tier) {
                            return Some(lease);
                        }
                    }
                }
            }
        } else {
            sleep_until(deadline).await;
        }

        self.try_admit(tier)
    }

    fn ticks_to_secs(&self, ticks: u64) -> u64 {
        (self.tick.as_millis() as u64 * ticks).div_ceil(1000)
    }
}
