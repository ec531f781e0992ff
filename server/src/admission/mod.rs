//! Tiered admission control.
//!
//! This module provides:
//! - `CapacityRegistry`: per-tier counts of sessions holding capacity
//! - `AdmissionGate`: the admit-or-wait decision and the backoff loop
//! - `SessionLease`: a scoped reservation released on every exit path
//! - `Tier`: a validated priority class
//!
//! A session of tier `t` is admitted immediately when the occupancy of all
//! tiers below `t` is less than `capacity - t`. Otherwise it waits, one tick
//! at a time, for at most `(occupancy + 1) * t` ticks and is then admitted
//! regardless of occupancy.

mod gate;
mod lease;
mod registry;
mod tier;

pub use gate::{Admission, AdmissionGate, QueueObserver, ReservationMode};
pub use lease::SessionLease;
pub use registry::CapacityRegistry;
pub use tier::{InvalidTierPolicy, Tier};
