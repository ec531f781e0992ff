//! Shared application state.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use tiergate_common::QueueDepth;

use crate::admission::{AdmissionGate, CapacityRegistry};
use crate::config::Config;
use crate::engine::GenerationEngine;
use crate::fail_fast::FailFast;
use crate::session::SessionContext;
use crate::transcript::TranscriptStore;

/// Shared application state passed to all handlers.
pub struct AppState {
    pub config: Config,
    /// Collaborators handed to every streaming session.
    pub session: SessionContext,
    connections: Arc<AtomicUsize>,
}

impl AppState {
    pub fn new(
        config: Config,
        engine: Arc<dyn GenerationEngine>,
        transcripts: Arc<dyn TranscriptStore>,
    ) -> Self {
        let registry = Arc::new(CapacityRegistry::new(config.admission.tiers));
        let gate = AdmissionGate::new(registry, config.admission.tick())
            .with_mode(config.admission.reservation)
            .with_wake_on_release(config.admission.wake_on_release);

        let session = SessionContext {
            gate,
            engine,
            transcripts,
            fail_fast: Arc::new(FailFast::new(config.fail_fast.max_consecutive_failures)),
            tier_policy: config.admission.invalid_tier,
            generation_timeout: config.session.generation_timeout(),
        };

        Self {
            config,
            session,
            connections: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn registry(&self) -> &Arc<CapacityRegistry> {
        self.session.gate.registry()
    }

    pub fn fail_fast(&self) -> &Arc<FailFast> {
        &self.session.fail_fast
    }

    /// Count a streaming connection until the guard is dropped.
    pub fn track_connection(&self) -> ConnectionGuard {
        self.connections.fetch_add(1, Ordering::Relaxed);
        ConnectionGuard {
            connections: self.connections.clone(),
        }
    }

    pub fn queue_depth(&self) -> QueueDepth {
        QueueDepth {
            queue_length: self.registry().total(),
            connections: self.connections.load(Ordering::Relaxed),
        }
    }
}

/// Keeps one streaming connection counted.
pub struct ConnectionGuard {
    connections: Arc<AtomicUsize>,
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.connections.fetch_sub(1, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::admission::{InvalidTierPolicy, SessionLease, Tier};
    use crate::test_util::test_state;

    #[test]
    fn test_queue_depth_counts_leases_and_connections() {
        let state = test_state(Vec::<String>::new());
        assert_eq!(
            state.queue_depth(),
            QueueDepth {
                queue_length: 0,
                connections: 0
            }
        );

        let tier = Tier::new(2, 4, InvalidTierPolicy::Reject).unwrap();
        let _lease = SessionLease::acquire(state.registry().clone(), tier);
        let first = state.track_connection();
        let _second = state.track_connection();
        assert_eq!(state.queue_depth().queue_length, 1);
        assert_eq!(state.queue_depth().connections, 2);

        drop(first);
        assert_eq!(state.queue_depth().connections, 1);
    }

    #[test]
    fn test_state_follows_admission_config() {
        let mut config = Config::default();
        config.admission.tiers = 6;
        config.admission.invalid_tier = InvalidTierPolicy::Clamp;
        let state = AppState::new(
            config,
            Arc::new(crate::test_util::ScriptedEngine::new(["x"])),
            Arc::new(crate::transcript::DisabledTranscripts),
        );
        assert_eq!(state.registry().tiers(), 6);
        assert_eq!(state.session.tier_policy, InvalidTierPolicy::Clamp);
    }
}
