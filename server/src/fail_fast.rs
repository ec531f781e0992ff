//! Shutdown after repeated engine failures.
//!
//! When the generation engine keeps failing, the operator may prefer the
//! process to exit and be restarted by its supervisor.

use std::sync::atomic::{AtomicU32, Ordering};

use tokio::sync::watch;

/// Counts consecutive engine failures and trips once a threshold is reached.
#[derive(Debug)]
pub struct FailFast {
    threshold: Option<u32>,
    consecutive: AtomicU32,
    tripped: watch::Sender<bool>,
}

impl FailFast {
    /// `None` never trips.
    pub fn new(threshold: Option<u32>) -> Self {
        let (tripped, _) = watch::channel(false);
        Self {
            threshold,
            consecutive: AtomicU32::new(0),
            tripped,
        }
    }

    pub fn disabled() -> Self {
        Self::new(None)
    }

    pub fn record_success(&self) {
        self.consecutive.store(0, Ordering::Relaxed);
    }

    /// Returns `true` if this failure tripped the breaker.
    pub fn record_failure(&self) -> bool {
        let failures = self.consecutive.fetch_add(1, Ordering::Relaxed) + 1;
        match self.threshold {
            Some(threshold) if failures >= threshold && !self.is_tripped() => {
                tracing::error!(
                    failures,
                    "Engine failed {} times in a row, shutting down",
                    failures
                );
                self.tripped.send_replace(true);
                true
            }
            _ => false,
        }
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive.load(Ordering::Relaxed)
    }

    pub fn is_tripped(&self) -> bool {
        *self.tripped.borrow()
    }

    /// Resolves once the breaker has tripped.
    pub async fn tripped(&self) {
        let mut rx = self.tripped.subscribe();
        // The sender lives in `self`, so the channel cannot close while we wait.
        let _ = rx.wait_for(|tripped| *tripped).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_disabled_never_trips() {
        let fail_fast = FailFast::disabled();
        for _ in 0..100 {
            assert!(!fail_fast.record_failure());
        }
        assert!(!fail_fast.is_tripped());
    }

    #[test]
    fn test_success_resets_count() {
        let fail_fast = FailFast::new(Some(3));
        fail_fast.record_failure();
        fail_fast.record_failure();
        fail_fast.record_success();
        assert_eq!(fail_fast.consecutive_failures(), 0);
        assert!(!fail_fast.record_failure());
        assert!(!fail_fast.is_tripped());
    }

    #[test]
    fn test_trips_once_at_threshold() {
        let fail_fast = FailFast::new(Some(2));
        assert!(!fail_fast.record_failure());
        assert!(fail_fast.record_failure());
        assert!(fail_fast.is_tripped());
        assert!(!fail_fast.record_failure());
    }

    #[tokio::test]
    async fn test_tripped_resolves() {
        let fail_fast = FailFast::new(Some(1));
        let waiter = fail_fast.tripped();
        fail_fast.record_failure();
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("breaker should trip");
    }
}
