//! Background eviction of expired limiter state.
//!
//! Sweeping only bounds memory. Evaluation already treats expired entries
//! as absent, so sweeps may interleave with evaluations arbitrarily.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info, warn};

use super::clock::Clock;
use super::store::{RateLimitStore, SweepStats};

/// Periodically removes expired entries from a store.
pub struct Sweeper {
    store: Arc<dyn RateLimitStore>,
    clock: Arc<dyn Clock>,
    interval: Duration,
}

impl Sweeper {
    pub fn new(store: Arc<dyn RateLimitStore>, clock: Arc<dyn Clock>, interval: Duration) -> Self {
        Self {
            store,
            clock,
            interval,
        }
    }

    /// Sweep once, synchronously.
    pub fn run_once(&self) -> SweepStats {
        self.store.sweep(self.clock.now())
    }

    /// Spawn the sweep loop on the current tokio runtime.
    ///
    /// The first sweep happens one interval after start.
    ///
    /// # Panics
    ///
    /// Panics if called outside a tokio runtime.
    pub fn start(self) -> SweeperHandle {
        let (shutdown_tx, mut shutdown_rx) = oneshot::channel::<()>();

        let task = tokio::spawn(async move {
            info!(interval_ms = self.interval.as_millis() as u64, "Sweeper started");

            let mut ticker = interval(self.interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // The first tick completes immediately
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let removed = self.run_once();
                        debug!(removed = removed.total(), "Sweep pass complete");
                    }
                    _ = &mut shutdown_rx => {
                        info!("Sweeper received shutdown signal");
                        break;
                    }
                }
            }

            info!("Sweeper stopped");
        });

        SweeperHandle {
            shutdown: Some(shutdown_tx),
            task: Some(task),
        }
    }
}

/// Handle to a running sweeper. Dropping it aborts the task.
#[derive(Debug)]
pub struct SweeperHandle {
    shutdown: Option<oneshot::Sender<()>>,
    task: Option<JoinHandle<()>>,
}

impl SweeperHandle {
    /// Whether the sweep loop is still running.
    pub fn is_running(&self) -> bool {
        self.task.as_ref().is_some_and(|t| !t.is_finished())
    }

    /// Stop the sweep loop and wait for it to exit.
    pub async fn shutdown(mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                warn!(error = %e, "Sweeper task ended abnormally");
            }
        }
    }
}

impl Drop for SweeperHandle {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ratelimit::clock::ManualClock;
    use crate::ratelimit::key::WindowKey;
    use crate::ratelimit::store::InMemoryStore;
    use crate::ratelimit::window::Granularity;
    use chrono::{TimeZone, Utc};

    fn seeded_store() -> (Arc<InMemoryStore>, Arc<ManualClock>) {
        let start = Utc.with_ymd_and_hms(2024, 7, 1, 0, 0, 0).unwrap();
        let clock = Arc::new(ManualClock::new(start));
        let store = Arc::new(InMemoryStore::new());
        for g in Granularity::ALL {
            store
                .check_window(&WindowKey::new("ip:1.2.3.4", g), 10, start)
                .unwrap();
        }
        (store, clock)
    }

    #[test]
    fn test_run_once_evicts_expired() {
        let (store, clock) = seeded_store();
        let sweeper = Sweeper::new(store.clone(), clock.clone(), Duration::from_secs(300));

        assert_eq!(sweeper.run_once().total(), 0);

        clock.advance(chrono::Duration::minutes(5));
        let removed = sweeper.run_once();
        assert_eq!(removed.windows, 2);
        assert_eq!(store.stats().windows, 2);
    }

    #[tokio::test]
    async fn test_background_sweep_and_shutdown() {
        let (store, clock) = seeded_store();
        clock.advance(chrono::Duration::days(2));

        let handle = Sweeper::new(store.clone(), clock, Duration::from_millis(20)).start();
        assert!(handle.is_running());

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(store.stats().windows, 0);

        handle.shutdown().await;
    }

    #[tokio::test]
    async fn test_drop_stops_sweeper() {
        let (store, clock) = seeded_store();
        let handle = Sweeper::new(store.clone(), clock.clone(), Duration::from_millis(20)).start();
        drop(handle);

        clock.advance(chrono::Duration::days(2));
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(store.stats().windows, 4);
    }
}
