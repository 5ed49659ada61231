//! Periodic driver for the federators

use super::Federator;
use crate::metrics;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{info, warn};

/// What a tick did
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickOutcome {
    Ran,
    /// The previous tick was still running
    Skipped,
}

/// Clears the running flag when a tick ends, even if it is cancelled
struct RunningGuard<'a>(&'a AtomicBool);

impl Drop for RunningGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Runs every federator, one after another, once per interval
pub struct Scheduler {
    federators: Vec<Arc<Federator>>,
    period: Duration,
    running: AtomicBool,
}

impl Scheduler {
    pub fn new(federators: Vec<Arc<Federator>>, period: Duration) -> Self {
        Self {
            federators,
            period,
            running: AtomicBool::new(false),
        }
    }

    fn try_begin(&self) -> Option<RunningGuard<'_>> {
        self.running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| RunningGuard(&self.running))
    }

    /// Run one cycle of each federator unless a previous tick is in flight
    pub async fn tick(&self) -> TickOutcome {
        let Some(_guard) = self.try_begin() else {
            warn!("Previous federator run still in progress, skipping tick");
            metrics::record_tick_skipped();
            return TickOutcome::Skipped;
        };

        for federator in &self.federators {
            // failures are logged, counted and alerted by the federator itself
            if federator.run().await.is_err() {
                info!(
                    "{}: {}, will retry on the next tick",
                    federator.direction(),
                    federator.state().await
                );
            }
        }

        TickOutcome::Ran
    }

    /// Tick every period until `shutdown` flips, then wait for the cycle in flight
    pub async fn start(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = interval(self.period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut in_flight: Vec<JoinHandle<TickOutcome>> = Vec::new();

        info!("Scheduler started, running every {:?}", self.period);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    in_flight.retain(|handle| !handle.is_finished());
                    let scheduler = self.clone();
                    in_flight.push(tokio::spawn(async move { scheduler.tick().await }));
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        info!("Scheduler stopping, waiting for {} running cycle(s)", in_flight.len());
        for handle in in_flight {
            if let Err(e) = handle.await {
                warn!("Federator task failed: {}", e);
            }
        }
        info!("Scheduler stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::SourceLedger;
    use crate::config::tests::sample_toml;
    use crate::config::Settings;
    use crate::error::FederatorResult;
    use crate::events::ScannedLog;
    use crate::notify::MockNotifier;
    use crate::state::MockCheckpointStore;
    use crate::tx::MockDestinationLedger;

    use async_trait::async_trait;
    use tokio::sync::Notify;

    /// Source whose head query blocks until released
    struct GatedSource {
        gate: Arc<Notify>,
    }

    #[async_trait]
    impl SourceLedger for GatedSource {
        async fn head(&self) -> FederatorResult<u64> {
            self.gate.notified().await;
            Ok(0)
        }

        async fn fetch_events(&self, _from: u64, _to: u64) -> FederatorResult<Vec<ScannedLog>> {
            Ok(Vec::new())
        }
    }

    fn gated_federator(gate: Arc<Notify>) -> Arc<Federator> {
        let config = Settings::from_toml(&sample_toml()).unwrap().forward().unwrap();

        let mut destination = MockDestinationLedger::new();
        destination.expect_chain_id().return_const(4u64);
        // checkpoint already at the head: nothing to scan once released
        let mut store = MockCheckpointStore::new();
        store.expect_load().returning(|_| Ok(Some(0)));
        let mut notifier = MockNotifier::new();
        notifier.expect_notify().return_const(());

        Arc::new(
            Federator::new(
                &config,
                Arc::new(GatedSource { gate }),
                Arc::new(destination),
                Arc::new(store),
                Arc::new(notifier),
            )
            .unwrap(),
        )
    }

    #[tokio::test]
    async fn test_tick_without_federators_runs() {
        let scheduler = Scheduler::new(Vec::new(), Duration::from_secs(60));
        assert_eq!(scheduler.tick().await, TickOutcome::Ran);
        assert_eq!(scheduler.tick().await, TickOutcome::Ran);
    }

    #[tokio::test]
    async fn test_overlapping_tick_is_skipped() {
        let gate = Arc::new(Notify::new());
        let scheduler = Arc::new(Scheduler::new(
            vec![gated_federator(gate.clone())],
            Duration::from_secs(60),
        ));

        let first = tokio::spawn({
            let scheduler = scheduler.clone();
            async move { scheduler.tick().await }
        });
        while !scheduler.running.load(Ordering::Acquire) {
            tokio::task::yield_now().await;
        }

        assert_eq!(scheduler.tick().await, TickOutcome::Skipped);

        gate.notify_one();
        assert_eq!(first.await.unwrap(), TickOutcome::Ran);
        assert!(!scheduler.running.load(Ordering::Acquire));
    }

    #[tokio::test]
    async fn test_cancelled_tick_releases_running_flag() {
        let gate = Arc::new(Notify::new());
        let scheduler = Arc::new(Scheduler::new(
            vec![gated_federator(gate.clone())],
            Duration::from_secs(60),
        ));

        let stuck = tokio::spawn({
            let scheduler = scheduler.clone();
            async move { scheduler.tick().await }
        });
        while !scheduler.running.load(Ordering::Acquire) {
            tokio::task::yield_now().await;
        }

        stuck.abort();
        assert!(stuck.await.unwrap_err().is_cancelled());
        assert!(!scheduler.running.load(Ordering::Acquire));

        gate.notify_one();
        assert_eq!(scheduler.tick().await, TickOutcome::Ran);
    }

    #[tokio::test]
    async fn test_shutdown_waits_for_running_cycle() {
        let gate = Arc::new(Notify::new());
        let scheduler = Arc::new(Scheduler::new(
            vec![gated_federator(gate.clone())],
            Duration::from_secs(3600),
        ));
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let driver = tokio::spawn(scheduler.clone().start(shutdown_rx));
        // the first tick fires immediately
        while !scheduler.running.load(Ordering::Acquire) {
            tokio::task::yield_now().await;
        }

        shutdown_tx.send(true).unwrap();
        tokio::task::yield_now().await;
        assert!(!driver.is_finished());

        gate.notify_one();
        driver.await.unwrap();
        assert!(!scheduler.running.load(Ordering::Acquire));
    }
}
