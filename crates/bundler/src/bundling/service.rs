//! Background bundling loop.
//!
//! One task per entry point wakes on the ticker or an explicit trigger and
//! runs a cycle unless one is already in flight. Aborted cycles pause the
//! loop with exponential backoff. Cancellation is only observed between
//! cycles, so shutdown waits for the in-flight cycle to reconcile.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use alloy_primitives::Address;
use backon::{BackoffBuilder, ExponentialBackoff, ExponentialBuilder};
use tokio::sync::{Mutex, Notify};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::metrics::BundlingMetrics;

use super::config::BundlerConfig;
use super::context::CycleAbort;
use super::pipeline::{BundlePipeline, BundlingMetricsHandle, CycleReport};

/// Schedules bundling cycles for the supported entry points
#[derive(Debug)]
pub struct BundlerService {
    pipeline: BundlePipeline,
    config: BundlerConfig,
    /// Single-flight guard per entry point
    in_flight: HashMap<Address, Mutex<()>>,
    trigger: Notify,
    cycle: AtomicU64,
    metrics: BundlingMetricsHandle,
}

impl BundlerService {
    pub fn new(pipeline: BundlePipeline, entry_points: &[Address], config: BundlerConfig) -> Self {
        Self {
            pipeline,
            config,
            in_flight: entry_points.iter().map(|ep| (*ep, Mutex::new(()))).collect(),
            trigger: Notify::new(),
            cycle: AtomicU64::new(0),
            metrics: BundlingMetricsHandle(BundlingMetrics::default()),
        }
    }

    /// Wakes every loop waiting for its next tick
    pub fn trigger(&self) {
        self.trigger.notify_waiters();
    }

    /// Runs a cycle unless one is already running for `entry_point`.
    ///
    /// Returns `Ok(None)` when the cycle was skipped.
    pub async fn try_run_cycle(&self, entry_point: Address) -> Result<Option<CycleReport>, CycleAbort> {
        let lock = self.in_flight.get(&entry_point).ok_or(CycleAbort::UnsupportedEntryPoint(entry_point))?;
        let Ok(_guard) = lock.try_lock() else {
            self.metrics.0.cycles_skipped.increment(1);
            debug!(target: "bundler::bundling", entry_point = %entry_point, "Cycle in flight, skipping");
            return Ok(None);
        };
        self.run_with_deadline(entry_point).await.map(Some)
    }

    /// Waits for any running cycle of `entry_point`, then runs one
    pub async fn send_bundle_now(&self, entry_point: Address) -> Result<CycleReport, CycleAbort> {
        let lock = self.in_flight.get(&entry_point).ok_or(CycleAbort::UnsupportedEntryPoint(entry_point))?;
        let _guard = lock.lock().await;
        self.run_with_deadline(entry_point).await
    }

    async fn run_with_deadline(&self, entry_point: Address) -> Result<CycleReport, CycleAbort> {
        let cycle = self.cycle.fetch_add(1, Ordering::Relaxed) + 1;
        match tokio::time::timeout(self.config.cycle_timeout, self.pipeline.run_cycle(entry_point, cycle)).await {
            Ok(result) => result,
            Err(_) => {
                self.metrics.0.cycles_aborted.increment(1);
                warn!(target: "bundler::bundling", entry_point = %entry_point, cycle, "Cycle deadline exceeded");
                Err(CycleAbort::Deadline)
            }
        }
    }

    fn backoff(&self) -> ExponentialBackoff {
        ExponentialBuilder::default()
            .with_min_delay(self.config.backoff_min_delay)
            .with_max_delay(self.config.backoff_max_delay)
            .without_max_times()
            .build()
    }

    /// Spawns one loop per entry point, running until `cancel` fires
    pub fn spawn(self: Arc<Self>, cancel: CancellationToken) -> Vec<JoinHandle<()>> {
        let mut entry_points: Vec<_> = self.in_flight.keys().copied().collect();
        entry_points.sort();
        entry_points
            .into_iter()
            .map(|entry_point| tokio::spawn(Arc::clone(&self).run_loop(entry_point, cancel.clone())))
            .collect()
    }

    async fn run_loop(self: Arc<Self>, entry_point: Address, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(self.config.bundle_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut backoff = self.backoff();
        let mut paused_until: Option<Instant> = None;

        info!(target: "bundler::bundling", entry_point = %entry_point, "Bundler started");
        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {}
                _ = self.trigger.notified() => {}
            }

            if paused_until.is_some_and(|until| Instant::now() < until) {
                continue;
            }

            match self.try_run_cycle(entry_point).await {
                Ok(Some(_)) => {
                    paused_until = None;
                    backoff = self.backoff();
                }
                Ok(None) => {}
                Err(abort) => {
                    let delay = backoff.next().unwrap_or(self.config.backoff_max_delay);
                    debug!(
                        target: "bundler::bundling",
                        entry_point = %entry_point,
                        error = %abort,
                        delay_ms = delay.as_millis() as u64,
                        "Backing off"
                    );
                    paused_until = Some(Instant::now() + delay);
                }
            }
        }
        info!(target: "bundler::bundling", entry_point = %entry_point, "Bundler stopped");
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use alloy_primitives::B256;
    use async_trait::async_trait;

    use super::*;
    use crate::bundling::BundlePipelineBuilder;
    use crate::gateway::{GatewayError, SubmissionGateway};
    use crate::mempool::{EntryState, OperationStore, StoreConfig, ValidationSnapshot};
    use crate::provider::SharedChainClient;
    use crate::reputation::{ReputationConfig, ReputationTracker};
    use crate::storage::Database;
    use crate::test_utils::{MockChainClient, MockGateway, test_address, test_user_op};
    use crate::types::UserOperation;

    /// Gateway that never answers within a test deadline
    #[derive(Debug)]
    struct StalledGateway;

    #[async_trait]
    impl SubmissionGateway for StalledGateway {
        fn signer(&self) -> Address {
            MockGateway::SIGNER
        }

        fn beneficiary(&self) -> Address {
            MockGateway::BENEFICIARY
        }

        async fn verify_chain(&self) -> Result<(), GatewayError> {
            Ok(())
        }

        async fn submit(&self, _entry_point: Address, _batch: &[UserOperation]) -> Result<B256, GatewayError> {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(B256::ZERO)
        }
    }

    struct Harness {
        _dir: tempfile::TempDir,
        store: Arc<OperationStore>,
        gateway: Arc<MockGateway>,
        service: Arc<BundlerService>,
        ep: Address,
    }

    fn harness_with(config: BundlerConfig, stalled: bool) -> Harness {
        let dir = tempfile::tempdir().unwrap();
        let db = Arc::new(Database::open(dir.path()).unwrap());
        let store = Arc::new(OperationStore::open(Arc::clone(&db), StoreConfig::new(1337)).unwrap());
        let tracker = Arc::new(ReputationTracker::open(db, ReputationConfig::default()).unwrap());
        let client = Arc::new(MockChainClient::new()) as SharedChainClient;
        let gateway = Arc::new(MockGateway::new());
        let submission = if stalled {
            Arc::new(StalledGateway) as Arc<dyn SubmissionGateway>
        } else {
            Arc::clone(&gateway) as Arc<dyn SubmissionGateway>
        };
        let ep = test_address(0xee);

        let pipeline = BundlePipelineBuilder::new(Arc::clone(&store), tracker, client, submission)
            .with_config(config.clone())
            .build();
        let service = Arc::new(BundlerService::new(pipeline, &[ep], config));

        Harness { _dir: dir, store, gateway, service, ep }
    }

    fn harness(config: BundlerConfig) -> Harness {
        harness_with(config, false)
    }

    #[tokio::test]
    async fn test_send_bundle_now() {
        let h = harness(BundlerConfig::default());
        let hash = h.store.add(test_user_op(1, 0, 100, 5), h.ep, ValidationSnapshot::default()).unwrap();

        let report = h.service.send_bundle_now(h.ep).await.unwrap();

        assert_eq!(report.included, vec![hash]);
        assert_eq!(report.cycle, 1);
        assert_eq!(h.gateway.submitted().len(), 1);
    }

    #[tokio::test]
    async fn test_unsupported_entry_point() {
        let h = harness(BundlerConfig::default());
        let err = h.service.send_bundle_now(test_address(0xaa)).await.unwrap_err();
        assert!(matches!(err, CycleAbort::UnsupportedEntryPoint(_)));
    }

    #[tokio::test]
    async fn test_cycle_in_flight_is_skipped() {
        let h = harness(BundlerConfig::default());
        h.store.add(test_user_op(1, 0, 100, 5), h.ep, ValidationSnapshot::default()).unwrap();

        let _guard = h.service.in_flight[&h.ep].lock().await;
        assert_eq!(h.service.try_run_cycle(h.ep).await.unwrap(), None);
        assert!(h.gateway.submitted().is_empty());
    }

    #[tokio::test]
    async fn test_deadline_leaves_ops_queued() {
        let config = BundlerConfig::default().with_timing(Duration::from_secs(1), Duration::from_millis(50));
        let h = harness_with(config, true);
        let hash = h.store.add(test_user_op(1, 0, 100, 5), h.ep, ValidationSnapshot::default()).unwrap();

        let err = h.service.send_bundle_now(h.ep).await.unwrap_err();

        assert!(matches!(err, CycleAbort::Deadline));
        assert_eq!(h.store.get(&hash).unwrap().state, EntryState::Queued);
    }

    #[tokio::test]
    async fn test_loop_bundles_and_stops_on_cancel() {
        let config = BundlerConfig::default().with_timing(Duration::from_millis(10), Duration::from_secs(5));
        let h = harness(config);
        h.store.add(test_user_op(1, 0, 100, 5), h.ep, ValidationSnapshot::default()).unwrap();

        let cancel = CancellationToken::new();
        let handles = Arc::clone(&h.service).spawn(cancel.clone());

        let deadline = Instant::now() + Duration::from_secs(5);
        while !h.store.is_empty(&h.ep) && Instant::now() < deadline {
            h.service.trigger();
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        cancel.cancel();
        for handle in handles {
            handle.await.unwrap();
        }

        assert!(h.store.is_empty(&h.ep));
        assert_eq!(h.gateway.submitted().len(), 1);
    }
}
