//! Bundling Pipeline
//!
//! One cycle lists the pending UserOps of an entry point, runs them through
//! the fixed list of [`BundleStep`]s built by [`BundlePipelineBuilder`] and
//! reconciles the mempool and reputation with the outcome:
//!
//! - the cycle completed: included, dropped and expired UserOps are removed,
//!   included senders are credited once per (hash, cycle), senders of
//!   penalizing drops are penalized, held back UserOps are marked requeued.
//! - the cycle aborted: the mempool and reputation are left untouched, expired
//!   UserOps are removed by the next completed cycle.

use std::sync::Arc;
use std::time::Instant;

use alloy_primitives::{Address, B256};
use async_trait::async_trait;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::gateway::SubmissionGateway;
use crate::mempool::{OperationStore, now_millis};
use crate::metrics::BundlingMetrics;
use crate::provider::SharedChainClient;
use crate::reputation::ReputationTracker;

use super::config::BundlerConfig;
use super::context::{BatchContext, CycleAbort, Outcome};
use super::steps::{
    CodeHashes, Expire, FilterUnderpriced, PackGasLimit, PaymasterDeposit, SimulateBatch,
    SortByNonce, SortByPrice, Submit,
};

/// One stage of a bundling cycle
#[async_trait]
pub trait BundleStep: std::fmt::Debug + Send + Sync {
    /// Name used in logs
    fn name(&self) -> &'static str;

    /// Narrows or reorders the batch, or aborts the cycle
    async fn apply(&self, ctx: &mut BatchContext) -> Result<(), CycleAbort>;
}

/// Summary of a reconciled cycle
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CycleReport {
    pub entry_point: Address,
    pub cycle: u64,
    /// Hash of the submitted bundle transaction
    pub transaction_hash: Option<B256>,
    /// Hashes of the included UserOps, in bundle order
    pub included: Vec<B256>,
    pub dropped: usize,
    pub expired: usize,
    pub requeued: usize,
}

/// Metrics structs are not `Debug`.
pub(super) struct BundlingMetricsHandle(pub(super) BundlingMetrics);

impl std::fmt::Debug for BundlingMetricsHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("BundlingMetrics")
    }
}

/// Runs bundling cycles for any entry point
#[derive(Debug)]
pub struct BundlePipeline {
    steps: Vec<Box<dyn BundleStep>>,
    store: Arc<OperationStore>,
    tracker: Arc<ReputationTracker>,
    client: SharedChainClient,
    metrics: BundlingMetricsHandle,
}

impl BundlePipeline {
    /// Runs one cycle for `entry_point` and reconciles its outcome
    pub async fn run_cycle(&self, entry_point: Address, cycle: u64) -> Result<CycleReport, CycleAbort> {
        let start = Instant::now();
        self.metrics.0.cycles.increment(1);

        let result = self.run(entry_point, cycle).await;
        self.metrics.0.cycle_duration.record(start.elapsed().as_secs_f64());

        match &result {
            Ok(report) if report.transaction_hash.is_some() => {
                info!(
                    target: "bundler::bundling",
                    entry_point = %entry_point,
                    cycle,
                    tx_hash = ?report.transaction_hash,
                    ops = report.included.len(),
                    dropped = report.dropped,
                    requeued = report.requeued,
                    "Bundle submitted"
                );
            }
            Ok(report) => {
                debug!(
                    target: "bundler::bundling",
                    entry_point = %entry_point,
                    cycle,
                    dropped = report.dropped,
                    expired = report.expired,
                    requeued = report.requeued,
                    "Cycle produced no bundle"
                );
            }
            Err(abort) => {
                self.metrics.0.cycles_aborted.increment(1);
                warn!(target: "bundler::bundling", entry_point = %entry_point, cycle, error = %abort, "Cycle aborted");
            }
        }
        result
    }

    async fn run(&self, entry_point: Address, cycle: u64) -> Result<CycleReport, CycleAbort> {
        let candidates = self.store.list(entry_point);
        if candidates.is_empty() {
            return Ok(CycleReport { entry_point, cycle, ..Default::default() });
        }

        let base_fee = self.client.base_fee().await?;
        let network_tip = self.client.max_priority_fee().await?;
        let mut ctx = BatchContext::new(entry_point, cycle, now_millis(), base_fee, network_tip, candidates);

        for step in &self.steps {
            step.apply(&mut ctx).await?;
            debug!(
                target: "bundler::bundling",
                cycle,
                step = step.name(),
                remaining = ctx.candidates.len(),
                "Step applied"
            );
        }

        self.reconcile(&ctx)
    }

    fn reconcile(&self, ctx: &BatchContext) -> Result<CycleReport, CycleAbort> {
        let storage = |e: &dyn std::fmt::Display| CycleAbort::Storage(e.to_string());

        let (included, mut requeued) = match ctx.tx_hash {
            Some(_) => (ctx.candidates.iter().collect::<Vec<_>>(), Vec::new()),
            None => (Vec::new(), ctx.candidates.iter().map(|e| e.hash).collect()),
        };
        requeued.extend(ctx.hashes_where(|o| *o == Outcome::Requeued));
        let dropped = ctx.hashes_where(|o| matches!(o, Outcome::Dropped { .. }));
        let expired = ctx.hashes_where(|o| *o == Outcome::Expired);

        let mut removals: Vec<B256> = included.iter().map(|e| e.hash).collect();
        removals.extend(&dropped);
        removals.extend(&expired);
        self.store.remove(&removals).map_err(|e| storage(&e))?;

        for entry in &included {
            self.tracker.inc_included(entry.sender(), entry.hash, ctx.cycle).map_err(|e| storage(&e))?;
        }
        for resolution in ctx.outcomes.values() {
            if let Outcome::Dropped { penalize: true, .. } = resolution.outcome {
                self.tracker.penalize(resolution.sender).map_err(|e| storage(&e))?;
            }
        }
        self.store.mark_requeued(&requeued).map_err(|e| storage(&e))?;

        if ctx.tx_hash.is_some() {
            self.metrics.0.bundles_submitted.increment(1);
        }
        self.metrics.0.ops_included.increment(included.len() as u64);
        self.metrics.0.ops_dropped.increment(dropped.len() as u64);
        self.metrics.0.ops_expired.increment(expired.len() as u64);
        self.metrics.0.ops_requeued.increment(requeued.len() as u64);

        Ok(CycleReport {
            entry_point: ctx.entry_point,
            cycle: ctx.cycle,
            transaction_hash: ctx.tx_hash,
            included: included.iter().map(|e| e.hash).collect(),
            dropped: dropped.len(),
            expired: expired.len(),
            requeued: requeued.len(),
        })
    }

    /// Names of the configured steps, in order
    pub fn step_names(&self) -> Vec<&'static str> {
        self.steps.iter().map(|s| s.name()).collect()
    }
}

/// Builds the fixed step order
#[derive(Debug)]
pub struct BundlePipelineBuilder {
    store: Arc<OperationStore>,
    tracker: Arc<ReputationTracker>,
    client: SharedChainClient,
    gateway: Arc<dyn SubmissionGateway>,
    config: BundlerConfig,
}

impl BundlePipelineBuilder {
    pub fn new(
        store: Arc<OperationStore>,
        tracker: Arc<ReputationTracker>,
        client: SharedChainClient,
        gateway: Arc<dyn SubmissionGateway>,
    ) -> Self {
        Self { store, tracker, client, gateway, config: BundlerConfig::default() }
    }

    /// Set the configuration
    pub fn with_config(mut self, config: BundlerConfig) -> Self {
        self.config = config;
        self
    }

    pub fn build(self) -> BundlePipeline {
        let steps: Vec<Box<dyn BundleStep>> = vec![
            Box::new(Expire { max_op_ttl_millis: self.config.max_op_ttl.as_millis() as u64 }),
            Box::new(SortByPrice),
            Box::new(FilterUnderpriced { min_priority_fee: self.config.min_priority_fee }),
            Box::new(SortByNonce),
            Box::new(PackGasLimit {
                max_batch_gas_limit: self.config.max_batch_gas_limit,
                max_batch_size: self.config.max_batch_size,
            }),
            Box::new(CodeHashes { client: Arc::clone(&self.client) }),
            Box::new(PaymasterDeposit { client: Arc::clone(&self.client) }),
            Box::new(SimulateBatch {
                client: Arc::clone(&self.client),
                gateway: Arc::clone(&self.gateway),
                max_retries: self.config.max_batch_simulation_retries,
            }),
            Box::new(Submit { gateway: self.gateway }),
        ];

        BundlePipeline {
            steps,
            store: self.store,
            tracker: self.tracker,
            client: self.client,
            metrics: BundlingMetricsHandle(BundlingMetrics::default()),
        }
    }
}
