//! Validation Pipeline
//!
//! A fixed, ordered list of [`ValidationStep`]s built once by
//! [`ValidationPipelineBuilder`]. The first failing step rejects the UserOp
//! and nothing is written. When every step passes the UserOp is admitted to
//! the store, which re-checks the capacity limits under its lock, and only a
//! stored UserOp increments the sender's opsSeen.

use std::sync::Arc;
use std::time::Instant;

use alloy_primitives::{Address, B256};
use async_trait::async_trait;
use tracing::{debug, info, warn};

use crate::mempool::{AdmissionLimits, OperationStore, ValidationSnapshot};
use crate::metrics::ValidationMetrics;
use crate::provider::SharedChainClient;
use crate::reputation::ReputationTracker;
use crate::types::{EntityStake, UserOperation};

use super::config::ValidationConfig;
use super::error::Rejection;
use super::steps::{PendingCountGate, ReputationGate, Simulation, StaticChecks};

/// State threaded through the steps for one submission
#[derive(Debug, Clone)]
pub struct ValidationContext {
    pub user_op: UserOperation,
    pub entry_point: Address,
    pub hash: B256,
    /// Stake of the sender, filled by the reputation gate
    pub sender_stake: EntityStake,
    /// Whether a UserOp with the same key is pending
    pub is_replacement: bool,
    /// Capacity limits the store enforces on insert
    pub limits: AdmissionLimits,
    /// Facts recorded for bundling-time checks
    pub snapshot: ValidationSnapshot,
}

impl ValidationContext {
    pub fn new(user_op: UserOperation, entry_point: Address, chain_id: u64) -> Self {
        let hash = user_op.hash(entry_point, chain_id);
        Self {
            user_op,
            entry_point,
            hash,
            sender_stake: EntityStake::default(),
            is_replacement: false,
            limits: AdmissionLimits::default(),
            snapshot: ValidationSnapshot::default(),
        }
    }
}

/// One admission check
#[async_trait]
pub trait ValidationStep: std::fmt::Debug + Send + Sync {
    /// Name used in logs
    fn name(&self) -> &'static str;

    /// Passes, or rejects the UserOp
    async fn check(&self, ctx: &mut ValidationContext) -> Result<(), Rejection>;
}

/// Runs the admission steps and writes accepted UserOps to the store
#[derive(Debug)]
pub struct ValidationPipeline {
    steps: Vec<Box<dyn ValidationStep>>,
    store: Arc<OperationStore>,
    tracker: Arc<ReputationTracker>,
    metrics: ValidationMetricsHandle,
}

/// Metrics structs are not `Debug`.
struct ValidationMetricsHandle(ValidationMetrics);

impl std::fmt::Debug for ValidationMetricsHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("ValidationMetrics")
    }
}

impl ValidationPipeline {
    /// Validates a UserOp and admits it, returning its hash
    pub async fn validate(
        &self,
        user_op: UserOperation,
        entry_point: Address,
    ) -> Result<B256, Rejection> {
        let start = Instant::now();
        let result = self.run(user_op, entry_point).await;
        self.metrics.0.validation_duration.record(start.elapsed().as_secs_f64());

        match &result {
            Ok(hash) => {
                self.metrics.0.accepted.increment(1);
                info!(target: "bundler::validation", hash = %hash, entry_point = %entry_point, "Accepted UserOp");
            }
            Err(rejection) => {
                self.metrics.0.rejected.increment(1);
                debug!(
                    target: "bundler::validation",
                    entry_point = %entry_point,
                    code = rejection.code(),
                    error = %rejection,
                    "Rejected UserOp"
                );
            }
        }
        result
    }

    async fn run(&self, user_op: UserOperation, entry_point: Address) -> Result<B256, Rejection> {
        let mut ctx = ValidationContext::new(user_op, entry_point, self.store.chain_id());
        for step in &self.steps {
            step.check(&mut ctx).await?;
            debug!(target: "bundler::validation", hash = %ctx.hash, step = step.name(), "Step passed");
        }

        let sender = ctx.user_op.sender;
        let hash = self.store.admit(ctx.user_op, ctx.entry_point, ctx.snapshot, &ctx.limits)?;

        // The UserOp is stored at this point, so a failed counter write is not a rejection
        if let Err(e) = self.tracker.inc_seen(sender) {
            warn!(target: "bundler::validation", hash = %hash, sender = %sender, error = %e, "Failed to record opsSeen");
        }
        Ok(hash)
    }

    /// Names of the configured steps, in order
    pub fn step_names(&self) -> Vec<&'static str> {
        self.steps.iter().map(|s| s.name()).collect()
    }
}

/// Builds the fixed step order
#[derive(Debug)]
pub struct ValidationPipelineBuilder {
    store: Arc<OperationStore>,
    tracker: Arc<ReputationTracker>,
    client: SharedChainClient,
    config: ValidationConfig,
}

impl ValidationPipelineBuilder {
    pub fn new(
        store: Arc<OperationStore>,
        tracker: Arc<ReputationTracker>,
        client: SharedChainClient,
    ) -> Self {
        Self { store, tracker, client, config: ValidationConfig::default() }
    }

    /// Set the configuration
    pub fn with_config(mut self, config: ValidationConfig) -> Self {
        self.config = config;
        self
    }

    pub fn build(self) -> ValidationPipeline {
        let steps: Vec<Box<dyn ValidationStep>> = vec![
            Box::new(ReputationGate { client: Arc::clone(&self.client), tracker: Arc::clone(&self.tracker) }),
            Box::new(PendingCountGate {
                store: Arc::clone(&self.store),
                tracker: Arc::clone(&self.tracker),
                max_pool_size: self.config.max_pool_size,
            }),
            Box::new(StaticChecks { client: Arc::clone(&self.client), config: self.config.clone() }),
            Box::new(Simulation {
                client: Arc::clone(&self.client),
                tracker: Arc::clone(&self.tracker),
                expiry_margin_secs: self.config.expiry_margin_secs,
            }),
        ];

        ValidationPipeline {
            steps,
            store: self.store,
            tracker: self.tracker,
            metrics: ValidationMetricsHandle(ValidationMetrics::default()),
        }
    }
}
