//! Reputation System
//!
//! Tracks per-sender counters and derives a status from them.
//!
//! # Metrics Tracked
//! - `ops_seen`: UserOps from this sender that passed validation
//! - `ops_included`: UserOps from this sender included in a submitted bundle
//!
//! # Status
//! With `min_expected = ops_seen / denominator`:
//! - OK: `min_expected <= ops_included + throttling_slack`
//! - Throttled: `min_expected <= ops_included + ban_slack`
//! - Banned: otherwise
//!
//! Counters decay by 1/24 every interval, so a banned sender recovers over
//! time without records ever being deleted.

use std::collections::HashMap;
use std::sync::Arc;

use alloy_primitives::{Address, B256};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::mempool::now_millis;
use crate::metrics::ReputationMetrics;
use crate::storage::{Database, REPUTATION_CF, StorageError};
use crate::types::EntityStake;

use super::config::ReputationConfig;

/// Credited (hash, cycle) pairs kept before pruning.
const MAX_CREDITED: usize = 16_384;
/// Cycles a credit is remembered for after pruning starts.
const CREDIT_RETENTION_CYCLES: u64 = 64;

/// Status of a sender's reputation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReputationStatus {
    /// Sender has good reputation
    #[default]
    Ok,

    /// Sender is limited to a stake-scaled number of pending UserOps
    Throttled,

    /// Sender is banned, all UserOps rejected
    Banned,
}

/// Errors from the reputation tracker
#[derive(Debug, Error)]
pub enum ReputationError {
    /// Sender already has as many pending UserOps as its status allows
    #[error("sender {sender} has {pending} pending UserOps, limit is {limit}")]
    OpLimitReached { sender: Address, pending: usize, limit: usize },

    /// Persistence failure
    #[error(transparent)]
    Storage(#[from] StorageError),
}

/// Reputation counters for a single sender
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReputationRecord {
    /// UserOps seen from this sender
    pub ops_seen: u64,

    /// UserOps included on-chain
    pub ops_included: u64,

    /// Unix milliseconds of the last update
    pub updated_at: u64,
}

impl ReputationRecord {
    /// Derive the status from the counters
    pub fn status(&self, config: &ReputationConfig, staked: bool) -> ReputationStatus {
        let denominator = if staked {
            config.staked_min_inclusion_denominator
        } else {
            config.min_inclusion_denominator
        };
        let min_expected = self.ops_seen / denominator.max(1);

        if min_expected <= self.ops_included.saturating_add(config.throttling_slack) {
            ReputationStatus::Ok
        } else if min_expected <= self.ops_included.saturating_add(config.ban_slack) {
            ReputationStatus::Throttled
        } else {
            ReputationStatus::Banned
        }
    }

    /// Apply one decay step to the counters
    pub fn decay(&mut self) {
        self.ops_seen -= self.ops_seen / 24;
        self.ops_included -= self.ops_included / 24;
    }
}

/// Serializable view of a sender's reputation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReputationEntry {
    pub address: Address,
    pub ops_seen: u64,
    pub ops_included: u64,
    pub status: ReputationStatus,
}

/// Durable per-sender reputation shared by both pipelines
pub struct ReputationTracker {
    db: Arc<Database>,
    config: ReputationConfig,
    records: RwLock<HashMap<Address, ReputationRecord>>,
    /// hash -> cycle in which its inclusion was credited
    credited: Mutex<HashMap<B256, u64>>,
    metrics: ReputationMetrics,
}

impl std::fmt::Debug for ReputationTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReputationTracker")
            .field("config", &self.config)
            .field("senders", &self.records.read().len())
            .finish()
    }
}

impl ReputationTracker {
    /// Load all persisted records
    pub fn open(db: Arc<Database>, config: ReputationConfig) -> Result<Self, StorageError> {
        let mut records = HashMap::new();
        for (key, record) in db.load_all::<ReputationRecord>(REPUTATION_CF)? {
            if key.len() == 20 {
                records.insert(Address::from_slice(&key), record);
            }
        }
        info!(target: "bundler::reputation", senders = records.len(), "Loaded reputation records");

        Ok(Self {
            db,
            config,
            records: RwLock::new(records),
            credited: Mutex::new(HashMap::new()),
            metrics: ReputationMetrics::default(),
        })
    }

    /// Get the configuration
    pub fn config(&self) -> &ReputationConfig {
        &self.config
    }

    /// Whether a stake meets the staking requirements
    pub fn is_staked(&self, stake: &EntityStake) -> bool {
        stake.stake >= self.config.min_stake
            && stake.unstake_delay_sec >= self.config.min_unstake_delay_sec
    }

    /// Get the counters for a sender
    pub fn record(&self, sender: &Address) -> ReputationRecord {
        self.records.read().get(sender).copied().unwrap_or_default()
    }

    /// Get the status for a sender
    pub fn status(&self, sender: &Address, staked: bool) -> ReputationStatus {
        self.record(sender).status(&self.config, staked)
    }

    /// Apply `f` to a sender's record and write it through
    fn update(
        &self,
        sender: Address,
        f: impl FnOnce(&mut ReputationRecord),
    ) -> Result<ReputationRecord, StorageError> {
        let mut records = self.records.write();
        let mut record = records.get(&sender).copied().unwrap_or_default();
        f(&mut record);
        record.updated_at = now_millis();

        self.db.put(REPUTATION_CF, sender.as_slice(), &record)?;
        records.insert(sender, record);
        Ok(record)
    }

    /// Record that a UserOp from `sender` passed validation
    pub fn inc_seen(&self, sender: Address) -> Result<(), StorageError> {
        self.update(sender, |r| r.ops_seen = r.ops_seen.saturating_add(1))?;
        self.metrics.ops_seen.increment(1);
        Ok(())
    }

    /// Record that UserOp `hash` from `sender` was included in bundling cycle `cycle`
    ///
    /// Crediting the same (hash, cycle) twice is a no-op. Returns whether the
    /// counter moved.
    pub fn inc_included(&self, sender: Address, hash: B256, cycle: u64) -> Result<bool, StorageError> {
        let mut credited = self.credited.lock();
        if credited.get(&hash) == Some(&cycle) {
            return Ok(false);
        }

        self.update(sender, |r| r.ops_included = r.ops_included.saturating_add(1))?;
        credited.insert(hash, cycle);
        if credited.len() > MAX_CREDITED {
            credited.retain(|_, c| c.saturating_add(CREDIT_RETENTION_CYCLES) >= cycle);
        }

        self.metrics.ops_included.increment(1);
        Ok(true)
    }

    /// Penalize a sender whose UserOp failed bundling-time checks
    pub fn penalize(&self, sender: Address) -> Result<(), StorageError> {
        let penalty = self.config.penalty_ops_seen;
        let record = self.update(sender, |r| r.ops_seen = r.ops_seen.saturating_add(penalty))?;
        self.metrics.penalties.increment(1);
        warn!(
            target: "bundler::reputation",
            sender = %sender,
            ops_seen = record.ops_seen,
            ops_included = record.ops_included,
            "Penalized sender"
        );
        Ok(())
    }

    /// Maximum pending UserOps for a sender, `None` if unrestricted
    pub fn op_limit(&self, status: ReputationStatus, stake: &EntityStake) -> Option<usize> {
        match status {
            ReputationStatus::Ok => None,
            ReputationStatus::Throttled if self.is_staked(stake) => {
                let per_op = self.config.stake_per_extra_op.max(alloy_primitives::U256::from(1));
                let extra: usize = (stake.stake / per_op).saturating_to();
                Some(self.config.throttled_staked_base_ops.saturating_add(extra))
            }
            ReputationStatus::Throttled => Some(self.config.throttled_unstaked_max_ops),
            ReputationStatus::Banned => Some(0),
        }
    }

    /// Check whether `sender` may add another pending UserOp
    pub fn check_op_limit(
        &self,
        sender: Address,
        stake: &EntityStake,
        pending: usize,
    ) -> Result<(), ReputationError> {
        let status = self.status(&sender, self.is_staked(stake));
        match self.op_limit(status, stake) {
            Some(limit) if pending >= limit => {
                Err(ReputationError::OpLimitReached { sender, pending, limit })
            }
            _ => Ok(()),
        }
    }

    /// Apply one decay step to every record
    pub fn decay(&self) -> Result<(), StorageError> {
        let mut records = self.records.write();
        let mut batch = self.db.batch();
        for (sender, record) in records.iter_mut() {
            record.decay();
            batch.put(REPUTATION_CF, sender.as_slice(), record)?;
        }
        batch.commit()?;
        debug!(target: "bundler::reputation", senders = records.len(), "Decayed reputation");
        Ok(())
    }

    /// Overwrite a sender's counters
    pub fn set(&self, sender: Address, ops_seen: u64, ops_included: u64) -> Result<(), StorageError> {
        self.update(sender, |r| {
            r.ops_seen = ops_seen;
            r.ops_included = ops_included;
        })?;
        Ok(())
    }

    /// Every tracked sender with its unstaked status
    pub fn dump(&self) -> Vec<ReputationEntry> {
        let mut entries: Vec<_> = self
            .records
            .read()
            .iter()
            .map(|(address, record)| ReputationEntry {
                address: *address,
                ops_seen: record.ops_seen,
                ops_included: record.ops_included,
                status: record.status(&self.config, false),
            })
            .collect();
        entries.sort_by_key(|e| e.address);
        entries
    }

    /// Drop every record
    pub fn clear(&self) -> Result<(), StorageError> {
        let mut records = self.records.write();
        self.db.clear(&[REPUTATION_CF])?;
        records.clear();
        self.credited.lock().clear();
        Ok(())
    }

    /// Number of tracked senders
    pub fn sender_count(&self) -> usize {
        self.records.read().len()
    }
}

/// Decay reputation on the configured interval until cancelled
pub fn spawn_decay(tracker: Arc<ReputationTracker>, cancel: CancellationToken) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(tracker.config.decay_interval);
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    if let Err(e) = tracker.decay() {
                        warn!(target: "bundler::reputation", error = %e, "Reputation decay failed");
                    }
                }
            }
        }
    })
}
