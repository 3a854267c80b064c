//! Durable UserOperation store.
//!
//! # Architecture
//!
//! - rocksdb is the source of truth: every mutation is written through
//!   before the in-memory indexes change.
//! - `StoreIndex` mirrors the on-disk state for reads: by hash, by
//!   (entry point, sender, nonce), insertion order per entry point, and
//!   pending counts per sender.
//! - All mutations hold the index write lock across the uniqueness check, the
//!   admission caps and the database write, so add, replace and remove are
//!   linearizable.
//! - The lock is store-wide because the pool-size and per-sender caps span
//!   keys. Critical sections never await, so submissions for distinct keys
//!   only interact through those caps and otherwise queue briefly.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use alloy_primitives::{Address, B256, U256};
use parking_lot::RwLock;
use tracing::{debug, info};

use crate::gas::required_replacement_fee;
use crate::metrics::MempoolMetrics;
use crate::storage::{Database, HASHES_CF, OPS_CF};
use crate::types::UserOperation;

use super::entry::{EntryKey, EntryState, MempoolEntry, ValidationSnapshot, now_millis};
use super::error::{MempoolError, MempoolResult};

/// Configuration for the operation store
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Chain id used for UserOp hashes
    pub chain_id: u64,

    /// Minimum fee bump required for replacement (percentage)
    ///
    /// Both maxFeePerGas and maxPriorityFeePerGas of the replacement must be
    /// at least this percentage higher than the pending UserOp's.
    /// Default: 10 (10%)
    pub replacement_fee_bump_percent: u64,
}

impl StoreConfig {
    /// Create a new configuration for a chain with default values
    pub fn new(chain_id: u64) -> Self {
        Self { chain_id, replacement_fee_bump_percent: 10 }
    }

    /// Set replacement fee bump percentage
    pub fn with_replacement_fee_bump(mut self, percent: u64) -> Self {
        self.replacement_fee_bump_percent = percent;
        self
    }
}

/// Capacity limits enforced atomically with an insert.
#[derive(Debug, Clone, Copy)]
pub struct AdmissionLimits {
    /// Maximum pending UserOps per entry point
    pub max_pool_size: usize,

    /// Maximum pending UserOps for the sender, `None` when unlimited
    pub sender_limit: Option<usize>,
}

impl Default for AdmissionLimits {
    fn default() -> Self {
        Self { max_pool_size: usize::MAX, sender_limit: None }
    }
}

#[derive(Debug, Default)]
struct StoreIndex {
    by_hash: HashMap<B256, MempoolEntry>,
    by_key: HashMap<EntryKey, B256>,
    /// Insertion order per entry point: seq -> hash
    by_entry_point: HashMap<Address, BTreeMap<u64, B256>>,
    pending_by_sender: HashMap<Address, usize>,
    next_seq: u64,
}

impl StoreIndex {
    fn insert(&mut self, entry: MempoolEntry) {
        self.next_seq = self.next_seq.max(entry.seq + 1);
        self.by_key.insert(entry.key(), entry.hash);
        self.by_entry_point.entry(entry.entry_point).or_default().insert(entry.seq, entry.hash);
        *self.pending_by_sender.entry(entry.sender()).or_default() += 1;
        self.by_hash.insert(entry.hash, entry);
    }

    fn remove(&mut self, hash: &B256) -> Option<MempoolEntry> {
        let entry = self.by_hash.remove(hash)?;
        self.by_key.remove(&entry.key());
        if let Some(order) = self.by_entry_point.get_mut(&entry.entry_point) {
            order.remove(&entry.seq);
            if order.is_empty() {
                self.by_entry_point.remove(&entry.entry_point);
            }
        }
        if let Some(count) = self.pending_by_sender.get_mut(&entry.sender()) {
            *count = count.saturating_sub(1);
            if *count == 0 {
                self.pending_by_sender.remove(&entry.sender());
            }
        }
        Some(entry)
    }
}

/// Durable pending-operation store shared by the validation and bundling paths.
pub struct OperationStore {
    db: Arc<Database>,
    config: StoreConfig,
    index: RwLock<StoreIndex>,
    metrics: MempoolMetrics,
}

impl std::fmt::Debug for OperationStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OperationStore")
            .field("config", &self.config)
            .field("pending", &self.index.read().by_hash.len())
            .finish()
    }
}

impl OperationStore {
    /// Opens the store and rebuilds the indexes from disk.
    pub fn open(db: Arc<Database>, config: StoreConfig) -> MempoolResult<Self> {
        let mut index = StoreIndex::default();
        for (_, entry) in db.load_all::<MempoolEntry>(OPS_CF)? {
            index.insert(entry);
        }

        let pending = index.by_hash.len();
        info!(target: "bundler::mempool", pending, "Loaded pending UserOps");

        let metrics = MempoolMetrics::default();
        metrics.pool_size.set(pending as f64);

        Ok(Self { db, config, index: RwLock::new(index), metrics })
    }

    /// Chain id used for hashes.
    pub fn chain_id(&self) -> u64 {
        self.config.chain_id
    }

    /// Adds a UserOp, replacing a pending one with the same key if the fee
    /// bump is sufficient.
    pub fn add(
        &self,
        user_op: UserOperation,
        entry_point: Address,
        validation: ValidationSnapshot,
    ) -> MempoolResult<B256> {
        self.admit(user_op, entry_point, validation, &AdmissionLimits::default())
    }

    /// Like [`Self::add`], but rejects the UserOp if inserting it would exceed
    /// `limits`. Replacements do not count against either cap.
    pub fn admit(
        &self,
        user_op: UserOperation,
        entry_point: Address,
        validation: ValidationSnapshot,
        limits: &AdmissionLimits,
    ) -> MempoolResult<B256> {
        check_fields(&user_op, entry_point)?;

        let hash = user_op.hash(entry_point, self.config.chain_id);
        let key = EntryKey::new(entry_point, user_op.sender, user_op.nonce);

        let mut index = self.index.write();
        if index.by_hash.contains_key(&hash) {
            return Err(MempoolError::AlreadyKnown(hash));
        }

        let replaced = match index.by_key.get(&key).and_then(|h| index.by_hash.get(h)) {
            Some(existing) => {
                self.check_replacement(existing, &user_op)?;
                Some(existing.hash)
            }
            None => None,
        };

        if replaced.is_none() {
            let size = index.by_entry_point.get(&entry_point).map_or(0, BTreeMap::len);
            if size >= limits.max_pool_size {
                return Err(MempoolError::PoolFull { entry_point, max: limits.max_pool_size });
            }
            if let Some(limit) = limits.sender_limit {
                let pending = index.pending_by_sender.get(&key.sender).copied().unwrap_or(0);
                if pending >= limit {
                    return Err(MempoolError::SenderLimit { sender: key.sender, pending, limit });
                }
            }
        }

        let entry = MempoolEntry {
            user_op,
            hash,
            entry_point,
            inserted_at: now_millis(),
            seq: index.next_seq,
            state: EntryState::Queued,
            validation,
        };

        let key_bytes = key.to_bytes();
        let mut batch = self.db.batch();
        if let Some(old) = replaced {
            batch.delete(HASHES_CF, old.as_slice())?;
        }
        batch.put(OPS_CF, &key_bytes, &entry)?;
        batch.put_raw(HASHES_CF, hash.as_slice(), &key_bytes)?;
        batch.commit()?;

        if let Some(old) = replaced {
            index.remove(&old);
            self.metrics.ops_replaced.increment(1);
            debug!(
                target: "bundler::mempool",
                old_hash = %old,
                new_hash = %hash,
                "Replaced UserOp"
            );
        }
        index.insert(entry);

        self.metrics.ops_added.increment(1);
        self.metrics.pool_size.set(index.by_hash.len() as f64);
        debug!(
            target: "bundler::mempool",
            hash = %hash,
            entry_point = %entry_point,
            sender = %key.sender,
            nonce = %key.nonce,
            "Added UserOp"
        );

        Ok(hash)
    }

    fn check_replacement(&self, existing: &MempoolEntry, new: &UserOperation) -> MempoolResult<()> {
        let bump = self.config.replacement_fee_bump_percent;
        let required_max_fee = required_replacement_fee(existing.user_op.max_fee_per_gas, bump);
        let required_priority_fee =
            required_replacement_fee(existing.user_op.max_priority_fee_per_gas, bump);

        if new.max_fee_per_gas < required_max_fee
            || new.max_priority_fee_per_gas < required_priority_fee
        {
            return Err(MempoolError::ReplacementUnderpriced {
                existing: existing.hash,
                required_max_fee,
                required_priority_fee,
            });
        }
        Ok(())
    }

    /// Get a UserOp by hash
    pub fn get(&self, hash: &B256) -> Option<MempoolEntry> {
        self.index.read().by_hash.get(hash).cloned()
    }

    /// Hash of the pending UserOp for a key, if any
    pub fn find(&self, entry_point: Address, sender: Address, nonce: U256) -> Option<B256> {
        self.index.read().by_key.get(&EntryKey::new(entry_point, sender, nonce)).copied()
    }

    /// All pending UserOps of an entry point in insertion order
    pub fn list(&self, entry_point: Address) -> Vec<MempoolEntry> {
        let index = self.index.read();
        index
            .by_entry_point
            .get(&entry_point)
            .map(|order| order.values().filter_map(|h| index.by_hash.get(h).cloned()).collect())
            .unwrap_or_default()
    }

    /// Every pending UserOp, grouped by entry point in insertion order
    pub fn dump(&self) -> Vec<MempoolEntry> {
        let index = self.index.read();
        let mut entry_points: Vec<_> = index.by_entry_point.keys().copied().collect();
        entry_points.sort();
        entry_points
            .iter()
            .filter_map(|ep| index.by_entry_point.get(ep))
            .flat_map(|order| order.values().filter_map(|h| index.by_hash.get(h).cloned()))
            .collect()
    }

    /// Removes UserOps by hash, returning how many were present
    pub fn remove(&self, hashes: &[B256]) -> MempoolResult<usize> {
        let mut index = self.index.write();

        let mut batch = self.db.batch();
        let mut present = Vec::with_capacity(hashes.len());
        for hash in hashes {
            if let Some(entry) = index.by_hash.get(hash) {
                batch.delete(OPS_CF, &entry.key().to_bytes())?;
                batch.delete(HASHES_CF, hash.as_slice())?;
                present.push(*hash);
            }
        }
        if present.is_empty() {
            return Ok(0);
        }
        batch.commit()?;

        for hash in &present {
            index.remove(hash);
        }

        self.metrics.ops_removed.increment(present.len() as u64);
        self.metrics.pool_size.set(index.by_hash.len() as f64);
        debug!(target: "bundler::mempool", count = present.len(), "Removed UserOps");

        Ok(present.len())
    }

    /// Marks UserOps as held back by a bundling cycle
    pub fn mark_requeued(&self, hashes: &[B256]) -> MempoolResult<()> {
        let mut index = self.index.write();

        let mut updated = Vec::with_capacity(hashes.len());
        for hash in hashes {
            if let Some(entry) = index.by_hash.get(hash) {
                let mut entry = entry.clone();
                entry.state = match entry.state {
                    EntryState::Queued => EntryState::Requeued { attempts: 1 },
                    EntryState::Requeued { attempts } => {
                        EntryState::Requeued { attempts: attempts.saturating_add(1) }
                    }
                };
                updated.push(entry);
            }
        }
        if updated.is_empty() {
            return Ok(());
        }

        let mut batch = self.db.batch();
        for entry in &updated {
            batch.put(OPS_CF, &entry.key().to_bytes(), entry)?;
        }
        batch.commit()?;

        for entry in updated {
            index.by_hash.insert(entry.hash, entry);
        }
        Ok(())
    }

    /// Number of pending UserOps from a sender across all entry points
    pub fn count_pending(&self, sender: &Address) -> usize {
        self.index.read().pending_by_sender.get(sender).copied().unwrap_or(0)
    }

    /// Number of pending UserOps for an entry point
    pub fn len(&self, entry_point: &Address) -> usize {
        self.index.read().by_entry_point.get(entry_point).map(|o| o.len()).unwrap_or(0)
    }

    /// Check if no UserOps are pending for an entry point
    pub fn is_empty(&self, entry_point: &Address) -> bool {
        self.len(entry_point) == 0
    }

    /// Drops every pending UserOp
    pub fn clear(&self) -> MempoolResult<()> {
        let mut index = self.index.write();
        self.db.clear(&[OPS_CF, HASHES_CF])?;
        let next_seq = index.next_seq;
        *index = StoreIndex { next_seq, ..Default::default() };
        self.metrics.pool_size.set(0.0);
        info!(target: "bundler::mempool", "Cleared mempool");
        Ok(())
    }
}

fn check_fields(user_op: &UserOperation, entry_point: Address) -> MempoolResult<()> {
    if entry_point.is_zero() {
        return Err(MempoolError::invalid_field("entryPoint", "zero address"));
    }
    if user_op.sender.is_zero() {
        return Err(MempoolError::invalid_field("sender", "zero address"));
    }
    if !user_op.init_code.is_empty() && user_op.init_code.len() < 20 {
        return Err(MempoolError::invalid_field("initCode", "must be empty or start with a factory address"));
    }
    if !user_op.paymaster_and_data.is_empty() && user_op.paymaster_and_data.len() < 20 {
        return Err(MempoolError::invalid_field(
            "paymasterAndData",
            "must be empty or start with a paymaster address",
        ));
    }
    Ok(())
}
