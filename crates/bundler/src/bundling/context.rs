//! State of one bundling cycle.

use std::collections::HashMap;

use alloy_primitives::{Address, B256, U256};

use crate::gateway::GatewayError;
use crate::mempool::MempoolEntry;
use crate::provider::ProviderError;

/// Terminal or deferring decision about a candidate
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// Stays pending for a later cycle
    Requeued,
    /// Removed from the mempool
    Dropped {
        reason: String,
        /// Whether the sender is penalized for it
        penalize: bool,
    },
    /// Removed for exceeding the time to live
    Expired,
}

/// Outcome of a candidate that left the batch
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resolution {
    pub sender: Address,
    pub nonce: U256,
    pub outcome: Outcome,
}

/// Why a cycle ended without reconciling the batch
#[derive(Debug, thiserror::Error)]
pub enum CycleAbort {
    /// Node or relay infrastructure failure; retried with backoff
    #[error("transient failure: {0}")]
    Transient(String),

    /// Every relay refused the bundle
    #[error("bundle rejected: {0}")]
    Rejected(String),

    /// The cycle ran past its deadline
    #[error("cycle deadline exceeded")]
    Deadline,

    /// The entry point is not bundled by this service
    #[error("entry point {0} is not supported")]
    UnsupportedEntryPoint(Address),

    /// Reconciliation could not be written
    #[error("storage: {0}")]
    Storage(String),
}

impl From<ProviderError> for CycleAbort {
    fn from(e: ProviderError) -> Self {
        Self::Transient(e.to_string())
    }
}

impl From<GatewayError> for CycleAbort {
    fn from(e: GatewayError) -> Self {
        if e.is_transient() { Self::Transient(e.to_string()) } else { Self::Rejected(e.to_string()) }
    }
}

/// Candidates of one entry point moving through the bundle steps
#[derive(Debug, Clone)]
pub struct BatchContext {
    pub entry_point: Address,
    pub cycle: u64,
    /// Unix milliseconds at cycle start
    pub now: u64,
    pub base_fee: U256,
    pub network_tip: U256,
    /// Current batch, in bundle order
    pub candidates: Vec<MempoolEntry>,
    /// Candidates that left the batch
    pub outcomes: HashMap<B256, Resolution>,
    /// Set once the gateway accepted the batch
    pub tx_hash: Option<B256>,
    /// Lowest nonce per sender that left the batch
    held_from: HashMap<Address, U256>,
}

impl BatchContext {
    pub fn new(
        entry_point: Address,
        cycle: u64,
        now: u64,
        base_fee: U256,
        network_tip: U256,
        candidates: Vec<MempoolEntry>,
    ) -> Self {
        Self {
            entry_point,
            cycle,
            now,
            base_fee,
            network_tip,
            candidates,
            outcomes: HashMap::new(),
            tx_hash: None,
            held_from: HashMap::new(),
        }
    }

    /// Records the outcome of a candidate that is no longer in the batch
    pub fn resolve(&mut self, entry: &MempoolEntry, outcome: Outcome) {
        let nonce = entry.user_op.nonce;
        self.held_from
            .entry(entry.sender())
            .and_modify(|held| *held = (*held).min(nonce))
            .or_insert(nonce);
        self.outcomes.insert(entry.hash, Resolution { sender: entry.sender(), nonce, outcome });
    }

    /// Takes out every candidate `decide` returns an outcome for, keeping
    /// the order of the rest. Returns how many left.
    pub fn resolve_where(&mut self, mut decide: impl FnMut(&MempoolEntry) -> Option<Outcome>) -> usize {
        let candidates = std::mem::take(&mut self.candidates);
        let mut resolved = 0;
        for entry in candidates {
            match decide(&entry) {
                Some(outcome) => {
                    self.resolve(&entry, outcome);
                    resolved += 1;
                }
                None => self.candidates.push(entry),
            }
        }
        resolved
    }

    /// Removes the candidate at `index` with `outcome`
    pub fn resolve_at(&mut self, index: usize, outcome: Outcome) -> Option<MempoolEntry> {
        if index >= self.candidates.len() {
            return None;
        }
        let entry = self.candidates.remove(index);
        self.resolve(&entry, outcome);
        Some(entry)
    }

    /// Whether a lower or equal nonce of `sender` already left the batch
    pub fn is_held(&self, sender: &Address, nonce: U256) -> bool {
        self.held_from.get(sender).is_some_and(|held| *held <= nonce)
    }

    /// Requeues candidates whose sender has a lower nonce out of the batch.
    pub fn enforce_nonce_prefix(&mut self) -> usize {
        let held_from = self.held_from.clone();
        self.resolve_where(|entry| {
            held_from
                .get(&entry.sender())
                .is_some_and(|held| *held < entry.user_op.nonce)
                .then_some(Outcome::Requeued)
        })
    }

    /// Hashes with the given outcome kind
    pub fn hashes_where(&self, pred: impl Fn(&Outcome) -> bool) -> Vec<B256> {
        self.outcomes.iter().filter(|(_, r)| pred(&r.outcome)).map(|(hash, _)| *hash).collect()
    }
}
