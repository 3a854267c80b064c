//! Stored mempool entries and their keys.

use std::time::{SystemTime, UNIX_EPOCH};

use alloy_primitives::{Address, B256, U256};
use serde::{Deserialize, Serialize};

use crate::types::UserOperation;

/// Current wall clock in unix milliseconds.
pub fn now_millis() -> u64 {
    SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_millis() as u64).unwrap_or_default()
}

/// Uniqueness key of a pending op.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EntryKey {
    pub entry_point: Address,
    pub sender: Address,
    pub nonce: U256,
}

impl EntryKey {
    /// Length of the encoded key.
    pub const LEN: usize = 20 + 20 + 32;

    pub fn new(entry_point: Address, sender: Address, nonce: U256) -> Self {
        Self { entry_point, sender, nonce }
    }

    /// `entry_point | sender | nonce` big-endian, so keys of one entry point
    /// and sender sort by nonce on disk.
    pub fn to_bytes(&self) -> [u8; Self::LEN] {
        let mut out = [0u8; Self::LEN];
        out[..20].copy_from_slice(self.entry_point.as_slice());
        out[20..40].copy_from_slice(self.sender.as_slice());
        out[40..].copy_from_slice(&self.nonce.to_be_bytes::<32>());
        out
    }
}

/// Where an entry is in the bundling lifecycle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "camelCase")]
pub enum EntryState {
    /// Waiting for its first bundling cycle.
    #[default]
    Queued,
    /// Considered by at least one cycle and held back.
    Requeued {
        /// Number of cycles that held it back.
        attempts: u32,
    },
}

/// Facts captured during validation and re-checked at bundling time.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ValidationSnapshot {
    /// `preOpGas` reported by `simulateValidation`.
    pub pre_op_gas: U256,
    /// Contracts whose code the validation ran, sorted.
    pub code_addresses: Vec<Address>,
    /// Digest over the code hashes of `code_addresses`.
    pub code_hash: Option<B256>,
}

/// A UserOperation stored in the mempool with metadata
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MempoolEntry {
    /// The UserOperation
    pub user_op: UserOperation,

    /// UserOperation hash
    pub hash: B256,

    /// EntryPoint address this UserOp is for
    pub entry_point: Address,

    /// Unix milliseconds at insertion
    pub inserted_at: u64,

    /// Insertion sequence, monotonic across restarts
    pub seq: u64,

    /// Lifecycle state
    #[serde(default)]
    pub state: EntryState,

    /// Validation-time facts
    #[serde(default)]
    pub validation: ValidationSnapshot,
}

impl MempoolEntry {
    /// Uniqueness key of this entry.
    pub fn key(&self) -> EntryKey {
        EntryKey::new(self.entry_point, self.user_op.sender, self.user_op.nonce)
    }

    /// Sender address.
    pub fn sender(&self) -> Address {
        self.user_op.sender
    }

    /// Age in milliseconds relative to `now`.
    pub fn age_millis(&self, now: u64) -> u64 {
        now.saturating_sub(self.inserted_at)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_ordering_matches_nonce() {
        let ep = Address::new([1; 20]);
        let sender = Address::new([2; 20]);
        let low = EntryKey::new(ep, sender, U256::from(1)).to_bytes();
        let high = EntryKey::new(ep, sender, U256::from(256)).to_bytes();
        assert!(low < high);
        assert_eq!(&low[..20], ep.as_slice());
    }

    #[test]
    fn test_state_serde() {
        let json = serde_json::to_string(&EntryState::Requeued { attempts: 2 }).unwrap();
        assert_eq!(json, r#"{"status":"requeued","attempts":2}"#);
        let back: EntryState = serde_json::from_str(&json).unwrap();
        assert_eq!(back, EntryState::Requeued { attempts: 2 });
    }
}
