//! Mempool Error Types

use alloy_primitives::{Address, B256, U256};
use thiserror::Error;

use crate::storage::StorageError;

/// Result type for mempool operations
pub type MempoolResult<T> = Result<T, MempoolError>;

/// Errors that can occur during mempool operations
#[derive(Debug, Error)]
pub enum MempoolError {
    /// The exact same UserOp is already pending
    #[error("UserOp {0} already known")]
    AlreadyKnown(B256),

    /// A UserOp for the same (entry point, sender, nonce) is pending and the
    /// new one does not bump fees enough
    #[error(
        "replacement underpriced for {existing}: need maxFeePerGas >= {required_max_fee} and maxPriorityFeePerGas >= {required_priority_fee}"
    )]
    ReplacementUnderpriced {
        existing: B256,
        required_max_fee: U256,
        required_priority_fee: U256,
    },

    /// The entry point's pool is at capacity
    #[error("mempool for {entry_point} is full ({max} UserOps)")]
    PoolFull { entry_point: Address, max: usize },

    /// The sender already has as many pending UserOps as its reputation allows
    #[error("sender {sender} has {pending} pending UserOps, limit {limit}")]
    SenderLimit { sender: Address, pending: usize, limit: usize },

    /// A field is malformed
    #[error("invalid {field}: {reason}")]
    InvalidField { field: &'static str, reason: String },

    /// Persistence failure
    #[error(transparent)]
    Storage(#[from] StorageError),
}

impl MempoolError {
    /// Create an invalid field error
    pub fn invalid_field(field: &'static str, reason: impl Into<String>) -> Self {
        Self::InvalidField { field, reason: reason.into() }
    }

    /// Check if this error is caused by the submitted UserOp rather than the node
    pub fn is_user_error(&self) -> bool {
        !matches!(self, Self::Storage(_))
    }
}
