//! Validation Rejections
//!
//! Every reason a UserOp can be refused at admission. Each variant has a
//! stable machine code and an ERC-4337 JSON-RPC error code.

use alloy_primitives::{Address, U256};
use thiserror::Error;

use crate::mempool::MempoolError;
use crate::provider::ProviderError;
use crate::storage::StorageError;

/// ERC-4337 JSON-RPC error codes.
pub mod codes {
    /// Invalid fields
    pub const INVALID_FIELDS: i32 = -32602;
    /// Rejected by the entry point during simulation
    pub const SIMULATION_REJECTED: i32 = -32500;
    /// Rejected by the paymaster
    pub const PAYMASTER_REJECTED: i32 = -32501;
    /// Banned opcode or storage access during validation
    pub const OPCODE_VIOLATION: i32 = -32502;
    /// Outside of the valid time range
    pub const EXPIRED: i32 = -32503;
    /// Throttled or banned sender
    pub const REPUTATION: i32 = -32504;
    /// Aggregator not supported
    pub const UNSUPPORTED_AGGREGATOR: i32 = -32506;
    /// Invalid signature
    pub const INVALID_SIGNATURE: i32 = -32507;
    /// Internal error
    pub const INTERNAL: i32 = -32603;
}

/// Reason a UserOp was not admitted
#[derive(Debug, Error)]
pub enum Rejection {
    #[error("entry point {0} is not supported")]
    UnsupportedEntryPoint(Address),

    #[error("invalid sender {sender}: {reason}")]
    InvalidSender { sender: Address, reason: &'static str },

    #[error("factory {0} has no code")]
    InvalidFactory(Address),

    #[error("{field} {provided} exceeds maximum {max}")]
    GasLimitTooHigh { field: &'static str, provided: U256, max: U256 },

    #[error("preVerificationGas {provided} is below required {required}")]
    PreVerificationGasTooLow { provided: U256, required: U256 },

    #[error("callGasLimit {provided} is below required {required}")]
    CallGasLimitTooLow { provided: U256, required: U256 },

    #[error("maxFeePerGas {max_fee} is below base fee {base_fee}")]
    FeeTooLow { max_fee: U256, base_fee: U256 },

    #[error("invalid fees: {0}")]
    InvalidFees(&'static str),

    #[error("paymaster {0} has no code")]
    InvalidPaymaster(Address),

    #[error("simulation failed: {0}")]
    SimulationFailed(String),

    #[error("aggregator {0} is not supported")]
    UnsupportedAggregator(Address),

    #[error("invalid signature")]
    InvalidSignature,

    #[error("UserOp expires at {valid_until}")]
    Expired { valid_until: u64 },

    #[error("{entity} used banned opcode {opcode}")]
    OpcodeViolation { entity: Address, opcode: &'static str },

    #[error("{entity} wrote to storage of unstaked contract {contract}")]
    StorageViolation { entity: Address, contract: Address },

    #[error("{0} ran out of gas during validation")]
    OutOfGas(Address),

    #[error("sender {0} is banned")]
    SenderBanned(Address),

    #[error("mempool for {entry_point} is full ({max} UserOps)")]
    PoolFull { entry_point: Address, max: usize },

    #[error("sender {sender} has {pending} pending UserOps, limit is {limit}")]
    PendingLimit { sender: Address, pending: usize, limit: usize },

    #[error(transparent)]
    Mempool(MempoolError),

    #[error(transparent)]
    Provider(#[from] ProviderError),
}

impl From<MempoolError> for Rejection {
    fn from(err: MempoolError) -> Self {
        match err {
            MempoolError::PoolFull { entry_point, max } => Self::PoolFull { entry_point, max },
            MempoolError::SenderLimit { sender, pending, limit } => {
                Self::PendingLimit { sender, pending, limit }
            }
            err => Self::Mempool(err),
        }
    }
}

impl From<StorageError> for Rejection {
    fn from(err: StorageError) -> Self {
        Self::Mempool(MempoolError::Storage(err))
    }
}

impl Rejection {
    /// Stable machine-readable code
    pub fn code(&self) -> &'static str {
        match self {
            Self::UnsupportedEntryPoint(_) => "UnsupportedEntryPoint",
            Self::InvalidSender { .. } => "InvalidSender",
            Self::InvalidFactory(_) => "InvalidFactory",
            Self::GasLimitTooHigh { .. } => "GasLimitTooHigh",
            Self::PreVerificationGasTooLow { .. } => "PreVerificationGasTooLow",
            Self::CallGasLimitTooLow { .. } => "CallGasLimitTooLow",
            Self::FeeTooLow { .. } => "FeeTooLow",
            Self::InvalidFees(_) => "InvalidFees",
            Self::InvalidPaymaster(_) => "InvalidPaymaster",
            Self::SimulationFailed(_) => "SimulationFailed",
            Self::UnsupportedAggregator(_) => "UnsupportedAggregator",
            Self::InvalidSignature => "InvalidSignature",
            Self::Expired { .. } => "Expired",
            Self::OpcodeViolation { .. } => "OpcodeViolation",
            Self::StorageViolation { .. } => "StorageViolation",
            Self::OutOfGas(_) => "OutOfGas",
            Self::SenderBanned(_) => "SenderBanned",
            Self::PoolFull { .. } | Self::Mempool(MempoolError::PoolFull { .. }) => "PoolFull",
            Self::PendingLimit { .. } | Self::Mempool(MempoolError::SenderLimit { .. }) => {
                "PendingLimit"
            }
            Self::Mempool(MempoolError::AlreadyKnown(_)) => "AlreadyKnown",
            Self::Mempool(MempoolError::ReplacementUnderpriced { .. }) => "ReplacementUnderpriced",
            Self::Mempool(MempoolError::InvalidField { .. }) => "InvalidField",
            Self::Mempool(MempoolError::Storage(_)) => "Storage",
            Self::Provider(_) => "Provider",
        }
    }

    /// JSON-RPC error code
    pub fn rpc_code(&self) -> i32 {
        match self {
            Self::SimulationFailed(_) | Self::InvalidSender { .. } | Self::InvalidFactory(_) => {
                codes::SIMULATION_REJECTED
            }
            Self::InvalidPaymaster(_) => codes::PAYMASTER_REJECTED,
            Self::OpcodeViolation { .. } | Self::StorageViolation { .. } | Self::OutOfGas(_) => {
                codes::OPCODE_VIOLATION
            }
            Self::Expired { .. } => codes::EXPIRED,
            Self::SenderBanned(_)
            | Self::PendingLimit { .. }
            | Self::PoolFull { .. }
            | Self::Mempool(MempoolError::PoolFull { .. } | MempoolError::SenderLimit { .. }) => {
                codes::REPUTATION
            }
            Self::UnsupportedAggregator(_) => codes::UNSUPPORTED_AGGREGATOR,
            Self::InvalidSignature => codes::INVALID_SIGNATURE,
            Self::Mempool(MempoolError::Storage(_)) | Self::Provider(_) => codes::INTERNAL,
            _ => codes::INVALID_FIELDS,
        }
    }

    /// Whether the failure is on our side rather than the submitter's
    pub fn is_internal(&self) -> bool {
        self.rpc_code() == codes::INTERNAL
    }
}
