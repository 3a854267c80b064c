//! Validation Configuration

use alloy_primitives::{Address, U256};

use crate::gas::Overhead;
use crate::types::ENTRYPOINT_V06_ADDRESS;

/// Configuration for admission checks
#[derive(Debug, Clone)]
pub struct ValidationConfig {
    /// Entry points UserOps may target
    pub supported_entry_points: Vec<Address>,

    /// Maximum verificationGasLimit
    /// Default: 3,000,000
    pub max_verification_gas: U256,

    /// Maximum gas of a bundle; a single UserOp may not need more
    /// Default: 25,000,000
    pub max_batch_gas_limit: U256,

    /// Maximum pending UserOps per entry point
    /// Default: 4096
    pub max_pool_size: usize,

    /// UserOps whose validUntil falls within this many seconds are rejected
    /// Default: 30
    pub expiry_margin_secs: u64,

    /// Overhead used for the preVerificationGas floor
    pub overhead: Overhead,
}

impl Default for ValidationConfig {
    fn default() -> Self {
        Self {
            supported_entry_points: vec![ENTRYPOINT_V06_ADDRESS],
            max_verification_gas: U256::from(3_000_000),
            max_batch_gas_limit: U256::from(25_000_000),
            max_pool_size: 4096,
            expiry_margin_secs: 30,
            overhead: Overhead::default(),
        }
    }
}

impl ValidationConfig {
    /// Create a new configuration with default values
    pub fn new() -> Self {
        Self::default()
    }

    /// Set supported entry points
    pub fn with_entry_points(mut self, entry_points: Vec<Address>) -> Self {
        self.supported_entry_points = entry_points;
        self
    }

    /// Set gas ceilings
    pub fn with_gas_limits(mut self, max_verification_gas: U256, max_batch_gas_limit: U256) -> Self {
        self.max_verification_gas = max_verification_gas;
        self.max_batch_gas_limit = max_batch_gas_limit;
        self
    }

    /// Set maximum pending UserOps per entry point
    pub fn with_max_pool_size(mut self, max: usize) -> Self {
        self.max_pool_size = max;
        self
    }

    /// Check if an entry point is supported
    pub fn supports(&self, entry_point: &Address) -> bool {
        self.supported_entry_points.contains(entry_point)
    }
}
