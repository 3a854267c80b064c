use std::time::Duration;

use alloy_primitives::U256;

/// Configuration for the bundling pipeline and its service loop
#[derive(Debug, Clone)]
pub struct BundlerConfig {
    /// Interval between scheduled cycles
    /// Default: 1s
    pub bundle_interval: Duration,

    /// Deadline of a single cycle. A cycle exceeding it is aborted without
    /// reconciliation.
    /// Default: 12s
    pub cycle_timeout: Duration,

    /// Age after which a pending UserOp is expired
    /// Default: 180s
    pub max_op_ttl: Duration,

    /// Gas budget of one bundle, summed over `max_gas_available()`
    /// Default: 25,000,000
    pub max_batch_gas_limit: U256,

    /// Maximum number of UserOps per bundle, `None` for unbounded
    pub max_batch_size: Option<usize>,

    /// Floor for the priority fee a UserOp must pay on top of the base fee
    pub min_priority_fee: U256,

    /// How many times a `handleOps` simulation may drop an op and retry
    /// Default: 3
    pub max_batch_simulation_retries: usize,

    /// First delay after an aborted cycle
    pub backoff_min_delay: Duration,

    /// Cap of the delay after repeated aborted cycles
    pub backoff_max_delay: Duration,
}

impl Default for BundlerConfig {
    fn default() -> Self {
        Self {
            bundle_interval: Duration::from_secs(1),
            cycle_timeout: Duration::from_secs(12),
            max_op_ttl: Duration::from_secs(180),
            max_batch_gas_limit: U256::from(25_000_000),
            max_batch_size: None,
            min_priority_fee: U256::ZERO,
            max_batch_simulation_retries: 3,
            backoff_min_delay: Duration::from_secs(1),
            backoff_max_delay: Duration::from_secs(30),
        }
    }
}

impl BundlerConfig {
    /// Set the cycle interval and deadline
    pub fn with_timing(mut self, bundle_interval: Duration, cycle_timeout: Duration) -> Self {
        self.bundle_interval = bundle_interval;
        self.cycle_timeout = cycle_timeout;
        self
    }

    /// Set the UserOp time to live
    pub fn with_max_op_ttl(mut self, ttl: Duration) -> Self {
        self.max_op_ttl = ttl;
        self
    }

    /// Set the gas budget per bundle
    pub fn with_max_batch_gas_limit(mut self, limit: U256) -> Self {
        self.max_batch_gas_limit = limit;
        self
    }

    /// Limit the number of UserOps per bundle
    pub fn with_max_batch_size(mut self, size: usize) -> Self {
        self.max_batch_size = Some(size);
        self
    }

    /// Set the minimum priority fee
    pub fn with_min_priority_fee(mut self, fee: U256) -> Self {
        self.min_priority_fee = fee;
        self
    }

    /// Set the bounds of the backoff after aborted cycles
    pub fn with_backoff(mut self, min_delay: Duration, max_delay: Duration) -> Self {
        self.backoff_min_delay = min_delay;
        self.backoff_max_delay = max_delay;
        self
    }
}
