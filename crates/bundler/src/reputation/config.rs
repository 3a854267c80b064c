//! Reputation Configuration

use std::time::Duration;

use alloy_primitives::U256;

/// One ether in wei.
const ETHER: u128 = 1_000_000_000_000_000_000;

/// Configuration for sender reputation
#[derive(Debug, Clone)]
pub struct ReputationConfig {
    /// Expected inclusion ratio denominator for unstaked senders
    ///
    /// `opsSeen / denominator` is the number of inclusions a sender is
    /// expected to have.
    /// Default: 10
    pub min_inclusion_denominator: u64,

    /// Expected inclusion ratio denominator for staked senders
    ///
    /// Larger than the unstaked one so staked senders are throttled later.
    /// Default: 100
    pub staked_min_inclusion_denominator: u64,

    /// Inclusions a sender may lag behind before being throttled
    /// Default: 10
    pub throttling_slack: u64,

    /// Inclusions a sender may lag behind before being banned
    /// Default: 50
    pub ban_slack: u64,

    /// Added to opsSeen when a sender's UserOp fails bundling checks
    /// Default: 10,000
    pub penalty_ops_seen: u64,

    /// Pending UserOps allowed for a throttled, unstaked sender
    /// Default: 4
    pub throttled_unstaked_max_ops: usize,

    /// Base pending UserOps allowed for a throttled, staked sender
    /// Default: 10
    pub throttled_staked_base_ops: usize,

    /// Stake buying one extra pending UserOp for a throttled, staked sender
    /// Default: 0.1 ether
    pub stake_per_extra_op: U256,

    /// Minimum stake for a sender to count as staked
    /// Default: 1 ether
    pub min_stake: U256,

    /// Minimum unstake delay for a sender to count as staked
    /// Default: 1 day
    pub min_unstake_delay_sec: u64,

    /// How often counters decay
    /// Default: 1 hour
    pub decay_interval: Duration,
}

impl Default for ReputationConfig {
    fn default() -> Self {
        Self {
            min_inclusion_denominator: 10,
            staked_min_inclusion_denominator: 100,
            throttling_slack: 10,
            ban_slack: 50,
            penalty_ops_seen: 10_000,
            throttled_unstaked_max_ops: 4,
            throttled_staked_base_ops: 10,
            stake_per_extra_op: U256::from(ETHER / 10),
            min_stake: U256::from(ETHER),
            min_unstake_delay_sec: 86_400,
            decay_interval: Duration::from_secs(3600),
        }
    }
}

impl ReputationConfig {
    /// Create a new configuration with default values
    pub fn new() -> Self {
        Self::default()
    }

    /// Set throttling and ban slack
    pub fn with_slack(mut self, throttling: u64, ban: u64) -> Self {
        self.throttling_slack = throttling;
        self.ban_slack = ban;
        self
    }

    /// Set the opsSeen penalty
    pub fn with_penalty(mut self, ops_seen: u64) -> Self {
        self.penalty_ops_seen = ops_seen;
        self
    }

    /// Set staking requirements
    pub fn with_min_stake(mut self, min_stake: U256, min_unstake_delay_sec: u64) -> Self {
        self.min_stake = min_stake;
        self.min_unstake_delay_sec = min_unstake_delay_sec;
        self
    }

    /// Set the decay interval
    pub fn with_decay_interval(mut self, interval: Duration) -> Self {
        self.decay_interval = interval;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = ReputationConfig::default();
        assert_eq!(config.throttling_slack, 10);
        assert_eq!(config.ban_slack, 50);
        assert_eq!(config.min_stake, U256::from(ETHER));
    }

    #[test]
    fn test_builder_pattern() {
        let config = ReputationConfig::new().with_slack(1, 2).with_penalty(7);
        assert_eq!(config.throttling_slack, 1);
        assert_eq!(config.ban_slack, 2);
        assert_eq!(config.penalty_ops_seen, 7);
    }
}
