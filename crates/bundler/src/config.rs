//! Process configuration.
//!
//! Every flag can also be set through a `BUNDLER_*` environment variable.
//! [`Config`] is flattened into the binary's CLI and split into the
//! per-component configs here.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use alloy_primitives::{Address, U256};
use alloy_signer_local::PrivateKeySigner;
use thiserror::Error;
use url::Url;

use crate::bundling::BundlerConfig;
use crate::client::ClientConfig;
use crate::gateway::GatewayConfig;
use crate::mempool::StoreConfig;
use crate::reputation::ReputationConfig;
use crate::validation::ValidationConfig;

/// One ether in wei
const ETHER: u128 = 1_000_000_000_000_000_000;

/// Invalid configuration values
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid signer key: {0}")]
    InvalidKey(String),

    #[error("no supported entry points configured")]
    NoEntryPoints,
}

/// Bundler configuration
#[derive(Debug, Clone, clap::Args)]
pub struct Config {
    /// URL of the Ethereum node
    #[arg(long = "eth-client-url", env = "BUNDLER_ETH_CLIENT_URL")]
    pub node_url: Url,

    /// Builder relay endpoints bundles are sent to
    #[arg(long, env = "BUNDLER_BUILDER_URLS", value_delimiter = ',', required = true)]
    pub builder_urls: Vec<Url>,

    /// Hex private key of the bundler EOA
    #[arg(long, env = "BUNDLER_PRIVATE_KEY", hide_env_values = true)]
    pub private_key: String,

    /// Address receiving bundle fees, defaults to the signer
    #[arg(long, env = "BUNDLER_BENEFICIARY")]
    pub beneficiary: Option<Address>,

    /// Directory of the durable store
    #[arg(long, env = "BUNDLER_DATA_DIRECTORY", default_value = "/tmp/bundler")]
    pub data_directory: PathBuf,

    /// Entry points UserOps may target
    #[arg(
        long,
        env = "BUNDLER_SUPPORTED_ENTRY_POINTS",
        value_delimiter = ',',
        default_value = "0x5FF137D4b0FDCD49DcA30c7CF57E578a026d2789"
    )]
    pub supported_entry_points: Vec<Address>,

    /// Expected chain id, the node's is used when unset
    #[arg(long, env = "BUNDLER_CHAIN_ID")]
    pub chain_id: Option<u64>,

    /// Chains accepted by the relay compatibility check in addition to the built-in ones
    #[arg(long, env = "BUNDLER_EXTRA_COMPATIBLE_CHAIN_IDS", value_delimiter = ',')]
    pub extra_compatible_chain_ids: Vec<u64>,

    /// Maximum verificationGasLimit of a UserOp
    #[arg(long, env = "BUNDLER_MAX_VERIFICATION_GAS", default_value = "3000000")]
    pub max_verification_gas: u64,

    /// Gas budget of a single bundle
    #[arg(long, env = "BUNDLER_MAX_BATCH_GAS_LIMIT", default_value = "25000000")]
    pub max_batch_gas_limit: u64,

    /// Seconds a UserOp may wait in the mempool
    #[arg(long, env = "BUNDLER_MAX_OP_TTL_SECONDS", default_value = "180")]
    pub max_op_ttl_seconds: u64,

    /// Number of upcoming blocks each bundle targets
    #[arg(long, env = "BUNDLER_BLOCKS_IN_THE_FUTURE", default_value = "6")]
    pub blocks_in_the_future: u64,

    /// How many blocks back UserOp lookups search
    #[arg(long, env = "BUNDLER_OP_LOOKUP_LIMIT", default_value = "2000")]
    pub op_lookup_limit: u64,

    /// Fee bump in percent a replacement UserOp must pay
    #[arg(long, env = "BUNDLER_REPLACEMENT_FEE_BUMP", default_value = "10")]
    pub replacement_fee_bump: u64,

    /// Maximum pending UserOps per entry point
    #[arg(long, env = "BUNDLER_MAX_POOL_SIZE", default_value = "4096")]
    pub max_pool_size: usize,

    /// Minimum priority fee in wei a bundled UserOp must pay
    #[arg(long, env = "BUNDLER_MIN_PRIORITY_FEE", default_value = "0")]
    pub min_priority_fee: u64,

    /// Inclusions a sender may lag behind before being throttled
    #[arg(long, env = "BUNDLER_THROTTLING_SLACK", default_value = "10")]
    pub throttling_slack: u64,

    /// Inclusions a sender may lag behind before being banned
    #[arg(long, env = "BUNDLER_BAN_SLACK", default_value = "50")]
    pub ban_slack: u64,

    /// opsSeen added to a sender whose UserOp fails bundling checks
    #[arg(long, env = "BUNDLER_PENALTY_OPS_SEEN", default_value = "10000")]
    pub penalty_ops_seen: u64,

    /// Minimum stake in wei for a sender to count as staked
    #[arg(long, env = "BUNDLER_MIN_STAKE", default_value_t = ETHER)]
    pub min_stake: u128,

    /// Minimum unstake delay in seconds for a sender to count as staked
    #[arg(long, env = "BUNDLER_MIN_UNSTAKE_DELAY", default_value = "86400")]
    pub min_unstake_delay: u64,

    /// Milliseconds between bundling cycles
    #[arg(long, env = "BUNDLER_BUNDLE_INTERVAL_MS", default_value = "1000")]
    pub bundle_interval_ms: u64,

    /// Seconds a bundling cycle may take before it is abandoned
    #[arg(long, env = "BUNDLER_CYCLE_TIMEOUT_SECONDS", default_value = "12")]
    pub cycle_timeout_seconds: u64,

    /// Seconds between reputation decays
    #[arg(long, env = "BUNDLER_REPUTATION_DECAY_INTERVAL_SECONDS", default_value = "3600")]
    pub reputation_decay_interval_seconds: u64,

    /// Seconds between database compactions
    #[arg(long, env = "BUNDLER_COMPACTION_INTERVAL_SECONDS", default_value = "300")]
    pub compaction_interval_seconds: u64,

    /// Address the JSON-RPC server binds to
    #[arg(long = "rpc.addr", env = "BUNDLER_RPC_ADDR", default_value = "0.0.0.0:4337")]
    pub rpc_addr: SocketAddr,

    /// Serves the debug namespace and bundles one UserOp at a time
    #[arg(long = "debug", env = "BUNDLER_DEBUG_MODE")]
    pub debug_mode: bool,
}

impl Config {
    /// Parses the bundler key
    pub fn signer(&self) -> Result<PrivateKeySigner, ConfigError> {
        self.private_key.trim().parse().map_err(|e| ConfigError::InvalidKey(format!("{e}")))
    }

    /// Fee recipient, falling back to `signer`
    pub fn beneficiary_or(&self, signer: Address) -> Address {
        self.beneficiary.unwrap_or(signer)
    }

    /// Entry points, rejecting an empty list
    pub fn entry_points(&self) -> Result<Vec<Address>, ConfigError> {
        if self.supported_entry_points.is_empty() {
            return Err(ConfigError::NoEntryPoints);
        }
        Ok(self.supported_entry_points.clone())
    }

    pub fn store_config(&self, chain_id: u64) -> StoreConfig {
        StoreConfig::new(chain_id).with_replacement_fee_bump(self.replacement_fee_bump)
    }

    pub fn reputation_config(&self) -> ReputationConfig {
        ReputationConfig::new()
            .with_slack(self.throttling_slack, self.ban_slack)
            .with_penalty(self.penalty_ops_seen)
            .with_min_stake(U256::from(self.min_stake), self.min_unstake_delay)
            .with_decay_interval(Duration::from_secs(self.reputation_decay_interval_seconds))
    }

    pub fn validation_config(&self) -> ValidationConfig {
        ValidationConfig::new()
            .with_entry_points(self.supported_entry_points.clone())
            .with_gas_limits(U256::from(self.max_verification_gas), U256::from(self.max_batch_gas_limit))
            .with_max_pool_size(self.max_pool_size)
    }

    /// Bundling loop settings. Debug mode bundles a single UserOp per cycle.
    pub fn bundler_config(&self) -> BundlerConfig {
        let config = BundlerConfig::default()
            .with_timing(
                Duration::from_millis(self.bundle_interval_ms),
                Duration::from_secs(self.cycle_timeout_seconds),
            )
            .with_max_op_ttl(Duration::from_secs(self.max_op_ttl_seconds))
            .with_max_batch_gas_limit(U256::from(self.max_batch_gas_limit))
            .with_min_priority_fee(U256::from(self.min_priority_fee));
        if self.debug_mode { config.with_max_batch_size(1) } else { config }
    }

    pub fn gateway_config(&self, chain_id: u64) -> GatewayConfig {
        GatewayConfig::new(chain_id, self.builder_urls.clone())
            .with_blocks_in_the_future(self.blocks_in_the_future)
            .with_extra_chain_ids(self.extra_compatible_chain_ids.clone())
    }

    pub fn client_config(&self, chain_id: u64) -> ClientConfig {
        ClientConfig::new(chain_id, self.supported_entry_points.clone())
            .with_op_lookup_limit(self.op_lookup_limit)
            .with_max_verification_gas(U256::from(self.max_verification_gas))
    }

    pub fn compaction_interval(&self) -> Duration {
        Duration::from_secs(self.compaction_interval_seconds)
    }
}
