//! ERC-4337 searcher bundler for EntryPoint v0.6.
//!
//! UserOps enter through [`rpc`], pass the [`validation`] pipeline and wait in
//! the durable [`mempool`]. The [`bundling`] service periodically turns them
//! into `handleOps` bundles that the [`gateway`] hands to builder relays.
//! [`reputation`] tracks every sender across both pipelines.

pub mod bundling;
pub mod client;
pub mod config;
pub mod gas;
pub mod gateway;
pub mod mempool;
pub mod metrics;
pub mod provider;
pub mod reputation;
pub mod rpc;
pub mod storage;
pub mod types;
pub mod validation;

#[cfg(test)]
pub(crate) mod test_utils;

pub use bundling::{BundlePipelineBuilder, BundlerConfig, BundlerService, CycleAbort, CycleReport};
pub use client::{BundlerClient, ClientConfig, ClientError};
pub use config::{Config, ConfigError};
pub use gateway::{GatewayConfig, GatewayError, RelayGateway, SubmissionGateway};
pub use mempool::{MempoolEntry, OperationStore, StoreConfig};
pub use provider::{ChainClient, ProviderError, RpcChainClient, SharedChainClient};
pub use reputation::{ReputationConfig, ReputationTracker, spawn_decay};
pub use rpc::{BundlerRpc, launch};
pub use storage::{Database, StorageError, spawn_compaction};
pub use types::{ENTRYPOINT_V06_ADDRESS, UserOperation};
pub use validation::{Rejection, ValidationConfig, ValidationPipeline, ValidationPipelineBuilder};
