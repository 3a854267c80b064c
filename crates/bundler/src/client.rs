//! Bundler client facade.
//!
//! The operations the RPC layer exposes, independent of the transport:
//! submission through the validation pipeline, lookups, gas estimation and
//! the debug helpers.

use std::sync::Arc;

use alloy_primitives::{Address, B256, U64, U256};
use alloy_sol_types::SolCall;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};

use crate::bundling::{BundlerService, CycleAbort, CycleReport};
use crate::gas::{MIN_CALL_GAS_LIMIT, Overhead};
use crate::mempool::{MempoolError, OperationStore};
use crate::provider::{ProviderError, SharedChainClient};
use crate::reputation::{ReputationEntry, ReputationTracker};
use crate::storage::StorageError;
use crate::types::{IEntryPointV06, UserOperation};
use crate::validation::{
    Rejection, ValidationPipeline, codes, simulate_validation, simulate_validation_calldata,
};

/// Extra verification gas added on top of the simulated amount (percent)
const VERIFICATION_GAS_BUFFER_PERCENT: u64 = 10;

/// Errors returned by the client facade
#[derive(Debug, Error)]
pub enum ClientError {
    /// The UserOp was refused
    #[error(transparent)]
    Rejected(#[from] Rejection),

    #[error(transparent)]
    Provider(#[from] ProviderError),

    #[error(transparent)]
    Bundling(#[from] CycleAbort),

    #[error("storage: {0}")]
    Storage(String),

    /// Debug operations need the bundler service
    #[error("bundler service is not running")]
    BundlerUnavailable,
}

impl From<StorageError> for ClientError {
    fn from(e: StorageError) -> Self {
        Self::Storage(e.to_string())
    }
}

impl From<MempoolError> for ClientError {
    fn from(e: MempoolError) -> Self {
        Self::Storage(e.to_string())
    }
}

impl ClientError {
    /// JSON-RPC error code
    pub fn rpc_code(&self) -> i32 {
        match self {
            Self::Rejected(rejection) => rejection.rpc_code(),
            _ => codes::INTERNAL,
        }
    }
}

/// Configuration for the client facade
#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub chain_id: u64,
    pub supported_entry_points: Vec<Address>,
    /// How many blocks back `get_user_operation_by_hash` searches
    /// Default: 2000
    pub op_lookup_limit: u64,
    /// Verification gas used while estimating a UserOp without one
    pub max_verification_gas: U256,
    pub overhead: Overhead,
}

impl ClientConfig {
    pub fn new(chain_id: u64, supported_entry_points: Vec<Address>) -> Self {
        Self {
            chain_id,
            supported_entry_points,
            op_lookup_limit: 2_000,
            max_verification_gas: U256::from(3_000_000),
            overhead: Overhead::default(),
        }
    }

    /// Set the lookup window
    pub fn with_op_lookup_limit(mut self, blocks: u64) -> Self {
        self.op_lookup_limit = blocks;
        self
    }

    /// Set the verification gas ceiling
    pub fn with_max_verification_gas(mut self, gas: U256) -> Self {
        self.max_verification_gas = gas;
        self
    }
}

/// Result of `eth_getUserOperationByHash`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserOperationByHash {
    pub user_operation: UserOperation,
    pub entry_point: Address,
    /// `None` while the UserOp is pending
    pub block_number: Option<U64>,
    pub block_hash: Option<B256>,
    pub transaction_hash: Option<B256>,
}

/// Result of `eth_estimateUserOperationGas`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GasEstimate {
    pub pre_verification_gas: U256,
    pub verification_gas_limit: U256,
    pub call_gas_limit: U256,
}

/// Counters to overwrite with `debug_bundler_setReputation`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReputationUpdate {
    pub address: Address,
    pub ops_seen: u64,
    pub ops_included: u64,
}

/// Entry point for every inbound bundler operation
#[derive(Debug)]
pub struct BundlerClient {
    pipeline: Arc<ValidationPipeline>,
    store: Arc<OperationStore>,
    tracker: Arc<ReputationTracker>,
    chain: SharedChainClient,
    bundler: Option<Arc<BundlerService>>,
    config: ClientConfig,
}

impl BundlerClient {
    pub fn new(
        pipeline: Arc<ValidationPipeline>,
        store: Arc<OperationStore>,
        tracker: Arc<ReputationTracker>,
        chain: SharedChainClient,
        config: ClientConfig,
    ) -> Self {
        Self { pipeline, store, tracker, chain, bundler: None, config }
    }

    /// Attach the bundler service used by `send_bundle_now`
    pub fn with_bundler(mut self, bundler: Arc<BundlerService>) -> Self {
        self.bundler = Some(bundler);
        self
    }

    /// Chain id the bundler serves
    pub fn chain_id(&self) -> u64 {
        self.config.chain_id
    }

    /// Entry points UserOps may target
    pub fn supported_entry_points(&self) -> &[Address] {
        &self.config.supported_entry_points
    }

    fn check_entry_point(&self, entry_point: Address) -> Result<(), Rejection> {
        if self.config.supported_entry_points.contains(&entry_point) {
            Ok(())
        } else {
            Err(Rejection::UnsupportedEntryPoint(entry_point))
        }
    }

    /// Validates and admits a UserOp, returning its hash
    pub async fn send_user_operation(
        &self,
        user_op: UserOperation,
        entry_point: Address,
    ) -> Result<B256, ClientError> {
        Ok(self.pipeline.validate(user_op, entry_point).await?)
    }

    /// Finds a UserOp in the mempool, or on chain within the lookup window
    pub async fn get_user_operation_by_hash(
        &self,
        hash: B256,
    ) -> Result<Option<UserOperationByHash>, ClientError> {
        if let Some(entry) = self.store.get(&hash) {
            return Ok(Some(UserOperationByHash {
                user_operation: entry.user_op,
                entry_point: entry.entry_point,
                block_number: None,
                block_hash: None,
                transaction_hash: None,
            }));
        }

        let latest = self.chain.block_number().await?;
        let from_block = latest.saturating_sub(self.config.op_lookup_limit);

        for entry_point in &self.config.supported_entry_points {
            let Some(lookup) = self.chain.find_user_operation(*entry_point, hash, from_block).await? else {
                continue;
            };

            let call = IEntryPointV06::handleOpsCall::abi_decode(&lookup.input)
                .map_err(|e| ProviderError::Decode(format!("handleOps input: {e}")))?;
            let found = call
                .ops
                .into_iter()
                .map(UserOperation::from)
                .find(|op| op.hash(*entry_point, self.config.chain_id) == hash);

            if let Some(user_operation) = found {
                return Ok(Some(UserOperationByHash {
                    user_operation,
                    entry_point: *entry_point,
                    block_number: Some(U64::from(lookup.block_number)),
                    block_hash: Some(lookup.block_hash),
                    transaction_hash: Some(lookup.transaction_hash),
                }));
            }
            debug!(target: "bundler::client", hash = %hash, tx = %lookup.transaction_hash, "UserOp not in bundle input");
        }
        Ok(None)
    }

    /// Estimates the gas fields of a UserOp
    ///
    /// Fees are zeroed for the simulation so the sender needs no deposit.
    pub async fn estimate_user_operation_gas(
        &self,
        user_op: UserOperation,
        entry_point: Address,
    ) -> Result<GasEstimate, ClientError> {
        self.check_entry_point(entry_point)?;

        let pre_verification_gas = self.config.overhead.calc_pre_verification_gas(&user_op);

        let mut simulated = user_op.clone();
        simulated.pre_verification_gas = pre_verification_gas;
        simulated.max_fee_per_gas = U256::ZERO;
        simulated.max_priority_fee_per_gas = U256::ZERO;
        if simulated.verification_gas_limit.is_zero() {
            simulated.verification_gas_limit = self.config.max_verification_gas;
        }

        let calldata = simulate_validation_calldata(&simulated);
        let result = simulate_validation(self.chain.as_ref(), entry_point, calldata).await?;
        let verification = result.returnInfo.preOpGas.saturating_sub(pre_verification_gas);
        let verification_gas_limit = verification
            + verification * U256::from(VERIFICATION_GAS_BUFFER_PERCENT) / U256::from(100);

        let call_gas = self
            .chain
            .estimate_gas(entry_point, user_op.sender, user_op.call_data.clone())
            .await?
            .max(MIN_CALL_GAS_LIMIT);

        Ok(GasEstimate {
            pre_verification_gas,
            verification_gas_limit,
            call_gas_limit: U256::from(call_gas),
        })
    }

    /// Drops every pending UserOp and reputation record
    pub fn clear_state(&self) -> Result<(), ClientError> {
        self.store.clear()?;
        self.tracker.clear()?;
        info!(target: "bundler::client", "Cleared bundler state");
        Ok(())
    }

    /// Pending UserOps of one entry point, or of all of them
    pub fn dump_mempool(&self, entry_point: Option<Address>) -> Result<Vec<UserOperation>, ClientError> {
        let entries = match entry_point {
            Some(entry_point) => {
                self.check_entry_point(entry_point)?;
                self.store.list(entry_point)
            }
            None => self.store.dump(),
        };
        Ok(entries.into_iter().map(|e| e.user_op).collect())
    }

    /// Runs a bundling cycle immediately
    pub async fn send_bundle_now(&self, entry_point: Option<Address>) -> Result<CycleReport, ClientError> {
        let bundler = self.bundler.as_ref().ok_or(ClientError::BundlerUnavailable)?;
        let entry_point = match entry_point {
            Some(entry_point) => entry_point,
            None => *self
                .config
                .supported_entry_points
                .first()
                .ok_or(Rejection::UnsupportedEntryPoint(Address::ZERO))?,
        };
        Ok(bundler.send_bundle_now(entry_point).await?)
    }

    /// Every tracked sender's reputation
    pub fn dump_reputation(&self) -> Vec<ReputationEntry> {
        self.tracker.dump()
    }

    /// Overwrites the counters of the given senders
    pub fn set_reputation(&self, updates: Vec<ReputationUpdate>) -> Result<(), ClientError> {
        for update in updates {
            self.tracker.set(update.address, update.ops_seen, update.ops_included)?;
        }
        Ok(())
    }
}
