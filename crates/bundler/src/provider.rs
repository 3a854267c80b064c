//! Node access.
//!
//! The pipelines only talk to the chain through [`ChainClient`], so tests can
//! swap in a scripted node and production uses [`RpcChainClient`].

use std::sync::Arc;

use alloy_consensus::Transaction as _;
use alloy_eips::{BlockId, BlockNumberOrTag};
use alloy_primitives::{Address, B256, Bytes, U256, keccak256};
use alloy_provider::{Provider, ProviderBuilder, RootProvider};
use alloy_rpc_types_eth::{Filter, TransactionRequest};
use alloy_rpc_types_trace::geth::erc7562::Erc7562Frame;
use alloy_sol_types::{SolCall, SolEvent};
use alloy_transport::TransportError;
use async_trait::async_trait;
use thiserror::Error;
use tracing::debug;
use url::Url;

use crate::types::{EntityStake, IEntryPointV06, UserOperationEvent};

/// JSON-RPC "method not found".
const METHOD_NOT_FOUND_CODE: i64 = -32601;

/// Shared handle to a chain client.
pub type SharedChainClient = Arc<dyn ChainClient>;

/// Errors talking to the node.
#[derive(Debug, Error)]
pub enum ProviderError {
    /// Transport or JSON-RPC failure
    #[error("rpc error: {0}")]
    Rpc(String),

    /// The node returned a response without a required field
    #[error("missing {0} in node response")]
    Missing(&'static str),

    /// A call returned data that could not be decoded
    #[error("decode error: {0}")]
    Decode(String),

    /// A view call reverted unexpectedly
    #[error("{method} reverted: {data}")]
    Reverted { method: &'static str, data: Bytes },
}

impl From<TransportError> for ProviderError {
    fn from(err: TransportError) -> Self {
        Self::Rpc(err.to_string())
    }
}

/// Outcome of an `eth_call`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallOutcome {
    /// Returned normally
    Success(Bytes),
    /// Reverted with the given data
    Revert(Bytes),
}

/// Where a UserOperationEvent was emitted, plus the raw bundle input.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserOperationLookup {
    pub block_number: u64,
    pub block_hash: B256,
    pub transaction_hash: B256,
    pub input: Bytes,
}

/// Read access to the chain used by validation, bundling and the RPC layer.
#[async_trait]
pub trait ChainClient: std::fmt::Debug + Send + Sync + 'static {
    /// `eth_chainId`
    async fn chain_id(&self) -> Result<u64, ProviderError>;

    /// `eth_blockNumber`
    async fn block_number(&self) -> Result<u64, ProviderError>;

    /// Base fee of the latest block
    async fn base_fee(&self) -> Result<U256, ProviderError>;

    /// `eth_maxPriorityFeePerGas`
    async fn max_priority_fee(&self) -> Result<U256, ProviderError>;

    /// `eth_getCode` at latest
    async fn code(&self, address: Address) -> Result<Bytes, ProviderError>;

    /// Pending nonce of an account
    async fn transaction_count(&self, address: Address) -> Result<u64, ProviderError>;

    /// `eth_call`, separating reverts from transport failures
    async fn call(
        &self,
        from: Option<Address>,
        to: Address,
        data: Bytes,
    ) -> Result<CallOutcome, ProviderError>;

    /// `eth_estimateGas`
    async fn estimate_gas(&self, from: Address, to: Address, data: Bytes)
    -> Result<u64, ProviderError>;

    /// `debug_traceCall` with the ERC-7562 tracer
    ///
    /// Returns `Ok(None)` when the node does not support tracing.
    async fn trace_call(&self, to: Address, data: Bytes)
    -> Result<Option<Erc7562Frame>, ProviderError>;

    /// Finds the first `UserOperationEvent` for `hash` emitted since `from_block`
    async fn find_user_operation(
        &self,
        entry_point: Address,
        hash: B256,
        from_block: u64,
    ) -> Result<Option<UserOperationLookup>, ProviderError>;
}

/// [`ChainClient`] over an alloy HTTP provider.
#[derive(Debug, Clone)]
pub struct RpcChainClient {
    provider: RootProvider,
}

impl RpcChainClient {
    /// Connects to the node at `url`.
    pub fn new(url: Url) -> Self {
        let provider = ProviderBuilder::new().disable_recommended_fillers().connect_http(url);
        Self { provider }
    }

    /// Underlying provider.
    pub fn provider(&self) -> &RootProvider {
        &self.provider
    }
}

#[async_trait]
impl ChainClient for RpcChainClient {
    async fn chain_id(&self) -> Result<u64, ProviderError> {
        Ok(self.provider.get_chain_id().await?)
    }

    async fn block_number(&self) -> Result<u64, ProviderError> {
        Ok(self.provider.get_block_number().await?)
    }

    async fn base_fee(&self) -> Result<U256, ProviderError> {
        let block = self
            .provider
            .get_block_by_number(BlockNumberOrTag::Latest)
            .await?
            .ok_or(ProviderError::Missing("latest block"))?;
        let base_fee = block.header.base_fee_per_gas.ok_or(ProviderError::Missing("base fee"))?;
        Ok(U256::from(base_fee))
    }

    async fn max_priority_fee(&self) -> Result<U256, ProviderError> {
        Ok(U256::from(self.provider.get_max_priority_fee_per_gas().await?))
    }

    async fn code(&self, address: Address) -> Result<Bytes, ProviderError> {
        Ok(self.provider.get_code_at(address).await?)
    }

    async fn transaction_count(&self, address: Address) -> Result<u64, ProviderError> {
        Ok(self.provider.get_transaction_count(address).block_id(BlockId::pending()).await?)
    }

    async fn call(
        &self,
        from: Option<Address>,
        to: Address,
        data: Bytes,
    ) -> Result<CallOutcome, ProviderError> {
        let mut tx = TransactionRequest::default().to(to).input(data.into());
        if let Some(from) = from {
            tx = tx.from(from);
        }

        match self.provider.call(tx).await {
            Ok(output) => Ok(CallOutcome::Success(output)),
            Err(err) => match err.as_error_resp().and_then(|payload| payload.as_revert_data()) {
                Some(data) => Ok(CallOutcome::Revert(data)),
                None => Err(err.into()),
            },
        }
    }

    async fn estimate_gas(
        &self,
        from: Address,
        to: Address,
        data: Bytes,
    ) -> Result<u64, ProviderError> {
        let tx = TransactionRequest::default().from(from).to(to).input(data.into());
        Ok(self.provider.estimate_gas(tx).await?)
    }

    async fn trace_call(
        &self,
        to: Address,
        data: Bytes,
    ) -> Result<Option<Erc7562Frame>, ProviderError> {
        let tx = TransactionRequest::default().to(to).input(data.into());
        let opts = serde_json::json!({ "tracer": "erc7562Tracer" });

        let result: Result<Erc7562Frame, TransportError> =
            self.provider.raw_request("debug_traceCall".into(), (tx, "latest", opts)).await;

        match result {
            Ok(frame) => Ok(Some(frame)),
            Err(err)
                if err.as_error_resp().is_some_and(|payload| payload.code == METHOD_NOT_FOUND_CODE) =>
            {
                debug!(target: "bundler::provider", "debug_traceCall not supported by node");
                Ok(None)
            }
            Err(err) => Err(err.into()),
        }
    }

    async fn find_user_operation(
        &self,
        entry_point: Address,
        hash: B256,
        from_block: u64,
    ) -> Result<Option<UserOperationLookup>, ProviderError> {
        let filter = Filter::new()
            .address(entry_point)
            .event_signature(UserOperationEvent::SIGNATURE_HASH)
            .topic1(hash)
            .from_block(from_block);

        let Some(log) = self.provider.get_logs(&filter).await?.into_iter().next() else {
            return Ok(None);
        };

        let transaction_hash = log.transaction_hash.ok_or(ProviderError::Missing("transaction hash"))?;
        let tx = self
            .provider
            .get_transaction_by_hash(transaction_hash)
            .await?
            .ok_or(ProviderError::Missing("transaction"))?;

        Ok(Some(UserOperationLookup {
            block_number: log.block_number.unwrap_or_default(),
            block_hash: log.block_hash.unwrap_or_default(),
            transaction_hash,
            input: tx.input().clone(),
        }))
    }
}

/// Reads stake and deposit of `account` from the entry point.
pub async fn get_deposit_info(
    client: &dyn ChainClient,
    entry_point: Address,
    account: Address,
) -> Result<EntityStake, ProviderError> {
    let data = IEntryPointV06::getDepositInfoCall { account }.abi_encode();
    match client.call(None, entry_point, data.into()).await? {
        CallOutcome::Success(output) => IEntryPointV06::getDepositInfoCall::abi_decode_returns(&output)
            .map(EntityStake::from)
            .map_err(|e| ProviderError::Decode(format!("getDepositInfo: {e}"))),
        CallOutcome::Revert(data) => Err(ProviderError::Reverted { method: "getDepositInfo", data }),
    }
}

/// Reads the gas deposit of `account` at the entry point.
pub async fn get_balance_of(
    client: &dyn ChainClient,
    entry_point: Address,
    account: Address,
) -> Result<U256, ProviderError> {
    let data = IEntryPointV06::balanceOfCall { account }.abi_encode();
    match client.call(None, entry_point, data.into()).await? {
        CallOutcome::Success(output) => IEntryPointV06::balanceOfCall::abi_decode_returns(&output)
            .map_err(|e| ProviderError::Decode(format!("balanceOf: {e}"))),
        CallOutcome::Revert(data) => Err(ProviderError::Reverted { method: "balanceOf", data }),
    }
}

/// Digest of the code hashes of `addresses`, in the given order.
pub async fn get_code_hash_digest(
    client: &dyn ChainClient,
    addresses: &[Address],
) -> Result<B256, ProviderError> {
    let mut preimage = Vec::with_capacity(addresses.len() * 32);
    for address in addresses {
        let code = client.code(*address).await?;
        preimage.extend_from_slice(keccak256(&code).as_slice());
    }
    Ok(keccak256(preimage))
}
