//! JSON-RPC surface of the bundler.
//!
//! `eth_*` methods are always served. The `debug_bundler_*` namespace is only
//! registered in debug mode. `GET /health` is proxied to `system_health`.

use std::net::SocketAddr;
use std::sync::Arc;

use alloy_primitives::{Address, B256, U64};
use jsonrpsee::{
    RpcModule,
    core::{RegisterMethodError, RpcResult, async_trait},
    proc_macros::rpc,
    server::{Server, ServerHandle, middleware::http::ProxyGetRequestLayer},
    types::ErrorObjectOwned,
};
use serde_json::json;
use thiserror::Error;
use tracing::{debug, info};

use crate::client::{BundlerClient, ClientError, GasEstimate, ReputationUpdate, UserOperationByHash};
use crate::reputation::ReputationEntry;
use crate::types::UserOperation;

/// ERC-4337 bundler API
#[rpc(server, namespace = "eth")]
pub trait BundlerApi {
    /// Submits a UserOp to the mempool
    #[method(name = "sendUserOperation")]
    async fn send_user_operation(&self, user_operation: UserOperation, entry_point: Address) -> RpcResult<B256>;

    /// Estimates gas values for a UserOp
    #[method(name = "estimateUserOperationGas")]
    async fn estimate_user_operation_gas(
        &self,
        user_operation: UserOperation,
        entry_point: Address,
    ) -> RpcResult<GasEstimate>;

    /// Returns a pending or included UserOp by its hash
    #[method(name = "getUserOperationByHash")]
    async fn get_user_operation_by_hash(&self, hash: B256) -> RpcResult<Option<UserOperationByHash>>;

    /// Returns supported entry point addresses
    #[method(name = "supportedEntryPoints")]
    async fn supported_entry_points(&self) -> RpcResult<Vec<Address>>;

    /// Returns the chain id the bundler serves
    #[method(name = "chainId")]
    async fn chain_id(&self) -> RpcResult<U64>;
}

/// Debug helpers for bundler test suites
#[rpc(server, namespace = "debug_bundler")]
pub trait DebugApi {
    /// Drops the mempool and reputation
    #[method(name = "clearState")]
    async fn clear_state(&self) -> RpcResult<String>;

    /// Pending UserOps of an entry point, or of every entry point
    #[method(name = "dumpMempool")]
    async fn dump_mempool(&self, entry_point: Option<Address>) -> RpcResult<Vec<UserOperation>>;

    /// Runs a bundling cycle now and returns the bundle transaction hash
    #[method(name = "sendBundleNow")]
    async fn send_bundle_now(&self) -> RpcResult<Option<B256>>;

    /// Reputation of every tracked sender
    ///
    /// Reputation is shared by all entry points, the argument is accepted
    /// for compatibility.
    #[method(name = "dumpReputation")]
    async fn dump_reputation(&self, entry_point: Option<Address>) -> RpcResult<Vec<ReputationEntry>>;

    /// Overwrites sender counters
    #[method(name = "setReputation")]
    async fn set_reputation(
        &self,
        entries: Vec<ReputationUpdate>,
        entry_point: Option<Address>,
    ) -> RpcResult<String>;
}

/// Liveness
#[rpc(server, namespace = "system")]
pub trait HealthApi {
    #[method(name = "health")]
    async fn health(&self) -> RpcResult<bool>;
}

/// Errors starting the RPC server
#[derive(Debug, Error)]
pub enum RpcServerError {
    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("invalid proxy route: {0}")]
    Route(String),

    #[error(transparent)]
    Register(#[from] RegisterMethodError),
}

fn to_rpc_error(err: ClientError) -> ErrorObjectOwned {
    let data = match &err {
        ClientError::Rejected(rejection) => Some(json!({ "reason": rejection.code() })),
        _ => None,
    };
    ErrorObjectOwned::owned(err.rpc_code(), err.to_string(), data)
}

/// Implementation of every bundler RPC namespace
#[derive(Debug, Clone)]
pub struct BundlerRpc {
    client: Arc<BundlerClient>,
}

impl BundlerRpc {
    pub fn new(client: Arc<BundlerClient>) -> Self {
        Self { client }
    }

    /// Collects the namespaces to serve
    pub fn into_module(self, debug: bool) -> Result<RpcModule<()>, RegisterMethodError> {
        let mut module = RpcModule::new(());
        module.merge(BundlerApiServer::into_rpc(self.clone()))?;
        module.merge(HealthApiServer::into_rpc(self.clone()))?;
        if debug {
            module.merge(DebugApiServer::into_rpc(self))?;
        }
        Ok(module)
    }
}

#[async_trait]
impl BundlerApiServer for BundlerRpc {
    async fn send_user_operation(&self, user_operation: UserOperation, entry_point: Address) -> RpcResult<B256> {
        debug!(
            target: "bundler::rpc",
            sender = %user_operation.sender,
            nonce = %user_operation.nonce,
            entry_point = %entry_point,
            "eth_sendUserOperation"
        );
        self.client.send_user_operation(user_operation, entry_point).await.map_err(to_rpc_error)
    }

    async fn estimate_user_operation_gas(
        &self,
        user_operation: UserOperation,
        entry_point: Address,
    ) -> RpcResult<GasEstimate> {
        self.client.estimate_user_operation_gas(user_operation, entry_point).await.map_err(to_rpc_error)
    }

    async fn get_user_operation_by_hash(&self, hash: B256) -> RpcResult<Option<UserOperationByHash>> {
        self.client.get_user_operation_by_hash(hash).await.map_err(to_rpc_error)
    }

    async fn supported_entry_points(&self) -> RpcResult<Vec<Address>> {
        Ok(self.client.supported_entry_points().to_vec())
    }

    async fn chain_id(&self) -> RpcResult<U64> {
        Ok(U64::from(self.client.chain_id()))
    }
}

#[async_trait]
impl DebugApiServer for BundlerRpc {
    async fn clear_state(&self) -> RpcResult<String> {
        self.client.clear_state().map_err(to_rpc_error)?;
        Ok("ok".to_string())
    }

    async fn dump_mempool(&self, entry_point: Option<Address>) -> RpcResult<Vec<UserOperation>> {
        self.client.dump_mempool(entry_point).map_err(to_rpc_error)
    }

    async fn send_bundle_now(&self) -> RpcResult<Option<B256>> {
        let report = self.client.send_bundle_now(None).await.map_err(to_rpc_error)?;
        Ok(report.transaction_hash)
    }

    async fn dump_reputation(&self, _entry_point: Option<Address>) -> RpcResult<Vec<ReputationEntry>> {
        Ok(self.client.dump_reputation())
    }

    async fn set_reputation(
        &self,
        entries: Vec<ReputationUpdate>,
        _entry_point: Option<Address>,
    ) -> RpcResult<String> {
        self.client.set_reputation(entries).map_err(to_rpc_error)?;
        Ok("ok".to_string())
    }
}

#[async_trait]
impl HealthApiServer for BundlerRpc {
    async fn health(&self) -> RpcResult<bool> {
        Ok(true)
    }
}

/// Binds the server and starts serving, returning its handle and address
pub async fn launch(
    client: Arc<BundlerClient>,
    addr: SocketAddr,
    debug: bool,
) -> Result<(ServerHandle, SocketAddr), RpcServerError> {
    let module = BundlerRpc::new(client).into_module(debug)?;

    let middleware = tower::ServiceBuilder::new().layer(
        ProxyGetRequestLayer::new([("/health", "system_health")])
            .map_err(|e| RpcServerError::Route(e.to_string()))?,
    );
    let server = Server::builder().set_http_middleware(middleware).build(addr).await?;
    let local_addr = server.local_addr()?;
    info!(target: "bundler::rpc", addr = %local_addr, debug, "RPC server started");

    Ok((server.start(module), local_addr))
}

#[cfg(test)]
mod tests {
    use serde_json::Value;

    use super::*;
    use crate::client::ClientConfig;
    use crate::mempool::{OperationStore, StoreConfig};
    use crate::provider::SharedChainClient;
    use crate::reputation::{ReputationConfig, ReputationTracker};
    use crate::storage::Database;
    use crate::test_utils::{MockChainClient, test_address, test_user_op};
    use crate::validation::{ValidationConfig, ValidationPipelineBuilder, codes};

    struct Harness {
        _dir: tempfile::TempDir,
        handle: ServerHandle,
        url: String,
        chain: Arc<MockChainClient>,
        ep: Address,
    }

    async fn harness(debug: bool) -> Harness {
        let dir = tempfile::tempdir().unwrap();
        let db = Arc::new(Database::open(dir.path()).unwrap());
        let store = Arc::new(OperationStore::open(Arc::clone(&db), StoreConfig::new(1337)).unwrap());
        let tracker = Arc::new(ReputationTracker::open(db, ReputationConfig::default()).unwrap());
        let chain = Arc::new(MockChainClient::new());
        let shared = Arc::clone(&chain) as SharedChainClient;
        let ep = test_address(0xee);

        let pipeline = ValidationPipelineBuilder::new(Arc::clone(&store), Arc::clone(&tracker), Arc::clone(&shared))
            .with_config(ValidationConfig::default().with_entry_points(vec![ep]))
            .build();
        let client = BundlerClient::new(
            Arc::new(pipeline),
            store,
            tracker,
            shared,
            ClientConfig::new(1337, vec![ep]),
        );

        let (handle, addr) = launch(Arc::new(client), "127.0.0.1:0".parse().unwrap(), debug).await.unwrap();
        Harness { _dir: dir, handle, url: format!("http://{addr}"), chain, ep }
    }

    async fn call(url: &str, method: &str, params: Value) -> Value {
        reqwest::Client::new()
            .post(url)
            .json(&json!({ "jsonrpc": "2.0", "id": 1, "method": method, "params": params }))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_chain_id_and_entry_points() {
        let h = harness(false).await;

        let response = call(&h.url, "eth_chainId", json!([])).await;
        assert_eq!(response["result"], "0x539");

        let response = call(&h.url, "eth_supportedEntryPoints", json!([])).await;
        assert_eq!(response["result"], json!([h.ep]));

        h.handle.stop().unwrap();
    }

    #[tokio::test]
    async fn test_send_user_operation() {
        let h = harness(false).await;
        let op = test_user_op(1, 0, 100, 10);
        h.chain.deploy(op.sender);

        let response = call(&h.url, "eth_sendUserOperation", json!([op, h.ep])).await;
        assert_eq!(response["result"], json!(op.hash(h.ep, 1337)));

        let response = call(&h.url, "eth_getUserOperationByHash", json!([op.hash(h.ep, 1337)])).await;
        assert_eq!(response["result"]["entryPoint"], json!(h.ep));
        assert_eq!(response["result"]["blockNumber"], Value::Null);
    }

    #[tokio::test]
    async fn test_rejection_is_reason_coded() {
        let h = harness(false).await;
        let op = test_user_op(1, 0, 100, 10);

        let response = call(&h.url, "eth_sendUserOperation", json!([op, test_address(0xaa)])).await;
        assert_eq!(response["error"]["code"], codes::INVALID_FIELDS);
        assert_eq!(response["error"]["data"]["reason"], "UnsupportedEntryPoint");
    }

    #[tokio::test]
    async fn test_debug_namespace_requires_debug_mode() {
        let h = harness(false).await;
        let response = call(&h.url, "debug_bundler_dumpMempool", json!([])).await;
        assert!(response["error"].is_object());

        let h = harness(true).await;
        let response = call(&h.url, "debug_bundler_dumpMempool", json!([])).await;
        assert_eq!(response["result"], json!([]));

        let response = call(&h.url, "debug_bundler_sendBundleNow", json!([])).await;
        assert_eq!(response["error"]["code"], codes::INTERNAL);
    }

    #[tokio::test]
    async fn test_health_route() {
        let h = harness(false).await;
        let response = reqwest::get(format!("{}/health", h.url)).await.unwrap();
        assert!(response.status().is_success());
        assert!(response.text().await.unwrap().contains("true"));
    }
}
