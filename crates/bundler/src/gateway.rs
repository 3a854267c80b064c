//! Bundle submission to private block-builder relays.
//!
//! [`RelayGateway`] signs a `handleOps` transaction with the bundler key and
//! sends it with `eth_sendBundle` to every configured relay, targeting each of
//! the next `blocks_in_the_future` blocks. Requests carry the
//! `X-Flashbots-Signature` header so relays can attribute the bundle.

use std::time::{Duration, Instant};

use alloy_eips::eip2718::Encodable2718;
use alloy_network::{EthereumWallet, TransactionBuilder};
use alloy_primitives::{Address, B256, Bytes, U256, hex, keccak256};
use alloy_rpc_types_eth::TransactionRequest;
use alloy_signer::Signer;
use alloy_signer_local::PrivateKeySigner;
use alloy_sol_types::SolCall;
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{Value, json};
use thiserror::Error;
use tracing::{debug, info, warn};
use url::Url;

use crate::metrics::GatewayMetrics;
use crate::provider::{ProviderError, SharedChainClient};
use crate::types::{IEntryPointV06, UserOperation};

/// Chains the supported builder relays operate on.
pub const COMPATIBLE_CHAIN_IDS: &[u64] = &[1, 5, 11_155_111, 17_000];

const SIGNATURE_HEADER: &str = "X-Flashbots-Signature";

/// Errors submitting a bundle
#[derive(Debug, Error)]
pub enum GatewayError {
    /// No relay could be reached
    #[error("no relay reachable: {0}")]
    Unreachable(String),

    /// Every reachable relay refused the bundle
    #[error("bundle rejected: {0}")]
    Rejected(String),

    /// The node serves a different chain than configured
    #[error("chain mismatch: configured {expected}, node reports {actual}")]
    ChainMismatch { expected: u64, actual: u64 },

    /// The chain has no compatible builder relays
    #[error("chain {0} is not supported by builder relays")]
    IncompatibleChain(u64),

    /// Building or signing the transaction failed
    #[error("signing failed: {0}")]
    Signing(String),

    #[error(transparent)]
    Provider(#[from] ProviderError),
}

impl GatewayError {
    /// Whether the outcome may change by retrying later
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Unreachable(_) | Self::Provider(_))
    }
}

/// Hands finished bundles to the network
#[async_trait]
pub trait SubmissionGateway: std::fmt::Debug + Send + Sync + 'static {
    /// Address the bundle transaction is sent from
    fn signer(&self) -> Address;

    /// Address receiving the bundle's gas refunds
    fn beneficiary(&self) -> Address;

    /// Checks the node's chain against the configuration
    async fn verify_chain(&self) -> Result<(), GatewayError>;

    /// Submits `handleOps(batch)` to `entry_point`, returning the transaction hash
    async fn submit(&self, entry_point: Address, batch: &[UserOperation]) -> Result<B256, GatewayError>;
}

/// Configuration for relay submission
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    /// Chain the bundler is configured for
    pub chain_id: u64,

    /// Builder relay endpoints
    pub builder_urls: Vec<Url>,

    /// Number of upcoming blocks each bundle targets
    /// Default: 6
    pub blocks_in_the_future: u64,

    /// Gas added to the bundle's summed op gas for the transaction itself
    /// Default: 100,000
    pub handle_ops_overhead: u64,

    /// Chains accepted in addition to [`COMPATIBLE_CHAIN_IDS`]
    pub extra_compatible_chain_ids: Vec<u64>,

    /// Timeout of a single relay request
    /// Default: 5 seconds
    pub request_timeout: Duration,
}

impl GatewayConfig {
    /// Create a new configuration with default values
    pub fn new(chain_id: u64, builder_urls: Vec<Url>) -> Self {
        Self {
            chain_id,
            builder_urls,
            blocks_in_the_future: 6,
            handle_ops_overhead: 100_000,
            extra_compatible_chain_ids: Vec::new(),
            request_timeout: Duration::from_secs(5),
        }
    }

    /// Set the number of targeted blocks
    pub fn with_blocks_in_the_future(mut self, blocks: u64) -> Self {
        self.blocks_in_the_future = blocks.max(1);
        self
    }

    /// Accept additional chains
    pub fn with_extra_chain_ids(mut self, chain_ids: Vec<u64>) -> Self {
        self.extra_compatible_chain_ids = chain_ids;
        self
    }

    /// Check if relays exist for a chain
    pub fn is_compatible(&self, chain_id: u64) -> bool {
        COMPATIBLE_CHAIN_IDS.contains(&chain_id) || self.extra_compatible_chain_ids.contains(&chain_id)
    }
}

#[derive(Debug, Deserialize)]
struct RelayResponse {
    #[serde(default)]
    error: Option<Value>,
}

enum RelayOutcome {
    Accepted,
    Refused(String),
    Unreachable(String),
}

/// [`SubmissionGateway`] over flashbots-style relays
pub struct RelayGateway {
    client: SharedChainClient,
    signer: PrivateKeySigner,
    wallet: EthereumWallet,
    beneficiary: Address,
    http: reqwest::Client,
    config: GatewayConfig,
    metrics: GatewayMetrics,
}

impl std::fmt::Debug for RelayGateway {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RelayGateway")
            .field("signer", &self.signer.address())
            .field("beneficiary", &self.beneficiary)
            .field("config", &self.config)
            .finish()
    }
}

impl RelayGateway {
    pub fn new(
        client: SharedChainClient,
        signer: PrivateKeySigner,
        beneficiary: Address,
        config: GatewayConfig,
    ) -> Result<Self, GatewayError> {
        let http = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .build()
            .map_err(|e| GatewayError::Signing(format!("http client: {e}")))?;
        let wallet = EthereumWallet::from(signer.clone());

        Ok(Self { client, signer, wallet, beneficiary, http, config, metrics: GatewayMetrics::default() })
    }

    async fn sign_handle_ops(
        &self,
        entry_point: Address,
        batch: &[UserOperation],
    ) -> Result<(B256, String), GatewayError> {
        let from = self.signer.address();
        let nonce = self.client.transaction_count(from).await?;
        let base_fee = self.client.base_fee().await?;
        let tip = self.client.max_priority_fee().await?;

        let batch_gas = batch.iter().fold(U256::ZERO, |acc, op| acc.saturating_add(op.max_gas_available()));
        let gas_limit = batch_gas
            .saturating_add(U256::from(self.config.handle_ops_overhead))
            .saturating_to::<u64>();
        let max_fee = base_fee.saturating_mul(U256::from(2)).saturating_add(tip);

        let calldata = IEntryPointV06::handleOpsCall {
            ops: batch.iter().cloned().map(Into::into).collect(),
            beneficiary: self.beneficiary,
        }
        .abi_encode();

        let tx = TransactionRequest::default()
            .from(from)
            .to(entry_point)
            .input(Bytes::from(calldata).into())
            .nonce(nonce)
            .gas_limit(gas_limit)
            .max_fee_per_gas(max_fee.saturating_to())
            .max_priority_fee_per_gas(tip.saturating_to())
            .with_chain_id(self.config.chain_id);

        let envelope = tx.build(&self.wallet).await.map_err(|e| GatewayError::Signing(e.to_string()))?;
        let raw = envelope.encoded_2718();
        Ok((keccak256(&raw), hex::encode_prefixed(raw)))
    }

    /// `X-Flashbots-Signature` value for a request body
    async fn signature_header(&self, body: &str) -> Result<String, GatewayError> {
        let digest = hex::encode_prefixed(keccak256(body.as_bytes()));
        let signature = self
            .signer
            .sign_message(digest.as_bytes())
            .await
            .map_err(|e| GatewayError::Signing(e.to_string()))?;
        Ok(format!("{}:{}", self.signer.address(), hex::encode_prefixed(signature.as_bytes())))
    }

    async fn send_to_relay(&self, url: &Url, body: String) -> RelayOutcome {
        let header = match self.signature_header(&body).await {
            Ok(header) => header,
            Err(e) => return RelayOutcome::Refused(e.to_string()),
        };

        let response = self
            .http
            .post(url.clone())
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .header(SIGNATURE_HEADER, header)
            .body(body)
            .send()
            .await;

        let response = match response {
            Ok(response) => response,
            Err(e) => return RelayOutcome::Unreachable(format!("{url}: {e}")),
        };
        if !response.status().is_success() {
            return RelayOutcome::Refused(format!("{url}: http {}", response.status()));
        }
        match response.json::<RelayResponse>().await {
            Ok(RelayResponse { error: None }) => RelayOutcome::Accepted,
            Ok(RelayResponse { error: Some(error) }) => RelayOutcome::Refused(format!("{url}: {error}")),
            Err(e) => RelayOutcome::Refused(format!("{url}: {e}")),
        }
    }
}

/// `eth_sendBundle` request body targeting `block_number`
fn send_bundle_body(raw_tx: &str, block_number: u64) -> String {
    json!({
        "jsonrpc": "2.0",
        "id": 1,
        "method": "eth_sendBundle",
        "params": [{ "txs": [raw_tx], "blockNumber": format!("{block_number:#x}") }],
    })
    .to_string()
}

#[async_trait]
impl SubmissionGateway for RelayGateway {
    fn signer(&self) -> Address {
        self.signer.address()
    }

    fn beneficiary(&self) -> Address {
        self.beneficiary
    }

    async fn verify_chain(&self) -> Result<(), GatewayError> {
        let actual = self.client.chain_id().await?;
        if actual != self.config.chain_id {
            return Err(GatewayError::ChainMismatch { expected: self.config.chain_id, actual });
        }
        if !self.config.is_compatible(actual) {
            return Err(GatewayError::IncompatibleChain(actual));
        }
        Ok(())
    }

    async fn submit(&self, entry_point: Address, batch: &[UserOperation]) -> Result<B256, GatewayError> {
        let start = Instant::now();
        let (tx_hash, raw_tx) = self.sign_handle_ops(entry_point, batch).await?;
        let current_block = self.client.block_number().await?;

        let mut accepted = 0usize;
        let mut refused = Vec::new();
        let mut unreachable = Vec::new();

        for url in &self.config.builder_urls {
            let mut relay_accepted = false;
            for offset in 1..=self.config.blocks_in_the_future {
                let body = send_bundle_body(&raw_tx, current_block + offset);
                match self.send_to_relay(url, body).await {
                    RelayOutcome::Accepted => relay_accepted = true,
                    RelayOutcome::Refused(reason) => refused.push(reason),
                    RelayOutcome::Unreachable(reason) => {
                        self.metrics.relay_failures.increment(1);
                        unreachable.push(reason);
                        break;
                    }
                }
            }
            if relay_accepted {
                accepted += 1;
            }
        }

        self.metrics.submit_duration.record(start.elapsed().as_secs_f64());

        if accepted > 0 {
            self.metrics.submissions.increment(1);
            info!(
                target: "bundler::gateway",
                tx_hash = %tx_hash,
                entry_point = %entry_point,
                ops = batch.len(),
                relays = accepted,
                target_block = current_block + 1,
                "Submitted bundle"
            );
            if !refused.is_empty() || !unreachable.is_empty() {
                debug!(target: "bundler::gateway", ?refused, ?unreachable, "Some relay requests failed");
            }
            return Ok(tx_hash);
        }

        if !refused.is_empty() {
            warn!(target: "bundler::gateway", ?refused, "Bundle refused by relays");
            return Err(GatewayError::Rejected(refused.join("; ")));
        }
        Err(GatewayError::Unreachable(unreachable.join("; ")))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use jsonrpsee::core::{RpcResult, async_trait as rpc_async_trait};
    use jsonrpsee::proc_macros::rpc;
    use jsonrpsee::server::Server;

    use super::*;
    use crate::test_utils::{MockChainClient, test_address, test_user_op};

    const TEST_KEY: &str = "0xac0974bec39a17e36ba4a6b4d238ff944bacb478cbed5efcae784d7bf4f2ff80";

    #[rpc(server, namespace = "eth")]
    trait Relay {
        #[method(name = "sendBundle")]
        async fn send_bundle(&self, bundle: Value) -> RpcResult<Value>;
    }

    struct AcceptingRelay;

    #[rpc_async_trait]
    impl RelayServer for AcceptingRelay {
        async fn send_bundle(&self, _bundle: Value) -> RpcResult<Value> {
            Ok(json!({ "bundleHash": B256::ZERO }))
        }
    }

    fn gateway(client: Arc<MockChainClient>, urls: Vec<Url>) -> RelayGateway {
        let signer: PrivateKeySigner = TEST_KEY.parse().unwrap();
        let config = GatewayConfig::new(1337, urls).with_blocks_in_the_future(2);
        RelayGateway::new(client, signer, test_address(0xbe), config).unwrap()
    }

    #[tokio::test]
    async fn test_verify_chain() {
        let client = Arc::new(MockChainClient::new());
        let gw = gateway(Arc::clone(&client), Vec::new());

        // 1337 is not a relay chain unless explicitly allowed
        assert!(matches!(gw.verify_chain().await, Err(GatewayError::IncompatibleChain(1337))));

        client.set_chain_id(1);
        assert!(matches!(
            gw.verify_chain().await,
            Err(GatewayError::ChainMismatch { expected: 1337, actual: 1 })
        ));

        client.set_chain_id(1337);
        let mut gw = gw;
        gw.config = gw.config.clone().with_extra_chain_ids(vec![1337]);
        assert!(gw.verify_chain().await.is_ok());
    }

    #[test]
    fn test_send_bundle_body() {
        let body: Value = serde_json::from_str(&send_bundle_body("0xdead", 255)).unwrap();
        assert_eq!(body["method"], "eth_sendBundle");
        assert_eq!(body["params"][0]["blockNumber"], "0xff");
        assert_eq!(body["params"][0]["txs"][0], "0xdead");
    }

    #[tokio::test]
    async fn test_signature_header_recovers_signer() {
        let gw = gateway(Arc::new(MockChainClient::new()), Vec::new());
        let body = send_bundle_body("0xdead", 1);
        let header = gw.signature_header(&body).await.unwrap();

        let (address, signature) = header.split_once(':').unwrap();
        assert_eq!(address.parse::<Address>().unwrap(), gw.signer());

        let signature: alloy_primitives::Signature = signature.parse().unwrap();
        let digest = hex::encode_prefixed(keccak256(body.as_bytes()));
        let recovered = signature.recover_address_from_msg(digest.as_bytes()).unwrap();
        assert_eq!(recovered, gw.signer());
    }

    #[tokio::test]
    async fn test_unreachable_relay() {
        let url: Url = "http://127.0.0.1:1".parse().unwrap();
        let gw = gateway(Arc::new(MockChainClient::new()), vec![url]);

        let err = gw.submit(test_address(0xee), &[test_user_op(1, 0, 100, 10)]).await.unwrap_err();
        assert!(matches!(err, GatewayError::Unreachable(_)));
        assert!(err.is_transient());
    }

    #[tokio::test]
    async fn test_submit_to_accepting_relay() {
        let server = Server::builder().build("127.0.0.1:0").await.unwrap();
        let addr = server.local_addr().unwrap();
        let handle = server.start(AcceptingRelay.into_rpc());

        let url: Url = format!("http://{addr}").parse().unwrap();
        let unreachable: Url = "http://127.0.0.1:1".parse().unwrap();
        let gw = gateway(Arc::new(MockChainClient::new()), vec![unreachable, url]);

        let tx_hash = gw.submit(test_address(0xee), &[test_user_op(1, 0, 100, 10)]).await.unwrap();
        assert_ne!(tx_hash, B256::ZERO);

        handle.stop().unwrap();
    }
}
