//! End-to-end flows through the public API: admission, bundling and restart.

use std::sync::Arc;

use alloy_primitives::{Address, B256, Bytes, U256};
use alloy_rpc_types_trace::geth::erc7562::Erc7562Frame;
use alloy_sol_types::{SolCall, SolError, SolValue};
use async_trait::async_trait;
use bundler_lib::gateway::{GatewayError, SubmissionGateway};
use bundler_lib::provider::{CallOutcome, UserOperationLookup};
use bundler_lib::reputation::ReputationStatus;
use bundler_lib::types::{DepositInfo, IEntryPointV06, ReturnInfo, StakeInfo, ValidationResult};
use bundler_lib::{
    BundlePipelineBuilder, BundlerClient, BundlerConfig, BundlerService, ChainClient, ClientConfig,
    ClientError, Database, OperationStore, ProviderError, ReputationConfig, ReputationTracker,
    SharedChainClient, StoreConfig, UserOperation, ValidationConfig, ValidationPipelineBuilder,
};
use parking_lot::Mutex;

const CHAIN_ID: u64 = 1337;
const ENTRY_POINT: Address = Address::new([0xee; 20]);

/// Node where every sender is deployed and every op validates
#[derive(Debug, Default)]
struct Node {
    handle_ops_calls: Mutex<usize>,
}

#[async_trait]
impl ChainClient for Node {
    async fn chain_id(&self) -> Result<u64, ProviderError> {
        Ok(CHAIN_ID)
    }

    async fn block_number(&self) -> Result<u64, ProviderError> {
        Ok(100)
    }

    async fn base_fee(&self) -> Result<U256, ProviderError> {
        Ok(U256::from(1))
    }

    async fn max_priority_fee(&self) -> Result<U256, ProviderError> {
        Ok(U256::ZERO)
    }

    async fn code(&self, _address: Address) -> Result<Bytes, ProviderError> {
        Ok(Bytes::from_static(&[0x60, 0x80]))
    }

    async fn transaction_count(&self, _address: Address) -> Result<u64, ProviderError> {
        Ok(0)
    }

    async fn call(&self, _from: Option<Address>, _to: Address, data: Bytes) -> Result<CallOutcome, ProviderError> {
        let selector: [u8; 4] = data.get(..4).and_then(|s| s.try_into().ok()).unwrap_or_default();
        match selector {
            IEntryPointV06::getDepositInfoCall::SELECTOR => {
                Ok(CallOutcome::Success(DepositInfo::default().abi_encode().into()))
            }
            IEntryPointV06::simulateValidationCall::SELECTOR => {
                let result = ValidationResult {
                    returnInfo: ReturnInfo {
                        preOpGas: U256::from(80_000),
                        prefund: U256::ZERO,
                        sigFailed: false,
                        validAfter: Default::default(),
                        validUntil: Default::default(),
                        paymasterContext: Bytes::new(),
                    },
                    senderInfo: StakeInfo::default(),
                    factoryInfo: StakeInfo::default(),
                    paymasterInfo: StakeInfo::default(),
                };
                Ok(CallOutcome::Revert(SolError::abi_encode(&result).into()))
            }
            IEntryPointV06::handleOpsCall::SELECTOR => {
                *self.handle_ops_calls.lock() += 1;
                Ok(CallOutcome::Success(Bytes::new()))
            }
            _ => Ok(CallOutcome::Success(Bytes::new())),
        }
    }

    async fn estimate_gas(&self, _from: Address, _to: Address, _data: Bytes) -> Result<u64, ProviderError> {
        Ok(45_000)
    }

    async fn trace_call(&self, _to: Address, _data: Bytes) -> Result<Option<Erc7562Frame>, ProviderError> {
        Ok(None)
    }

    async fn find_user_operation(
        &self,
        _entry_point: Address,
        _hash: B256,
        _from_block: u64,
    ) -> Result<Option<UserOperationLookup>, ProviderError> {
        Ok(None)
    }
}

/// Relay that accepts every bundle
#[derive(Debug, Default)]
struct Relay {
    bundles: Mutex<Vec<Vec<UserOperation>>>,
}

#[async_trait]
impl SubmissionGateway for Relay {
    fn signer(&self) -> Address {
        Address::repeat_byte(0x5e)
    }

    fn beneficiary(&self) -> Address {
        Address::repeat_byte(0xbe)
    }

    async fn verify_chain(&self) -> Result<(), GatewayError> {
        Ok(())
    }

    async fn submit(&self, _entry_point: Address, batch: &[UserOperation]) -> Result<B256, GatewayError> {
        self.bundles.lock().push(batch.to_vec());
        Ok(B256::repeat_byte(0xab))
    }
}

fn user_op(sender: u8, nonce: u64) -> UserOperation {
    UserOperation {
        sender: Address::repeat_byte(sender),
        nonce: U256::from(nonce),
        call_gas_limit: U256::from(50_000),
        verification_gas_limit: U256::from(100_000),
        pre_verification_gas: U256::from(60_000),
        max_fee_per_gas: U256::from(100),
        max_priority_fee_per_gas: U256::from(10),
        signature: Bytes::from(vec![0x11; 65]),
        ..Default::default()
    }
}

struct Bundler {
    store: Arc<OperationStore>,
    tracker: Arc<ReputationTracker>,
    service: Arc<BundlerService>,
    client: BundlerClient,
    node: Arc<Node>,
    relay: Arc<Relay>,
}

fn start(db: Arc<Database>) -> Bundler {
    let store = Arc::new(OperationStore::open(Arc::clone(&db), StoreConfig::new(CHAIN_ID)).unwrap());
    let tracker = Arc::new(ReputationTracker::open(db, ReputationConfig::default()).unwrap());
    let node = Arc::new(Node::default());
    let chain = Arc::clone(&node) as SharedChainClient;
    let relay = Arc::new(Relay::default());

    let validation = ValidationPipelineBuilder::new(Arc::clone(&store), Arc::clone(&tracker), Arc::clone(&chain))
        .with_config(ValidationConfig::default().with_entry_points(vec![ENTRY_POINT]))
        .build();
    let pipeline = BundlePipelineBuilder::new(
        Arc::clone(&store),
        Arc::clone(&tracker),
        Arc::clone(&chain),
        Arc::clone(&relay) as Arc<dyn SubmissionGateway>,
    )
    .build();
    let service = Arc::new(BundlerService::new(pipeline, &[ENTRY_POINT], BundlerConfig::default()));
    let client = BundlerClient::new(
        Arc::new(validation),
        Arc::clone(&store),
        Arc::clone(&tracker),
        chain,
        ClientConfig::new(CHAIN_ID, vec![ENTRY_POINT]),
    )
    .with_bundler(Arc::clone(&service));

    Bundler { store, tracker, service, client, node, relay }
}

#[tokio::test]
async fn submitted_ops_are_bundled() {
    let dir = tempfile::tempdir().unwrap();
    let bundler = start(Arc::new(Database::open(dir.path()).unwrap()));

    let first = bundler.client.send_user_operation(user_op(1, 0), ENTRY_POINT).await.unwrap();
    let second = bundler.client.send_user_operation(user_op(1, 1), ENTRY_POINT).await.unwrap();
    let other = bundler.client.send_user_operation(user_op(2, 0), ENTRY_POINT).await.unwrap();
    assert_eq!(bundler.store.len(&ENTRY_POINT), 3);

    let pending = bundler.client.get_user_operation_by_hash(first).await.unwrap().unwrap();
    assert_eq!(pending.entry_point, ENTRY_POINT);
    assert_eq!(pending.block_number, None);

    let report = bundler.service.send_bundle_now(ENTRY_POINT).await.unwrap();

    assert_eq!(report.transaction_hash, Some(B256::repeat_byte(0xab)));
    assert_eq!(report.included.len(), 3);
    for hash in [first, second, other] {
        assert!(report.included.contains(&hash));
    }
    assert!(bundler.store.is_empty(&ENTRY_POINT));
    assert_eq!(*bundler.node.handle_ops_calls.lock(), 1);

    let bundles = bundler.relay.bundles.lock().clone();
    assert_eq!(bundles.len(), 1);
    let nonces: Vec<_> =
        bundles[0].iter().filter(|op| op.sender == Address::repeat_byte(1)).map(|op| op.nonce).collect();
    assert_eq!(nonces, vec![U256::from(0), U256::from(1)]);

    let sender = bundler.tracker.record(&Address::repeat_byte(1));
    assert_eq!(sender.ops_seen, 2);
    assert_eq!(sender.ops_included, 2);
    assert_eq!(bundler.tracker.status(&Address::repeat_byte(1), false), ReputationStatus::Ok);

    let empty = bundler.service.send_bundle_now(ENTRY_POINT).await.unwrap();
    assert_eq!(empty.transaction_hash, None);
    assert_eq!(bundler.relay.bundles.lock().len(), 1);
}

#[tokio::test]
async fn state_survives_restart() {
    let dir = tempfile::tempdir().unwrap();
    let (hash, op) = {
        let bundler = start(Arc::new(Database::open(dir.path()).unwrap()));
        let op = user_op(3, 0);
        let hash = bundler.client.send_user_operation(op.clone(), ENTRY_POINT).await.unwrap();
        (hash, op)
    };

    let bundler = start(Arc::new(Database::open(dir.path()).unwrap()));

    let entry = bundler.store.get(&hash).unwrap();
    assert_eq!(entry.user_op, op);
    assert_eq!(bundler.store.find(ENTRY_POINT, op.sender, op.nonce), Some(hash));
    assert_eq!(bundler.tracker.record(&op.sender).ops_seen, 1);

    let duplicate = bundler.client.send_user_operation(op, ENTRY_POINT).await;
    assert!(matches!(duplicate, Err(ClientError::Rejected(_))));

    let report = bundler.service.send_bundle_now(ENTRY_POINT).await.unwrap();
    assert_eq!(report.included, vec![hash]);
}
