//! Shared fixtures for unit tests.

use std::collections::{HashMap, HashSet};

use alloy_primitives::{Address, B256, Bytes, U256};
use alloy_rpc_types_trace::geth::erc7562::Erc7562Frame;
use alloy_sol_types::{SolCall, SolError, SolValue};
use async_trait::async_trait;
use parking_lot::Mutex;

use crate::gateway::{GatewayError, SubmissionGateway};
use crate::provider::{CallOutcome, ChainClient, ProviderError, UserOperationLookup};
use crate::types::{
    DepositInfo, FailedOp, IEntryPointV06, ReturnInfo, StakeInfo, UserOperation, ValidationResult,
};

pub fn test_address(n: u8) -> Address {
    Address::new([n; 20])
}

/// A deployed-sender UserOp with gas limits that pass the static checks
pub fn test_user_op(sender: u8, nonce: u64, max_fee: u64, max_priority_fee: u64) -> UserOperation {
    UserOperation {
        sender: test_address(sender),
        nonce: U256::from(nonce),
        call_gas_limit: U256::from(50_000),
        verification_gas_limit: U256::from(100_000),
        pre_verification_gas: U256::from(60_000),
        max_fee_per_gas: U256::from(max_fee),
        max_priority_fee_per_gas: U256::from(max_priority_fee),
        signature: Bytes::from(vec![0x11; 65]),
        ..Default::default()
    }
}

#[derive(Debug)]
struct MockState {
    chain_id: u64,
    block_number: u64,
    base_fee: U256,
    priority_fee: U256,
    unavailable: bool,
    code: HashMap<Address, Bytes>,
    deposit_info: HashMap<Address, Vec<u8>>,
    balances: HashMap<Address, U256>,
    validation_failures: HashMap<Address, String>,
    bundle_failures: HashSet<Address>,
    sig_failed: HashSet<Address>,
    valid_until: HashMap<Address, u64>,
    trace: Option<Erc7562Frame>,
    lookups: HashMap<B256, UserOperationLookup>,
    handle_ops_calls: usize,
}

/// Scripted node answering the entry point calls the bundler makes
#[derive(Debug)]
pub struct MockChainClient {
    state: Mutex<MockState>,
}

impl Default for MockChainClient {
    fn default() -> Self {
        Self::new()
    }
}

impl MockChainClient {
    /// preOpGas reported by `simulateValidation`
    pub const PRE_OP_GAS: u64 = 80_000;

    /// Gas reported by `eth_estimateGas`
    pub const ESTIMATED_GAS: u64 = 45_000;

    pub fn new() -> Self {
        Self {
            state: Mutex::new(MockState {
                chain_id: 1337,
                block_number: 100,
                base_fee: U256::from(1),
                priority_fee: U256::ZERO,
                unavailable: false,
                code: HashMap::new(),
                deposit_info: HashMap::new(),
                balances: HashMap::new(),
                validation_failures: HashMap::new(),
                bundle_failures: HashSet::new(),
                sig_failed: HashSet::new(),
                valid_until: HashMap::new(),
                trace: None,
                lookups: HashMap::new(),
                handle_ops_calls: 0,
            }),
        }
    }

    pub fn set_chain_id(&self, chain_id: u64) {
        self.state.lock().chain_id = chain_id;
    }

    pub fn set_base_fee(&self, base_fee: U256) {
        self.state.lock().base_fee = base_fee;
    }

    pub fn set_priority_fee(&self, fee: U256) {
        self.state.lock().priority_fee = fee;
    }

    /// Makes every request fail as a transport error
    pub fn set_unavailable(&self, unavailable: bool) {
        self.state.lock().unavailable = unavailable;
    }

    pub fn set_code(&self, address: Address, code: Bytes) {
        self.state.lock().code.insert(address, code);
    }

    /// Gives `address` some code
    pub fn deploy(&self, address: Address) {
        self.set_code(address, Bytes::from_static(&[0x60, 0x80, 0x60, 0x40]));
    }

    /// Sets the ABI-encoded `getDepositInfo` return for `account`
    pub fn set_deposit_info(&self, account: Address, encoded: Vec<u8>) {
        self.state.lock().deposit_info.insert(account, encoded);
    }

    pub fn set_balance(&self, account: Address, balance: U256) {
        self.state.lock().balances.insert(account, balance);
    }

    /// `simulateValidation` for `sender` reverts with `FailedOp`
    pub fn fail_validation(&self, sender: Address, reason: &str) {
        self.state.lock().validation_failures.insert(sender, reason.to_string());
    }

    /// `handleOps` reverts with `FailedOp` pointing at `sender`'s op
    pub fn fail_in_bundle(&self, sender: Address) {
        self.state.lock().bundle_failures.insert(sender);
    }

    pub fn set_sig_failed(&self, sender: Address) {
        self.state.lock().sig_failed.insert(sender);
    }

    pub fn set_valid_until(&self, sender: Address, valid_until: u64) {
        self.state.lock().valid_until.insert(sender, valid_until);
    }

    pub fn set_trace(&self, trace: Erc7562Frame) {
        self.state.lock().trace = Some(trace);
    }

    pub fn add_lookup(&self, hash: B256, lookup: UserOperationLookup) {
        self.state.lock().lookups.insert(hash, lookup);
    }

    /// Number of `handleOps` calls seen
    pub fn handle_ops_calls(&self) -> usize {
        self.state.lock().handle_ops_calls
    }

    fn check_available(&self) -> Result<(), ProviderError> {
        if self.state.lock().unavailable {
            return Err(ProviderError::Rpc("connection refused".into()));
        }
        Ok(())
    }

    fn dispatch(&self, data: &[u8]) -> Result<CallOutcome, ProviderError> {
        let selector: [u8; 4] = data.get(..4).and_then(|s| s.try_into().ok()).unwrap_or_default();
        let mut state = self.state.lock();

        match selector {
            IEntryPointV06::getDepositInfoCall::SELECTOR => {
                let call = IEntryPointV06::getDepositInfoCall::abi_decode(data)
                    .map_err(|e| ProviderError::Decode(e.to_string()))?;
                let encoded = state
                    .deposit_info
                    .get(&call.account)
                    .cloned()
                    .unwrap_or_else(|| DepositInfo::default().abi_encode());
                Ok(CallOutcome::Success(encoded.into()))
            }
            IEntryPointV06::balanceOfCall::SELECTOR => {
                let call = IEntryPointV06::balanceOfCall::abi_decode(data)
                    .map_err(|e| ProviderError::Decode(e.to_string()))?;
                let balance = state.balances.get(&call.account).copied().unwrap_or_default();
                Ok(CallOutcome::Success(balance.abi_encode().into()))
            }
            IEntryPointV06::simulateValidationCall::SELECTOR => {
                let call = IEntryPointV06::simulateValidationCall::abi_decode(data)
                    .map_err(|e| ProviderError::Decode(e.to_string()))?;
                let sender = call.userOp.sender;

                if let Some(reason) = state.validation_failures.get(&sender) {
                    let failed = FailedOp { opIndex: U256::ZERO, reason: reason.clone() };
                    return Ok(CallOutcome::Revert(SolError::abi_encode(&failed).into()));
                }

                let valid_until = state.valid_until.get(&sender).copied().unwrap_or_default();
                let result = ValidationResult {
                    returnInfo: ReturnInfo {
                        preOpGas: U256::from(Self::PRE_OP_GAS),
                        prefund: U256::ZERO,
                        sigFailed: state.sig_failed.contains(&sender),
                        validAfter: Default::default(),
                        validUntil: valid_until.try_into().unwrap(),
                        paymasterContext: Bytes::new(),
                    },
                    senderInfo: StakeInfo::default(),
                    factoryInfo: StakeInfo::default(),
                    paymasterInfo: StakeInfo::default(),
                };
                Ok(CallOutcome::Revert(SolError::abi_encode(&result).into()))
            }
            IEntryPointV06::handleOpsCall::SELECTOR => {
                let call = IEntryPointV06::handleOpsCall::abi_decode(data)
                    .map_err(|e| ProviderError::Decode(e.to_string()))?;
                state.handle_ops_calls += 1;

                let failing = call.ops.iter().position(|op| state.bundle_failures.contains(&op.sender));
                match failing {
                    Some(index) => {
                        let failed = FailedOp {
                            opIndex: U256::from(index),
                            reason: "AA33 reverted".to_string(),
                        };
                        Ok(CallOutcome::Revert(SolError::abi_encode(&failed).into()))
                    }
                    None => Ok(CallOutcome::Success(Bytes::new())),
                }
            }
            _ => Ok(CallOutcome::Success(Bytes::new())),
        }
    }
}

#[async_trait]
impl ChainClient for MockChainClient {
    async fn chain_id(&self) -> Result<u64, ProviderError> {
        self.check_available()?;
        Ok(self.state.lock().chain_id)
    }

    async fn block_number(&self) -> Result<u64, ProviderError> {
        self.check_available()?;
        Ok(self.state.lock().block_number)
    }

    async fn base_fee(&self) -> Result<U256, ProviderError> {
        self.check_available()?;
        Ok(self.state.lock().base_fee)
    }

    async fn max_priority_fee(&self) -> Result<U256, ProviderError> {
        self.check_available()?;
        Ok(self.state.lock().priority_fee)
    }

    async fn code(&self, address: Address) -> Result<Bytes, ProviderError> {
        self.check_available()?;
        Ok(self.state.lock().code.get(&address).cloned().unwrap_or_default())
    }

    async fn transaction_count(&self, _address: Address) -> Result<u64, ProviderError> {
        self.check_available()?;
        Ok(0)
    }

    async fn call(
        &self,
        _from: Option<Address>,
        _to: Address,
        data: Bytes,
    ) -> Result<CallOutcome, ProviderError> {
        self.check_available()?;
        self.dispatch(&data)
    }

    async fn estimate_gas(
        &self,
        _from: Address,
        _to: Address,
        _data: Bytes,
    ) -> Result<u64, ProviderError> {
        self.check_available()?;
        Ok(Self::ESTIMATED_GAS)
    }

    async fn trace_call(
        &self,
        _to: Address,
        _data: Bytes,
    ) -> Result<Option<Erc7562Frame>, ProviderError> {
        self.check_available()?;
        Ok(self.state.lock().trace.clone())
    }

    async fn find_user_operation(
        &self,
        _entry_point: Address,
        hash: B256,
        _from_block: u64,
    ) -> Result<Option<UserOperationLookup>, ProviderError> {
        self.check_available()?;
        Ok(self.state.lock().lookups.get(&hash).cloned())
    }
}

/// What the mock gateway answers to submissions
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MockGatewayMode {
    Accept,
    Unreachable,
    Rejected,
}

/// Gateway recording submitted batches
#[derive(Debug)]
pub struct MockGateway {
    mode: Mutex<MockGatewayMode>,
    submitted: Mutex<Vec<(Address, Vec<UserOperation>)>>,
}

impl Default for MockGateway {
    fn default() -> Self {
        Self::new()
    }
}

impl MockGateway {
    pub const SIGNER: Address = Address::new([0x5e; 20]);
    pub const BENEFICIARY: Address = Address::new([0xbe; 20]);

    pub fn new() -> Self {
        Self { mode: Mutex::new(MockGatewayMode::Accept), submitted: Mutex::new(Vec::new()) }
    }

    pub fn set_mode(&self, mode: MockGatewayMode) {
        *self.mode.lock() = mode;
    }

    /// Batches submitted so far
    pub fn submitted(&self) -> Vec<(Address, Vec<UserOperation>)> {
        self.submitted.lock().clone()
    }
}

#[async_trait]
impl SubmissionGateway for MockGateway {
    fn signer(&self) -> Address {
        Self::SIGNER
    }

    fn beneficiary(&self) -> Address {
        Self::BENEFICIARY
    }

    async fn verify_chain(&self) -> Result<(), GatewayError> {
        Ok(())
    }

    async fn submit(&self, entry_point: Address, batch: &[UserOperation]) -> Result<B256, GatewayError> {
        match *self.mode.lock() {
            MockGatewayMode::Accept => {
                self.submitted.lock().push((entry_point, batch.to_vec()));
                Ok(B256::repeat_byte(0xab))
            }
            MockGatewayMode::Unreachable => Err(GatewayError::Unreachable("no relay answered".into())),
            MockGatewayMode::Rejected => Err(GatewayError::Rejected("bundle refused".into())),
        }
    }
}
