//! ERC-4337 v0.6 user operation.

use alloy_primitives::{Address, B256, Bytes, U256, keccak256};
use alloy_sol_types::SolValue;
use serde::{Deserialize, Serialize};

use super::entrypoint::{UserOperationHashEncoded, UserOperationPackedForHash, UserOperationV06};

/// Verification gas multiplier applied when a paymaster is present, since
/// `validatePaymasterUserOp` and `postOp` both draw on the same limit.
const PAYMASTER_VERIFICATION_MULTIPLIER: u64 = 3;

/// A signed, off-chain user operation as submitted over `eth_sendUserOperation`.
///
/// Values are immutable once admitted: a replacement is always a new value.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserOperation {
    pub sender: Address,
    pub nonce: U256,
    #[serde(default)]
    pub init_code: Bytes,
    #[serde(default)]
    pub call_data: Bytes,
    #[serde(default)]
    pub call_gas_limit: U256,
    #[serde(default)]
    pub verification_gas_limit: U256,
    #[serde(default)]
    pub pre_verification_gas: U256,
    #[serde(default)]
    pub max_fee_per_gas: U256,
    #[serde(default)]
    pub max_priority_fee_per_gas: U256,
    #[serde(default)]
    pub paymaster_and_data: Bytes,
    #[serde(default)]
    pub signature: Bytes,
}

impl UserOperation {
    /// Computes the user operation hash as defined by ERC-4337.
    ///
    /// `keccak256(abi.encode(keccak256(abi.encode(packed)), entryPoint, chainId))`
    pub fn hash(&self, entry_point: Address, chain_id: u64) -> B256 {
        let packed = UserOperationPackedForHash {
            sender: self.sender,
            nonce: self.nonce,
            hashInitCode: keccak256(&self.init_code),
            hashCallData: keccak256(&self.call_data),
            callGasLimit: self.call_gas_limit,
            verificationGasLimit: self.verification_gas_limit,
            preVerificationGas: self.pre_verification_gas,
            maxFeePerGas: self.max_fee_per_gas,
            maxPriorityFeePerGas: self.max_priority_fee_per_gas,
            hashPaymasterAndData: keccak256(&self.paymaster_and_data),
        };
        let encoded = UserOperationHashEncoded {
            encodedHash: keccak256(packed.abi_encode()),
            entryPoint: entry_point,
            chainId: U256::from(chain_id),
        };
        keccak256(encoded.abi_encode())
    }

    /// Factory address taken from the first 20 bytes of `initCode`.
    pub fn factory(&self) -> Option<Address> {
        address_prefix(&self.init_code)
    }

    /// Paymaster address taken from the first 20 bytes of `paymasterAndData`.
    pub fn paymaster(&self) -> Option<Address> {
        address_prefix(&self.paymaster_and_data)
    }

    /// Whether the op deploys its sender.
    pub fn is_deployment(&self) -> bool {
        !self.init_code.is_empty()
    }

    /// Upper bound of gas the entry point may charge for this op.
    pub fn max_gas_available(&self) -> U256 {
        let multiplier = if self.paymaster().is_some() {
            U256::from(PAYMASTER_VERIFICATION_MULTIPLIER)
        } else {
            U256::from(1)
        };
        self.verification_gas_limit
            .saturating_mul(multiplier)
            .saturating_add(self.pre_verification_gas)
            .saturating_add(self.call_gas_limit)
    }

    /// Upper bound of the prefund: `max_gas_available * max_fee_per_gas`.
    pub fn max_gas_cost(&self) -> U256 {
        self.max_gas_available().saturating_mul(self.max_fee_per_gas)
    }

    /// ABI-encoded form as passed to the entry point.
    pub fn abi_encoded(&self) -> Vec<u8> {
        UserOperationV06::from(self.clone()).abi_encode()
    }
}

fn address_prefix(data: &Bytes) -> Option<Address> {
    (data.len() >= 20).then(|| Address::from_slice(&data[..20]))
}

impl From<UserOperation> for UserOperationV06 {
    fn from(op: UserOperation) -> Self {
        Self {
            sender: op.sender,
            nonce: op.nonce,
            initCode: op.init_code,
            callData: op.call_data,
            callGasLimit: op.call_gas_limit,
            verificationGasLimit: op.verification_gas_limit,
            preVerificationGas: op.pre_verification_gas,
            maxFeePerGas: op.max_fee_per_gas,
            maxPriorityFeePerGas: op.max_priority_fee_per_gas,
            paymasterAndData: op.paymaster_and_data,
            signature: op.signature,
        }
    }
}

impl From<UserOperationV06> for UserOperation {
    fn from(op: UserOperationV06) -> Self {
        Self {
            sender: op.sender,
            nonce: op.nonce,
            init_code: op.initCode,
            call_data: op.callData,
            call_gas_limit: op.callGasLimit,
            verification_gas_limit: op.verificationGasLimit,
            pre_verification_gas: op.preVerificationGas,
            max_fee_per_gas: op.maxFeePerGas,
            max_priority_fee_per_gas: op.maxPriorityFeePerGas,
            paymaster_and_data: op.paymasterAndData,
            signature: op.signature,
        }
    }
}

#[cfg(test)]
mod tests {
    use alloy_primitives::{address, b256, bytes};

    use super::*;

    const ENTRY_POINT: Address = address!("66a15edcc3b50a663e72f1457ffd49b9ae284ddc");

    #[test]
    fn test_hash_zeroed() {
        let op = UserOperation::default();
        assert_eq!(
            op.hash(ENTRY_POINT, 1337),
            b256!("dca97c3b49558ab360659f6ead939773be8bf26631e61bb17045bb70dc983b2d")
        );
    }

    #[test]
    fn test_hash_non_zeroed() {
        let op = UserOperation {
            sender: address!("0x1306b01bc3e4ad202612d3843387e94737673f53"),
            nonce: U256::from(8942),
            init_code: bytes!("6942069420694206942069420694206942069420"),
            call_data: bytes!("0000000000000000000000000000000000000000080085"),
            call_gas_limit: U256::from(10_000),
            verification_gas_limit: U256::from(100_000),
            pre_verification_gas: U256::from(100),
            max_fee_per_gas: U256::from(99_999),
            max_priority_fee_per_gas: U256::from(9_999_999),
            paymaster_and_data: bytes!(
                "0123456789abcdef0123456789abcdef0123456789abcdef0123456789abcdef0123456789abcdef"
            ),
            signature: bytes!("da0929f527cded8d0a1eaf2e8861d7f7e2d8160b7b13942f99dd367df4473a"),
        };
        assert_eq!(
            op.hash(ENTRY_POINT, 1337),
            b256!("484add9e4d8c3172d11b5feb6a3cc712280e176d278027cfa02ee396eb28afa1")
        );
    }

    #[test]
    fn test_entities() {
        let mut op = UserOperation::default();
        assert_eq!(op.factory(), None);
        assert_eq!(op.paymaster(), None);

        op.init_code = bytes!("69420694206942069420694206942069420694200102");
        op.paymaster_and_data = bytes!("0123456789abcdef0123456789abcdef01234567");
        assert_eq!(op.factory(), Some(address!("6942069420694206942069420694206942069420")));
        assert_eq!(op.paymaster(), Some(address!("0123456789abcdef0123456789abcdef01234567")));
        assert!(op.is_deployment());
    }

    #[test]
    fn test_max_gas_available() {
        let mut op = UserOperation {
            call_gas_limit: U256::from(10),
            verification_gas_limit: U256::from(100),
            pre_verification_gas: U256::from(1),
            max_fee_per_gas: U256::from(2),
            ..Default::default()
        };
        assert_eq!(op.max_gas_available(), U256::from(111));
        assert_eq!(op.max_gas_cost(), U256::from(222));

        op.paymaster_and_data = Bytes::from(vec![1u8; 20]);
        assert_eq!(op.max_gas_available(), U256::from(311));
    }

    #[test]
    fn test_serde_camel_case() {
        let json = r#"{
            "sender": "0x1306b01bc3e4ad202612d3843387e94737673f53",
            "nonce": "0x1",
            "initCode": "0x",
            "callData": "0x1234",
            "callGasLimit": "0x2710",
            "verificationGasLimit": "0x186a0",
            "preVerificationGas": "0xc350",
            "maxFeePerGas": "0x3b9aca00",
            "maxPriorityFeePerGas": "0x3b9aca00",
            "paymasterAndData": "0x",
            "signature": "0x"
        }"#;
        let op: UserOperation = serde_json::from_str(json).unwrap();
        assert_eq!(op.nonce, U256::from(1));
        assert_eq!(op.call_gas_limit, U256::from(10_000));
        assert_eq!(op.call_data, bytes!("1234"));

        let value = serde_json::to_value(&op).unwrap();
        assert!(value.get("maxPriorityFeePerGas").is_some());
    }
}
