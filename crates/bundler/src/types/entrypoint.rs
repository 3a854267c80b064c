//! EntryPoint v0.6 ABI bindings.
//!
//! Only the surface the bundler talks to is declared here: batch execution
//! (`handleOps`), validation simulation, deposits, and the revert payloads
//! returned by `simulateValidation`.

use alloy_primitives::{Address, Bytes, U256, address};
use alloy_sol_types::{Revert, SolError, sol};

/// Canonical EntryPoint v0.6 deployment.
pub const ENTRYPOINT_V06_ADDRESS: Address = address!("0x5FF137D4b0FDCD49DcA30c7CF57E578a026d2789");

sol! {
    /// Packed form of a user operation used as the inner hash preimage.
    #[allow(missing_docs)]
    #[derive(Debug, Default, PartialEq, Eq)]
    struct UserOperationPackedForHash {
        address sender;
        uint256 nonce;
        bytes32 hashInitCode;
        bytes32 hashCallData;
        uint256 callGasLimit;
        uint256 verificationGasLimit;
        uint256 preVerificationGas;
        uint256 maxFeePerGas;
        uint256 maxPriorityFeePerGas;
        bytes32 hashPaymasterAndData;
    }

    /// Outer hash preimage binding the op to an entry point and chain.
    #[allow(missing_docs)]
    #[derive(Debug, Default, PartialEq, Eq)]
    struct UserOperationHashEncoded {
        bytes32 encodedHash;
        address entryPoint;
        uint256 chainId;
    }

    /// ABI shape of a v0.6 user operation.
    #[allow(missing_docs)]
    #[derive(Debug, Default, PartialEq, Eq)]
    struct UserOperationV06 {
        address sender;
        uint256 nonce;
        bytes initCode;
        bytes callData;
        uint256 callGasLimit;
        uint256 verificationGasLimit;
        uint256 preVerificationGas;
        uint256 maxFeePerGas;
        uint256 maxPriorityFeePerGas;
        bytes paymasterAndData;
        bytes signature;
    }

    #[allow(missing_docs)]
    #[derive(Debug, Default)]
    struct ReturnInfo {
        uint256 preOpGas;
        uint256 prefund;
        bool sigFailed;
        uint48 validAfter;
        uint48 validUntil;
        bytes paymasterContext;
    }

    #[allow(missing_docs)]
    #[derive(Debug, Default)]
    struct StakeInfo {
        uint256 stake;
        uint256 unstakeDelaySec;
    }

    #[allow(missing_docs)]
    #[derive(Debug, Default)]
    struct AggregatorStakeInfo {
        address aggregator;
        StakeInfo stakeInfo;
    }

    #[allow(missing_docs)]
    #[derive(Debug, Default)]
    struct DepositInfo {
        uint112 deposit;
        bool staked;
        uint112 stake;
        uint32 unstakeDelaySec;
        uint48 withdrawTime;
    }

    #[allow(missing_docs)]
    #[derive(Debug)]
    error ValidationResult(
        ReturnInfo returnInfo,
        StakeInfo senderInfo,
        StakeInfo factoryInfo,
        StakeInfo paymasterInfo
    );

    #[allow(missing_docs)]
    #[derive(Debug)]
    error ValidationResultWithAggregation(
        ReturnInfo returnInfo,
        StakeInfo senderInfo,
        StakeInfo factoryInfo,
        StakeInfo paymasterInfo,
        AggregatorStakeInfo aggregatorInfo
    );

    #[allow(missing_docs)]
    #[derive(Debug)]
    error FailedOp(uint256 opIndex, string reason);

    #[allow(missing_docs)]
    #[derive(Debug)]
    event UserOperationEvent(
        bytes32 indexed userOpHash,
        address indexed sender,
        address indexed paymaster,
        uint256 nonce,
        bool success,
        uint256 actualGasCost,
        uint256 actualGasUsed
    );

    #[allow(missing_docs)]
    interface IEntryPointV06 {
        function handleOps(UserOperationV06[] calldata ops, address payable beneficiary) external;
        function simulateValidation(UserOperationV06 calldata userOp) external;
        function balanceOf(address account) external view returns (uint256);
        function getDepositInfo(address account) external view returns (DepositInfo memory info);
    }
}

/// Decoded outcome of a `simulateValidation` revert.
#[derive(Debug)]
pub enum SimulationRevert {
    /// Validation passed.
    Validation(ValidationResult),
    /// Validation passed but the op relies on a signature aggregator.
    Aggregated(ValidationResultWithAggregation),
    /// The entry point rejected the op.
    Failed(FailedOp),
    /// Plain `Error(string)` revert.
    Reason(String),
    /// Anything else.
    Unknown(Bytes),
}

impl SimulationRevert {
    /// Decodes revert data returned by the entry point.
    pub fn decode(data: &Bytes) -> Self {
        if let Ok(result) = ValidationResult::abi_decode(data) {
            return Self::Validation(result);
        }
        if let Ok(result) = ValidationResultWithAggregation::abi_decode(data) {
            return Self::Aggregated(result);
        }
        if let Ok(failed) = FailedOp::abi_decode(data) {
            return Self::Failed(failed);
        }
        if let Ok(revert) = Revert::abi_decode(data) {
            return Self::Reason(revert.reason);
        }
        Self::Unknown(data.clone())
    }
}

/// Stake and deposit of an entity as reported by the entry point.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EntityStake {
    /// Gas deposit.
    pub deposit: U256,
    /// Locked stake.
    pub stake: U256,
    /// Unstake delay in seconds.
    pub unstake_delay_sec: u64,
}

impl From<DepositInfo> for EntityStake {
    fn from(info: DepositInfo) -> Self {
        Self {
            deposit: U256::from(info.deposit),
            stake: U256::from(info.stake),
            unstake_delay_sec: u64::from(info.unstakeDelaySec),
        }
    }
}
