//! Gas and fee math.
//!
//! Everything here is a pure function of the operation and the chain's
//! current base fee, so the validation and bundling paths always agree.

use alloy_primitives::{Bytes, U256};
use alloy_sol_types::SolValue;

use crate::types::{UserOperation, UserOperationV06};

/// Minimum `callGasLimit`: the cost of a non-zero value CALL.
pub const MIN_CALL_GAS_LIMIT: u64 = 9_100;

/// Fixed and calldata-proportional overhead of including one op in a bundle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Overhead {
    /// Intrinsic cost of the bundle transaction.
    pub fixed: u64,
    /// Entry point bookkeeping per op.
    pub per_user_op: u64,
    /// Cost per 32-byte word of the packed op.
    pub per_user_op_word: u64,
    /// Calldata cost of a zero byte.
    pub zero_byte: u64,
    /// Calldata cost of a non-zero byte.
    pub non_zero_byte: u64,
    /// Expected bundle size the fixed cost is amortized over.
    pub bundle_size: u64,
    /// Length of the dummy signature used before the op is signed.
    pub sig_size: usize,
    /// Placeholder `preVerificationGas` so its own bytes are charged.
    pub dummy_pre_verification_gas: u64,
}

impl Default for Overhead {
    fn default() -> Self {
        Self {
            fixed: 21_000,
            per_user_op: 18_300,
            per_user_op_word: 4,
            zero_byte: 4,
            non_zero_byte: 16,
            bundle_size: 1,
            sig_size: 65,
            dummy_pre_verification_gas: 100_000,
        }
    }
}

impl Overhead {
    /// Calldata cost of a byte sequence.
    pub fn calldata_cost(&self, data: &[u8]) -> U256 {
        let cost = data.iter().fold(0u64, |acc, byte| {
            acc + if *byte == 0 { self.zero_byte } else { self.non_zero_byte }
        });
        U256::from(cost)
    }

    /// Minimum `preVerificationGas` for an operation.
    ///
    /// The signature and `preVerificationGas` are replaced by placeholders
    /// first, so the result does not change once the op is signed.
    pub fn calc_pre_verification_gas(&self, op: &UserOperation) -> U256 {
        let mut sanitized = UserOperationV06::from(op.clone());
        sanitized.signature = Bytes::from(vec![1u8; self.sig_size]);
        sanitized.preVerificationGas = U256::from(self.dummy_pre_verification_gas);

        let packed = sanitized.abi_encode_params();
        let words = packed.len().div_ceil(32) as u64;

        self.calldata_cost(&packed)
            + U256::from(self.fixed / self.bundle_size.max(1))
            + U256::from(self.per_user_op)
            + U256::from(self.per_user_op_word * words)
    }
}

/// `min(maxFeePerGas, baseFee + maxPriorityFeePerGas)`.
pub fn effective_gas_price(op: &UserOperation, base_fee: U256) -> U256 {
    op.max_fee_per_gas.min(base_fee.saturating_add(op.max_priority_fee_per_gas))
}

/// `min(maxPriorityFeePerGas, maxFeePerGas - baseFee)`, floored at zero.
pub fn effective_priority_fee(op: &UserOperation, base_fee: U256) -> U256 {
    op.max_priority_fee_per_gas.min(op.max_fee_per_gas.saturating_sub(base_fee))
}

/// Lowest acceptable replacement fee for `current` given a bump percentage.
///
/// The result is strictly greater than `current`, so a zero fee still needs
/// a bump.
pub fn required_replacement_fee(current: U256, bump_percent: u64) -> U256 {
    let bumped =
        current.saturating_add(current.saturating_mul(U256::from(bump_percent)) / U256::from(100));
    if bumped > current { bumped } else { current.saturating_add(U256::from(1)) }
}
