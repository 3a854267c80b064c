//! Admission steps, in the order the pipeline runs them.

use std::sync::Arc;

use alloy_primitives::{Address, Bytes, U256};
use alloy_sol_types::SolCall;
use async_trait::async_trait;
use tracing::{debug, warn};

use crate::gas::MIN_CALL_GAS_LIMIT;
use crate::mempool::{AdmissionLimits, OperationStore, now_millis};
use crate::provider::{
    CallOutcome, ChainClient, SharedChainClient, get_code_hash_digest, get_deposit_info,
};
use crate::reputation::{ReputationError, ReputationStatus, ReputationTracker};
use crate::types::{
    EntityStake, IEntryPointV06, SimulationRevert, StakeInfo, UserOperation, ValidationResult,
};

use super::config::ValidationConfig;
use super::error::Rejection;
use super::pipeline::{ValidationContext, ValidationStep};
use super::rules::{TraceEntities, check_trace, touched_contracts};

/// Rejects banned senders and records the sender's stake.
#[derive(Debug)]
pub struct ReputationGate {
    pub client: SharedChainClient,
    pub tracker: Arc<ReputationTracker>,
}

#[async_trait]
impl ValidationStep for ReputationGate {
    fn name(&self) -> &'static str {
        "reputation_gate"
    }

    async fn check(&self, ctx: &mut ValidationContext) -> Result<(), Rejection> {
        let sender = ctx.user_op.sender;
        ctx.sender_stake = get_deposit_info(self.client.as_ref(), ctx.entry_point, sender).await?;

        let staked = self.tracker.is_staked(&ctx.sender_stake);
        if self.tracker.status(&sender, staked) == ReputationStatus::Banned {
            return Err(Rejection::SenderBanned(sender));
        }
        Ok(())
    }
}

/// Enforces the pool size and the sender's pending limit.
///
/// Fails fast before simulation and records the limits in the context so the
/// store enforces them again atomically with the insert.
#[derive(Debug)]
pub struct PendingCountGate {
    pub store: Arc<OperationStore>,
    pub tracker: Arc<ReputationTracker>,
    pub max_pool_size: usize,
}

#[async_trait]
impl ValidationStep for PendingCountGate {
    fn name(&self) -> &'static str {
        "pending_count_gate"
    }

    async fn check(&self, ctx: &mut ValidationContext) -> Result<(), Rejection> {
        let op = &ctx.user_op;
        ctx.is_replacement = self.store.find(ctx.entry_point, op.sender, op.nonce).is_some();

        let status = self.tracker.status(&op.sender, self.tracker.is_staked(&ctx.sender_stake));
        ctx.limits = AdmissionLimits {
            max_pool_size: self.max_pool_size,
            sender_limit: self.tracker.op_limit(status, &ctx.sender_stake),
        };

        if !ctx.is_replacement && self.store.len(&ctx.entry_point) >= self.max_pool_size {
            return Err(Rejection::PoolFull { entry_point: ctx.entry_point, max: self.max_pool_size });
        }

        // A replacement takes the slot of the UserOp it replaces
        let pending = self.store.count_pending(&op.sender).saturating_sub(ctx.is_replacement as usize);
        match self.tracker.check_op_limit(op.sender, &ctx.sender_stake, pending) {
            Ok(()) => Ok(()),
            Err(ReputationError::OpLimitReached { sender, pending, limit }) => {
                Err(Rejection::PendingLimit { sender, pending, limit })
            }
            Err(ReputationError::Storage(e)) => Err(e.into()),
        }
    }
}

/// Field, code and fee checks that need no simulation.
#[derive(Debug)]
pub struct StaticChecks {
    pub client: SharedChainClient,
    pub config: ValidationConfig,
}

#[async_trait]
impl ValidationStep for StaticChecks {
    fn name(&self) -> &'static str {
        "static_checks"
    }

    async fn check(&self, ctx: &mut ValidationContext) -> Result<(), Rejection> {
        let op = &ctx.user_op;

        if !self.config.supports(&ctx.entry_point) {
            return Err(Rejection::UnsupportedEntryPoint(ctx.entry_point));
        }

        let sender_deployed = !self.client.code(op.sender).await?.is_empty();
        match (sender_deployed, op.is_deployment()) {
            (true, true) => {
                return Err(Rejection::InvalidSender {
                    sender: op.sender,
                    reason: "already deployed but initCode is set",
                });
            }
            (false, false) => {
                return Err(Rejection::InvalidSender {
                    sender: op.sender,
                    reason: "has no code and no initCode",
                });
            }
            _ => {}
        }

        if let Some(factory) = op.factory()
            && self.client.code(factory).await?.is_empty()
        {
            return Err(Rejection::InvalidFactory(factory));
        }

        if op.verification_gas_limit > self.config.max_verification_gas {
            return Err(Rejection::GasLimitTooHigh {
                field: "verificationGasLimit",
                provided: op.verification_gas_limit,
                max: self.config.max_verification_gas,
            });
        }

        let required_pvg = self.config.overhead.calc_pre_verification_gas(op);
        if op.pre_verification_gas < required_pvg {
            return Err(Rejection::PreVerificationGasTooLow {
                provided: op.pre_verification_gas,
                required: required_pvg,
            });
        }

        if op.call_gas_limit < U256::from(MIN_CALL_GAS_LIMIT) {
            return Err(Rejection::CallGasLimitTooLow {
                provided: op.call_gas_limit,
                required: U256::from(MIN_CALL_GAS_LIMIT),
            });
        }

        check_fees(op)?;
        let base_fee = self.client.base_fee().await?;
        if op.max_fee_per_gas < base_fee {
            return Err(Rejection::FeeTooLow { max_fee: op.max_fee_per_gas, base_fee });
        }

        let max_gas = op.max_gas_available();
        if max_gas > self.config.max_batch_gas_limit {
            return Err(Rejection::GasLimitTooHigh {
                field: "maxGasAvailable",
                provided: max_gas,
                max: self.config.max_batch_gas_limit,
            });
        }

        if let Some(paymaster) = op.paymaster()
            && self.client.code(paymaster).await?.is_empty()
        {
            return Err(Rejection::InvalidPaymaster(paymaster));
        }

        Ok(())
    }
}

fn check_fees(op: &UserOperation) -> Result<(), Rejection> {
    if op.max_fee_per_gas.is_zero() {
        return Err(Rejection::InvalidFees("maxFeePerGas is zero"));
    }
    if op.max_priority_fee_per_gas > op.max_fee_per_gas {
        return Err(Rejection::InvalidFees("maxPriorityFeePerGas exceeds maxFeePerGas"));
    }
    Ok(())
}

/// `simulateValidation` plus the ERC-7562 trace rules.
#[derive(Debug)]
pub struct Simulation {
    pub client: SharedChainClient,
    pub tracker: Arc<ReputationTracker>,
    pub expiry_margin_secs: u64,
}

#[async_trait]
impl ValidationStep for Simulation {
    fn name(&self) -> &'static str {
        "simulation"
    }

    async fn check(&self, ctx: &mut ValidationContext) -> Result<(), Rejection> {
        let op = &ctx.user_op;
        let calldata = simulate_validation_calldata(op);
        let result = simulate_validation(self.client.as_ref(), ctx.entry_point, calldata.clone()).await?;

        if result.returnInfo.sigFailed {
            return Err(Rejection::InvalidSignature);
        }

        let valid_until = U256::from(result.returnInfo.validUntil).saturating_to::<u64>();
        let now_secs = now_millis() / 1000;
        if valid_until != 0 && valid_until < now_secs.saturating_add(self.expiry_margin_secs) {
            return Err(Rejection::Expired { valid_until });
        }

        let mut staked = Vec::new();
        for (entity, info) in [
            (Some(op.sender), &result.senderInfo),
            (op.factory(), &result.factoryInfo),
            (op.paymaster(), &result.paymasterInfo),
        ] {
            if let Some(entity) = entity
                && self.tracker.is_staked(&stake_of(info))
            {
                staked.push(entity);
            }
        }

        let entities = TraceEntities {
            entry_point: ctx.entry_point,
            sender: op.sender,
            factory: op.factory(),
            paymaster: op.paymaster(),
            staked,
        };

        let code_addresses = match self.client.trace_call(ctx.entry_point, calldata).await? {
            Some(frame) => {
                check_trace(&frame, &entities)?;
                touched_contracts(&frame, ctx.entry_point)
            }
            None => {
                warn!(
                    target: "bundler::validation",
                    hash = %ctx.hash,
                    "Node does not support tracing, skipping trace rules"
                );
                let mut addresses: Vec<Address> =
                    [Some(op.sender), op.factory(), op.paymaster()].into_iter().flatten().collect();
                addresses.sort();
                addresses.dedup();
                addresses
            }
        };

        ctx.snapshot.pre_op_gas = result.returnInfo.preOpGas;
        ctx.snapshot.code_hash = Some(get_code_hash_digest(self.client.as_ref(), &code_addresses).await?);
        ctx.snapshot.code_addresses = code_addresses;

        debug!(
            target: "bundler::validation",
            hash = %ctx.hash,
            pre_op_gas = %ctx.snapshot.pre_op_gas,
            contracts = ctx.snapshot.code_addresses.len(),
            "Simulation passed"
        );
        Ok(())
    }
}

fn stake_of(info: &StakeInfo) -> EntityStake {
    EntityStake {
        deposit: U256::ZERO,
        stake: info.stake,
        unstake_delay_sec: info.unstakeDelaySec.saturating_to(),
    }
}

/// Calldata of `simulateValidation(op)`
pub fn simulate_validation_calldata(op: &UserOperation) -> Bytes {
    IEntryPointV06::simulateValidationCall { userOp: op.clone().into() }.abi_encode().into()
}

/// Runs `simulateValidation` and decodes its mandatory revert
pub async fn simulate_validation(
    client: &dyn ChainClient,
    entry_point: Address,
    calldata: Bytes,
) -> Result<ValidationResult, Rejection> {
    let data = match client.call(None, entry_point, calldata).await? {
        CallOutcome::Revert(data) => data,
        CallOutcome::Success(_) => {
            return Err(Rejection::SimulationFailed("simulateValidation did not revert".into()));
        }
    };

    match SimulationRevert::decode(&data) {
        SimulationRevert::Validation(result) => Ok(result),
        SimulationRevert::Aggregated(result) => {
            Err(Rejection::UnsupportedAggregator(result.aggregatorInfo.aggregator))
        }
        SimulationRevert::Failed(failed) => Err(Rejection::SimulationFailed(failed.reason)),
        SimulationRevert::Reason(reason) => Err(Rejection::SimulationFailed(reason)),
        SimulationRevert::Unknown(data) => {
            Err(Rejection::SimulationFailed(format!("unexpected revert data {data}")))
        }
    }
}
