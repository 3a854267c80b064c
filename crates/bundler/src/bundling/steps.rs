//! Bundle steps, in the order the pipeline runs them.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use alloy_primitives::{Address, B256, Bytes, U256};
use alloy_sol_types::SolCall;
use async_trait::async_trait;
use tracing::{debug, warn};

use crate::gas::{effective_gas_price, effective_priority_fee};
use crate::gateway::SubmissionGateway;
use crate::mempool::MempoolEntry;
use crate::provider::{CallOutcome, SharedChainClient, get_balance_of, get_code_hash_digest};
use crate::types::{IEntryPointV06, SimulationRevert};

use super::context::{BatchContext, CycleAbort, Outcome};
use super::pipeline::BundleStep;

/// Expires UserOps older than the time to live.
#[derive(Debug)]
pub struct Expire {
    pub max_op_ttl_millis: u64,
}

#[async_trait]
impl BundleStep for Expire {
    fn name(&self) -> &'static str {
        "expire"
    }

    async fn apply(&self, ctx: &mut BatchContext) -> Result<(), CycleAbort> {
        let now = ctx.now;
        let ttl = self.max_op_ttl_millis;
        ctx.resolve_where(|entry| {
            let expired = entry.age_millis(now) >= ttl;
            if expired {
                debug!(target: "bundler::bundling", hash = %entry.hash, age_ms = entry.age_millis(now), "UserOp expired");
            }
            expired.then_some(Outcome::Expired)
        });
        Ok(())
    }
}

/// Orders candidates by effective priority fee, highest first.
#[derive(Debug)]
pub struct SortByPrice;

#[async_trait]
impl BundleStep for SortByPrice {
    fn name(&self) -> &'static str {
        "sort_by_price"
    }

    async fn apply(&self, ctx: &mut BatchContext) -> Result<(), CycleAbort> {
        let base_fee = ctx.base_fee;
        ctx.candidates.sort_by(|a, b| {
            effective_priority_fee(&b.user_op, base_fee)
                .cmp(&effective_priority_fee(&a.user_op, base_fee))
                .then(a.seq.cmp(&b.seq))
        });
        Ok(())
    }
}

/// Holds back UserOps paying less than the current market.
#[derive(Debug)]
pub struct FilterUnderpriced {
    pub min_priority_fee: U256,
}

#[async_trait]
impl BundleStep for FilterUnderpriced {
    fn name(&self) -> &'static str {
        "filter_underpriced"
    }

    async fn apply(&self, ctx: &mut BatchContext) -> Result<(), CycleAbort> {
        let base_fee = ctx.base_fee;
        let floor = base_fee.saturating_add(ctx.network_tip.max(self.min_priority_fee));
        ctx.resolve_where(|entry| {
            (effective_gas_price(&entry.user_op, base_fee) < floor).then_some(Outcome::Requeued)
        });
        Ok(())
    }
}

/// Groups each sender's UserOps by ascending nonce at the slot of its best
/// priced UserOp.
#[derive(Debug)]
pub struct SortByNonce;

#[async_trait]
impl BundleStep for SortByNonce {
    fn name(&self) -> &'static str {
        "sort_by_nonce"
    }

    async fn apply(&self, ctx: &mut BatchContext) -> Result<(), CycleAbort> {
        let mut order = Vec::new();
        let mut by_sender: HashMap<Address, Vec<MempoolEntry>> = HashMap::new();
        for entry in std::mem::take(&mut ctx.candidates) {
            let sender = entry.sender();
            if !by_sender.contains_key(&sender) {
                order.push(sender);
            }
            by_sender.entry(sender).or_default().push(entry);
        }

        for sender in order {
            if let Some(mut entries) = by_sender.remove(&sender) {
                entries.sort_by_key(|e| e.user_op.nonce);
                ctx.candidates.extend(entries);
            }
        }
        Ok(())
    }
}

/// Greedily fills the gas budget, keeping every sender's nonces contiguous.
#[derive(Debug)]
pub struct PackGasLimit {
    pub max_batch_gas_limit: U256,
    pub max_batch_size: Option<usize>,
}

#[async_trait]
impl BundleStep for PackGasLimit {
    fn name(&self) -> &'static str {
        "pack_gas_limit"
    }

    async fn apply(&self, ctx: &mut BatchContext) -> Result<(), CycleAbort> {
        let mut packed = Vec::with_capacity(ctx.candidates.len());
        let mut gas = U256::ZERO;
        let mut last_nonce: HashMap<Address, U256> = HashMap::new();

        for entry in std::mem::take(&mut ctx.candidates) {
            let sender = entry.sender();
            let nonce = entry.user_op.nonce;

            if ctx.is_held(&sender, nonce) {
                ctx.resolve(&entry, Outcome::Requeued);
                continue;
            }
            if let Some(last) = last_nonce.get(&sender)
                && nonce != last.saturating_add(U256::from(1))
            {
                debug!(target: "bundler::bundling", sender = %sender, nonce = %nonce, "Nonce gap");
                ctx.resolve(&entry, Outcome::Requeued);
                continue;
            }

            let op_gas = entry.user_op.max_gas_available();
            let full = self.max_batch_size.is_some_and(|max| packed.len() >= max);
            if full || gas.saturating_add(op_gas) > self.max_batch_gas_limit {
                ctx.resolve(&entry, Outcome::Requeued);
                continue;
            }

            gas += op_gas;
            last_nonce.insert(sender, nonce);
            packed.push(entry);
        }

        ctx.candidates = packed;
        Ok(())
    }
}

/// Drops UserOps whose validation-time contracts changed code.
#[derive(Debug)]
pub struct CodeHashes {
    pub client: SharedChainClient,
}

#[async_trait]
impl BundleStep for CodeHashes {
    fn name(&self) -> &'static str {
        "code_hashes"
    }

    async fn apply(&self, ctx: &mut BatchContext) -> Result<(), CycleAbort> {
        let mut changed = HashSet::new();
        for entry in &ctx.candidates {
            let Some(expected) = entry.validation.code_hash else { continue };
            let actual = get_code_hash_digest(self.client.as_ref(), &entry.validation.code_addresses).await?;
            if actual != expected {
                warn!(target: "bundler::bundling", hash = %entry.hash, "Code changed since validation");
                changed.insert(entry.hash);
            }
        }

        drop_with_penalty(ctx, &changed, "code hash changed since validation");
        Ok(())
    }
}

/// Drops UserOps their paymaster can no longer pay for.
#[derive(Debug)]
pub struct PaymasterDeposit {
    pub client: SharedChainClient,
}

#[async_trait]
impl BundleStep for PaymasterDeposit {
    fn name(&self) -> &'static str {
        "paymaster_deposit"
    }

    async fn apply(&self, ctx: &mut BatchContext) -> Result<(), CycleAbort> {
        let mut balances: HashMap<Address, U256> = HashMap::new();
        let mut committed: HashMap<Address, U256> = HashMap::new();
        let mut insolvent = HashSet::new();

        for entry in &ctx.candidates {
            let Some(paymaster) = entry.user_op.paymaster() else { continue };

            let balance = match balances.get(&paymaster) {
                Some(balance) => *balance,
                None => {
                    let balance = get_balance_of(self.client.as_ref(), ctx.entry_point, paymaster).await?;
                    balances.insert(paymaster, balance);
                    balance
                }
            };

            let total = committed.entry(paymaster).or_default();
            let required = total.saturating_add(entry.user_op.max_gas_cost());
            if required > balance {
                warn!(
                    target: "bundler::bundling",
                    hash = %entry.hash,
                    paymaster = %paymaster,
                    balance = %balance,
                    required = %required,
                    "Paymaster deposit too low"
                );
                insolvent.insert(entry.hash);
            } else {
                *total = required;
            }
        }

        drop_with_penalty(ctx, &insolvent, "paymaster deposit too low");
        Ok(())
    }
}

fn drop_with_penalty(ctx: &mut BatchContext, hashes: &HashSet<B256>, reason: &str) {
    if hashes.is_empty() {
        return;
    }
    ctx.resolve_where(|entry| {
        hashes
            .contains(&entry.hash)
            .then(|| Outcome::Dropped { reason: reason.to_string(), penalize: true })
    });
    ctx.enforce_nonce_prefix();
}

/// Simulates `handleOps` for the batch, dropping UserOps that fail.
#[derive(Debug)]
pub struct SimulateBatch {
    pub client: SharedChainClient,
    pub gateway: Arc<dyn SubmissionGateway>,
    pub max_retries: usize,
}

impl SimulateBatch {
    fn calldata(&self, ctx: &BatchContext) -> Bytes {
        IEntryPointV06::handleOpsCall {
            ops: ctx.candidates.iter().map(|e| e.user_op.clone().into()).collect(),
            beneficiary: self.gateway.beneficiary(),
        }
        .abi_encode()
        .into()
    }

    fn requeue_all(ctx: &mut BatchContext) {
        ctx.resolve_where(|_| Some(Outcome::Requeued));
    }
}

#[async_trait]
impl BundleStep for SimulateBatch {
    fn name(&self) -> &'static str {
        "simulate_batch"
    }

    async fn apply(&self, ctx: &mut BatchContext) -> Result<(), CycleAbort> {
        for _ in 0..=self.max_retries {
            if ctx.candidates.is_empty() {
                return Ok(());
            }

            let calldata = self.calldata(ctx);
            let data = match self.client.call(Some(self.gateway.signer()), ctx.entry_point, calldata).await? {
                CallOutcome::Success(_) => return Ok(()),
                CallOutcome::Revert(data) => data,
            };

            let SimulationRevert::Failed(failed) = SimulationRevert::decode(&data) else {
                warn!(target: "bundler::bundling", data = %data, "handleOps reverted without FailedOp");
                Self::requeue_all(ctx);
                return Ok(());
            };

            let index = failed.opIndex.saturating_to::<usize>();
            let outcome = Outcome::Dropped { reason: failed.reason.clone(), penalize: true };
            match ctx.resolve_at(index, outcome) {
                Some(entry) => {
                    warn!(
                        target: "bundler::bundling",
                        hash = %entry.hash,
                        sender = %entry.sender(),
                        reason = %failed.reason,
                        "UserOp failed batch simulation"
                    );
                    ctx.enforce_nonce_prefix();
                }
                None => {
                    warn!(target: "bundler::bundling", index, "FailedOp index out of range");
                    Self::requeue_all(ctx);
                    return Ok(());
                }
            }
        }

        if !ctx.candidates.is_empty() {
            warn!(
                target: "bundler::bundling",
                remaining = ctx.candidates.len(),
                "Batch simulation retries exhausted"
            );
            Self::requeue_all(ctx);
        }
        Ok(())
    }
}

/// Hands the batch to the gateway.
#[derive(Debug)]
pub struct Submit {
    pub gateway: Arc<dyn SubmissionGateway>,
}

#[async_trait]
impl BundleStep for Submit {
    fn name(&self) -> &'static str {
        "submit"
    }

    async fn apply(&self, ctx: &mut BatchContext) -> Result<(), CycleAbort> {
        if ctx.candidates.is_empty() {
            return Ok(());
        }

        let ops: Vec<_> = ctx.candidates.iter().map(|e| e.user_op.clone()).collect();
        let tx_hash = self.gateway.submit(ctx.entry_point, &ops).await?;
        ctx.tx_hash = Some(tx_hash);
        Ok(())
    }
}
