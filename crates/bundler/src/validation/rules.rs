//! ERC-7562 Trace Rules
//!
//! Checks a `debug_traceCall` frame tree of `simulateValidation` for opcode
//! and storage access the bundler does not accept during validation.
//!
//! Reference: https://eips.ethereum.org/EIPS/eip-7562

use std::collections::BTreeSet;

use alloy_primitives::Address;
use alloy_rpc_types_trace::geth::erc7562::Erc7562Frame;

use super::error::Rejection;

/// Opcodes banned during validation
pub const BANNED_OPCODES: &[u8] = &[
    0x31, // BALANCE
    0x32, // ORIGIN
    0x3A, // GASPRICE
    0x40, // BLOCKHASH
    0x41, // COINBASE
    0x42, // TIMESTAMP
    0x43, // NUMBER
    0x44, // PREVRANDAO
    0x45, // GASLIMIT
    0x47, // SELFBALANCE
    0x48, // BASEFEE
    0x5A, // GAS, allowed when used for a *CALL
    0xF0, // CREATE
    0xFE, // INVALID
    0xFF, // SELFDESTRUCT
];

/// CALL variants
pub const CALL_OPCODES: &[u8] = &[0xF1, 0xF2, 0xF4, 0xFA];

const GAS_OPCODE: u8 = 0x5A;
const CREATE2_OPCODE: u8 = 0xF5;

fn opcode_name(opcode: u8) -> &'static str {
    match opcode {
        0x31 => "BALANCE",
        0x32 => "ORIGIN",
        0x3A => "GASPRICE",
        0x40 => "BLOCKHASH",
        0x41 => "COINBASE",
        0x42 => "TIMESTAMP",
        0x43 => "NUMBER",
        0x44 => "PREVRANDAO",
        0x45 => "GASLIMIT",
        0x47 => "SELFBALANCE",
        0x48 => "BASEFEE",
        0x5A => "GAS",
        0xF0 => "CREATE",
        0xF5 => "CREATE2",
        0xFE => "INVALID",
        0xFF => "SELFDESTRUCT",
        _ => "UNKNOWN",
    }
}

/// Entities of the UserOp being validated
#[derive(Debug, Clone, Default)]
pub struct TraceEntities {
    pub entry_point: Address,
    pub sender: Address,
    /// Set only when the UserOp deploys its sender
    pub factory: Option<Address>,
    pub paymaster: Option<Address>,
    /// Entities meeting the stake requirements
    pub staked: Vec<Address>,
}

impl TraceEntities {
    fn may_write_storage_of(&self, contract: Address) -> bool {
        contract == self.sender || contract == self.entry_point || self.staked.contains(&contract)
    }
}

/// Walks the frame tree and returns the first violation found
pub fn check_trace(frame: &Erc7562Frame, entities: &TraceEntities) -> Result<(), Rejection> {
    // The entry point's own frames are trusted; only the code it calls is checked.
    if frame.to != Some(entities.entry_point) {
        check_opcodes(frame, entities)?;
        check_storage(frame, entities)?;
    }

    if frame.out_of_gas {
        return Err(Rejection::OutOfGas(frame.to.unwrap_or(frame.from)));
    }

    for child in &frame.calls {
        check_trace(child, entities)?;
    }
    Ok(())
}

fn check_opcodes(frame: &Erc7562Frame, entities: &TraceEntities) -> Result<(), Rejection> {
    let entity = frame.to.unwrap_or(frame.from);
    let used = |opcode: &u8| frame.used_opcodes.get(opcode).is_some_and(|count| *count > 0);

    for opcode in BANNED_OPCODES {
        if !used(opcode) {
            continue;
        }
        if *opcode == GAS_OPCODE && CALL_OPCODES.iter().any(used) {
            continue;
        }
        return Err(Rejection::OpcodeViolation { entity, opcode: opcode_name(*opcode) });
    }

    // CREATE2 only by the factory deploying the sender, once
    let create2 = frame.used_opcodes.get(&CREATE2_OPCODE).copied().unwrap_or(0);
    if create2 > 0 && (entities.factory != Some(entity) || create2 > 1) {
        return Err(Rejection::OpcodeViolation { entity, opcode: opcode_name(CREATE2_OPCODE) });
    }
    Ok(())
}

fn check_storage(frame: &Erc7562Frame, entities: &TraceEntities) -> Result<(), Rejection> {
    if frame.accessed_slots.writes.is_empty() {
        return Ok(());
    }
    let Some(contract) = frame.to else {
        return Ok(());
    };
    if entities.may_write_storage_of(contract) {
        return Ok(());
    }
    Err(Rejection::StorageViolation { entity: frame.from, contract })
}

/// Every contract whose code ran or was inspected, excluding the entry point
pub fn touched_contracts(frame: &Erc7562Frame, entry_point: Address) -> Vec<Address> {
    let mut out = BTreeSet::new();
    collect_contracts(frame, &mut out);
    out.remove(&entry_point);
    out.into_iter().collect()
}

fn collect_contracts(frame: &Erc7562Frame, out: &mut BTreeSet<Address>) {
    if let Some(to) = frame.to {
        out.insert(to);
    }
    out.extend(frame.contract_size.keys().copied());
    for child in &frame.calls {
        collect_contracts(child, out);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::test_address;

    fn entities() -> TraceEntities {
        TraceEntities {
            entry_point: test_address(0xee),
            sender: test_address(1),
            factory: None,
            paymaster: Some(test_address(3)),
            staked: Vec::new(),
        }
    }

    fn frame(to: Address, opcodes: &[(u8, u64)]) -> Erc7562Frame {
        let mut frame = Erc7562Frame::default();
        frame.from = test_address(0xee);
        frame.to = Some(to);
        frame.used_opcodes = opcodes.iter().copied().collect();
        frame
    }

    fn under_entry_point(child: Erc7562Frame) -> Erc7562Frame {
        let mut root = frame(test_address(0xee), &[(0x43, 1), (0x5A, 1)]);
        root.calls.push(child);
        root
    }

    #[test]
    fn test_clean_trace_passes() {
        let trace = under_entry_point(frame(test_address(1), &[(0x54, 2)]));
        assert!(check_trace(&trace, &entities()).is_ok());
    }

    #[test]
    fn test_banned_opcode_in_sender() {
        let trace = under_entry_point(frame(test_address(1), &[(0x42, 1)]));
        let err = check_trace(&trace, &entities()).unwrap_err();
        assert!(matches!(err, Rejection::OpcodeViolation { opcode: "TIMESTAMP", .. }));
    }

    #[test]
    fn test_gas_allowed_with_call() {
        let trace = under_entry_point(frame(test_address(1), &[(0x5A, 1), (0xF1, 1)]));
        assert!(check_trace(&trace, &entities()).is_ok());

        let trace = under_entry_point(frame(test_address(1), &[(0x5A, 1)]));
        assert!(check_trace(&trace, &entities()).is_err());
    }

    #[test]
    fn test_create2_only_for_factory() {
        let trace = under_entry_point(frame(test_address(2), &[(0xF5, 1)]));
        assert!(check_trace(&trace, &entities()).is_err());

        let deploying = TraceEntities { factory: Some(test_address(2)), ..entities() };
        assert!(check_trace(&trace, &deploying).is_ok());
    }

    #[test]
    fn test_storage_write_needs_stake() {
        let mut paymaster = frame(test_address(3), &[]);
        paymaster.accessed_slots.writes.insert(Default::default(), 1);
        let trace = under_entry_point(paymaster);

        let err = check_trace(&trace, &entities()).unwrap_err();
        assert!(matches!(err, Rejection::StorageViolation { .. }));

        let staked = TraceEntities { staked: vec![test_address(3)], ..entities() };
        assert!(check_trace(&trace, &staked).is_ok());
    }

    #[test]
    fn test_out_of_gas() {
        let mut sender = frame(test_address(1), &[]);
        sender.out_of_gas = true;
        let err = check_trace(&under_entry_point(sender), &entities()).unwrap_err();
        assert!(matches!(err, Rejection::OutOfGas(_)));
    }

    #[test]
    fn test_touched_contracts_excludes_entry_point() {
        let trace = under_entry_point(frame(test_address(1), &[]));
        assert_eq!(touched_contracts(&trace, test_address(0xee)), vec![test_address(1)]);
    }
}
