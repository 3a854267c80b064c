//! Core domain types.

mod entrypoint;
pub use entrypoint::{
    DepositInfo, ENTRYPOINT_V06_ADDRESS, EntityStake, FailedOp, IEntryPointV06, ReturnInfo,
    SimulationRevert, StakeInfo, UserOperationEvent, UserOperationV06, ValidationResult,
    ValidationResultWithAggregation,
};

mod user_operation;
pub use user_operation::UserOperation;
