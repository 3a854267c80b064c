//! Admission of submitted UserOps.
//!
//! Reputation and pending-count gates run first, then the static field and
//! fee checks, then `simulateValidation` with ERC-7562 trace rules.

mod config;
pub use config::ValidationConfig;

mod error;
pub use error::{Rejection, codes};

mod pipeline;
pub use pipeline::{ValidationContext, ValidationPipeline, ValidationPipelineBuilder, ValidationStep};

mod rules;
pub use rules::{BANNED_OPCODES, CALL_OPCODES, TraceEntities, check_trace, touched_contracts};

mod steps;
pub use steps::{
    PendingCountGate, ReputationGate, Simulation, StaticChecks, simulate_validation,
    simulate_validation_calldata,
};
