//! Sender reputation: rolling counters, derived status and pending limits.

mod config;
pub use config::ReputationConfig;

mod tracker;
pub use tracker::{
    ReputationEntry, ReputationError, ReputationRecord, ReputationStatus, ReputationTracker,
    spawn_decay,
};
