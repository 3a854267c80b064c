//! Durable UserOperation mempool.
//!
//! Pending operations are keyed by (entry point, sender, nonce) and persisted
//! in rocksdb so they survive restarts without replaying submissions.

mod entry;
pub use entry::{EntryKey, EntryState, MempoolEntry, ValidationSnapshot, now_millis};

mod error;
pub use error::{MempoolError, MempoolResult};

mod store;
pub use store::{AdmissionLimits, OperationStore, StoreConfig};
