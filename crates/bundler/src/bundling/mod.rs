//! Periodic batching of pending UserOps into `handleOps` bundles.
//!
//! [`BundlePipeline`] runs one cycle through the ordered bundle steps and
//! reconciles the mempool. [`BundlerService`] schedules cycles per entry
//! point.

mod config;
pub use config::BundlerConfig;

mod context;
pub use context::{BatchContext, CycleAbort, Outcome, Resolution};

mod pipeline;
pub use pipeline::{BundlePipeline, BundlePipelineBuilder, BundleStep, CycleReport};

mod service;
pub use service::BundlerService;

mod steps;
pub use steps::{
    CodeHashes, Expire, FilterUnderpriced, PackGasLimit, PaymasterDeposit, SimulateBatch,
    SortByNonce, SortByPrice, Submit,
};
