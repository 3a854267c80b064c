use metrics::{Counter, Gauge, Histogram};
use metrics_derive::Metrics;

#[derive(Metrics, Clone)]
#[metrics(scope = "bundler_mempool")]
pub struct MempoolMetrics {
    #[metric(describe = "Number of UserOps added to the mempool")]
    pub ops_added: Counter,

    #[metric(describe = "Number of UserOps that replaced a pending UserOp")]
    pub ops_replaced: Counter,

    #[metric(describe = "Number of UserOps removed from the mempool")]
    pub ops_removed: Counter,

    #[metric(describe = "Number of UserOps currently pending")]
    pub pool_size: Gauge,
}

#[derive(Metrics, Clone)]
#[metrics(scope = "bundler_reputation")]
pub struct ReputationMetrics {
    #[metric(describe = "Number of opsSeen increments")]
    pub ops_seen: Counter,

    #[metric(describe = "Number of opsIncluded increments")]
    pub ops_included: Counter,

    #[metric(describe = "Number of senders penalized")]
    pub penalties: Counter,
}

#[derive(Metrics, Clone)]
#[metrics(scope = "bundler_validation")]
pub struct ValidationMetrics {
    #[metric(describe = "Number of UserOps accepted")]
    pub accepted: Counter,

    #[metric(describe = "Number of UserOps rejected")]
    pub rejected: Counter,

    #[metric(describe = "Duration of the validation pipeline")]
    pub validation_duration: Histogram,
}

#[derive(Metrics, Clone)]
#[metrics(scope = "bundler_bundling")]
pub struct BundlingMetrics {
    #[metric(describe = "Number of bundling cycles run")]
    pub cycles: Counter,

    #[metric(describe = "Number of bundling cycles aborted")]
    pub cycles_aborted: Counter,

    #[metric(describe = "Number of cycles skipped because a previous one was still running")]
    pub cycles_skipped: Counter,

    #[metric(describe = "Number of bundles submitted")]
    pub bundles_submitted: Counter,

    #[metric(describe = "Number of UserOps included in submitted bundles")]
    pub ops_included: Counter,

    #[metric(describe = "Number of UserOps dropped while bundling")]
    pub ops_dropped: Counter,

    #[metric(describe = "Number of UserOps expired")]
    pub ops_expired: Counter,

    #[metric(describe = "Number of UserOps held back for a later cycle")]
    pub ops_requeued: Counter,

    #[metric(describe = "Duration of a bundling cycle")]
    pub cycle_duration: Histogram,
}

#[derive(Metrics, Clone)]
#[metrics(scope = "bundler_gateway")]
pub struct GatewayMetrics {
    #[metric(describe = "Number of bundle submissions")]
    pub submissions: Counter,

    #[metric(describe = "Number of relay requests that failed")]
    pub relay_failures: Counter,

    #[metric(describe = "Duration of a bundle submission")]
    pub submit_duration: Histogram,
}
