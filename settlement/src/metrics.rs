use prometheus_client::{
    metrics::{counter::Counter, gauge::Gauge},
    registry::Registry,
};
use std::sync::atomic::AtomicU64;

/// Counters exported by the settlement engine.
///
/// Cloning shares the underlying atomics, so a clone handed to a watcher task updates the same
/// series that was registered.
#[derive(Clone, Debug, Default)]
pub struct SettlementMetrics {
    pub submitted: Counter<u64, AtomicU64>,
    pub succeeded: Counter<u64, AtomicU64>,
    pub failed: Counter<u64, AtomicU64>,
    pub submission_retries: Counter<u64, AtomicU64>,
    pub batches_refused: Counter<u64, AtomicU64>,
    pub pending_watchers: Gauge,
}

impl SettlementMetrics {
    /// Create metrics registered under the `settlement` prefix of `registry`.
    pub fn register(registry: &mut Registry) -> Self {
        let metrics = Self::default();
        let registry = registry.sub_registry_with_prefix("settlement");
        registry.register(
            "payouts_submitted",
            "Number of payout transfers acknowledged by the transfer system",
            metrics.submitted.clone(),
        );
        registry.register(
            "payouts_succeeded",
            "Number of payouts confirmed on chain",
            metrics.succeeded.clone(),
        );
        registry.register(
            "payouts_failed",
            "Number of payouts recorded as FAILED",
            metrics.failed.clone(),
        );
        registry.register(
            "submission_retries",
            "Number of transient submission failures that were retried",
            metrics.submission_retries.clone(),
        );
        registry.register(
            "batches_refused",
            "Number of settlements refused by the balance guard",
            metrics.batches_refused.clone(),
        );
        registry.register(
            "pending_watchers",
            "Confirmation watchers currently running",
            metrics.pending_watchers.clone(),
        );
        metrics
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use prometheus_client::encoding::text::encode;

    #[test]
    fn registered_metrics_are_encoded() {
        let mut registry = Registry::default();
        let metrics = SettlementMetrics::register(&mut registry);
        metrics.submitted.inc();
        metrics.pending_watchers.inc();

        let mut buffer = String::new();
        encode(&mut buffer, &registry).unwrap();
        assert!(buffer.contains("settlement_payouts_submitted_total 1"));
        assert!(buffer.contains("settlement_pending_watchers 1"));
    }
}
