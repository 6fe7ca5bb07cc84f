//! Metrics collection for observability
//!
//! Prometheus metrics for monitoring the wallet ledger.
//!
//! # Metrics
//!
//! - `wallet_transactions_total{type,currency}` - Rows appended
//! - `wallet_decisions_total{status}` - PENDING rows approved or failed
//! - `wallet_rejected_writes_total` - Writes refused by validation or funds checks
//! - `wallet_record_duration_seconds` - Histogram of append latencies

use prometheus::{
    Encoder, Histogram, HistogramOpts, IntCounter, IntCounterVec, Opts, Registry, TextEncoder,
};
use std::sync::Arc;

/// Metrics collector
#[derive(Clone)]
pub struct Metrics {
    /// Rows appended by type and currency
    pub transactions_total: IntCounterVec,

    /// Status decisions
    pub decisions_total: IntCounterVec,

    /// Refused writes
    pub rejected_writes: IntCounter,

    /// Append duration histogram
    pub record_duration: Histogram,

    /// Prometheus registry
    pub registry: Arc<Registry>,
}

impl Metrics {
    /// Create new metrics collector with its own registry
    pub fn new() -> prometheus::Result<Self> {
        let registry = Arc::new(Registry::new());

        let transactions_total = IntCounterVec::new(
            Opts::new("wallet_transactions_total", "Wallet rows appended"),
            &["type", "currency"],
        )?;
        registry.register(Box::new(transactions_total.clone()))?;

        let decisions_total = IntCounterVec::new(
            Opts::new("wallet_decisions_total", "Pending rows approved or failed"),
            &["status"],
        )?;
        registry.register(Box::new(decisions_total.clone()))?;

        let rejected_writes = IntCounter::new(
            "wallet_rejected_writes_total",
            "Writes refused by validation or funds checks",
        )?;
        registry.register(Box::new(rejected_writes.clone()))?;

        let record_duration = Histogram::with_opts(
            HistogramOpts::new(
                "wallet_record_duration_seconds",
                "Histogram of append latencies",
            )
            .buckets(vec![0.0005, 0.001, 0.005, 0.010, 0.025, 0.050, 0.100, 0.250]),
        )?;
        registry.register(Box::new(record_duration.clone()))?;

        Ok(Self {
            transactions_total,
            decisions_total,
            rejected_writes,
            record_duration,
            registry,
        })
    }

    /// Render in Prometheus text format
    pub fn gather_text(&self) -> String {
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();
        if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
            tracing::error!("Failed to encode metrics: {}", e);
            return String::new();
        }
        String::from_utf8(buffer).unwrap_or_default()
    }
}

impl std::fmt::Debug for Metrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Metrics").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_creation() {
        let metrics = Metrics::new().unwrap();
        metrics
            .transactions_total
            .with_label_values(&["EARNING", "USD"])
            .inc();
        assert_eq!(
            metrics
                .transactions_total
                .with_label_values(&["EARNING", "USD"])
                .get(),
            1
        );
    }

    #[test]
    fn test_independent_registries() {
        // Two ledgers in one process must not collide
        let first = Metrics::new().unwrap();
        let second = Metrics::new().unwrap();
        first.rejected_writes.inc();
        assert_eq!(second.rejected_writes.get(), 0);
        assert!(first.gather_text().contains("wallet_rejected_writes_total 1"));
    }
}
