//! Metrics collection for observability
//!
//! Each bank instance owns its own registry, so several banks (tests, or
//! one per data directory) can live in the same process.
//!
//! # Metrics
//!
//! - `bank_increments_total` - Successful balance increments
//! - `bank_transfers_total` - Successful balance transfers
//! - `bank_insufficient_funds_total` - Operations rejected for lack of funds
//! - `bank_exports_submitted_total` - Exports debited and enqueued
//! - `bank_exports_acked_total` - Exports acknowledged by a consumer
//! - `bank_exports_nacked_total` - Exports released back to their group
//! - `bank_exports_redelivered_total` - Deliveries of an already-delivered export

use prometheus::{IntCounter, Registry};
use std::sync::Arc;

/// Metrics collector
#[derive(Clone)]
pub struct Metrics {
    /// Successful balance increments
    pub increments_total: IntCounter,

    /// Successful balance transfers
    pub transfers_total: IntCounter,

    /// Operations rejected for lack of funds
    pub insufficient_funds_total: IntCounter,

    /// Exports submitted
    pub exports_submitted: IntCounter,

    /// Exports acknowledged
    pub exports_acked: IntCounter,

    /// Exports nacked
    pub exports_nacked: IntCounter,

    /// Exports delivered more than once
    pub exports_redelivered: IntCounter,

    /// Prometheus registry
    pub registry: Arc<Registry>,
}

impl Metrics {
    /// Create new metrics collector
    pub fn new() -> prometheus::Result<Self> {
        let registry = Arc::new(Registry::new());

        let counter = |name: &str, help: &str| -> prometheus::Result<IntCounter> {
            let counter = IntCounter::new(name, help)?;
            registry.register(Box::new(counter.clone()))?;
            Ok(counter)
        };

        Ok(Self {
            increments_total: counter("bank_increments_total", "Successful balance increments")?,
            transfers_total: counter("bank_transfers_total", "Successful balance transfers")?,
            insufficient_funds_total: counter(
                "bank_insufficient_funds_total",
                "Operations rejected for lack of funds",
            )?,
            exports_submitted: counter(
                "bank_exports_submitted_total",
                "Exports debited and enqueued",
            )?,
            exports_acked: counter("bank_exports_acked_total", "Exports acknowledged")?,
            exports_nacked: counter("bank_exports_nacked_total", "Exports released for retry")?,
            exports_redelivered: counter(
                "bank_exports_redelivered_total",
                "Deliveries of an already-delivered export",
            )?,
            registry: registry.clone(),
        })
    }

    /// Count the outcome of a balance-changing operation
    pub(crate) fn record_result<T>(&self, counter: &IntCounter, result: &crate::Result<T>) {
        match result {
            Ok(_) => counter.inc(),
            Err(e) if e.is_insufficient_funds() => self.insufficient_funds_total.inc(),
            Err(_) => {}
        }
    }

    /// Get metrics registry
    pub fn registry(&self) -> &Registry {
        &self.registry
    }
}

impl std::fmt::Debug for Metrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Metrics")
            .field("increments_total", &self.increments_total.get())
            .field("transfers_total", &self.transfers_total.get())
            .field("exports_submitted", &self.exports_submitted.get())
            .field("exports_acked", &self.exports_acked.get())
            .finish_non_exhaustive()
    }
}
