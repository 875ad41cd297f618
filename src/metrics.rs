//! Pipeline outcome counters, surfaced on the health endpoint.

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

/// Cheap per-process counters for each pipeline outcome. Incremented from
/// the interceptor chain, read by health reporting.
#[derive(Debug, Default)]
pub struct PipelineMetrics {
    admitted: AtomicU64,
    rejected: AtomicU64,
    unauthenticated: AtomicU64,
    envelope_failures: AtomicU64,
    handler_failures: AtomicU64,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub admitted: u64,
    pub rejected: u64,
    pub unauthenticated: u64,
    pub envelope_failures: u64,
    pub handler_failures: u64,
}

impl PipelineMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_admitted(&self) {
        self.admitted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_rejected(&self) {
        self.rejected.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_unauthenticated(&self) {
        self.unauthenticated.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_envelope_failure(&self) {
        self.envelope_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_handler_failure(&self) {
        self.handler_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            admitted: self.admitted.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
            unauthenticated: self.unauthenticated.load(Ordering::Relaxed),
            envelope_failures: self.envelope_failures.load(Ordering::Relaxed),
            handler_failures: self.handler_failures.load(Ordering::Relaxed),
        }
    }
}
