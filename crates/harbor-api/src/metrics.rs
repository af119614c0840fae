use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use harbor_core::HarborError;

/// Sink for call metrics. Implementations can forward to Prometheus,
/// StatsD, or simply log.
pub trait MetricsBackend: Send + Sync {
    fn record_counter(&self, name: &str, value: u64);
    fn record_histogram(&self, name: &str, value: f64);
}

/// Atomic call counters shared by every clone of an `ApiProxy`.
#[derive(Default)]
pub struct CallMetrics {
    issued: AtomicU64,
    succeeded: AtomicU64,
    deadline_exceeded: AtomicU64,
    failed: AtomicU64,
    backend: Option<Arc<dyn MetricsBackend>>,
}

impl std::fmt::Debug for CallMetrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallMetrics")
            .field("snapshot", &self.snapshot())
            .finish()
    }
}

impl CallMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_backend(backend: Arc<dyn MetricsBackend>) -> Self {
        Self {
            backend: Some(backend),
            ..Self::default()
        }
    }

    pub(crate) fn record_issued(&self) {
        let val = self.issued.fetch_add(1, Ordering::Relaxed) + 1;
        if let Some(backend) = &self.backend {
            backend.record_counter("harbor.api.calls_issued", val);
        }
    }

    pub(crate) fn record_outcome(&self, outcome: &Result<Vec<u8>, HarborError>, elapsed_ms: f64) {
        let (counter, name) = match outcome {
            Ok(_) => (&self.succeeded, "harbor.api.calls_succeeded"),
            Err(e) if e.is_deadline_exceeded() => {
                (&self.deadline_exceeded, "harbor.api.calls_deadline_exceeded")
            }
            Err(_) => (&self.failed, "harbor.api.calls_failed"),
        };
        let val = counter.fetch_add(1, Ordering::Relaxed) + 1;
        if let Some(backend) = &self.backend {
            backend.record_counter(name, val);
            backend.record_histogram("harbor.api.call_latency_ms", elapsed_ms);
        }
    }

    pub fn snapshot(&self) -> CallMetricsSnapshot {
        CallMetricsSnapshot {
            issued: self.issued.load(Ordering::Relaxed),
            succeeded: self.succeeded.load(Ordering::Relaxed),
            deadline_exceeded: self.deadline_exceeded.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub struct CallMetricsSnapshot {
    pub issued: u64,
    pub succeeded: u64,
    pub deadline_exceeded: u64,
    pub failed: u64,
}

/// Emits metrics as structured log events.
pub struct LoggingMetricsBackend;

impl MetricsBackend for LoggingMetricsBackend {
    fn record_counter(&self, name: &str, value: u64) {
        tracing::info!(metric = name, value = value, kind = "counter", "metric");
    }

    fn record_histogram(&self, name: &str, value: f64) {
        tracing::info!(metric = name, value = value, kind = "histogram", "metric");
    }
}
