use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Query counters kept by the retry policy
#[derive(Debug)]
pub struct QueryStats {
    slow_threshold: Duration,
    total: AtomicU64,
    slow: AtomicU64,
    failed: AtomicU64,
    total_micros: AtomicU64,
    max_micros: AtomicU64,
}

/// Point-in-time copy of [`QueryStats`]
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QueryStatsSnapshot {
    pub total: u64,
    pub slow: u64,
    pub failed: u64,
    pub avg_ms: f64,
    pub max_ms: f64,
    pub slow_threshold_ms: u64,
}

impl QueryStats {
    pub fn new(slow_threshold: Duration) -> Self {
        Self {
            slow_threshold,
            total: AtomicU64::new(0),
            slow: AtomicU64::new(0),
            failed: AtomicU64::new(0),
            total_micros: AtomicU64::new(0),
            max_micros: AtomicU64::new(0),
        }
    }

    /// Record one attempt that reached the datastore
    pub fn record(&self, operation: &str, elapsed: Duration, success: bool) {
        let micros = elapsed.as_micros() as u64;
        self.total.fetch_add(1, Ordering::Relaxed);
        self.total_micros.fetch_add(micros, Ordering::Relaxed);
        self.max_micros.fetch_max(micros, Ordering::Relaxed);
        if !success {
            self.failed.fetch_add(1, Ordering::Relaxed);
        }

        let status = if success { "ok" } else { "error" };
        ::metrics::counter!(
            "db_queries_total",
            "operation" => operation.to_string(),
            "status" => status
        )
        .increment(1);
        ::metrics::histogram!("db_queries_duration_seconds", "operation" => operation.to_string())
            .record(elapsed.as_secs_f64());

        if elapsed >= self.slow_threshold {
            self.slow.fetch_add(1, Ordering::Relaxed);
            tracing::warn!(
                operation,
                elapsed_ms = elapsed.as_millis() as u64,
                threshold_ms = self.slow_threshold.as_millis() as u64,
                "Slow query"
            );
        }
    }

    pub fn snapshot(&self) -> QueryStatsSnapshot {
        let total = self.total.load(Ordering::Relaxed);
        let total_micros = self.total_micros.load(Ordering::Relaxed);
        let avg_ms = if total > 0 {
            total_micros as f64 / total as f64 / 1000.0
        } else {
            0.0
        };

        QueryStatsSnapshot {
            total,
            slow: self.slow.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            avg_ms,
            max_ms: self.max_micros.load(Ordering::Relaxed) as f64 / 1000.0,
            slow_threshold_ms: self.slow_threshold.as_millis() as u64,
        }
    }
}
