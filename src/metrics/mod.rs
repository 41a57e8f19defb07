mod query;

pub use query::{QueryStats, QueryStatsSnapshot};

use metrics::{describe_counter, describe_gauge, describe_histogram, gauge};
use metrics_exporter_prometheus::{BuildError, Matcher, PrometheusBuilder, PrometheusHandle};
use std::sync::{Arc, OnceLock};

use crate::cache::CacheStats;
use crate::database::PoolStats;

static PROMETHEUS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

/// Process-wide Prometheus recorder
///
/// The pool, breaker, cache and retry policy emit through the `metrics`
/// macros directly; this type installs the recorder once and renders the
/// exposition text.
#[derive(Clone)]
pub struct AppMetrics {
    prometheus_handle: Arc<PrometheusHandle>,
}

impl AppMetrics {
    pub fn new() -> Result<Self, BuildError> {
        Self::with_config(None)
    }

    pub fn with_config(config: Option<&crate::config::AppConfig>) -> Result<Self, BuildError> {
        if let Some(handle) = PROMETHEUS_HANDLE.get() {
            return Ok(Self {
                prometheus_handle: Arc::new(handle.clone()),
            });
        }

        let builder = PrometheusBuilder::new();

        // Add global labels from config
        let builder = if let Some(cfg) = config {
            builder
                .add_global_label("service", cfg.app.name.clone())
                .add_global_label("version", cfg.app.version.clone())
                .add_global_label("environment", cfg.app.environment.clone())
        } else {
            builder
        };

        let builder = builder.set_buckets_for_metric(
            Matcher::Full("db_queries_duration_seconds".to_string()),
            &[0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0],
        )?;

        // Describe all metrics
        Self::describe_metrics();

        let handle = match builder.install_recorder() {
            Ok(handle) => PROMETHEUS_HANDLE.get_or_init(|| handle).clone(),
            // Lost a race with another installer
            Err(e) => PROMETHEUS_HANDLE.get().cloned().ok_or(e)?,
        };

        Ok(Self {
            prometheus_handle: Arc::new(handle),
        })
    }

    fn describe_metrics() {
        // Pool metrics
        describe_counter!(
            "db_pool_connections_created_total",
            "Total number of pooled connections opened"
        );
        describe_counter!(
            "db_pool_connections_reused_total",
            "Total number of checkouts served by an idle connection"
        );
        describe_counter!(
            "db_pool_acquire_timeouts_total",
            "Total number of acquires that timed out waiting for a connection"
        );
        describe_counter!(
            "db_pool_connections_closed_total",
            "Total number of pooled connections closed"
        );
        describe_counter!(
            "db_pool_emergency_connections_total",
            "Total number of out-of-pool emergency connections opened"
        );
        describe_gauge!("db_pool_size", "Pooled connections, idle plus checked out");
        describe_gauge!("db_pool_idle", "Idle pooled connections");

        // Resilience metrics
        describe_gauge!("db_circuit_open", "1 while the database circuit breaker is open");
        describe_counter!(
            "db_operation_retries_total",
            "Total number of retried datastore attempts"
        );
        describe_counter!(
            "db_operation_degraded_total",
            "Total number of calls answered from a degraded path"
        );

        // Query metrics
        describe_counter!("db_queries_total", "Total number of datastore attempts");
        describe_histogram!(
            "db_queries_duration_seconds",
            "Datastore attempt duration in seconds"
        );

        // Cache metrics
        describe_counter!("cache_hits_total", "Total number of cache hits");
        describe_counter!("cache_misses_total", "Total number of cache misses");
        describe_counter!(
            "cache_evictions_total",
            "Total number of entries evicted by the LRU policy"
        );
        describe_gauge!("cache_size", "Current number of items in cache");
    }

    /// Refresh gauges from a pool snapshot
    pub fn record_pool(&self, stats: &PoolStats) {
        gauge!("db_pool_size").set(stats.size as f64);
        gauge!("db_pool_idle").set(stats.idle as f64);
    }

    /// Refresh gauges from a cache snapshot
    pub fn record_cache(&self, stats: &CacheStats) {
        gauge!("cache_size").set(stats.size as f64);
    }

    // Prometheus export
    pub fn render(&self) -> String {
        self.prometheus_handle.render()
    }
}
