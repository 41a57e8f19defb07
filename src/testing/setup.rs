use std::sync::Arc;

use crate::bootstrap::DataLayer;
use crate::config::{AppConfig, CacheConfig, CircuitBreakerConfig, PoolConfig, RetryConfig};
use crate::testing::{MockConnector, MockServer, RecordingOfflineSync};

/// Returns a configuration with production shapes but test-sized timings
///
/// Same breaker thresholds and retry budget as the defaults, with backoff in
/// milliseconds and no jitter so test timings are predictable. The cache
/// sweeper is disabled; tests call `clear_expired` themselves.
///
/// # Example
/// ```no_run
/// use resilient_db::testing::setup;
///
/// let config = setup::config();
/// assert_eq!(config.resilience.retry.attempts(), 3);
/// ```
pub fn config() -> AppConfig {
    AppConfig {
        pool: PoolConfig {
            max_connections: 4,
            min_idle: 1,
            acquire_timeout: 1,
            create_retries: 1,
            create_retry_delay: 1,
            max_lifetime: 1800,
        },
        resilience: crate::config::ResilienceConfig {
            circuit_breaker: CircuitBreakerConfig::default(),
            retry: RetryConfig {
                initial_delay: 10,
                max_delay: 40,
                jitter: 0.0,
                ..RetryConfig::default()
            },
        },
        cache: CacheConfig {
            sweep_interval: 0,
            ..CacheConfig::default()
        },
        ..AppConfig::default()
    }
}

/// Returns a data layer over a fresh scripted server
///
/// # Example
/// ```no_run
/// use resilient_db::testing::setup;
///
/// # async fn example() {
/// let (server, layer) = setup::data_layer();
/// layer.initialize().await.unwrap();
/// assert_eq!(server.connects(), 1);
/// # }
/// ```
pub fn data_layer() -> (MockServer, DataLayer<MockConnector>) {
    let server = MockServer::new();
    let layer = DataLayer::new(config(), server.connector());
    (server, layer)
}

/// Same as [`data_layer`] with a recording offline collaborator attached
pub fn offline_data_layer() -> (MockServer, Arc<RecordingOfflineSync>, DataLayer<MockConnector>) {
    let server = MockServer::new();
    let offline = Arc::new(RecordingOfflineSync::new());
    let layer = DataLayer::new(config(), server.connector()).with_offline(offline.clone());
    (server, offline, layer)
}
