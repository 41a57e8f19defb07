//! Resilient access to a remote relational datastore
//!
//! A bounded [`ConnectionPool`](database::ConnectionPool), a
//! [`CircuitBreaker`](resilience::CircuitBreaker), a categorized
//! [`CacheManager`](cache::CacheManager) and an optional offline collaborator,
//! composed by [`RetryPolicy`](resilience::RetryPolicy) so that calls keep
//! answering while the datastore is slow, flapping or away.

pub mod bootstrap;
pub mod cache;
pub mod config;
pub mod database;
pub mod metrics;
pub mod offline;
pub mod resilience;

// Testing utilities (always available for integration tests)
pub mod testing;

// Re-export commonly used types for convenience
pub use bootstrap::{DataLayer, DataLayerStats};
pub use cache::{CacheKey, CacheManager, CacheStats};
pub use config::AppConfig;
pub use database::{ConnectionPool, DbError, PoolStats};
pub use metrics::AppMetrics;
pub use offline::OfflineSync;
pub use resilience::{CircuitBreaker, Operation, OperationCatalog, OperationKind, Outcome, RetryPolicy};
