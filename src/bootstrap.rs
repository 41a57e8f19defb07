//! Startup wiring for the data layer
//!
//! [`DataLayer`] builds the pool, breaker, cache and retry policy from one
//! [`AppConfig`] and owns them for the lifetime of the process. Schema setup
//! and pool warm-up happen in [`DataLayer::initialize`], which runs at most
//! once no matter how many tasks call it.

use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::OnceCell;

use crate::cache::{CacheManager, CacheStats};
use crate::config::AppConfig;
use crate::database::{ConnectionPool, Connector, DbError, PoolStats, SeaOrmConnector, SessionFuture};
use crate::metrics::{AppMetrics, QueryStatsSnapshot};
use crate::offline::OfflineSync;
use crate::resilience::{CircuitBreaker, CircuitSnapshot, Operation, OperationCatalog, RetryPolicy};

/// Point-in-time view of every component, for health output
#[derive(Debug, Clone, Serialize)]
pub struct DataLayerStats {
    pub pool: PoolStats,
    pub circuit: CircuitSnapshot,
    pub cache: CacheStats,
    pub queries: QueryStatsSnapshot,
}

/// The wired-up pool, breaker, cache and retry policy
pub struct DataLayer<C: Connector> {
    config: AppConfig,
    catalog: OperationCatalog,
    policy: RetryPolicy<C>,
    initialized: OnceCell<usize>,
}

impl DataLayer<SeaOrmConnector> {
    /// Data layer talking to the configured datastore
    pub fn from_config(config: AppConfig) -> Self {
        let connector = SeaOrmConnector::new(&config.database);
        Self::new(config, connector)
    }
}

impl<C: Connector> DataLayer<C> {
    #[tracing::instrument(skip_all, fields(environment = %config.app.environment))]
    pub fn new(config: AppConfig, connector: C) -> Self {
        let pool = Arc::new(ConnectionPool::new(connector, config.pool.clone()));
        let breaker = Arc::new(CircuitBreaker::new("database", &config.resilience.circuit_breaker));
        let cache = Arc::new(CacheManager::new(config.cache.clone()));
        let policy = RetryPolicy::new(pool, breaker, cache, config.resilience.retry.clone());

        tracing::info!("Data layer created");

        Self {
            config,
            catalog: OperationCatalog::new(),
            policy,
            initialized: OnceCell::new(),
        }
    }

    /// Attach the offline collaborator used for degraded reads and queued writes
    pub fn with_offline(mut self, offline: Arc<dyn OfflineSync>) -> Self {
        self.policy = self.policy.with_offline(offline);
        self
    }

    /// Replace the operation metadata table
    pub fn with_catalog(mut self, catalog: OperationCatalog) -> Self {
        self.catalog = catalog;
        self
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    pub fn catalog(&self) -> &OperationCatalog {
        &self.catalog
    }

    pub fn policy(&self) -> &RetryPolicy<C> {
        &self.policy
    }

    pub fn pool(&self) -> &Arc<ConnectionPool<C>> {
        self.policy.pool()
    }

    pub fn breaker(&self) -> &Arc<CircuitBreaker> {
        self.policy.breaker()
    }

    pub fn cache(&self) -> &Arc<CacheManager> {
        self.policy.cache()
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized.initialized()
    }

    /// Warm the pool once; later calls return the first result
    pub async fn initialize(&self) -> Result<usize, DbError> {
        self.initialize_with(|_| Box::pin(async { Ok(()) })).await
    }

    /// Run `setup` (schema, indexes) once, then warm the pool
    ///
    /// A failing setup leaves the data layer uninitialized so the next call
    /// tries again. Warm-up itself is best effort and returns how many
    /// connections it opened.
    #[tracing::instrument(skip_all)]
    pub async fn initialize_with<F>(&self, setup: F) -> Result<usize, DbError>
    where
        F: for<'c> FnOnce(&'c C::Session) -> SessionFuture<'c, ()>,
    {
        let warmed = self
            .initialized
            .get_or_try_init(|| async {
                self.pool().with_connection(setup).await?;
                tracing::info!("Datastore setup completed");
                Ok::<_, DbError>(self.warm_up().await)
            })
            .await?;
        Ok(*warmed)
    }

    async fn warm_up(&self) -> usize {
        let target = self.config.pool.min_idle;
        let mut held = Vec::with_capacity(target);

        while held.len() < target {
            match self.pool().acquire().await {
                Ok(conn) => held.push(conn),
                Err(e) => {
                    tracing::warn!(error = %e, warmed = held.len(), target, "Pool warm-up stopped early");
                    break;
                }
            }
        }

        let warmed = held.len();
        for conn in held {
            self.pool().release(conn, false).await;
        }

        tracing::info!(warmed, "Pool warmed up");
        warmed
    }

    /// Descriptor for a named operation from the catalog
    pub fn operation<T>(&self, name: &str, args: Value) -> Operation<T>
    where
        T: DeserializeOwned + 'static,
    {
        self.catalog.operation(name, args)
    }

    /// Run `f` through the retry policy
    pub async fn execute<T, F>(&self, op: &Operation<T>, f: F) -> Result<T, DbError>
    where
        T: Serialize + DeserializeOwned + Send,
        F: for<'c> Fn(&'c C::Session) -> SessionFuture<'c, T> + Sync,
    {
        self.policy.execute(op, f).await
    }

    pub fn stats(&self) -> DataLayerStats {
        DataLayerStats {
            pool: self.pool().stats(),
            circuit: self.breaker().snapshot(),
            cache: self.cache().stats(),
            queries: self.policy.query_stats(),
        }
    }

    /// Push the current gauges to the Prometheus recorder
    pub fn record_metrics(&self, metrics: &AppMetrics) {
        let stats = self.stats();
        metrics.record_pool(&stats.pool);
        metrics.record_cache(&stats.cache);
    }

    /// Close every idle connection
    pub async fn shutdown(&self) -> usize {
        let closed = self.pool().purge().await;
        tracing::info!(closed, "Data layer shut down");
        closed
    }
}

impl<C: Connector> std::fmt::Debug for DataLayer<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DataLayer")
            .field("policy", &self.policy)
            .field("catalog", &self.catalog)
            .field("initialized", &self.is_initialized())
            .finish()
    }
}
