//! Retrying execution wrapper
//!
//! [`RetryPolicy`] is the single entry point for datastore calls. It
//! short-circuits while the breaker is open, retries transient failures with
//! exponential backoff and jitter, tries one emergency connection once the
//! budget is spent, and finally degrades: reads fall back to the cache, the
//! offline store or the declared default, writes are queued for replay.
//!
//! Non-transient errors are never retried, never counted against the breaker
//! and always reach the caller unchanged.
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use resilient_db::config::AppConfig;
//! use resilient_db::database::{ConnectionPool, SeaOrmConnector, Session};
//! use resilient_db::cache::CacheManager;
//! use resilient_db::resilience::{CircuitBreaker, Operation, RetryPolicy};
//!
//! # async fn example() -> Result<(), resilient_db::database::DbError> {
//! let config = AppConfig::default();
//! let policy = RetryPolicy::new(
//!     Arc::new(ConnectionPool::new(SeaOrmConnector::new(&config.database), config.pool.clone())),
//!     Arc::new(CircuitBreaker::new("database", &config.resilience.circuit_breaker)),
//!     Arc::new(CacheManager::new(config.cache.clone())),
//!     config.resilience.retry.clone(),
//! );
//!
//! let op = Operation::<u64>::read("count_members").default_value(0);
//! let count = policy
//!     .execute(&op, |session| Box::pin(async move { session.execute("SELECT 1").await }))
//!     .await?;
//! # Ok(())
//! # }
//! ```

use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use tokio::time::Instant;

use super::circuit_breaker::CircuitBreaker;
use super::operation::{Operation, OperationKind};
use crate::cache::CacheManager;
use crate::config::RetryConfig;
use crate::database::{ConnectionPool, Connector, DbError, SessionFuture};
use crate::metrics::{QueryStats, QueryStatsSnapshot};
use crate::offline::OfflineSync;

/// Where a result came from
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome<T> {
    /// The datastore answered
    Applied(T),
    /// A read served from the cache or the offline store
    Cached(T),
    /// A read answered with its safe default
    Defaulted(T),
    /// A write queued for replay, answered with its safe default
    Queued(T),
}

impl<T> Outcome<T> {
    pub fn into_inner(self) -> T {
        match self {
            Outcome::Applied(value)
            | Outcome::Cached(value)
            | Outcome::Defaulted(value)
            | Outcome::Queued(value) => value,
        }
    }

    pub fn value(&self) -> &T {
        match self {
            Outcome::Applied(value)
            | Outcome::Cached(value)
            | Outcome::Defaulted(value)
            | Outcome::Queued(value) => value,
        }
    }

    /// Answered without the datastore
    pub fn is_degraded(&self) -> bool {
        !matches!(self, Outcome::Applied(_))
    }
}

/// Which kind of connection an attempt runs on
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Scope {
    Pooled,
    Transaction,
}

/// Retry, breaker and degradation around every datastore call
pub struct RetryPolicy<C: Connector> {
    pool: Arc<ConnectionPool<C>>,
    breaker: Arc<CircuitBreaker>,
    cache: Arc<CacheManager>,
    offline: Option<Arc<dyn OfflineSync>>,
    config: RetryConfig,
    read_category: String,
    query_stats: QueryStats,
}

/// Backoff before the retry that follows the given zero-based attempt
pub fn backoff_delay(config: &RetryConfig, attempt: u32) -> Duration {
    let delay = config.delay_for(attempt);
    let max_jitter = delay.as_secs_f64() * config.jitter;
    let jitter = if max_jitter > 0.0 {
        rand::thread_rng().gen_range(0.0..max_jitter)
    } else {
        0.0
    };
    delay + Duration::from_secs_f64(jitter)
}

impl<C: Connector> RetryPolicy<C> {
    pub fn new(
        pool: Arc<ConnectionPool<C>>,
        breaker: Arc<CircuitBreaker>,
        cache: Arc<CacheManager>,
        config: RetryConfig,
    ) -> Self {
        let read_category = cache.config().read_category.clone();
        let query_stats = QueryStats::new(Duration::from_millis(config.slow_query_threshold));

        Self {
            pool,
            breaker,
            cache,
            offline: None,
            config,
            read_category,
            query_stats,
        }
    }

    /// Attach the offline collaborator
    pub fn with_offline(mut self, offline: Arc<dyn OfflineSync>) -> Self {
        self.offline = Some(offline);
        self
    }

    pub fn pool(&self) -> &Arc<ConnectionPool<C>> {
        &self.pool
    }

    pub fn breaker(&self) -> &Arc<CircuitBreaker> {
        &self.breaker
    }

    pub fn cache(&self) -> &Arc<CacheManager> {
        &self.cache
    }

    pub fn config(&self) -> &RetryConfig {
        &self.config
    }

    pub fn query_stats(&self) -> QueryStatsSnapshot {
        self.query_stats.snapshot()
    }

    /// Run `f` and return its value, real or degraded
    pub async fn execute<T, F>(&self, op: &Operation<T>, f: F) -> Result<T, DbError>
    where
        T: Serialize + DeserializeOwned + Send,
        F: for<'c> Fn(&'c C::Session) -> SessionFuture<'c, T> + Sync,
    {
        self.execute_tagged(op, f).await.map(Outcome::into_inner)
    }

    /// Run `f`, reporting whether the value came from the datastore
    #[tracing::instrument(skip(self, op, f), fields(operation = %op.name(), kind = %op.kind()))]
    pub async fn execute_tagged<T, F>(&self, op: &Operation<T>, f: F) -> Result<Outcome<T>, DbError>
    where
        T: Serialize + DeserializeOwned + Send,
        F: for<'c> Fn(&'c C::Session) -> SessionFuture<'c, T> + Sync,
    {
        self.run(op, &f, Scope::Pooled).await
    }

    /// Like [`execute_tagged`](Self::execute_tagged), with each attempt in its own transaction
    #[tracing::instrument(skip(self, op, f), fields(operation = %op.name(), kind = %op.kind()))]
    pub async fn execute_in_transaction<T, F>(&self, op: &Operation<T>, f: F) -> Result<Outcome<T>, DbError>
    where
        T: Serialize + DeserializeOwned + Send,
        F: for<'c> Fn(&'c C::Session) -> SessionFuture<'c, T> + Sync,
    {
        self.run(op, &f, Scope::Transaction).await
    }

    async fn run<T, F>(&self, op: &Operation<T>, f: &F, scope: Scope) -> Result<Outcome<T>, DbError>
    where
        T: Serialize + DeserializeOwned + Send,
        F: for<'c> Fn(&'c C::Session) -> SessionFuture<'c, T> + Sync,
    {
        if self.breaker.is_open() {
            tracing::warn!("Circuit open, skipping datastore");
            return self.degrade(op, DbError::CircuitOpen).await;
        }

        let attempts = self.config.attempts();
        let halfway = attempts / 2;
        let mut last_error = None;

        for attempt in 0..attempts {
            if attempt > 0 && self.breaker.is_open() {
                tracing::warn!(attempt = attempt + 1, "Circuit opened while retrying");
                return self.degrade(op, last_error.unwrap_or(DbError::CircuitOpen)).await;
            }

            match self.attempt(op, f, scope).await {
                Ok(value) => {
                    if attempt > 0 {
                        tracing::info!(attempt = attempt + 1, "Succeeded after retry");
                    }
                    return Ok(self.applied(op, value).await);
                }
                Err(e) if !e.is_transient() => {
                    tracing::debug!(error = %e, "Non-transient error, not retrying");
                    return Err(e);
                }
                Err(e) => {
                    if !matches!(e, DbError::PoolExhausted { .. }) {
                        self.breaker.register_failure();
                    }
                    if e.is_disconnect() {
                        if attempt == halfway {
                            tracing::warn!("Repeated disconnects, rebuilding the pool");
                            self.pool.purge().await;
                        } else {
                            self.pool.purge_dead().await;
                        }
                    }

                    if attempt + 1 < attempts {
                        let delay = backoff_delay(&self.config, attempt);
                        ::metrics::counter!("db_operation_retries_total", "operation" => op.name().to_string())
                            .increment(1);
                        tracing::warn!(
                            attempt = attempt + 1,
                            max_attempts = attempts,
                            delay_ms = delay.as_millis() as u64,
                            error = %e,
                            "Transient datastore error, retrying"
                        );
                        tokio::time::sleep(delay).await;
                    } else {
                        tracing::error!(attempts, error = %e, "Retries exhausted");
                    }
                    last_error = Some(e);
                }
            }
        }

        let error = last_error.unwrap_or(DbError::CircuitOpen);

        if self.config.emergency_connection {
            match self.emergency_attempt(op, f).await {
                Ok(value) => return Ok(self.applied(op, value).await),
                Err(e) if !e.is_transient() && matches!(e, DbError::Query(_)) => return Err(e),
                Err(e) => {
                    tracing::warn!(error = %e, "Emergency connection failed");
                }
            }
        }

        self.degrade(op, error).await
    }

    async fn attempt<T, F>(&self, op: &Operation<T>, f: &F, scope: Scope) -> Result<T, DbError>
    where
        T: Send,
        F: for<'c> Fn(&'c C::Session) -> SessionFuture<'c, T> + Sync,
    {
        let started = Instant::now();
        let result = match scope {
            Scope::Pooled => self.pool.with_connection(f).await,
            Scope::Transaction => self.pool.transaction(f).await,
        };
        self.record(op.name(), started.elapsed(), &result);
        result
    }

    async fn emergency_attempt<T, F>(&self, op: &Operation<T>, f: &F) -> Result<T, DbError>
    where
        T: Send,
        F: for<'c> Fn(&'c C::Session) -> SessionFuture<'c, T> + Sync,
    {
        let started = Instant::now();
        let result = self.pool.with_emergency_connection(f).await;
        self.record(op.name(), started.elapsed(), &result);

        match &result {
            Ok(_) => {}
            Err(e) if e.is_transient() => self.breaker.register_failure(),
            Err(_) => {}
        }
        result
    }

    /// Attempts that reached the datastore count towards query statistics
    fn record<T>(&self, operation: &str, elapsed: Duration, result: &Result<T, DbError>) {
        match result {
            Ok(_) => self.query_stats.record(operation, elapsed, true),
            Err(DbError::Query(_)) | Err(DbError::Transaction(_)) => {
                self.query_stats.record(operation, elapsed, false)
            }
            Err(_) => {}
        }
    }

    async fn applied<T>(&self, op: &Operation<T>, value: T) -> Outcome<T>
    where
        T: Serialize,
    {
        if let Some(json) = self.on_success(op, &value) {
            self.offer_offline(op, &json).await;
        }
        Outcome::Applied(value)
    }

    /// Breaker and cache bookkeeping for a success; returns the read result
    /// to hand to the offline store, if there is one
    fn on_success<T>(&self, op: &Operation<T>, value: &T) -> Option<Value>
    where
        T: Serialize,
    {
        self.breaker.register_success();

        match op.kind() {
            OperationKind::Read => {
                let category = op.cache_category().unwrap_or(self.read_category.as_str());
                if let Err(e) = self.cache.set(category, &op.cache_key(), value) {
                    tracing::debug!(error = %e, "Could not cache read result");
                }

                self.offline.as_ref()?;
                match serde_json::to_value(value) {
                    Ok(json) => Some(json),
                    Err(e) => {
                        tracing::debug!(error = %e, "Read result is not representable as JSON");
                        None
                    }
                }
            }
            OperationKind::Write => {
                self.cache.invalidate_many(op.invalidated_categories());
                None
            }
        }
    }

    async fn offer_offline<T>(&self, op: &Operation<T>, result: &Value) {
        if let Some(offline) = &self.offline {
            if let Err(e) = offline.cache_read_result(op.name(), op.arguments(), result).await {
                tracing::debug!(error = %e, "Offline store rejected read result");
            }
        }
    }

    /// Safe default: the declared one, or a value synthesized from JSON null
    fn safe_default<T>(&self, op: &Operation<T>) -> Option<T>
    where
        T: DeserializeOwned,
    {
        op.declared_default()
            .or_else(|| serde_json::from_value(Value::Null).ok())
    }

    async fn degrade<T>(&self, op: &Operation<T>, error: DbError) -> Result<Outcome<T>, DbError>
    where
        T: DeserializeOwned,
    {
        ::metrics::counter!("db_operation_degraded_total", "kind" => op.kind().to_string()).increment(1);

        match op.kind() {
            OperationKind::Read => {
                let category = op.cache_category().unwrap_or(self.read_category.as_str());
                match self.cache.get::<T>(category, &op.cache_key()) {
                    Ok(Some(value)) => {
                        tracing::warn!(error = %error, "Serving cached read");
                        return Ok(Outcome::Cached(value));
                    }
                    Ok(None) => {}
                    Err(e) => tracing::debug!(error = %e, "Cached read unusable"),
                }

                if let Some(value) = self.offline_read(op).await {
                    tracing::warn!(error = %error, "Serving offline read");
                    return Ok(Outcome::Cached(value));
                }

                match self.safe_default(op) {
                    Some(value) => {
                        tracing::warn!(error = %error, "Serving safe default");
                        Ok(Outcome::Defaulted(value))
                    }
                    None => Err(error),
                }
            }
            OperationKind::Write => {
                let Some(offline) = &self.offline else {
                    return Err(error);
                };
                // Nothing to answer with, so the write must not be queued either
                let Some(value) = self.safe_default(op) else {
                    tracing::debug!(operation = op.name(), "Write has no safe default, not queueing");
                    return Err(error);
                };

                if let Err(e) = offline.enqueue_db_operation(op.name(), op.arguments()).await {
                    tracing::warn!(error = %e, original = %error, "Could not queue write for replay");
                    return Err(error);
                }

                tracing::warn!(error = %error, "Write queued for replay");
                Ok(Outcome::Queued(value))
            }
        }
    }

    async fn offline_read<T>(&self, op: &Operation<T>) -> Option<T>
    where
        T: DeserializeOwned,
    {
        let offline = self.offline.as_ref()?;
        match offline.get_cached_read_result(op.name(), op.arguments()).await {
            Ok(Some(json)) => match serde_json::from_value(json) {
                Ok(value) => Some(value),
                Err(e) => {
                    tracing::debug!(error = %e, "Offline read does not fit the result type");
                    None
                }
            },
            Ok(None) => None,
            Err(e) => {
                tracing::warn!(error = %e, "Offline store unavailable");
                None
            }
        }
    }
}

impl<C: Connector> std::fmt::Debug for RetryPolicy<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RetryPolicy")
            .field("config", &self.config)
            .field("breaker", &self.breaker)
            .field("pool", &self.pool)
            .field("offline", &self.offline.is_some())
            .finish()
    }
}
