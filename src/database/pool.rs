//! Bounded connection pool
//!
//! The pool hands out [`PooledConnection`]s, validates them on the way out,
//! resets them on the way back in and recycles them once they reach
//! `max_lifetime`. `size` counts idle plus checked-out connections and never
//! exceeds `max_connections`. Emergency connections live outside that count.
//!
//! # Example
//!
//! ```rust,no_run
//! use resilient_db::config::{ConnectionConfig, PoolConfig};
//! use resilient_db::database::{ConnectionPool, SeaOrmConnector, Session};
//!
//! # async fn example() -> Result<(), resilient_db::database::DbError> {
//! let connector = SeaOrmConnector::new(&ConnectionConfig::default());
//! let pool = ConnectionPool::new(connector, PoolConfig::default());
//!
//! let rows = pool
//!     .with_connection(|session| Box::pin(async move { session.execute("SELECT 1").await }))
//!     .await?;
//! # Ok(())
//! # }
//! ```

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Instant;

use serde::Serialize;
use tokio::sync::Notify;

use super::connection::{Connector, PooledConnection, Session, SessionFuture};
use super::error::{classify, DbError, ErrorClass};
use crate::config::PoolConfig;

/// Point-in-time pool statistics
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PoolStats {
    /// Connections opened for the pool
    pub created: u64,
    /// Checkouts served by an idle connection
    pub reused: u64,
    /// Acquires that gave up waiting
    pub timeouts: u64,
    /// Failed connect attempts
    pub errors: u64,
    /// Connections closed by the pool
    pub closed: u64,
    /// Out-of-pool connections opened
    pub emergency: u64,
    pub size: usize,
    pub idle: usize,
    pub in_use: usize,
    pub max_connections: usize,
}

#[derive(Debug, Default)]
struct Counters {
    created: u64,
    reused: u64,
    timeouts: u64,
    errors: u64,
    closed: u64,
    emergency: u64,
}

struct PoolState<S> {
    idle: VecDeque<PooledConnection<S>>,
    size: usize,
    counters: Counters,
}

enum Checkout<S> {
    Idle(PooledConnection<S>),
    Grow,
    Full,
}

/// Bounded pool of datastore sessions
pub struct ConnectionPool<C: Connector> {
    connector: C,
    config: PoolConfig,
    state: Mutex<PoolState<C::Session>>,
    released: Notify,
    next_id: AtomicU64,
}

/// Slot accounting that is handed back if the holder goes away early
///
/// Covers both a slot reserved for a connection still being opened and a
/// checked-out connection whose operation, release or probe was cancelled
/// mid-flight.
struct SlotGuard<'p, C: Connector> {
    pool: &'p ConnectionPool<C>,
    armed: bool,
    checked_out: bool,
}

impl<'p, C: Connector> SlotGuard<'p, C> {
    fn reserved(pool: &'p ConnectionPool<C>) -> Self {
        Self { pool, armed: true, checked_out: false }
    }

    fn checked_out(pool: &'p ConnectionPool<C>, conn: &PooledConnection<C::Session>) -> Self {
        Self { pool, armed: !conn.is_emergency(), checked_out: true }
    }

    fn disarm(&mut self) {
        self.armed = false;
    }
}

impl<C: Connector> Drop for SlotGuard<'_, C> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        if self.checked_out {
            tracing::warn!("Checkout dropped mid-operation, discarding connection");
            self.pool.forget();
        } else {
            self.pool.release_slot();
        }
    }
}

impl<C: Connector> ConnectionPool<C> {
    pub fn new(connector: C, config: PoolConfig) -> Self {
        tracing::info!(
            max_connections = config.max_connections,
            acquire_timeout = ?config.acquire_timeout(),
            max_lifetime = ?config.max_lifetime(),
            "Initializing connection pool"
        );

        Self {
            connector,
            config,
            state: Mutex::new(PoolState {
                idle: VecDeque::new(),
                size: 0,
                counters: Counters::default(),
            }),
            released: Notify::new(),
            next_id: AtomicU64::new(1),
        }
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    pub fn connector(&self) -> &C {
        &self.connector
    }

    fn lock(&self) -> MutexGuard<'_, PoolState<C::Session>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn publish_gauges(state: &PoolState<C::Session>) {
        ::metrics::gauge!("db_pool_size").set(state.size as f64);
        ::metrics::gauge!("db_pool_idle").set(state.idle.len() as f64);
    }

    fn try_checkout(&self) -> Checkout<C::Session> {
        let mut state = self.lock();
        if let Some(conn) = state.idle.pop_back() {
            return Checkout::Idle(conn);
        }
        if state.size < self.config.max_connections {
            state.size += 1;
            Self::publish_gauges(&state);
            return Checkout::Grow;
        }
        Checkout::Full
    }

    /// Reserve a slot, or take the oldest idle connection whose slot can be reused
    fn try_reserve(&self) -> Checkout<C::Session> {
        let mut state = self.lock();
        if state.size < self.config.max_connections {
            state.size += 1;
            Self::publish_gauges(&state);
            return Checkout::Grow;
        }
        match state.idle.pop_front() {
            Some(conn) => {
                Self::publish_gauges(&state);
                Checkout::Idle(conn)
            }
            None => Checkout::Full,
        }
    }

    /// Give back a slot reserved for a connection that no longer exists
    fn release_slot(&self) {
        {
            let mut state = self.lock();
            state.size = state.size.saturating_sub(1);
            Self::publish_gauges(&state);
        }
        self.released.notify_one();
    }

    fn is_expired(&self, conn: &PooledConnection<C::Session>) -> bool {
        conn.age() >= self.config.max_lifetime()
    }

    /// Check out a connection, waiting up to `acquire_timeout` when the pool is full
    #[tracing::instrument(skip(self))]
    pub async fn acquire(&self) -> Result<PooledConnection<C::Session>, DbError> {
        let started = Instant::now();
        let deadline = started + self.config.acquire_timeout();

        loop {
            let notified = self.released.notified();
            tokio::pin!(notified);
            // Registered before inspecting the state so a release in between is not lost
            notified.as_mut().enable();

            match self.try_checkout() {
                Checkout::Idle(conn) => {
                    if let Some(conn) = self.validate(conn).await {
                        return Ok(conn);
                    }
                    continue;
                }
                Checkout::Grow => return self.open().await,
                Checkout::Full => {}
            }

            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() || tokio::time::timeout(remaining, notified).await.is_err() {
                return Err(self.exhausted(started));
            }
        }
    }

    /// Open a fresh connection for exclusive use, never one from the idle set
    ///
    /// A full pool makes room by closing its oldest idle connection.
    async fn acquire_dedicated(&self) -> Result<PooledConnection<C::Session>, DbError> {
        let started = Instant::now();
        let deadline = started + self.config.acquire_timeout();

        loop {
            let notified = self.released.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            match self.try_reserve() {
                Checkout::Grow => return self.open().await,
                Checkout::Idle(conn) => {
                    tracing::debug!(connection_id = conn.id(), "Closing idle connection to make room");
                    {
                        self.lock().counters.closed += 1;
                        ::metrics::counter!("db_pool_connections_closed_total").increment(1);
                    }
                    // The slot now belongs to the new connection
                    let mut slot = SlotGuard::reserved(self);
                    Self::close_session(conn).await;
                    slot.disarm();
                    return self.open().await;
                }
                Checkout::Full => {}
            }

            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() || tokio::time::timeout(remaining, notified).await.is_err() {
                return Err(self.exhausted(started));
            }
        }
    }

    fn exhausted(&self, started: Instant) -> DbError {
        let waited = started.elapsed();
        self.lock().counters.timeouts += 1;
        ::metrics::counter!("db_pool_acquire_timeouts_total").increment(1);
        tracing::warn!(waited = ?waited, "Connection pool exhausted");
        DbError::PoolExhausted { waited }
    }

    /// Probe an idle connection before handing it out
    async fn validate(&self, conn: PooledConnection<C::Session>) -> Option<PooledConnection<C::Session>> {
        if self.is_expired(&conn) {
            tracing::debug!(connection_id = conn.id(), age = ?conn.age(), "Recycling expired connection");
            self.discard(conn).await;
            return None;
        }

        let mut guard = SlotGuard::checked_out(self, &conn);
        let probe = conn.session().ping().await;
        guard.disarm();

        match probe {
            Ok(()) => {
                self.lock().counters.reused += 1;
                ::metrics::counter!("db_pool_connections_reused_total").increment(1);
                Some(conn)
            }
            Err(e) => {
                tracing::debug!(connection_id = conn.id(), error = %e, "Idle connection failed probe");
                self.discard(conn).await;
                None
            }
        }
    }

    /// Open a connection into an already reserved slot
    async fn open(&self) -> Result<PooledConnection<C::Session>, DbError> {
        let mut slot = SlotGuard::reserved(self);
        let session = self.connect_with_retries().await?;
        slot.disarm();

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.lock().counters.created += 1;
        ::metrics::counter!("db_pool_connections_created_total").increment(1);
        tracing::debug!(connection_id = id, "Opened pooled connection");

        Ok(PooledConnection::new(id, session, false))
    }

    async fn connect_with_retries(&self) -> Result<C::Session, DbError> {
        let mut attempt = 0;
        loop {
            match self.connector.connect().await {
                Ok(session) => return Ok(session),
                Err(e) => {
                    self.lock().counters.errors += 1;
                    let transient = classify(&e) == ErrorClass::Transient;
                    if !transient || attempt >= self.config.create_retries {
                        tracing::error!(error = %e, attempt = attempt + 1, "Failed to open database connection");
                        return Err(DbError::Connect(e));
                    }

                    attempt += 1;
                    let delay = self.config.create_retry_delay() * attempt;
                    tracing::warn!(error = %e, attempt, delay = ?delay, "Connect failed, retrying");
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    /// Return a connection to the pool
    ///
    /// Any open transaction is rolled back and the connection is probed before
    /// it becomes idle again. Broken, expired and emergency connections are
    /// closed instead.
    #[tracing::instrument(skip(self, conn), fields(connection_id = conn.id()))]
    pub async fn release(&self, conn: PooledConnection<C::Session>, broken: bool) {
        if conn.is_emergency() {
            Self::close_session(conn).await;
            return;
        }
        if broken || self.is_expired(&conn) {
            self.discard(conn).await;
            return;
        }

        let mut guard = SlotGuard::checked_out(self, &conn);

        if conn.session().in_transaction() {
            if let Err(e) = conn.session().rollback().await {
                tracing::warn!(error = %e, "Rollback on release failed, discarding connection");
                guard.disarm();
                self.discard(conn).await;
                return;
            }
        }

        let probe = conn.session().ping().await;
        guard.disarm();
        if let Err(e) = probe {
            tracing::debug!(error = %e, "Connection failed probe on release");
            self.discard(conn).await;
            return;
        }

        {
            let mut state = self.lock();
            state.idle.push_back(conn);
            Self::publish_gauges(&state);
        }
        self.released.notify_one();
    }

    /// Free a pooled connection's slot and close it
    async fn discard(&self, conn: PooledConnection<C::Session>) {
        self.forget();
        Self::close_session(conn).await;
    }

    /// Account for a pooled connection that is gone
    fn forget(&self) {
        self.lock().counters.closed += 1;
        ::metrics::counter!("db_pool_connections_closed_total").increment(1);
        self.release_slot();
    }

    async fn close_session(conn: PooledConnection<C::Session>) {
        let id = conn.id();
        if let Err(e) = conn.into_session().close().await {
            tracing::debug!(connection_id = id, error = %e, "Error while closing connection");
        }
    }

    /// Close every idle connection
    #[tracing::instrument(skip(self))]
    pub async fn purge(&self) -> usize {
        let drained: Vec<_> = {
            let mut state = self.lock();
            let drained: Vec<_> = state.idle.drain(..).collect();
            state.size = state.size.saturating_sub(drained.len());
            state.counters.closed += drained.len() as u64;
            Self::publish_gauges(&state);
            drained
        };

        let count = drained.len();
        for conn in drained {
            Self::close_session(conn).await;
        }
        if count > 0 {
            ::metrics::counter!("db_pool_connections_closed_total").increment(count as u64);
            self.released.notify_waiters();
        }

        tracing::info!(closed = count, "Purged idle connections");
        count
    }

    /// Probe idle connections and close the dead ones, keeping live ones
    #[tracing::instrument(skip(self))]
    pub async fn purge_dead(&self) -> usize {
        let candidates = self.lock().idle.len();

        let mut removed = 0;
        for _ in 0..candidates {
            let Some(conn) = self.lock().idle.pop_front() else {
                break;
            };

            let mut guard = SlotGuard::checked_out(self, &conn);
            let alive = !self.is_expired(&conn) && conn.session().ping().await.is_ok();
            guard.disarm();

            if alive {
                self.lock().idle.push_back(conn);
                self.released.notify_one();
            } else {
                removed += 1;
                self.discard(conn).await;
            }
        }

        if removed > 0 {
            tracing::info!(removed, "Removed dead idle connections");
        }
        removed
    }

    /// Open a connection outside the pool's size accounting
    #[tracing::instrument(skip(self))]
    pub async fn emergency_acquire(&self) -> Result<PooledConnection<C::Session>, DbError> {
        let session = self.connector.connect().await.map_err(|e| {
            tracing::error!(error = %e, "Emergency connection failed");
            DbError::Connect(e)
        })?;

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.lock().counters.emergency += 1;
        ::metrics::counter!("db_pool_emergency_connections_total").increment(1);
        tracing::warn!(connection_id = id, "Opened emergency connection");

        Ok(PooledConnection::new(id, session, true))
    }

    /// Run `f` on a checked-out connection, always releasing it
    ///
    /// A transient failure marks the connection broken, so it is rolled back
    /// and closed rather than returned to the idle set.
    pub async fn with_connection<F, T>(&self, f: F) -> Result<T, DbError>
    where
        F: for<'c> FnOnce(&'c C::Session) -> SessionFuture<'c, T>,
    {
        let conn = self.acquire().await?;
        self.run_on(conn, f).await
    }

    /// Run `f` on an emergency connection, which is closed afterwards
    pub async fn with_emergency_connection<F, T>(&self, f: F) -> Result<T, DbError>
    where
        F: for<'c> FnOnce(&'c C::Session) -> SessionFuture<'c, T>,
    {
        let conn = self.emergency_acquire().await?;
        self.run_on(conn, f).await
    }

    async fn run_on<F, T>(&self, conn: PooledConnection<C::Session>, f: F) -> Result<T, DbError>
    where
        F: for<'c> FnOnce(&'c C::Session) -> SessionFuture<'c, T>,
    {
        let mut guard = SlotGuard::checked_out(self, &conn);
        let result = f(conn.session()).await;

        match result {
            Ok(value) => {
                guard.disarm();
                self.release(conn, false).await;
                Ok(value)
            }
            Err(e) => {
                let broken = classify(&e) == ErrorClass::Transient;
                if broken && conn.session().in_transaction() {
                    if let Err(rollback) = conn.session().rollback().await {
                        tracing::debug!(error = %rollback, "Rollback before discard failed");
                    }
                }
                guard.disarm();
                self.release(conn, broken).await;
                Err(DbError::Query(e))
            }
        }
    }

    /// Run `f` inside a transaction on a dedicated connection
    ///
    /// The connection is opened fresh rather than taken from the idle set,
    /// counts against `size` while in use and is closed afterwards.
    #[tracing::instrument(skip(self, f))]
    pub async fn transaction<F, T>(&self, f: F) -> Result<T, DbError>
    where
        F: for<'c> FnOnce(&'c C::Session) -> SessionFuture<'c, T>,
    {
        let conn = self.acquire_dedicated().await?;
        let mut guard = SlotGuard::checked_out(self, &conn);
        let result = Self::run_transaction(conn.session(), f).await;
        guard.disarm();
        self.discard(conn).await;

        if result.is_ok() {
            tracing::debug!("Transaction committed successfully");
        }
        result
    }

    async fn run_transaction<F, T>(session: &C::Session, f: F) -> Result<T, DbError>
    where
        F: for<'c> FnOnce(&'c C::Session) -> SessionFuture<'c, T>,
    {
        session.begin().await.map_err(DbError::Transaction)?;

        match f(session).await {
            Ok(value) => {
                session.commit().await.map_err(DbError::Transaction)?;
                Ok(value)
            }
            Err(e) => {
                if let Err(rollback) = session.rollback().await {
                    tracing::warn!(error = %rollback, "Rollback failed");
                }
                Err(DbError::Query(e))
            }
        }
    }

    pub fn stats(&self) -> PoolStats {
        let state = self.lock();
        let idle = state.idle.len();
        PoolStats {
            created: state.counters.created,
            reused: state.counters.reused,
            timeouts: state.counters.timeouts,
            errors: state.counters.errors,
            closed: state.counters.closed,
            emergency: state.counters.emergency,
            size: state.size,
            idle,
            in_use: state.size.saturating_sub(idle),
            max_connections: self.config.max_connections,
        }
    }
}

impl<C: Connector> std::fmt::Debug for ConnectionPool<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionPool")
            .field("config", &self.config)
            .field("stats", &self.stats())
            .finish()
    }
}
