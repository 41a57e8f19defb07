//! Connections to the remote datastore
//!
//! The pool never talks to sea-orm directly. It opens sessions through a
//! [`Connector`] and drives them through the [`Session`] trait, so the same
//! pool runs against a live server ([`SeaOrmConnector`]) or the scripted
//! backend in [`crate::testing`].

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use futures_util::future::BoxFuture;
use sea_orm::{ConnectOptions, ConnectionTrait, Database, DatabaseBackend, DatabaseConnection, DbErr};

use crate::config::ConnectionConfig;

/// Future returned by operations that run against a checked-out session
pub type SessionFuture<'c, T> = BoxFuture<'c, Result<T, DbErr>>;

/// One physical session with the datastore
#[async_trait]
pub trait Session: Send + Sync + 'static {
    /// Cheap liveness probe
    async fn ping(&self) -> Result<(), DbErr>;

    /// Run a statement, returning the affected row count
    async fn execute(&self, sql: &str) -> Result<u64, DbErr>;

    async fn begin(&self) -> Result<(), DbErr>;

    async fn commit(&self) -> Result<(), DbErr>;

    async fn rollback(&self) -> Result<(), DbErr>;

    /// Whether a transaction was opened and not yet finished
    fn in_transaction(&self) -> bool;

    async fn close(self) -> Result<(), DbErr>;
}

/// Opens new sessions
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    type Session: Session;

    async fn connect(&self) -> Result<Self::Session, DbErr>;
}

/// A session owned by the pool, plus its bookkeeping
#[derive(Debug)]
pub struct PooledConnection<S> {
    id: u64,
    session: S,
    created_at: Instant,
    emergency: bool,
}

impl<S: Session> PooledConnection<S> {
    pub(crate) fn new(id: u64, session: S, emergency: bool) -> Self {
        Self {
            id,
            session,
            created_at: Instant::now(),
            emergency,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn session(&self) -> &S {
        &self.session
    }

    pub fn age(&self) -> Duration {
        self.created_at.elapsed()
    }

    /// Opened outside the pool's accounting, always closed on release
    pub fn is_emergency(&self) -> bool {
        self.emergency
    }

    pub(crate) fn into_session(self) -> S {
        self.session
    }
}

/// sea-orm backed connector
///
/// Each session wraps a single-connection sea-orm pool so that `BEGIN`,
/// `COMMIT` and session options always land on the same physical connection.
#[derive(Debug, Clone)]
pub struct SeaOrmConnector {
    url: String,
    connect_timeout: Duration,
    statements: Vec<String>,
}

impl SeaOrmConnector {
    pub fn new(config: &ConnectionConfig) -> Self {
        Self {
            url: config.database_url(),
            connect_timeout: config.connect_timeout(),
            statements: config.session_statements(),
        }
    }

    /// Connector for a bare URL without session options
    pub fn from_url(url: impl Into<String>, connect_timeout: Duration) -> Self {
        Self {
            url: url.into(),
            connect_timeout,
            statements: Vec::new(),
        }
    }

    fn options(&self) -> ConnectOptions {
        let mut options = ConnectOptions::new(self.url.clone());
        options
            .max_connections(1)
            .min_connections(1)
            .connect_timeout(self.connect_timeout)
            .acquire_timeout(self.connect_timeout)
            .sqlx_logging(false);
        options
    }
}

#[async_trait]
impl Connector for SeaOrmConnector {
    type Session = SeaOrmSession;

    #[tracing::instrument(skip(self), fields(timeout = ?self.connect_timeout))]
    async fn connect(&self) -> Result<SeaOrmSession, DbErr> {
        let db = Database::connect(self.options()).await?;

        if db.get_database_backend() == DatabaseBackend::Postgres {
            for statement in &self.statements {
                // Best-effort, the session stays usable without the option
                if let Err(e) = db.execute_unprepared(statement).await {
                    tracing::debug!(statement = %statement, error = %e, "Session option ignored");
                }
            }
        }

        tracing::debug!("Opened database session");
        Ok(SeaOrmSession {
            db,
            in_transaction: AtomicBool::new(false),
        })
    }
}

/// A live sea-orm session
#[derive(Debug)]
pub struct SeaOrmSession {
    db: DatabaseConnection,
    in_transaction: AtomicBool,
}

impl SeaOrmSession {
    /// Underlying sea-orm connection, for entity and statement APIs
    pub fn connection(&self) -> &DatabaseConnection {
        &self.db
    }
}

#[async_trait]
impl Session for SeaOrmSession {
    async fn ping(&self) -> Result<(), DbErr> {
        self.db.ping().await
    }

    async fn execute(&self, sql: &str) -> Result<u64, DbErr> {
        let result = self.db.execute_unprepared(sql).await?;
        Ok(result.rows_affected())
    }

    async fn begin(&self) -> Result<(), DbErr> {
        self.db.execute_unprepared("BEGIN").await?;
        self.in_transaction.store(true, Ordering::Release);
        Ok(())
    }

    async fn commit(&self) -> Result<(), DbErr> {
        self.db.execute_unprepared("COMMIT").await?;
        self.in_transaction.store(false, Ordering::Release);
        Ok(())
    }

    async fn rollback(&self) -> Result<(), DbErr> {
        let result = self.db.execute_unprepared("ROLLBACK").await;
        self.in_transaction.store(false, Ordering::Release);
        result.map(|_| ())
    }

    fn in_transaction(&self) -> bool {
        self.in_transaction.load(Ordering::Acquire)
    }

    async fn close(self) -> Result<(), DbErr> {
        self.db.close().await
    }
}
