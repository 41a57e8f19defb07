//! Error taxonomy for the data-access layer
//!
//! Every failure is either [`ErrorClass::Transient`] (transport trouble that a
//! retry, a fresh connection or a degraded response can paper over) or
//! [`ErrorClass::Permanent`] (constraint violations, permission problems,
//! malformed statements) which must reach the caller untouched.

use std::time::Duration;

use once_cell::sync::Lazy;
use regex::Regex;
use sea_orm::DbErr;
use thiserror::Error;

/// Database access error
#[derive(Error, Debug)]
pub enum DbError {
    /// Circuit breaker rejected the call before touching the datastore
    #[error("Database circuit breaker is open, service temporarily unavailable")]
    CircuitOpen,

    /// No connection was released within the acquire timeout
    #[error("Connection pool exhausted, no connection released within {waited:?}")]
    PoolExhausted { waited: Duration },

    /// Opening a new connection failed
    #[error("Database connection error: {0}")]
    Connect(#[source] DbErr),

    /// Database operation failed
    #[error("Database operation failed: {0}")]
    Query(#[from] DbErr),

    /// Begin/commit/rollback failed
    #[error("Transaction error: {0}")]
    Transaction(#[source] DbErr),
}

/// Whether an error may go away on its own
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    Transient,
    Permanent,
}

static TRANSIENT_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(concat!(
        r"(?i)connection (reset|refused|closed|timed out|lost|aborted)",
        r"|could not connect|server closed the connection|terminating connection",
        r"|broken pipe|timed out|timeout|network|unexpected eof|end of file",
        r"|ssl connection has been closed|no route to host|pool (timed out|closed)",
    ))
    .expect("transient error pattern is valid")
});

static DISCONNECT_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(concat!(
        r"(?i)server closed the connection|terminating connection|connection reset",
        r"|broken pipe|ssl connection has been closed|connection (closed|lost)|unexpected eof",
    ))
    .expect("disconnect error pattern is valid")
});

static PERMANENT_CONNECT_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(concat!(
        r"(?i)password authentication failed|authentication failed|permission denied",
        r"|no pg_hba\.conf entry|database .* does not exist|role .* does not exist",
        r"|invalid (connection string|url)|unsupported (scheme|database)",
    ))
    .expect("permanent connect pattern is valid")
});

/// Classify a raw sea-orm error
pub fn classify(err: &DbErr) -> ErrorClass {
    match err {
        DbErr::ConnectionAcquire(_) => ErrorClass::Transient,
        DbErr::Conn(_) => {
            if PERMANENT_CONNECT_PATTERN.is_match(&err.to_string()) {
                ErrorClass::Permanent
            } else {
                ErrorClass::Transient
            }
        }
        _ => {
            if TRANSIENT_PATTERN.is_match(&err.to_string()) {
                ErrorClass::Transient
            } else {
                ErrorClass::Permanent
            }
        }
    }
}

/// Whether a raw sea-orm error looks like the server dropped the session
pub fn is_disconnect(err: &DbErr) -> bool {
    DISCONNECT_PATTERN.is_match(&err.to_string())
}

impl DbError {
    pub fn class(&self) -> ErrorClass {
        match self {
            DbError::CircuitOpen => ErrorClass::Permanent,
            DbError::PoolExhausted { .. } => ErrorClass::Transient,
            DbError::Connect(err) | DbError::Query(err) | DbError::Transaction(err) => classify(err),
        }
    }

    pub fn is_transient(&self) -> bool {
        self.class() == ErrorClass::Transient
    }

    /// Hard server-side disconnect, the idle set is probably full of dead sessions
    pub fn is_disconnect(&self) -> bool {
        match self {
            DbError::Connect(err) | DbError::Query(err) | DbError::Transaction(err) => is_disconnect(err),
            DbError::CircuitOpen | DbError::PoolExhausted { .. } => false,
        }
    }
}
