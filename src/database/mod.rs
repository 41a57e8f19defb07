//! Pooled, classified access to the remote datastore
//!
//! [`ConnectionPool`] owns the sessions, [`Connector`] and [`Session`] are the
//! seam to the actual backend, and [`DbError`] tells callers whether a failure
//! is worth retrying.

mod connection;
mod error;
mod pool;

pub use connection::{Connector, PooledConnection, SeaOrmConnector, SeaOrmSession, Session, SessionFuture};
pub use error::{classify, is_disconnect, DbError, ErrorClass};
pub use pool::{ConnectionPool, PoolStats};
