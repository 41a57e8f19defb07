//! Offline synchronization collaborator
//!
//! When the datastore cannot be reached the retry policy hands writes to an
//! [`OfflineSync`] queue and serves reads from whatever it cached earlier.
//! The collaborator is optional and every failure inside it is swallowed by
//! the caller: offline support degrades, it never breaks the request.

use anyhow::Result;
use async_trait::async_trait;
use serde_json::{json, Value};

#[async_trait]
pub trait OfflineSync: Send + Sync {
    /// Last known result of a read, if one was recorded
    async fn get_cached_read_result(&self, operation: &str, args: &Value) -> Result<Option<Value>>;

    /// Record the result of a successful read
    async fn cache_read_result(&self, operation: &str, args: &Value, result: &Value) -> Result<()>;

    /// Queue a write for replay once the datastore is back
    async fn enqueue_db_operation(&self, operation: &str, args: &Value) -> Result<()>;
}

/// Stable key for an operation and its arguments
///
/// Object keys serialize in sorted order, so equal arguments always produce
/// the same key regardless of how the caller built them.
pub fn operation_key(operation: &str, args: &Value) -> String {
    json!({ "func": operation, "args": args }).to_string()
}
