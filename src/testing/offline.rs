use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, PoisonError};

use anyhow::{bail, Result};
use async_trait::async_trait;
use serde_json::Value;

use crate::offline::{operation_key, OfflineSync};

/// In-memory offline collaborator that records what it was asked to do
#[derive(Debug, Default)]
pub struct RecordingOfflineSync {
    reads: Mutex<HashMap<String, Value>>,
    queued: Mutex<Vec<(String, Value)>>,
    failing: AtomicBool,
}

impl RecordingOfflineSync {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a cached read as if it had been recorded earlier
    pub fn seed_read(&self, operation: &str, args: &Value, result: Value) {
        self.reads
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(operation_key(operation, args), result);
    }

    /// Make every call fail
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// Writes queued so far, oldest first
    pub fn queued(&self) -> Vec<(String, Value)> {
        self.queued.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub fn cached_reads(&self) -> usize {
        self.reads.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    fn check(&self) -> Result<()> {
        if self.failing.load(Ordering::SeqCst) {
            bail!("offline store unavailable");
        }
        Ok(())
    }
}

#[async_trait]
impl OfflineSync for RecordingOfflineSync {
    async fn get_cached_read_result(&self, operation: &str, args: &Value) -> Result<Option<Value>> {
        self.check()?;
        let reads = self.reads.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(reads.get(&operation_key(operation, args)).cloned())
    }

    async fn cache_read_result(&self, operation: &str, args: &Value, result: &Value) -> Result<()> {
        self.check()?;
        self.reads
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(operation_key(operation, args), result.clone());
        Ok(())
    }

    async fn enqueue_db_operation(&self, operation: &str, args: &Value) -> Result<()> {
        self.check()?;
        self.queued
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push((operation.to_string(), args.clone()));
        Ok(())
    }
}
