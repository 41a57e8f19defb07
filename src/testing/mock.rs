//! Scripted datastore for exercising the pool and the retry policy
//!
//! A [`MockServer`] is shared between the test and every session it hands
//! out. Tests flip it down, kill individual sessions, make the next connects
//! or statements fail, and then read back counters to see what the pool did.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use sea_orm::{DbErr, RuntimeErr};

use crate::database::{Connector, Session};

const REFUSED: &str = "Connection refused (os error 111)";
const DROPPED: &str = "server closed the connection unexpectedly";
const AUTH_FAILED: &str = "password authentication failed for user \"gym\"";

#[derive(Debug, Default)]
struct ServerState {
    down: AtomicBool,
    reject_credentials: AtomicBool,
    failing_connects: AtomicU32,
    failing_statements: AtomicU32,
    latency_ms: AtomicU64,
    ping_latency_ms: AtomicU64,
    next_id: AtomicU64,
    connects: AtomicU64,
    pings: AtomicU64,
    statements: AtomicU64,
    commits: AtomicU64,
    rollbacks: AtomicU64,
    sessions: Mutex<HashMap<u64, Arc<AtomicBool>>>,
}

impl ServerState {
    fn sessions(&self) -> std::sync::MutexGuard<'_, HashMap<u64, Arc<AtomicBool>>> {
        self.sessions.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn take_one(counter: &AtomicU32) -> bool {
        counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

/// Handle to the scripted datastore
#[derive(Debug, Clone, Default)]
pub struct MockServer {
    state: Arc<ServerState>,
}

impl MockServer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn connector(&self) -> MockConnector {
        MockConnector {
            state: Arc::clone(&self.state),
        }
    }

    /// Take the server down (killing every session) or bring it back
    pub fn set_down(&self, down: bool) {
        self.state.down.store(down, Ordering::SeqCst);
        if down {
            self.kill_sessions();
        }
    }

    pub fn reject_credentials(&self, reject: bool) {
        self.state.reject_credentials.store(reject, Ordering::SeqCst);
    }

    /// Refuse the next `n` connects
    pub fn fail_next_connects(&self, n: u32) {
        self.state.failing_connects.store(n, Ordering::SeqCst);
    }

    /// Drop the next `n` statements as if the server hung up mid-query
    pub fn fail_next_statements(&self, n: u32) {
        self.state.failing_statements.store(n, Ordering::SeqCst);
    }

    /// Delay applied to every statement
    pub fn set_latency(&self, latency: Duration) {
        self.state.latency_ms.store(latency.as_millis() as u64, Ordering::SeqCst);
    }

    /// Delay applied to every liveness probe
    pub fn set_ping_latency(&self, latency: Duration) {
        self.state.ping_latency_ms.store(latency.as_millis() as u64, Ordering::SeqCst);
    }

    /// Server-side termination of every open session
    pub fn kill_sessions(&self) {
        for alive in self.state.sessions().values() {
            alive.store(false, Ordering::SeqCst);
        }
    }

    pub fn kill_session(&self, id: u64) {
        if let Some(alive) = self.state.sessions().get(&id) {
            alive.store(false, Ordering::SeqCst);
        }
    }

    pub fn connects(&self) -> u64 {
        self.state.connects.load(Ordering::SeqCst)
    }

    pub fn pings(&self) -> u64 {
        self.state.pings.load(Ordering::SeqCst)
    }

    pub fn statements(&self) -> u64 {
        self.state.statements.load(Ordering::SeqCst)
    }

    pub fn commits(&self) -> u64 {
        self.state.commits.load(Ordering::SeqCst)
    }

    pub fn rollbacks(&self) -> u64 {
        self.state.rollbacks.load(Ordering::SeqCst)
    }

    /// Sessions opened and not yet closed
    pub fn open_sessions(&self) -> usize {
        self.state.sessions().len()
    }
}

#[derive(Debug, Clone)]
pub struct MockConnector {
    state: Arc<ServerState>,
}

#[async_trait]
impl Connector for MockConnector {
    type Session = MockSession;

    async fn connect(&self) -> Result<MockSession, DbErr> {
        self.state.connects.fetch_add(1, Ordering::SeqCst);

        if self.state.reject_credentials.load(Ordering::SeqCst) {
            return Err(DbErr::Conn(RuntimeErr::Internal(AUTH_FAILED.to_string())));
        }
        if self.state.down.load(Ordering::SeqCst) || ServerState::take_one(&self.state.failing_connects) {
            return Err(DbErr::Conn(RuntimeErr::Internal(REFUSED.to_string())));
        }

        let id = self.state.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        let alive = Arc::new(AtomicBool::new(true));
        self.state.sessions().insert(id, Arc::clone(&alive));

        Ok(MockSession {
            id,
            alive,
            in_transaction: AtomicBool::new(false),
            state: Arc::clone(&self.state),
        })
    }
}

#[derive(Debug)]
pub struct MockSession {
    id: u64,
    alive: Arc<AtomicBool>,
    in_transaction: AtomicBool,
    state: Arc<ServerState>,
}

impl MockSession {
    /// Server-side session id, as used by [`MockServer::kill_session`]
    pub fn id(&self) -> u64 {
        self.id
    }

    fn check(&self) -> Result<(), DbErr> {
        if self.state.down.load(Ordering::SeqCst) || !self.alive.load(Ordering::SeqCst) {
            return Err(DbErr::Conn(RuntimeErr::Internal(DROPPED.to_string())));
        }
        Ok(())
    }

    async fn latency(&self) {
        Self::delay(&self.state.latency_ms).await;
    }

    async fn delay(ms: &AtomicU64) {
        let ms = ms.load(Ordering::SeqCst);
        if ms > 0 {
            tokio::time::sleep(Duration::from_millis(ms)).await;
        }
    }
}

#[async_trait]
impl Session for MockSession {
    async fn ping(&self) -> Result<(), DbErr> {
        self.state.pings.fetch_add(1, Ordering::SeqCst);
        Self::delay(&self.state.ping_latency_ms).await;
        self.check()
    }

    async fn execute(&self, _sql: &str) -> Result<u64, DbErr> {
        self.latency().await;
        self.check()?;
        if ServerState::take_one(&self.state.failing_statements) {
            return Err(DbErr::Query(RuntimeErr::Internal(DROPPED.to_string())));
        }
        self.state.statements.fetch_add(1, Ordering::SeqCst);
        Ok(1)
    }

    async fn begin(&self) -> Result<(), DbErr> {
        self.check()?;
        self.in_transaction.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn commit(&self) -> Result<(), DbErr> {
        self.check()?;
        self.in_transaction.store(false, Ordering::SeqCst);
        self.state.commits.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn rollback(&self) -> Result<(), DbErr> {
        self.in_transaction.store(false, Ordering::SeqCst);
        self.check()?;
        self.state.rollbacks.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn in_transaction(&self) -> bool {
        self.in_transaction.load(Ordering::SeqCst)
    }

    async fn close(self) -> Result<(), DbErr> {
        self.state.sessions().remove(&self.id);
        Ok(())
    }
}
