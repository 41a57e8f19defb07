//! Windowed circuit breaker for the datastore
//!
//! # State Machine
//!
//! ```text
//! ┌─────────┐
//! │ Closed  │ ◄──────────────────────┐
//! │ (Normal)│                        │
//! └────┬────┘                        │
//!      │ failure_threshold failures  │ any success
//!      │ inside window_seconds       │
//!      ▼                             │
//! ┌─────────┐  open_seconds   ┌──────┴────┐
//! │  Open   │────────────────►│ HalfOpen  │
//! │(Failing)│                 │ (Probing) │
//! └─────────┘◄────────────────└───────────┘
//!                probe failure
//! ```
//!
//! The breaker does not run operations itself. The retry policy asks
//! [`CircuitBreaker::is_open`] before touching the datastore and reports each
//! attempt that actually reached it through [`CircuitBreaker::register_failure`]
//! or [`CircuitBreaker::register_success`]. Calls short-circuited while open are
//! never reported, so they cannot keep the circuit open on their own.
//!
//! # Example
//!
//! ```rust
//! use resilient_db::config::CircuitBreakerConfig;
//! use resilient_db::resilience::CircuitBreaker;
//!
//! let breaker = CircuitBreaker::new("database", &CircuitBreakerConfig::default());
//!
//! for _ in 0..3 {
//!     breaker.register_failure();
//! }
//! assert!(breaker.is_open());
//!
//! breaker.register_success();
//! assert!(!breaker.is_open());
//! ```

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use serde::Serialize;
use tokio::time::Instant;

use crate::config::CircuitBreakerConfig;

/// Observable circuit state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum CircuitState {
    /// Normal operation, every call reaches the datastore
    Closed,
    /// Rejecting calls until the cool-down elapses
    Open,
    /// Cool-down elapsed, the next call is a probe
    HalfOpen,
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CircuitState::Closed => write!(f, "Closed"),
            CircuitState::Open => write!(f, "Open"),
            CircuitState::HalfOpen => write!(f, "HalfOpen"),
        }
    }
}

#[derive(Debug, Default)]
struct BreakerState {
    failure_count: u32,
    window_start: Option<Instant>,
    is_open: bool,
    open_until: Option<Instant>,
    /// Cool-down elapsed and no outcome reported since
    half_open: bool,
}

/// Serializable view of the breaker for health reporting
#[derive(Debug, Clone, Serialize)]
pub struct CircuitSnapshot {
    pub name: String,
    pub state: CircuitState,
    pub failure_count: u32,
    pub failure_threshold: u32,
    pub window_seconds: u64,
    pub open_seconds: u64,
    /// Remaining cool-down while open
    pub open_remaining_ms: Option<u64>,
    pub total_failures: u64,
    pub total_successes: u64,
    pub times_opened: u64,
}

/// Failure-counting circuit breaker
pub struct CircuitBreaker {
    name: String,
    enabled: bool,
    failure_threshold: u32,
    window: Duration,
    open_for: Duration,
    state: Mutex<BreakerState>,
    total_failures: AtomicU64,
    total_successes: AtomicU64,
    times_opened: AtomicU64,
}

impl CircuitBreaker {
    #[tracing::instrument(skip_all, fields(
        enabled = config.enabled,
        failure_threshold = config.failure_threshold,
        window_seconds = config.window_seconds,
        open_seconds = config.open_seconds
    ))]
    pub fn new(name: impl Into<String>, config: &CircuitBreakerConfig) -> Self {
        if !config.enabled {
            tracing::warn!("Database circuit breaker is disabled");
        }
        let mut breaker = Self::with_timing(name, config.failure_threshold, config.window(), config.open_for());
        breaker.enabled = config.enabled;
        breaker
    }

    /// Breaker with explicit timings, for sub-second windows
    pub fn with_timing(name: impl Into<String>, failure_threshold: u32, window: Duration, open_for: Duration) -> Self {
        Self {
            name: name.into(),
            enabled: true,
            failure_threshold: failure_threshold.max(1),
            window,
            open_for,
            state: Mutex::new(BreakerState::default()),
            total_failures: AtomicU64::new(0),
            total_successes: AtomicU64::new(0),
            times_opened: AtomicU64::new(0),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn lock(&self) -> MutexGuard<'_, BreakerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Whether calls should skip the datastore
    ///
    /// Once the cool-down has elapsed this flips the circuit to half-open and
    /// returns false, letting the next call through as a probe.
    pub fn is_open(&self) -> bool {
        if !self.enabled {
            return false;
        }

        let mut state = self.lock();
        if !state.is_open {
            return false;
        }

        let now = Instant::now();
        if state.open_until.is_some_and(|until| now >= until) {
            state.is_open = false;
            state.open_until = None;
            state.half_open = true;
            drop(state);

            ::metrics::gauge!("db_circuit_open").set(0.0);
            tracing::info!(
                circuit_breaker = %self.name,
                state = "Open -> HalfOpen",
                "Cool-down elapsed, allowing a probe"
            );
            return false;
        }
        true
    }

    /// Record an attempt that reached the datastore and failed transiently
    pub fn register_failure(&self) {
        if !self.enabled {
            return;
        }
        self.total_failures.fetch_add(1, Ordering::Relaxed);

        let now = Instant::now();
        let mut state = self.lock();

        if state.half_open {
            state.half_open = false;
            state.failure_count = self.failure_threshold;
            self.open(&mut state, now);
            drop(state);
            tracing::warn!(
                circuit_breaker = %self.name,
                state = "HalfOpen -> Open",
                open_seconds = self.open_for.as_secs(),
                "Probe failed, circuit re-opened"
            );
            return;
        }

        match state.window_start {
            Some(start) if now.duration_since(start) <= self.window => {
                state.failure_count += 1;
            }
            _ => {
                state.window_start = Some(now);
                state.failure_count = 1;
            }
        }

        if !state.is_open && state.failure_count >= self.failure_threshold {
            let failures = state.failure_count;
            self.open(&mut state, now);
            drop(state);
            tracing::warn!(
                circuit_breaker = %self.name,
                state = "Closed -> Open",
                consecutive_failures = failures,
                failure_threshold = self.failure_threshold,
                open_seconds = self.open_for.as_secs(),
                "Circuit breaker opened due to consecutive failures"
            );
        }
    }

    fn open(&self, state: &mut BreakerState, now: Instant) {
        state.is_open = true;
        state.open_until = Some(now + self.open_for);
        self.times_opened.fetch_add(1, Ordering::Relaxed);
        ::metrics::gauge!("db_circuit_open").set(1.0);
    }

    /// Record a successful attempt, fully resetting the breaker
    pub fn register_success(&self) {
        if !self.enabled {
            return;
        }
        self.total_successes.fetch_add(1, Ordering::Relaxed);

        let mut state = self.lock();
        let was_tripped = state.is_open || state.half_open;
        *state = BreakerState::default();
        drop(state);

        if was_tripped {
            ::metrics::gauge!("db_circuit_open").set(0.0);
            tracing::info!(
                circuit_breaker = %self.name,
                state = "-> Closed",
                "Circuit breaker closed after successful call"
            );
        }
    }

    /// Current state without triggering the half-open transition
    pub fn state(&self) -> CircuitState {
        let state = self.lock();
        if state.is_open {
            if state.open_until.is_some_and(|until| Instant::now() >= until) {
                CircuitState::HalfOpen
            } else {
                CircuitState::Open
            }
        } else if state.half_open {
            CircuitState::HalfOpen
        } else {
            CircuitState::Closed
        }
    }

    pub fn failure_count(&self) -> u32 {
        self.lock().failure_count
    }

    /// Force the breaker closed
    pub fn reset(&self) {
        *self.lock() = BreakerState::default();
        ::metrics::gauge!("db_circuit_open").set(0.0);
        tracing::info!(circuit_breaker = %self.name, "Circuit breaker manually reset to Closed");
    }

    pub fn snapshot(&self) -> CircuitSnapshot {
        let state = self.state();
        let (failure_count, open_remaining_ms) = {
            let inner = self.lock();
            let remaining = inner
                .open_until
                .filter(|_| inner.is_open)
                .map(|until| until.saturating_duration_since(Instant::now()).as_millis() as u64);
            (inner.failure_count, remaining)
        };

        CircuitSnapshot {
            name: self.name.clone(),
            state,
            failure_count,
            failure_threshold: self.failure_threshold,
            window_seconds: self.window.as_secs(),
            open_seconds: self.open_for.as_secs(),
            open_remaining_ms,
            total_failures: self.total_failures.load(Ordering::Relaxed),
            total_successes: self.total_successes.load(Ordering::Relaxed),
            times_opened: self.times_opened.load(Ordering::Relaxed),
        }
    }
}

impl fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CircuitBreaker")
            .field("name", &self.name)
            .field("enabled", &self.enabled)
            .field("state", &self.state())
            .field("failure_count", &self.failure_count())
            .field("failure_threshold", &self.failure_threshold)
            .field("window", &self.window)
            .field("open_for", &self.open_for)
            .finish()
    }
}
