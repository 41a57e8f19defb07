//! Resilience patterns around the remote datastore
//!
//! - **Circuit Breaker**: stops sending calls to a datastore that keeps
//!   failing, giving it time to recover.
//! - **Retry Policy**: retries transient failures with backoff and degrades
//!   to cached, offline or default values when the datastore stays away.
//! - **Operations**: describe a call (name, arguments, read or write, safe
//!   default) so the policy knows how to degrade it.
//!
//! # Example
//!
//! ```rust
//! use std::time::Duration;
//! use resilient_db::resilience::{CircuitBreaker, CircuitState};
//!
//! let breaker = CircuitBreaker::with_timing("database", 3, Duration::from_secs(20), Duration::from_secs(25));
//! for _ in 0..3 {
//!     breaker.register_failure();
//! }
//! assert!(breaker.is_open());
//! assert_eq!(breaker.state(), CircuitState::Open);
//! ```

mod circuit_breaker;
mod operation;
mod retry;

pub use circuit_breaker::{CircuitBreaker, CircuitSnapshot, CircuitState};
pub use operation::{legacy_default, legacy_kind, Operation, OperationCatalog, OperationKind};
pub use retry::{backoff_delay, Outcome, RetryPolicy};
