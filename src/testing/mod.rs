//! Test doubles and setup helpers
//!
//! Always compiled so the integration tests under `tests/` can use them.

mod mock;
mod offline;
pub mod setup;

pub use mock::{MockConnector, MockServer, MockSession};
pub use offline::RecordingOfflineSync;
