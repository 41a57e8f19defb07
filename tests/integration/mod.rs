//! Integration tests for the resilient data layer
//!
//! Every test drives the public API against the scripted datastore from
//! `resilient_db::testing`, so no server is needed.

pub mod degraded_test;
pub mod pool_test;
pub mod retry_test;
