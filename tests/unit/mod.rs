pub mod cache_test;
pub mod circuit_test;
