pub mod app;
pub mod cache;
pub mod database;
pub mod resilience;

use thiserror::Error;

pub use app::{AppConfig, AppMetadata, ObservabilityConfig};
pub use cache::{CacheConfig, CategoryPolicy};
pub use database::{ConnectionConfig, PoolConfig, SessionOptions};
pub use resilience::{CircuitBreakerConfig, ResilienceConfig, RetryConfig};

/// Configuration loading or validation failure
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to load configuration: {0}")]
    Load(#[from] ::config::ConfigError),

    #[error("Invalid configuration: {0}")]
    ValidationError(String),
}

/// Configuration sections check their own invariants
pub trait Validate {
    fn validate(&self) -> Result<(), ConfigError>;
}

/// Load the configuration from files and environment variables
pub fn load() -> Result<AppConfig, ConfigError> {
    app::load_config()
}
