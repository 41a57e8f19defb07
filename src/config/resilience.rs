use serde::{Deserialize, Serialize};
use std::time::Duration;

use super::{ConfigError, Validate};

/// Resilience configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[derive(Default)]
pub struct ResilienceConfig {
    /// Circuit breaker configuration
    #[serde(default = "CircuitBreakerConfig::default")]
    pub circuit_breaker: CircuitBreakerConfig,
    /// Retry configuration
    #[serde(default = "RetryConfig::default")]
    pub retry: RetryConfig,
}

/// Circuit breaker configuration
///
/// Overridable through `DB_CB_FAILURE_THRESHOLD`, `DB_CB_WINDOW_SECONDS` and
/// `DB_CB_OPEN_SECONDS`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CircuitBreakerConfig {
    /// Enable circuit breaker
    #[serde(default = "default_circuit_breaker_enabled")]
    pub enabled: bool,
    /// Consecutive failures inside the window before opening the circuit
    #[serde(default = "default_circuit_breaker_failure_threshold")]
    pub failure_threshold: u32,
    /// Rolling window, measured from the first tracked failure
    #[serde(default = "default_circuit_breaker_window_seconds")]
    pub window_seconds: u64,
    /// Cool-down before the next call is let through as a probe
    #[serde(default = "default_circuit_breaker_open_seconds")]
    pub open_seconds: u64,
}

/// Retry configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Retries after the first attempt (total attempts = max_retries + 1)
    #[serde(default = "default_retry_max_retries")]
    pub max_retries: u32,
    /// Initial delay in milliseconds
    #[serde(default = "default_retry_initial_delay")]
    pub initial_delay: u64,
    /// Maximum delay in milliseconds
    #[serde(default = "default_retry_max_delay")]
    pub max_delay: u64,
    /// Multiplier for exponential backoff
    #[serde(default = "default_retry_multiplier")]
    pub multiplier: f64,
    /// Upper bound of the random jitter, as a fraction of the delay
    #[serde(default = "default_retry_jitter")]
    pub jitter: f64,
    /// Try one out-of-pool connection once retries are exhausted
    #[serde(default = "default_retry_emergency_connection")]
    pub emergency_connection: bool,
    /// Queries slower than this (milliseconds) are counted as slow
    #[serde(default = "default_retry_slow_query_threshold")]
    pub slow_query_threshold: u64,
}

// Default functions for CircuitBreakerConfig
fn default_circuit_breaker_enabled() -> bool {
    true
}

fn default_circuit_breaker_failure_threshold() -> u32 {
    3
}

fn default_circuit_breaker_window_seconds() -> u64 {
    20
}

fn default_circuit_breaker_open_seconds() -> u64 {
    25
}

// Default functions for RetryConfig
fn default_retry_max_retries() -> u32 {
    2
}

fn default_retry_initial_delay() -> u64 {
    500 // milliseconds
}

fn default_retry_max_delay() -> u64 {
    5000 // milliseconds
}

fn default_retry_multiplier() -> f64 {
    2.0
}

fn default_retry_jitter() -> f64 {
    0.1
}

fn default_retry_emergency_connection() -> bool {
    true
}

fn default_retry_slow_query_threshold() -> u64 {
    1000 // milliseconds
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            enabled: default_circuit_breaker_enabled(),
            failure_threshold: default_circuit_breaker_failure_threshold(),
            window_seconds: default_circuit_breaker_window_seconds(),
            open_seconds: default_circuit_breaker_open_seconds(),
        }
    }
}

impl CircuitBreakerConfig {
    pub fn window(&self) -> Duration {
        Duration::from_secs(self.window_seconds)
    }

    pub fn open_for(&self) -> Duration {
        Duration::from_secs(self.open_seconds)
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: default_retry_max_retries(),
            initial_delay: default_retry_initial_delay(),
            max_delay: default_retry_max_delay(),
            multiplier: default_retry_multiplier(),
            jitter: default_retry_jitter(),
            emergency_connection: default_retry_emergency_connection(),
            slow_query_threshold: default_retry_slow_query_threshold(),
        }
    }
}

impl RetryConfig {
    /// Total number of pooled attempts per call
    pub fn attempts(&self) -> u32 {
        self.max_retries + 1
    }

    /// Backoff before retrying after the given zero-based attempt, without jitter
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = self.multiplier.powi(attempt as i32);
        let delay = (self.initial_delay as f64 * factor).min(self.max_delay as f64);
        Duration::from_millis(delay as u64)
    }
}

impl Validate for ResilienceConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        self.circuit_breaker.validate()?;
        self.retry.validate()?;
        Ok(())
    }
}

impl Validate for CircuitBreakerConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        if self.enabled && self.failure_threshold == 0 {
            return Err(ConfigError::ValidationError("resilience.circuit_breaker.failure_threshold must be > 0 when circuit breaker is enabled".to_string()));
        }
        if self.enabled && self.window_seconds == 0 {
            return Err(ConfigError::ValidationError("resilience.circuit_breaker.window_seconds must be > 0 when circuit breaker is enabled".to_string()));
        }
        if self.enabled && self.open_seconds == 0 {
            return Err(ConfigError::ValidationError("resilience.circuit_breaker.open_seconds must be > 0 when circuit breaker is enabled".to_string()));
        }
        Ok(())
    }
}

impl Validate for RetryConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        if self.initial_delay == 0 {
            return Err(ConfigError::ValidationError("resilience.retry.initial_delay must be > 0".to_string()));
        }
        if self.max_delay == 0 {
            return Err(ConfigError::ValidationError("resilience.retry.max_delay must be > 0".to_string()));
        }
        if self.initial_delay > self.max_delay {
            return Err(ConfigError::ValidationError("resilience.retry.initial_delay must be <= max_delay".to_string()));
        }
        if self.multiplier < 1.0 {
            return Err(ConfigError::ValidationError("resilience.retry.multiplier must be >= 1.0".to_string()));
        }
        if !(0.0..=1.0).contains(&self.jitter) {
            return Err(ConfigError::ValidationError("resilience.retry.jitter must be within 0.0..=1.0".to_string()));
        }
        Ok(())
    }
}
