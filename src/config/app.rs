use serde::{Deserialize, Serialize};

use super::{CacheConfig, ConfigError, ConnectionConfig, PoolConfig, ResilienceConfig, Validate};

/// Environment prefix for structured overrides, e.g. `RESILIENT_DB__POOL__MAX_CONNECTIONS=8`
pub const ENV_PREFIX: &str = "RESILIENT_DB";

/// Top-level configuration that aggregates all config modules
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    /// Application metadata
    #[serde(default)]
    pub app: AppMetadata,
    /// Datastore connection parameters and session options
    #[serde(default)]
    pub database: ConnectionConfig,
    /// Connection pool sizing and timeouts
    #[serde(default)]
    pub pool: PoolConfig,
    /// Resilience configuration (circuit breaker, retry)
    #[serde(default)]
    pub resilience: ResilienceConfig,
    /// Fallback cache categories
    #[serde(default)]
    pub cache: CacheConfig,
    /// Logging configuration
    #[serde(default)]
    pub observability: ObservabilityConfig,
}

/// Application metadata configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppMetadata {
    /// Application name
    #[serde(default = "default_app_name")]
    pub name: String,
    /// Application version
    #[serde(default = "default_app_version")]
    pub version: String,
    /// Application environment (development, staging, production)
    #[serde(default = "default_environment")]
    pub environment: String,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObservabilityConfig {
    /// Default filter directive, `RUST_LOG` takes precedence
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// `pretty` or `json`
    #[serde(default = "default_log_format")]
    pub log_format: String,
}

// Default functions for AppMetadata
fn default_app_name() -> String {
    "resilient-db".to_string()
}

fn default_app_version() -> String {
    env!("CARGO_PKG_VERSION").to_string()
}

fn default_environment() -> String {
    "development".to_string()
}

// Default functions for ObservabilityConfig
fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "pretty".to_string()
}

impl Default for AppMetadata {
    fn default() -> Self {
        Self {
            name: default_app_name(),
            version: default_app_version(),
            environment: default_environment(),
        }
    }
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            log_format: default_log_format(),
        }
    }
}

impl Validate for AppMetadata {
    fn validate(&self) -> Result<(), ConfigError> {
        if self.name.is_empty() {
            return Err(ConfigError::ValidationError("app.name cannot be empty".to_string()));
        }
        if self.environment.is_empty() {
            return Err(ConfigError::ValidationError("app.environment cannot be empty".to_string()));
        }
        Ok(())
    }
}

impl Validate for ObservabilityConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        if !matches!(self.log_format.as_str(), "pretty" | "json") {
            return Err(ConfigError::ValidationError(format!(
                "observability.log_format must be 'pretty' or 'json', got '{}'",
                self.log_format
            )));
        }
        Ok(())
    }
}

impl Validate for AppConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        // Validate all nested configurations
        self.app.validate()?;
        self.database.validate()?;
        self.pool.validate()?;
        self.resilience.validate()?;
        self.cache.validate()?;
        self.observability.validate()?;
        Ok(())
    }
}

/// Legacy environment variables and the config keys they override
const LEGACY_ENV_OVERRIDES: [(&str, &str); 10] = [
    ("DATABASE_URL", "database.url"),
    ("DB_HOST", "database.host"),
    ("DB_PORT", "database.port"),
    ("DB_USER", "database.user"),
    ("DB_PASSWORD", "database.password"),
    ("DB_NAME", "database.database"),
    ("DB_SSLMODE", "database.sslmode"),
    ("DB_CB_FAILURE_THRESHOLD", "resilience.circuit_breaker.failure_threshold"),
    ("DB_CB_WINDOW_SECONDS", "resilience.circuit_breaker.window_seconds"),
    ("DB_CB_OPEN_SECONDS", "resilience.circuit_breaker.open_seconds"),
];

/// Load configuration from files and environment variables
///
/// Configuration loading follows this precedence (highest to lowest):
/// 1. Legacy variables: DATABASE_URL, DB_HOST, ..., DB_CB_FAILURE_THRESHOLD
/// 2. Environment variables: RESILIENT_DB__POOL__MAX_CONNECTIONS=8
/// 3. config/local.toml (git-ignored, developer overrides)
/// 4. config/{APP_ENV}.toml (development/staging/production)
/// 5. config/default.toml (base defaults)
pub fn load_config() -> Result<AppConfig, ConfigError> {
    use ::config::{Config, Environment, File};

    // Determine the environment
    let env = std::env::var("APP_ENV").unwrap_or_else(|_| "development".to_string());

    // Build configuration with layered sources
    let mut builder = Config::builder()
        // Layer 1: Base defaults
        .add_source(File::with_name("config/default").required(false))
        // Layer 2: Environment-specific overrides
        .add_source(File::with_name(&format!("config/{}", env)).required(false))
        // Layer 3: Local developer overrides (git-ignored)
        .add_source(File::with_name("config/local").required(false))
        // Layer 4: Environment variables
        .add_source(
            Environment::with_prefix(ENV_PREFIX)
                .separator("__")
                .try_parsing(true)
        );

    // Layer 5: Legacy variables (highest precedence)
    for (var, key) in LEGACY_ENV_OVERRIDES {
        builder = builder.set_override_option(key, std::env::var(var).ok())?;
    }

    // Deserialize into AppConfig
    let app_config: AppConfig = builder.build()?.try_deserialize()?;

    // Validate the configuration
    app_config.validate()?;

    Ok(app_config)
}
