use serde::{Deserialize, Serialize};
use std::time::Duration;

use super::{ConfigError, Validate};

/// Connection parameters for the remote datastore
///
/// Either `url` is set, or the URL is assembled from the individual fields.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionConfig {
    /// Full connection URL, takes precedence over the individual fields
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_user")]
    pub user: String,
    #[serde(default)]
    pub password: String,
    #[serde(default = "default_database")]
    pub database: String,
    /// `disable`, `prefer`, `require`, `verify-ca` or `verify-full`
    #[serde(default = "default_sslmode")]
    pub sslmode: String,
    /// Connect timeout in seconds
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout: u64,
    #[serde(default = "default_application_name")]
    pub application_name: String,
    /// TCP keepalive idle time in seconds, applied as a session option
    #[serde(default = "default_keepalive")]
    pub keepalive: Option<u64>,
    /// Session options applied to every new connection
    #[serde(default)]
    pub session: SessionOptions,
}

/// Fixed session options applied after connecting
///
/// Every option is best-effort: a backend that rejects one keeps the
/// connection and simply runs without it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionOptions {
    /// Statement timeout in milliseconds
    #[serde(default = "default_statement_timeout")]
    pub statement_timeout: Option<u64>,
    /// Lock timeout in milliseconds
    #[serde(default = "default_lock_timeout")]
    pub lock_timeout: Option<u64>,
    /// Idle-in-transaction timeout in milliseconds
    #[serde(default = "default_idle_in_transaction_timeout")]
    pub idle_in_transaction_timeout: Option<u64>,
    #[serde(default = "default_timezone")]
    pub timezone: Option<String>,
    /// Planner hints as `name = value` pairs, e.g. `jit = off`
    #[serde(default)]
    pub planner_hints: Vec<String>,
}

/// Connection pool configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolConfig {
    /// Upper bound on pooled connections (idle + checked out)
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
    /// Connections opened eagerly at bootstrap
    #[serde(default = "default_min_idle")]
    pub min_idle: usize,
    /// Seconds to wait for a released connection when the pool is full
    #[serde(default = "default_acquire_timeout")]
    pub acquire_timeout: u64,
    /// Extra attempts after a transient connect failure
    #[serde(default = "default_create_retries")]
    pub create_retries: u32,
    /// Base delay in milliseconds between connect attempts, grows per attempt
    #[serde(default = "default_create_retry_delay")]
    pub create_retry_delay: u64,
    /// Connections older than this (seconds) are recycled instead of reused
    #[serde(default = "default_max_lifetime")]
    pub max_lifetime: u64,
}

fn default_host() -> String {
    "localhost".to_string()
}

fn default_port() -> u16 {
    5432
}

fn default_user() -> String {
    "postgres".to_string()
}

fn default_database() -> String {
    "gym_management".to_string()
}

fn default_sslmode() -> String {
    "require".to_string()
}

fn default_connect_timeout() -> u64 {
    10
}

fn default_application_name() -> String {
    "resilient-db".to_string()
}

fn default_keepalive() -> Option<u64> {
    Some(30)
}

fn default_statement_timeout() -> Option<u64> {
    Some(30_000)
}

fn default_lock_timeout() -> Option<u64> {
    Some(10_000)
}

fn default_idle_in_transaction_timeout() -> Option<u64> {
    Some(60_000)
}

fn default_timezone() -> Option<String> {
    Some("America/Argentina/Buenos_Aires".to_string())
}

fn default_max_connections() -> usize {
    10
}

fn default_min_idle() -> usize {
    1
}

fn default_acquire_timeout() -> u64 {
    25
}

fn default_create_retries() -> u32 {
    2
}

fn default_create_retry_delay() -> u64 {
    200
}

fn default_max_lifetime() -> u64 {
    1800
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            url: None,
            host: default_host(),
            port: default_port(),
            user: default_user(),
            password: String::new(),
            database: default_database(),
            sslmode: default_sslmode(),
            connect_timeout: default_connect_timeout(),
            application_name: default_application_name(),
            keepalive: default_keepalive(),
            session: SessionOptions::default(),
        }
    }
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            statement_timeout: default_statement_timeout(),
            lock_timeout: default_lock_timeout(),
            idle_in_transaction_timeout: default_idle_in_transaction_timeout(),
            timezone: default_timezone(),
            planner_hints: Vec::new(),
        }
    }
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_connections: default_max_connections(),
            min_idle: default_min_idle(),
            acquire_timeout: default_acquire_timeout(),
            create_retries: default_create_retries(),
            create_retry_delay: default_create_retry_delay(),
            max_lifetime: default_max_lifetime(),
        }
    }
}

impl ConnectionConfig {
    /// Connection URL, assembled from the individual fields unless `url` is set
    pub fn database_url(&self) -> String {
        if let Some(url) = &self.url {
            return url.clone();
        }

        let auth = if self.password.is_empty() {
            urlencoding::encode(&self.user).into_owned()
        } else {
            format!(
                "{}:{}",
                urlencoding::encode(&self.user),
                urlencoding::encode(&self.password)
            )
        };

        format!(
            "postgres://{}@{}:{}/{}?sslmode={}&application_name={}",
            auth,
            self.host,
            self.port,
            self.database,
            self.sslmode,
            urlencoding::encode(&self.application_name)
        )
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout)
    }

    /// Statements issued on every new connection, in order
    pub fn session_statements(&self) -> Vec<String> {
        let mut statements = self.session.statements();
        if let Some(idle) = self.keepalive {
            statements.push(format!("SET tcp_keepalives_idle = {}", idle));
        }
        statements
    }
}

impl SessionOptions {
    pub fn statements(&self) -> Vec<String> {
        let mut statements = Vec::new();

        if let Some(ms) = self.statement_timeout {
            statements.push(format!("SET statement_timeout = '{}ms'", ms));
        }
        if let Some(ms) = self.lock_timeout {
            statements.push(format!("SET lock_timeout = '{}ms'", ms));
        }
        if let Some(ms) = self.idle_in_transaction_timeout {
            statements.push(format!("SET idle_in_transaction_session_timeout = '{}ms'", ms));
        }
        if let Some(tz) = &self.timezone {
            statements.push(format!("SET TIME ZONE '{}'", tz.replace('\'', "''")));
        }
        for hint in &self.planner_hints {
            if let Some((name, value)) = hint.split_once('=') {
                statements.push(format!("SET {} = {}", name.trim(), value.trim()));
            }
        }

        statements
    }
}

impl PoolConfig {
    pub fn acquire_timeout(&self) -> Duration {
        Duration::from_secs(self.acquire_timeout)
    }

    pub fn create_retry_delay(&self) -> Duration {
        Duration::from_millis(self.create_retry_delay)
    }

    pub fn max_lifetime(&self) -> Duration {
        Duration::from_secs(self.max_lifetime)
    }
}

impl Validate for ConnectionConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        if self.url.as_deref().is_some_and(str::is_empty) {
            return Err(ConfigError::ValidationError("database.url cannot be empty when set".to_string()));
        }
        if self.url.is_none() {
            if self.host.is_empty() {
                return Err(ConfigError::ValidationError("database.host cannot be empty".to_string()));
            }
            if self.database.is_empty() {
                return Err(ConfigError::ValidationError("database.database cannot be empty".to_string()));
            }
        }
        const SSL_MODES: [&str; 6] = ["disable", "allow", "prefer", "require", "verify-ca", "verify-full"];
        if !SSL_MODES.contains(&self.sslmode.as_str()) {
            return Err(ConfigError::ValidationError(format!("database.sslmode '{}' is not a valid mode", self.sslmode)));
        }
        if self.connect_timeout == 0 {
            return Err(ConfigError::ValidationError("database.connect_timeout must be > 0".to_string()));
        }
        Ok(())
    }
}

impl Validate for PoolConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        if self.max_connections == 0 {
            return Err(ConfigError::ValidationError("pool.max_connections must be > 0".to_string()));
        }
        if self.min_idle > self.max_connections {
            return Err(ConfigError::ValidationError("pool.min_idle must be <= max_connections".to_string()));
        }
        if self.acquire_timeout == 0 {
            return Err(ConfigError::ValidationError("pool.acquire_timeout must be > 0".to_string()));
        }
        if self.max_lifetime == 0 {
            return Err(ConfigError::ValidationError("pool.max_lifetime must be > 0".to_string()));
        }
        Ok(())
    }
}
