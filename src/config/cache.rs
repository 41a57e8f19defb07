use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

use super::{ConfigError, Validate};

/// Fallback cache configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Seconds between background sweeps of expired entries (0 disables the sweeper)
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval: u64,
    /// Policy for categories without an explicit entry
    #[serde(default = "CategoryPolicy::default")]
    pub default: CategoryPolicy,
    /// Category the retry policy stores read results under
    #[serde(default = "default_read_category")]
    pub read_category: String,
    /// Per-category policies
    #[serde(default = "default_categories")]
    pub categories: HashMap<String, CategoryPolicy>,
}

/// TTL and capacity of one cache category
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CategoryPolicy {
    pub ttl_seconds: u64,
    pub max_size: usize,
}

impl CategoryPolicy {
    pub const fn new(ttl_seconds: u64, max_size: usize) -> Self {
        Self { ttl_seconds, max_size }
    }

    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_seconds)
    }
}

impl Default for CategoryPolicy {
    fn default() -> Self {
        Self::new(300, 100)
    }
}

fn default_sweep_interval() -> u64 {
    60
}

fn default_read_category() -> String {
    "operations".to_string()
}

fn default_categories() -> HashMap<String, CategoryPolicy> {
    [
        ("members", CategoryPolicy::new(180, 1000)),
        ("payments", CategoryPolicy::new(120, 500)),
        ("attendance", CategoryPolicy::new(120, 500)),
        ("classes", CategoryPolicy::new(300, 300)),
        ("exercises", CategoryPolicy::new(1800, 200)),
        ("config", CategoryPolicy::new(1800, 50)),
        ("operations", CategoryPolicy::new(150, 1000)),
    ]
    .into_iter()
    .map(|(name, policy)| (name.to_string(), policy))
    .collect()
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            sweep_interval: default_sweep_interval(),
            default: CategoryPolicy::default(),
            read_category: default_read_category(),
            categories: default_categories(),
        }
    }
}

impl CacheConfig {
    /// Policy for a category, falling back to the default policy
    pub fn policy(&self, category: &str) -> CategoryPolicy {
        self.categories.get(category).copied().unwrap_or(self.default)
    }
}

impl Validate for CacheConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        if self.read_category.is_empty() {
            return Err(ConfigError::ValidationError("cache.read_category cannot be empty".to_string()));
        }
        let policies = std::iter::once(("default", &self.default))
            .chain(self.categories.iter().map(|(name, policy)| (name.as_str(), policy)));
        for (name, policy) in policies {
            if policy.ttl_seconds == 0 {
                return Err(ConfigError::ValidationError(format!("cache.{}.ttl_seconds must be > 0", name)));
            }
            if policy.max_size == 0 {
                return Err(ConfigError::ValidationError(format!("cache.{}.max_size must be > 0", name)));
            }
        }
        Ok(())
    }
}
