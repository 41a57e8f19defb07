mod manager;

pub use manager::CacheManager;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Statistics about cache performance
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheStats {
    /// Total number of cache hits (successful gets)
    pub hits: u64,

    /// Total number of cache misses, expired reads included
    pub misses: u64,

    /// Total number of entries dropped because a category was over capacity
    pub evictions: u64,

    /// Total number of entries removed because their TTL elapsed
    pub expirations: u64,

    /// Current number of items in the cache, across categories
    pub size: usize,

    /// Hit rate as a fraction (0.0 to 1.0)
    pub hit_rate: f64,
}

impl CacheStats {
    /// Create new cache stats with zero values
    pub fn new() -> Self {
        Self {
            hits: 0,
            misses: 0,
            evictions: 0,
            expirations: 0,
            size: 0,
            hit_rate: 0.0,
        }
    }

    /// Calculate hit rate from hits and misses
    pub fn calculate_hit_rate(&mut self) {
        let total = self.hits + self.misses;
        self.hit_rate = if total > 0 {
            self.hits as f64 / total as f64
        } else {
            0.0
        };
    }
}

impl Default for CacheStats {
    fn default() -> Self {
        Self::new()
    }
}

/// Builder for consistent cache key naming
pub struct CacheKey;

impl CacheKey {
    /// Key of an operation call: its name plus its arguments as canonical JSON
    pub fn operation(name: &str, args: &Value) -> String {
        format!("{}:{}", name, args)
    }
}
