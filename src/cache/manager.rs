use anyhow::{Context, Result};
use dashmap::DashMap;
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use super::CacheStats;
use crate::config::{CacheConfig, CategoryPolicy};

/// Internal cache entry with expiration and recency
#[derive(Debug, Clone)]
struct CacheEntry {
    /// Serialized data using bincode
    data: Vec<u8>,
    /// Expiration timestamp
    expires_at: Instant,
    /// Logical access time, larger is more recent
    last_access: u64,
}

impl CacheEntry {
    fn is_expired(&self, now: Instant) -> bool {
        now >= self.expires_at
    }
}

/// One category: its policy and its entries
#[derive(Debug)]
struct Category {
    policy: CategoryPolicy,
    entries: HashMap<String, CacheEntry>,
}

impl Category {
    /// Drop the least recently accessed entry
    fn evict_lru(&mut self) -> bool {
        let oldest = self
            .entries
            .iter()
            .min_by_key(|(_, entry)| entry.last_access)
            .map(|(key, _)| key.clone());

        match oldest {
            Some(key) => self.entries.remove(&key).is_some(),
            None => false,
        }
    }

    fn remove_expired(&mut self, now: Instant) -> usize {
        let before = self.entries.len();
        self.entries.retain(|_, entry| !entry.is_expired(now));
        before - self.entries.len()
    }
}

#[derive(Debug)]
struct CacheInner {
    config: CacheConfig,
    /// DashMap storage keyed by category, each category is its own namespace
    categories: DashMap<String, Category>,
    /// Logical clock for LRU ordering
    clock: AtomicU64,
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
    expirations: AtomicU64,
}

impl CacheInner {
    fn tick(&self) -> u64 {
        self.clock.fetch_add(1, Ordering::Relaxed) + 1
    }

    fn size(&self) -> usize {
        self.categories.iter().map(|category| category.entries.len()).sum()
    }

    fn publish_size(&self) {
        ::metrics::gauge!("cache_size").set(self.size() as f64);
    }

    fn clear_expired(&self) -> usize {
        let now = Instant::now();
        let removed: usize = self
            .categories
            .iter_mut()
            .map(|mut category| category.remove_expired(now))
            .sum();

        if removed > 0 {
            self.expirations.fetch_add(removed as u64, Ordering::Relaxed);
            self.publish_size();
        }
        removed
    }
}

/// Per-category TTL + LRU cache used as the degraded-mode fallback
///
/// Categories never evict into each other: each has its own TTL and
/// capacity. Expired entries are never returned, whether or not the
/// background sweep has removed them yet.
#[derive(Debug)]
pub struct CacheManager {
    inner: Arc<CacheInner>,
    /// Background sweep task handle
    sweeper: Option<JoinHandle<()>>,
}

impl CacheManager {
    /// Create a cache, starting the sweeper when called inside a tokio runtime
    pub fn new(config: CacheConfig) -> Self {
        Self::with_shard_count(config, (num_cpus::get() * 4).next_power_of_two())
    }

    /// Create a cache with a specific shard count (a power of two)
    pub fn with_shard_count(config: CacheConfig, shard_count: usize) -> Self {
        let sweep_interval = Duration::from_secs(config.sweep_interval);
        let inner = Arc::new(CacheInner {
            config,
            categories: DashMap::with_shard_amount(shard_count),
            clock: AtomicU64::new(0),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
            expirations: AtomicU64::new(0),
        });

        let sweeper = if sweep_interval.is_zero() {
            None
        } else {
            Self::start_sweeper(Arc::clone(&inner), sweep_interval)
        };

        Self { inner, sweeper }
    }

    /// Periodically remove expired entries
    fn start_sweeper(inner: Arc<CacheInner>, every: Duration) -> Option<JoinHandle<()>> {
        let handle = tokio::runtime::Handle::try_current().ok()?;
        Some(handle.spawn(async move {
            let mut interval = tokio::time::interval(every);
            // The first tick completes immediately
            interval.tick().await;

            loop {
                interval.tick().await;
                let removed = inner.clear_expired();
                if removed > 0 {
                    tracing::debug!(removed, "Swept expired cache entries");
                }
            }
        }))
    }

    pub fn config(&self) -> &CacheConfig {
        &self.inner.config
    }

    /// Value if present and unexpired
    ///
    /// A miss is `Ok(None)`; only a value that cannot be decoded as `V` is an error.
    pub fn get<V>(&self, category: &str, key: &str) -> Result<Option<V>>
    where
        V: DeserializeOwned,
    {
        let now = Instant::now();
        let found = self.inner.categories.get_mut(category).and_then(|mut store| {
            match store.entries.get(key).map(|entry| entry.is_expired(now)) {
                Some(true) => {
                    store.entries.remove(key);
                    self.inner.expirations.fetch_add(1, Ordering::Relaxed);
                    None
                }
                Some(false) => {
                    let tick = self.inner.tick();
                    store.entries.get_mut(key).map(|entry| {
                        entry.last_access = tick;
                        entry.data.clone()
                    })
                }
                None => None,
            }
        });

        match found {
            Some(data) => {
                let value: V = bincode::deserialize(&data).context("Failed to deserialize cached value")?;
                self.inner.hits.fetch_add(1, Ordering::Relaxed);
                ::metrics::counter!("cache_hits_total", "category" => category.to_string()).increment(1);
                Ok(Some(value))
            }
            None => {
                self.inner.misses.fetch_add(1, Ordering::Relaxed);
                ::metrics::counter!("cache_misses_total", "category" => category.to_string()).increment(1);
                Ok(None)
            }
        }
    }

    /// Insert or overwrite with the category's TTL
    pub fn set<V>(&self, category: &str, key: &str, value: &V) -> Result<()>
    where
        V: Serialize + ?Sized,
    {
        self.insert(category, key, value, None)
    }

    /// Insert or overwrite with an explicit TTL
    pub fn set_with_ttl<V>(&self, category: &str, key: &str, value: &V, ttl: Duration) -> Result<()>
    where
        V: Serialize + ?Sized,
    {
        self.insert(category, key, value, Some(ttl))
    }

    fn insert<V>(&self, category: &str, key: &str, value: &V, ttl: Option<Duration>) -> Result<()>
    where
        V: Serialize + ?Sized,
    {
        let data = bincode::serialize(value).context("Failed to serialize value")?;

        let evicted = {
            let mut store = self
                .inner
                .categories
                .entry(category.to_string())
                .or_insert_with(|| Category {
                    policy: self.inner.config.policy(category),
                    entries: HashMap::new(),
                });

            let ttl = ttl.unwrap_or_else(|| store.policy.ttl());
            let entry = CacheEntry {
                data,
                expires_at: Instant::now() + ttl,
                last_access: self.inner.tick(),
            };
            store.entries.insert(key.to_string(), entry);

            let mut evicted = 0;
            while store.entries.len() > store.policy.max_size && store.evict_lru() {
                evicted += 1;
            }
            evicted
        };

        if evicted > 0 {
            self.inner.evictions.fetch_add(evicted, Ordering::Relaxed);
            ::metrics::counter!("cache_evictions_total", "category" => category.to_string()).increment(evicted);
            tracing::debug!(category, evicted, "Evicted least recently used cache entries");
        }
        self.inner.publish_size();

        Ok(())
    }

    /// Remove one key, or the whole category when `key` is `None`
    pub fn invalidate(&self, category: &str, key: Option<&str>) {
        if let Some(mut store) = self.inner.categories.get_mut(category) {
            match key {
                Some(key) => {
                    store.entries.remove(key);
                }
                None => store.entries.clear(),
            }
        }
        self.inner.publish_size();
    }

    /// Clear several categories at once
    pub fn invalidate_many<S: AsRef<str>>(&self, categories: &[S]) {
        for category in categories {
            self.invalidate(category.as_ref(), None);
        }
    }

    /// Remove every expired entry, returning how many were removed
    pub fn clear_expired(&self) -> usize {
        self.inner.clear_expired()
    }

    pub fn clear(&self) {
        self.inner.categories.clear();
        self.inner.publish_size();
    }

    /// Entries currently held in a category, expired or not
    pub fn len(&self, category: &str) -> usize {
        self.inner
            .categories
            .get(category)
            .map(|store| store.entries.len())
            .unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.inner.size() == 0
    }

    pub fn stats(&self) -> CacheStats {
        let mut stats = CacheStats {
            hits: self.inner.hits.load(Ordering::Relaxed),
            misses: self.inner.misses.load(Ordering::Relaxed),
            evictions: self.inner.evictions.load(Ordering::Relaxed),
            expirations: self.inner.expirations.load(Ordering::Relaxed),
            size: self.inner.size(),
            hit_rate: 0.0,
        };
        stats.calculate_hit_rate();
        stats
    }
}

impl Drop for CacheManager {
    fn drop(&mut self) {
        // Abort sweep task when the cache is dropped
        if let Some(handle) = self.sweeper.take() {
            handle.abort();
        }
    }
}
