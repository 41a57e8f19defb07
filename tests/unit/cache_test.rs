//! Unit tests for the categorized fallback cache

use std::sync::Arc;
use std::time::Duration;

use resilient_db::cache::{CacheKey, CacheManager};
use resilient_db::config::{CacheConfig, CategoryPolicy};
use serde_json::json;

fn cache_with(category: &str, ttl_seconds: u64, max_size: usize) -> CacheManager {
    let mut config = CacheConfig {
        sweep_interval: 0,
        ..CacheConfig::default()
    };
    config
        .categories
        .insert(category.to_string(), CategoryPolicy::new(ttl_seconds, max_size));
    CacheManager::new(config)
}

#[test]
fn test_members_scenario_evicts_b() {
    let cache = cache_with("members", 180, 2);

    cache.set("members", "A", &"Ana").unwrap();
    cache.set("members", "B", &"Bruno").unwrap();
    assert_eq!(cache.get::<String>("members", "A").unwrap().as_deref(), Some("Ana"));
    cache.set("members", "C", &"Carla").unwrap();

    assert_eq!(cache.get::<String>("members", "B").unwrap(), None);
    assert_eq!(cache.get::<String>("members", "A").unwrap().as_deref(), Some("Ana"));
    assert_eq!(cache.get::<String>("members", "C").unwrap().as_deref(), Some("Carla"));
}

#[test]
fn test_overflow_evicts_exactly_least_recent() {
    let max_size = 5;
    let cache = cache_with("payments", 120, max_size);

    for id in 0..max_size {
        cache.set("payments", &format!("payment:{id}"), &(id as u64)).unwrap();
    }
    // Touch everything except payment:2, oldest first
    for id in [0, 1, 3, 4] {
        cache.get::<u64>("payments", &format!("payment:{id}")).unwrap();
    }
    cache.set("payments", "payment:99", &99u64).unwrap();

    assert_eq!(cache.len("payments"), max_size);
    assert_eq!(cache.get::<u64>("payments", "payment:2").unwrap(), None);
    for id in [0, 1, 3, 4, 99] {
        assert!(cache.get::<u64>("payments", &format!("payment:{id}")).unwrap().is_some());
    }
    assert_eq!(cache.stats().evictions, 1);
}

#[tokio::test(start_paused = true)]
async fn test_category_ttl_from_config() {
    let cache = cache_with("attendance", 120, 500);

    cache.set("attendance", "today", &vec![1u32, 2, 3]).unwrap();
    tokio::time::advance(Duration::from_secs(119)).await;
    assert!(cache.get::<Vec<u32>>("attendance", "today").unwrap().is_some());

    tokio::time::advance(Duration::from_secs(1)).await;
    assert!(cache.get::<Vec<u32>>("attendance", "today").unwrap().is_none());
}

#[test]
fn test_operation_keys_are_argument_sensitive() {
    let cache = cache_with("operations", 150, 1000);

    let a = CacheKey::operation("get_member", &json!({ "id": 1 }));
    let b = CacheKey::operation("get_member", &json!({ "id": 2 }));
    cache.set("operations", &a, &"first").unwrap();

    assert!(cache.get::<String>("operations", &a).unwrap().is_some());
    assert!(cache.get::<String>("operations", &b).unwrap().is_none());
}

#[test]
fn test_hit_rate() {
    let cache = cache_with("classes", 300, 300);

    cache.set("classes", "yoga", &"Yoga").unwrap();
    for _ in 0..3 {
        cache.get::<String>("classes", "yoga").unwrap();
    }
    cache.get::<String>("classes", "boxing").unwrap();

    let stats = cache.stats();
    assert_eq!(stats.hits, 3);
    assert_eq!(stats.misses, 1);
    assert_eq!(stats.hit_rate, 0.75);
}

#[test]
fn test_concurrent_writers_respect_capacity() {
    let cache = Arc::new(cache_with("members", 180, 50));

    let handles: Vec<_> = (0..8)
        .map(|worker| {
            let cache = Arc::clone(&cache);
            std::thread::spawn(move || {
                for i in 0..200u32 {
                    let key = format!("member:{}", worker * 1000 + i);
                    cache.set("members", &key, &i).unwrap();
                    let _ = cache.get::<u32>("members", &key).unwrap();
                }
            })
        })
        .collect();

    for handle in handles {
        handle.join().unwrap();
    }

    assert_eq!(cache.len("members"), 50);
    assert_eq!(cache.stats().evictions, 8 * 200 - 50);
}
