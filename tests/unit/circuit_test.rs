//! Unit tests for the circuit breaker state machine

use std::sync::Arc;
use std::time::Duration;

use resilient_db::config::CircuitBreakerConfig;
use resilient_db::resilience::{CircuitBreaker, CircuitState};

fn breaker() -> CircuitBreaker {
    CircuitBreaker::new("database", &CircuitBreakerConfig::default())
}

#[tokio::test(start_paused = true)]
async fn test_full_cycle() {
    let cb = breaker();

    cb.register_failure();
    cb.register_failure();
    assert!(!cb.is_open());
    cb.register_failure();
    assert!(cb.is_open());
    assert_eq!(cb.state(), CircuitState::Open);

    tokio::time::advance(Duration::from_secs(25)).await;
    assert!(!cb.is_open(), "cool-down elapsed, probe allowed");
    assert_eq!(cb.state(), CircuitState::HalfOpen);

    cb.register_success();
    assert_eq!(cb.state(), CircuitState::Closed);
    assert_eq!(cb.failure_count(), 0);

    let snapshot = cb.snapshot();
    assert_eq!(snapshot.times_opened, 1);
    assert_eq!(snapshot.total_failures, 3);
    assert_eq!(snapshot.total_successes, 1);
}

#[tokio::test(start_paused = true)]
async fn test_failures_spread_beyond_window_do_not_open() {
    let cb = breaker();

    cb.register_failure();
    cb.register_failure();
    tokio::time::advance(Duration::from_secs(21)).await;
    cb.register_failure();

    assert!(!cb.is_open());
    assert_eq!(cb.failure_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_probe_failure_restarts_cool_down() {
    let cb = breaker();
    for _ in 0..3 {
        cb.register_failure();
    }

    tokio::time::advance(Duration::from_secs(25)).await;
    assert!(!cb.is_open());
    cb.register_failure();
    assert!(cb.is_open());

    tokio::time::advance(Duration::from_secs(24)).await;
    assert!(cb.is_open());
    tokio::time::advance(Duration::from_secs(1)).await;
    assert!(!cb.is_open());
}

#[tokio::test(start_paused = true)]
async fn test_snapshot_serializes_for_health_output() {
    let cb = breaker();
    for _ in 0..3 {
        cb.register_failure();
    }
    tokio::time::advance(Duration::from_secs(5)).await;

    let json = serde_json::to_value(cb.snapshot()).unwrap();
    assert_eq!(json["name"], "database");
    assert_eq!(json["state"], "Open");
    assert_eq!(json["failure_threshold"], 3);
    assert_eq!(json["open_remaining_ms"], 20_000);
}

#[test]
fn test_shared_across_threads() {
    let cb = Arc::new(CircuitBreaker::with_timing(
        "database",
        100,
        Duration::from_secs(60),
        Duration::from_secs(60),
    ));

    let handles: Vec<_> = (0..4)
        .map(|_| {
            let cb = Arc::clone(&cb);
            std::thread::spawn(move || {
                for _ in 0..25 {
                    cb.register_failure();
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    assert!(cb.is_open());
    assert_eq!(cb.failure_count(), 100);
}
