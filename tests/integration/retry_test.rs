//! Retry policy against a scripted datastore
//!
//! Backoff sleeps run on paused tokio time, so these tests finish instantly
//! while still exercising the real delays.

use std::sync::atomic::{AtomicU32, Ordering};

use resilient_db::database::{DbError, Session};
use resilient_db::resilience::{CircuitState, Operation, Outcome};
use resilient_db::testing::setup;
use sea_orm::{DbErr, RuntimeErr};
use serde_json::json;

#[tokio::test(start_paused = true)]
async fn test_two_failures_then_success_returns_real_result() {
    let (server, layer) = setup::data_layer();
    server.fail_next_statements(2);

    let op = Operation::<u64>::read("count_active_members").default_value(0);
    let outcome = layer
        .policy()
        .execute_tagged(&op, |session| Box::pin(async move { session.execute("SELECT count(*) FROM members").await }))
        .await
        .unwrap();

    assert_eq!(outcome, Outcome::Applied(1));
    assert_eq!(layer.breaker().failure_count(), 0);
    assert_eq!(layer.breaker().state(), CircuitState::Closed);
    assert_eq!(server.statements(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_backoff_waits_between_attempts() {
    let (server, layer) = setup::data_layer();
    server.fail_next_statements(2);

    let started = tokio::time::Instant::now();
    let op = Operation::<u64>::read("get_monthly_fee");
    layer
        .execute(&op, |session| Box::pin(async move { session.execute("SELECT fee FROM config").await }))
        .await
        .unwrap();

    // 10ms then 20ms with jitter disabled
    assert!(started.elapsed() >= std::time::Duration::from_millis(30));
}

#[tokio::test]
async fn test_non_transient_error_is_not_retried() {
    let (_server, layer) = setup::data_layer();
    let calls = AtomicU32::new(0);

    let op = Operation::<u64>::write("register_member").default_value(0);
    let err = layer
        .execute(&op, |_session| {
            calls.fetch_add(1, Ordering::SeqCst);
            Box::pin(async move {
                Err::<u64, _>(DbErr::Query(RuntimeErr::Internal(
                    "duplicate key value violates unique constraint \"members_dni_key\"".to_string(),
                )))
            })
        })
        .await
        .unwrap_err();

    assert!(matches!(err, DbError::Query(_)));
    assert!(!err.is_transient());
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(layer.breaker().failure_count(), 0);
}

#[tokio::test]
async fn test_non_transient_error_bypasses_offline_queue() {
    let (_server, offline, layer) = setup::offline_data_layer();

    let op = Operation::<()>::write("delete_member").args(json!({ "id": 3 }));
    let err = layer
        .execute(&op, |_session| {
            Box::pin(async move {
                Err::<(), _>(DbErr::Exec(RuntimeErr::Internal(
                    "permission denied for table members".to_string(),
                )))
            })
        })
        .await
        .unwrap_err();

    assert!(matches!(err, DbError::Query(_)));
    assert!(offline.queued().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_breaker_opens_after_threshold_of_retried_failures() {
    let (server, layer) = setup::data_layer();
    server.set_down(true);

    let op = Operation::<u64>::read("count_payments").default_value(0);
    let outcome = layer
        .policy()
        .execute_tagged(&op, |session| Box::pin(async move { session.execute("SELECT count(*) FROM payments").await }))
        .await
        .unwrap();

    assert_eq!(outcome, Outcome::Defaulted(0));
    assert!(layer.breaker().is_open());
    assert_eq!(layer.pool().stats().emergency, 0);
}

#[tokio::test(start_paused = true)]
async fn test_breaker_opening_mid_budget_stops_retrying() {
    let server = resilient_db::testing::MockServer::new();
    let mut config = setup::config();
    config.resilience.retry.max_retries = 6;
    config.resilience.retry.emergency_connection = false;
    let layer = resilient_db::DataLayer::new(config, server.connector());
    server.set_down(true);

    let calls = AtomicU32::new(0);
    let op = Operation::<u64>::read("list_classes_today");
    let result = layer
        .execute(&op, |session| {
            calls.fetch_add(1, Ordering::SeqCst);
            Box::pin(async move { session.execute("SELECT 1").await })
        })
        .await;

    // Never reached a session, and stopped at the breaker threshold
    assert!(result.is_err());
    assert_eq!(calls.load(Ordering::SeqCst), 0);
    assert!(layer.breaker().is_open());
    assert_eq!(layer.breaker().failure_count(), 3);
}

#[tokio::test(start_paused = true)]
async fn test_emergency_connection_rescues_exhausted_pool() {
    let server = resilient_db::testing::MockServer::new();
    let mut config = setup::config();
    config.pool.max_connections = 1;
    let layer = resilient_db::DataLayer::new(config, server.connector());

    let held = layer.pool().acquire().await.unwrap();

    let op = Operation::<u64>::read("get_member_by_dni").args(json!({ "dni": "30111222" }));
    let outcome = layer
        .policy()
        .execute_tagged(&op, |session| Box::pin(async move { session.execute("SELECT * FROM members").await }))
        .await
        .unwrap();

    assert_eq!(outcome, Outcome::Applied(1));
    let stats = layer.pool().stats();
    assert_eq!(stats.emergency, 1);
    assert_eq!(stats.timeouts, 3);
    assert_eq!(stats.size, 1);
    // Pool exhaustion never reached the datastore
    assert_eq!(layer.breaker().failure_count(), 0);

    layer.pool().release(held, false).await;
}

#[tokio::test(start_paused = true)]
async fn test_disconnect_storm_rebuilds_idle_set() {
    let (server, layer) = setup::data_layer();
    layer.initialize().await.unwrap();
    assert_eq!(layer.pool().stats().idle, 1);

    server.fail_next_statements(1);
    let op = Operation::<u64>::read("get_attendance_today");
    let value = layer
        .execute(&op, |session| Box::pin(async move { session.execute("SELECT 1").await }))
        .await
        .unwrap();

    assert_eq!(value, 1);
    let stats = layer.pool().stats();
    assert_eq!(stats.closed, 1);
    assert_eq!(stats.idle, 1);
}

#[tokio::test]
async fn test_transaction_scope_commits_each_attempt() {
    let (server, layer) = setup::data_layer();

    let op = Operation::<u64>::write("register_payment")
        .args(json!({ "member_id": 7, "amount": 15000 }))
        .invalidates(["payments"]);
    let outcome = layer
        .policy()
        .execute_in_transaction(&op, |session| {
            Box::pin(async move {
                session.execute("INSERT INTO payments (member_id, amount) VALUES (7, 15000)").await?;
                session.execute("UPDATE members SET last_payment = now() WHERE id = 7").await
            })
        })
        .await
        .unwrap();

    assert_eq!(outcome, Outcome::Applied(1));
    assert_eq!(server.commits(), 1);
    assert_eq!(server.statements(), 2);
    assert_eq!(layer.pool().stats().idle, 0);
}

#[tokio::test]
async fn test_query_stats_track_attempts() {
    let (_server, layer) = setup::data_layer();

    let op = Operation::<u64>::read("get_exercise_catalog");
    for _ in 0..3 {
        layer
            .execute(&op, |session| Box::pin(async move { session.execute("SELECT 1").await }))
            .await
            .unwrap();
    }

    let stats = layer.policy().query_stats();
    assert_eq!(stats.total, 3);
    assert_eq!(stats.failed, 0);
    assert_eq!(stats.slow_threshold_ms, 1000);
}

#[tokio::test(start_paused = true)]
async fn test_slow_queries_are_counted() {
    let (server, layer) = setup::data_layer();
    server.set_latency(std::time::Duration::from_millis(1500));

    let op = Operation::<u64>::read("search_members").args(json!({ "q": "garcia" }));
    layer
        .execute(&op, |session| Box::pin(async move { session.execute("SELECT * FROM members").await }))
        .await
        .unwrap();

    let stats = layer.policy().query_stats();
    assert_eq!(stats.total, 1);
    assert_eq!(stats.slow, 1);
}
