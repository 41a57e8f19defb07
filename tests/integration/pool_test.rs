//! Connection pool under concurrent load

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use resilient_db::config::PoolConfig;
use resilient_db::database::{ConnectionPool, DbError, Session};
use resilient_db::testing::{MockConnector, MockServer};

fn pool(max_connections: usize) -> (MockServer, Arc<ConnectionPool<MockConnector>>) {
    let server = MockServer::new();
    let config = PoolConfig {
        max_connections,
        min_idle: 0,
        acquire_timeout: 2,
        create_retries: 1,
        create_retry_delay: 1,
        max_lifetime: 1800,
    };
    let pool = Arc::new(ConnectionPool::new(server.connector(), config));
    (server, pool)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_size_bound_holds_under_contention() {
    let (server, pool) = pool(3);
    server.set_latency(Duration::from_millis(5));

    let mut handles = Vec::new();
    for _ in 0..24 {
        let pool = Arc::clone(&pool);
        handles.push(tokio::spawn(async move {
            let stats = pool.stats();
            assert!(stats.in_use + stats.idle <= 3);
            pool.with_connection(|session| Box::pin(async move { session.execute("SELECT 1").await }))
                .await
        }));
    }

    for handle in handles {
        assert_eq!(handle.await.unwrap().unwrap(), 1);
    }

    let stats = pool.stats();
    assert!(stats.size <= 3);
    assert!(stats.created <= 3);
    assert_eq!(stats.in_use, 0);
    assert_eq!(server.statements(), 24);
}

#[tokio::test]
async fn test_every_handoff_is_live() {
    let (server, pool) = pool(2);

    let a = pool.acquire().await.unwrap();
    let b = pool.acquire().await.unwrap();
    pool.release(a, false).await;
    pool.release(b, false).await;

    server.kill_sessions();

    for _ in 0..2 {
        let conn = pool.acquire().await.unwrap();
        assert!(conn.session().ping().await.is_ok());
        pool.release(conn, false).await;
    }
    assert_eq!(pool.stats().closed, 2);
}

#[tokio::test]
async fn test_broken_connection_never_handed_out_again() {
    let (_server, pool) = pool(2);

    let broken = pool.acquire().await.unwrap();
    let broken_id = broken.id();
    pool.release(broken, true).await;

    let mut seen = HashSet::new();
    for _ in 0..4 {
        let conn = pool.acquire().await.unwrap();
        seen.insert(conn.id());
        pool.release(conn, false).await;
    }
    assert!(!seen.contains(&broken_id));
}

#[tokio::test(start_paused = true)]
async fn test_exhaustion_then_recovery() {
    let (_server, pool) = pool(1);

    let held = pool.acquire().await.unwrap();
    let err = pool.acquire().await.unwrap_err();
    assert!(matches!(err, DbError::PoolExhausted { .. }));
    assert!(err.is_transient());

    pool.release(held, false).await;
    let conn = pool.acquire().await.unwrap();
    assert_eq!(pool.stats().reused, 1);
    pool.release(conn, false).await;
}

#[tokio::test]
async fn test_emergency_connections_are_counted_but_unbounded() {
    let (server, pool) = pool(1);
    let held = pool.acquire().await.unwrap();

    let first = pool.emergency_acquire().await.unwrap();
    let second = pool.emergency_acquire().await.unwrap();
    assert!(first.is_emergency());

    let stats = pool.stats();
    assert_eq!(stats.size, 1);
    assert_eq!(stats.emergency, 2);

    pool.release(first, false).await;
    pool.release(second, false).await;
    assert_eq!(pool.stats().idle, 0);
    assert_eq!(server.open_sessions(), 1);

    pool.release(held, false).await;
}

#[tokio::test]
async fn test_transaction_never_touches_idle_set() {
    let (server, pool) = pool(2);

    let idle = pool.acquire().await.unwrap();
    let idle_id = idle.id();
    pool.release(idle, false).await;

    pool.transaction(|session| {
        Box::pin(async move {
            assert!(session.in_transaction());
            session.execute("UPDATE members SET active = false WHERE expires_at < now()").await
        })
    })
    .await
    .unwrap();

    let stats = pool.stats();
    assert_eq!(stats.idle, 1);
    assert_eq!(stats.size, 1);
    assert_eq!(server.connects(), 2);
    assert_eq!(server.commits(), 1);

    let conn = pool.acquire().await.unwrap();
    assert_eq!(conn.id(), idle_id);
    pool.release(conn, false).await;
}

#[tokio::test]
async fn test_transaction_in_full_pool_replaces_an_idle_connection() {
    let (server, pool) = pool(1);

    let idle = pool.acquire().await.unwrap();
    pool.release(idle, false).await;

    pool.transaction(|session| Box::pin(async move { session.execute("DELETE FROM sessions").await }))
        .await
        .unwrap();

    let stats = pool.stats();
    assert_eq!(stats.size, 0);
    assert_eq!(stats.closed, 2);
    assert_eq!(server.open_sessions(), 0);
}
