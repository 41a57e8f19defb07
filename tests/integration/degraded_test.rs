//! Degraded answers while the datastore is unreachable
//!
//! Reads fall back to the fallback cache, then the offline store, then the
//! safe default. Writes are queued for replay. The original error only
//! surfaces when none of that applies.

use resilient_db::database::{DbError, Session};
use resilient_db::resilience::{Operation, OperationCatalog, OperationKind, Outcome};
use resilient_db::testing::setup;
use serde::{Deserialize, Serialize};
use serde_json::json;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct Member {
    id: u32,
    name: String,
    active: bool,
}

fn member(id: u32) -> Member {
    Member {
        id,
        name: "Lucia Fernandez".to_string(),
        active: true,
    }
}

fn open_breaker(layer: &resilient_db::DataLayer<resilient_db::testing::MockConnector>) {
    for _ in 0..3 {
        layer.breaker().register_failure();
    }
    assert!(layer.breaker().is_open());
}

#[tokio::test]
async fn test_open_circuit_serves_cached_read_without_datastore() {
    let (server, layer) = setup::data_layer();
    let op = Operation::<Member>::read("get_member").args(json!({ "id": 12 }));

    let fresh = layer
        .policy()
        .execute_tagged(&op, |session| {
            Box::pin(async move { session.execute("SELECT * FROM members WHERE id = 12").await.map(|_| member(12)) })
        })
        .await
        .unwrap();
    assert_eq!(fresh, Outcome::Applied(member(12)));

    open_breaker(&layer);
    let connects = server.connects();
    let statements = server.statements();

    for _ in 0..2 {
        let outcome = layer
            .policy()
            .execute_tagged(&op, |session| {
                Box::pin(async move { session.execute("SELECT * FROM members WHERE id = 12").await.map(|_| member(99)) })
            })
            .await
            .unwrap();
        assert_eq!(outcome, Outcome::Cached(member(12)));
    }

    assert_eq!(server.connects(), connects);
    assert_eq!(server.statements(), statements);
    assert_eq!(server.pings(), 1);
}

#[tokio::test]
async fn test_cached_read_is_keyed_by_arguments() {
    let (_server, layer) = setup::data_layer();
    let first = Operation::<Member>::read("get_member").args(json!({ "id": 1 }));
    layer
        .execute(&first, |session| Box::pin(async move { session.execute("SELECT 1").await.map(|_| member(1)) }))
        .await
        .unwrap();

    open_breaker(&layer);

    let other = Operation::<Member>::read("get_member").args(json!({ "id": 2 }));
    let err = layer
        .execute(&other, |session| Box::pin(async move { session.execute("SELECT 1").await.map(|_| member(2)) }))
        .await
        .unwrap_err();

    // No cache entry, no offline store and no default for a struct
    assert!(matches!(err, DbError::CircuitOpen));
}

#[tokio::test]
async fn test_open_circuit_read_falls_back_to_default() {
    let (server, layer) = setup::data_layer();
    open_breaker(&layer);

    let op = Operation::<Vec<Member>>::read("list_members").default_with(|| Some(Vec::new()));
    let outcome = layer
        .policy()
        .execute_tagged(&op, |session| Box::pin(async move { session.execute("SELECT 1").await.map(|_| vec![member(1)]) }))
        .await
        .unwrap();

    assert_eq!(outcome, Outcome::Defaulted(Vec::new()));
    assert_eq!(server.connects(), 0);
}

#[tokio::test]
async fn test_option_results_synthesize_a_default() {
    let (_server, layer) = setup::data_layer();
    open_breaker(&layer);

    let op = Operation::<Option<Member>>::read("find_member_by_dni").args(json!({ "dni": "28999111" }));
    let outcome = layer
        .policy()
        .execute_tagged(&op, |session| Box::pin(async move { session.execute("SELECT 1").await.map(|_| None::<Member>) }))
        .await
        .unwrap();

    assert_eq!(outcome, Outcome::Defaulted(None));
}

#[tokio::test]
async fn test_open_circuit_write_is_queued() {
    let (server, offline, layer) = setup::offline_data_layer();
    open_breaker(&layer);

    let args = json!({ "member_id": 7, "amount": 15000, "method": "cash" });
    let op = Operation::<bool>::write("register_payment").args(args.clone()).default_value(true);
    let outcome = layer
        .policy()
        .execute_tagged(&op, |session| Box::pin(async move { session.execute("INSERT INTO payments").await.map(|_| true) }))
        .await
        .unwrap();

    assert_eq!(outcome, Outcome::Queued(true));
    assert_eq!(offline.queued(), vec![("register_payment".to_string(), args)]);
    assert_eq!(server.connects(), 0);
}

#[tokio::test]
async fn test_uniform_contract_hides_queueing() {
    let (_server, _offline, layer) = setup::offline_data_layer();
    open_breaker(&layer);

    let op = Operation::<()>::write("update_member_phone").args(json!({ "id": 4, "phone": "+54 11 5555 0000" }));
    let value = layer
        .execute(&op, |session| Box::pin(async move { session.execute("UPDATE members").await.map(|_| ()) }))
        .await;

    assert!(value.is_ok());
}

#[tokio::test]
async fn test_write_without_offline_store_surfaces_error() {
    let (_server, layer) = setup::data_layer();
    open_breaker(&layer);

    let op = Operation::<()>::write("delete_class").args(json!({ "id": 3 }));
    let err = layer
        .execute(&op, |session| Box::pin(async move { session.execute("DELETE FROM classes").await.map(|_| ()) }))
        .await
        .unwrap_err();

    assert!(matches!(err, DbError::CircuitOpen));
}

#[tokio::test]
async fn test_write_without_safe_default_is_not_queued() {
    let (server, offline, layer) = setup::offline_data_layer();
    open_breaker(&layer);

    let op = Operation::<u64>::write("register_payment").args(json!({ "member_id": 7, "amount": 15000 }));
    let err = layer
        .policy()
        .execute_tagged(&op, |session| Box::pin(async move { session.execute("INSERT INTO payments").await }))
        .await
        .unwrap_err();

    assert!(matches!(err, DbError::CircuitOpen));
    assert!(offline.queued().is_empty());
    assert_eq!(server.connects(), 0);
}

#[tokio::test]
async fn test_failing_offline_store_keeps_original_error() {
    let (_server, offline, layer) = setup::offline_data_layer();
    offline.set_failing(true);
    open_breaker(&layer);

    let op = Operation::<()>::write("register_attendance").args(json!({ "member_id": 9 }));
    let err = layer
        .execute(&op, |session| Box::pin(async move { session.execute("INSERT INTO attendance").await.map(|_| ()) }))
        .await
        .unwrap_err();

    assert!(matches!(err, DbError::CircuitOpen));
    assert!(offline.queued().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_exhausted_read_uses_offline_result() {
    let (server, offline, layer) = setup::offline_data_layer();
    let args = json!({ "id": 5 });
    offline.seed_read("get_member", &args, json!({ "id": 5, "name": "Lucia Fernandez", "active": false }));
    server.set_down(true);

    let op = Operation::<Member>::read("get_member").args(args);
    let outcome = layer
        .policy()
        .execute_tagged(&op, |session| Box::pin(async move { session.execute("SELECT 1").await.map(|_| member(5)) }))
        .await
        .unwrap();

    assert_eq!(
        outcome,
        Outcome::Cached(Member {
            id: 5,
            name: "Lucia Fernandez".to_string(),
            active: false,
        })
    );
}

#[tokio::test(start_paused = true)]
async fn test_exhausted_write_without_fallback_returns_last_error() {
    let (server, layer) = setup::data_layer();
    server.set_down(true);

    let op = Operation::<()>::write("create_class").args(json!({ "name": "Spinning" }));
    let err = layer
        .execute(&op, |session| Box::pin(async move { session.execute("INSERT INTO classes").await.map(|_| ()) }))
        .await
        .unwrap_err();

    assert!(matches!(err, DbError::Connect(_)));
    assert!(err.is_transient());
}

#[tokio::test]
async fn test_successful_read_is_offered_to_offline_store() {
    let (_server, offline, layer) = setup::offline_data_layer();

    let op = Operation::<u64>::read("count_members");
    layer
        .execute(&op, |session| Box::pin(async move { session.execute("SELECT count(*) FROM members").await }))
        .await
        .unwrap();

    assert_eq!(offline.cached_reads(), 1);
    assert!(offline.queued().is_empty());
}

#[tokio::test]
async fn test_successful_write_invalidates_declared_categories() {
    let (_server, layer) = setup::data_layer();
    layer.cache().set("members", "member:4", &member(4)).unwrap();
    layer.cache().set("classes", "class:1", &"Yoga").unwrap();

    let op = Operation::<u64>::write("update_member").invalidates(["members"]);
    layer
        .execute(&op, |session| Box::pin(async move { session.execute("UPDATE members").await }))
        .await
        .unwrap();

    assert_eq!(layer.cache().len("members"), 0);
    assert_eq!(layer.cache().len("classes"), 1);
}

#[tokio::test]
async fn test_catalog_operations_degrade_with_legacy_defaults() {
    let mut catalog = OperationCatalog::new();
    catalog
        .register("monthly_revenue", OperationKind::Read, Some(json!(0)))
        .register("close_cash_register", OperationKind::Write, Some(json!(true)))
        .invalidates("close_cash_register", ["payments"]);

    let (_server, offline, layer) = setup::offline_data_layer();
    let layer = layer.with_catalog(catalog);
    open_breaker(&layer);

    let revenue: Operation<u64> = layer.operation("monthly_revenue", json!({ "month": 3 }));
    let value = layer
        .execute(&revenue, |session| Box::pin(async move { session.execute("SELECT sum(amount)").await }))
        .await
        .unwrap();
    assert_eq!(value, 0);

    let classes: Operation<Vec<String>> = layer.operation("buscar_clases", json!({ "dia": "lunes" }));
    let value = layer
        .execute(&classes, |session| Box::pin(async move { session.execute("SELECT name").await.map(|_| Vec::<String>::new()) }))
        .await
        .unwrap();
    assert!(value.is_empty());

    let close: Operation<bool> = layer.operation("close_cash_register", json!({}));
    let value = layer
        .execute(&close, |session| Box::pin(async move { session.execute("UPDATE cash").await.map(|_| true) }))
        .await
        .unwrap();
    assert!(value);
    assert_eq!(offline.queued().len(), 1);
}
