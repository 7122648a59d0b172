mod common;

use common::{begin, ids_of, open_collection, seed_documents, test_config};
use quilldb::catalog::CollectionCatalog;
use quilldb::doc::value::DataValue;
use quilldb::query::checkpoint::PlanCheckpoint;
use quilldb::query::cursor::{Cursor, CursorRegistry};
use quilldb::query::plan::Plan;
use quilldb::storage::kv::MemoryKv;
use std::rc::Rc;
use std::time::{Duration, Instant};

/// A non-isolated scan parked in the registry and fetched batch by batch
/// delivers every document exactly once, in order.
#[tokio::test]
async fn paged_cursor_delivers_the_full_scan_exactly_once() {
    let store = MemoryKv::new();
    let cx = open_collection(&store, "paged").await;
    let docs: Vec<DataValue> = (0..100)
        .map(|i| serde_json::json!({ "_id": format!("c{i:02}"), "n": i }).into())
        .collect();
    seed_documents(&store, &cx, &docs).await;

    let config = test_config();
    let plan: Rc<Plan> = Rc::new(Plan::NonIsolated {
        sub: Rc::new(Plan::TableScan { cx: cx.clone() }),
        cx: cx.clone(),
        catalog: CollectionCatalog::new(store.clone()),
        config: config.clone(),
        read_only: true,
    });

    let txn = begin(&store);
    let checkpoint = PlanCheckpoint::new(config.flow_control_permits);
    let stream = plan.execute(&checkpoint, &txn);

    let mut registry = CursorRegistry::new();
    registry.add(Cursor::open(
        42,
        checkpoint,
        stream,
        Instant::now() + Duration::from_secs(60),
    ));

    let mut values = Vec::new();
    let mut fetches = 0;
    loop {
        // Resume by id each round, as a client issuing repeated fetches would.
        let cursor = registry.get(42).expect("cursor parked");
        let (batch, more) = cursor.next_batch(10).await.expect("fetch");
        for doc in batch {
            values.push(doc.to_data_value().await.expect("value"));
        }
        fetches += 1;
        if !more {
            break;
        }
    }

    let expected: Vec<String> = (0..100).map(|i| format!("c{i:02}")).collect();
    assert_eq!(ids_of(&values), expected);
    assert!(fetches > 1, "paging must span several fetches, saw {fetches}");

    assert!(registry.pluck(42));
    assert!(registry.get(42).is_none());
}

/// Pruning an expired cursor cancels the execution parked inside it.
#[tokio::test]
async fn pruning_a_parked_cursor_cancels_its_execution() {
    let store = MemoryKv::new();
    let cx = open_collection(&store, "stale").await;
    let docs: Vec<DataValue> = (0..10)
        .map(|i| serde_json::json!({ "_id": format!("s{i}") }).into())
        .collect();
    seed_documents(&store, &cx, &docs).await;

    let config = test_config();
    let plan: Rc<Plan> = Rc::new(Plan::TableScan { cx: cx.clone() });
    let txn = begin(&store);
    let checkpoint = PlanCheckpoint::new(config.flow_control_permits);
    let stream = plan.execute(&checkpoint, &txn);

    let mut registry = CursorRegistry::new();
    let held = registry.add(Cursor::open(
        9,
        checkpoint,
        stream,
        Instant::now() - Duration::from_secs(1),
    ));

    assert_eq!(registry.prune(Instant::now()), 1);
    assert!(registry.is_empty());

    // The parked stream was cancelled, so a retained handle cannot fetch.
    assert!(held.next_batch(5).await.is_err());
}
