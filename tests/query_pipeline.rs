mod common;

use common::{begin, collect_values, ids_of, open_collection, seed_documents, test_config};
use quilldb::catalog::IndexInfo;
use quilldb::doc::value::DataValue;
use quilldb::query::checkpoint::PlanCheckpoint;
use quilldb::query::executor::next_document;
use quilldb::query::plan::{InsertOp, Order, Plan, Projection, UpdateOp};
use quilldb::query::planner::construct_filter_plan;
use quilldb::query::predicate::{Predicate, ValuePredicate};
use quilldb::storage::encoded::encode_key_part;
use quilldb::storage::kv::MemoryKv;
use std::rc::Rc;

#[tokio::test]
async fn primary_key_equality_returns_exactly_one_document() {
    let store = MemoryKv::new();
    let cx = open_collection(&store, "docs").await;
    let docs: Vec<DataValue> = (0..10)
        .map(|i| serde_json::json!({ "_id": format!("k{i}"), "n": i }).into())
        .collect();
    seed_documents(&store, &cx, &docs).await;

    let plan = construct_filter_plan(
        &cx,
        Rc::new(Plan::TableScan { cx: cx.clone() }),
        Predicate::eq("_id", DataValue::text("k7")),
    );
    let txn = begin(&store);
    let values = collect_values(&plan, &txn, &test_config()).await;
    assert_eq!(ids_of(&values), vec!["k7"]);
    assert_eq!(values[0].field("n"), Some(&DataValue::Int(7)));
}

#[tokio::test]
async fn or_pushdown_returns_both_without_duplicates() {
    let store = MemoryKv::new();
    let cx = open_collection(&store, "docs").await;
    let docs: Vec<DataValue> = ["a", "b", "c", "d"]
        .iter()
        .map(|id| serde_json::json!({ "_id": id }).into())
        .collect();
    seed_documents(&store, &cx, &docs).await;

    let plan = construct_filter_plan(
        &cx,
        Rc::new(Plan::TableScan { cx: cx.clone() }),
        Predicate::Or(vec![
            Predicate::eq("_id", DataValue::text("a")),
            Predicate::eq("_id", DataValue::text("b")),
        ]),
    );
    let txn = begin(&store);
    let mut ids = ids_of(&collect_values(&plan, &txn, &test_config()).await);
    ids.sort();
    assert_eq!(ids, vec!["a", "b"]);
}

#[tokio::test]
async fn array_index_scan_emits_each_document_once_at_its_largest_entry() {
    let store = MemoryKv::new();
    let cx = open_collection(&store, "tagged").await;
    {
        let txn = begin(&store);
        cx.clone().bind(&txn)
            .write_index_descriptor(&IndexInfo::ready("tags_1", &["tags"]))
            .await
            .expect("descriptor");
        txn.commit().await.expect("commit");
    }
    let cx = open_collection(&store, "tagged").await;
    seed_documents(
        &store,
        &cx,
        &[
            serde_json::json!({ "_id": "d1", "tags": ["x", "y", "z"] }).into(),
            serde_json::json!({ "_id": "d2", "tags": ["y"] }).into(),
        ],
    )
    .await;

    let plan = construct_filter_plan(
        &cx,
        Rc::new(Plan::TableScan { cx: cx.clone() }),
        Predicate::any(
            "tags",
            ValuePredicate::between(DataValue::text("a"), DataValue::text("zzz")),
        ),
    );
    assert!(matches!(&*plan, Plan::IndexScan { .. }));

    let txn = begin(&store);
    let config = test_config();
    let checkpoint = PlanCheckpoint::new(config.flow_control_permits);
    let mut stream = plan.execute(&checkpoint, &txn);
    let mut seen = Vec::new();
    while let Some(doc) = next_document(&checkpoint, &mut stream).await.expect("run") {
        let id = match doc.to_data_value().await.expect("value").field("_id") {
            Some(DataValue::Text(id)) => id.clone(),
            other => panic!("bad _id: {other:?}"),
        };
        seen.push((id, doc.scan_key().to_vec()));
    }
    checkpoint.stop();

    // Index order puts d2 (at "y") before d1 (at "z", its largest entry).
    assert_eq!(seen.len(), 2);
    assert_eq!(seen[0].0, "d2");
    assert!(seen[0].1.starts_with(&encode_key_part(&DataValue::text("y"))));
    assert_eq!(seen[1].0, "d1");
    assert!(seen[1].1.starts_with(&encode_key_part(&DataValue::text("z"))));
}

/// Integer- and double-valued fields land in one numeric key range, so a
/// pushed-down range with no residual filter still sees both widths.
#[tokio::test]
async fn mixed_width_numbers_share_index_ranges() {
    let store = MemoryKv::new();
    let cx = open_collection(&store, "measures").await;
    {
        let txn = begin(&store);
        cx.clone()
            .bind(&txn)
            .write_index_descriptor(&IndexInfo::ready("n_1", &["n"]))
            .await
            .expect("descriptor");
        txn.commit().await.expect("commit");
    }
    let cx = open_collection(&store, "measures").await;
    seed_documents(
        &store,
        &cx,
        &[
            serde_json::json!({ "_id": "a", "n": 3 }).into(),
            serde_json::json!({ "_id": "b", "n": 3.0 }).into(),
            serde_json::json!({ "_id": "c", "n": 2 }).into(),
            serde_json::json!({ "_id": "d", "n": 2.5 }).into(),
        ],
    )
    .await;

    let equality = construct_filter_plan(
        &cx,
        Rc::new(Plan::TableScan { cx: cx.clone() }),
        Predicate::eq("n", DataValue::Int(3)),
    );
    assert!(matches!(&*equality, Plan::IndexScan { .. }));
    let txn = begin(&store);
    let mut ids = ids_of(&collect_values(&equality, &txn, &test_config()).await);
    ids.sort();
    assert_eq!(ids, vec!["a", "b"]);

    let range = construct_filter_plan(
        &cx,
        Rc::new(Plan::TableScan { cx: cx.clone() }),
        Predicate::any("n", ValuePredicate::gte(DataValue::Double(2.5))),
    );
    assert!(matches!(&*range, Plan::IndexScan { .. }));
    let txn = begin(&store);
    let mut ids = ids_of(&collect_values(&range, &txn, &test_config()).await);
    ids.sort();
    assert_eq!(ids, vec!["a", "b", "d"]);
}

#[tokio::test]
async fn empty_range_scan_terminates_with_no_documents() {
    let store = MemoryKv::new();
    let cx = open_collection(&store, "docs").await;
    seed_documents(&store, &cx, &[common::doc_with_id("k1")]).await;

    let plan: Rc<Plan> = Rc::new(Plan::PrimaryKeyLookup {
        cx: cx.clone(),
        begin: Some(DataValue::text("z1")),
        end: Some(DataValue::text("z9")),
    });
    let txn = begin(&store);
    assert!(collect_values(&plan, &txn, &test_config()).await.is_empty());
}

#[tokio::test]
async fn skip_discards_the_first_n_documents() {
    let store = MemoryKv::new();
    let cx = open_collection(&store, "docs").await;
    let docs: Vec<DataValue> = (0..10).map(|i| common::doc_with_id(&format!("k{i}"))).collect();
    seed_documents(&store, &cx, &docs).await;

    let plan: Rc<Plan> = Rc::new(Plan::Skip {
        source: Rc::new(Plan::TableScan { cx: cx.clone() }),
        skip: 3,
    });
    let txn = begin(&store);
    let ids = ids_of(&collect_values(&plan, &txn, &test_config()).await);
    assert_eq!(ids.len(), 7);
    assert_eq!(ids[0], "k3");
}

#[tokio::test]
async fn sort_orders_by_the_requested_direction() {
    let store = MemoryKv::new();
    let cx = open_collection(&store, "orders").await;
    let docs: Vec<DataValue> = [30i64, 90, 60, 110, 20]
        .iter()
        .enumerate()
        .map(|(i, amount)| serde_json::json!({ "_id": format!("o{i}"), "amount": amount }).into())
        .collect();
    seed_documents(&store, &cx, &docs).await;

    let plan: Rc<Plan> = Rc::new(Plan::Sort {
        source: Rc::new(Plan::TableScan { cx: cx.clone() }),
        order: vec![("amount".to_string(), Order::Desc)],
        config: test_config(),
    });
    let txn = begin(&store);
    let amounts: Vec<i64> = collect_values(&plan, &txn, &test_config())
        .await
        .iter()
        .map(|v| match v.field("amount") {
            Some(DataValue::Int(n)) => *n,
            other => panic!("bad amount: {other:?}"),
        })
        .collect();
    assert_eq!(amounts, vec![110, 90, 60, 30, 20]);
}

#[tokio::test]
async fn projection_keeps_only_the_selected_fields() {
    let store = MemoryKv::new();
    let cx = open_collection(&store, "docs").await;
    seed_documents(
        &store,
        &cx,
        &[serde_json::json!({ "_id": "k1", "a": 1, "b": 2 }).into()],
    )
    .await;

    let plan: Rc<Plan> = Rc::new(Plan::Projection {
        source: Rc::new(Plan::TableScan { cx: cx.clone() }),
        projection: Rc::new(Projection::Fields(vec!["_id".to_string(), "a".to_string()])),
    });
    let txn = begin(&store);
    let values = collect_values(&plan, &txn, &test_config()).await;
    assert_eq!(values.len(), 1);
    assert_eq!(values[0].field("a"), Some(&DataValue::Int(1)));
    assert_eq!(values[0].field("b"), None);
}

#[tokio::test]
async fn update_honors_limit_and_finishes_started_updates() {
    let store = MemoryKv::new();
    let cx = open_collection(&store, "docs").await;
    let docs: Vec<DataValue> = (0..5).map(|i| common::doc_with_id(&format!("k{i}"))).collect();
    seed_documents(&store, &cx, &docs).await;

    let update: Rc<Plan> = Rc::new(Plan::Update {
        source: Rc::new(Plan::TableScan { cx: cx.clone() }),
        cx: cx.clone(),
        update_op: Rc::new(UpdateOp::SetFields(vec![(
            "touched".to_string(),
            DataValue::Bool(true),
        )])),
        upsert_op: None,
        limit: 2,
    });
    let plan = Plan::flush_changes(update);
    let txn = begin(&store);
    let values = collect_values(&plan, &txn, &test_config()).await;
    assert_eq!(values.len(), 2);
    txn.commit().await.expect("commit updates");

    let txn = begin(&store);
    let all = collect_values(
        &Rc::new(Plan::TableScan { cx: cx.clone() }),
        &txn,
        &test_config(),
    )
    .await;
    let touched = all
        .iter()
        .filter(|v| v.field("touched") == Some(&DataValue::Bool(true)))
        .count();
    assert_eq!(touched, 2);
}

#[tokio::test]
async fn update_with_limit_zero_only_fires_the_upsert() {
    let store = MemoryKv::new();
    let cx = open_collection(&store, "docs").await;

    let update: Rc<Plan> = Rc::new(Plan::Update {
        source: Rc::new(Plan::TableScan { cx: cx.clone() }),
        cx: cx.clone(),
        update_op: Rc::new(UpdateOp::SetFields(Vec::new())),
        upsert_op: Some(Rc::new(InsertOp::new(
            serde_json::json!({ "_id": "u1", "v": 1 }).into(),
        ))),
        limit: 0,
    });
    let plan = Plan::flush_changes(update);
    let txn = begin(&store);
    let values = collect_values(&plan, &txn, &test_config()).await;
    assert_eq!(ids_of(&values), vec!["u1"]);
    txn.commit().await.expect("commit upsert");

    let txn = begin(&store);
    let all = collect_values(
        &Rc::new(Plan::TableScan { cx: cx.clone() }),
        &txn,
        &test_config(),
    )
    .await;
    assert_eq!(ids_of(&all), vec!["u1"]);
}

#[tokio::test]
async fn upsert_does_not_fire_when_a_document_matched() {
    let store = MemoryKv::new();
    let cx = open_collection(&store, "docs").await;
    seed_documents(&store, &cx, &[common::doc_with_id("k1")]).await;

    let update: Rc<Plan> = Rc::new(Plan::Update {
        source: Rc::new(Plan::TableScan { cx: cx.clone() }),
        cx: cx.clone(),
        update_op: Rc::new(UpdateOp::SetFields(vec![(
            "v".to_string(),
            DataValue::Int(2),
        )])),
        upsert_op: Some(Rc::new(InsertOp::new(
            serde_json::json!({ "_id": "u1" }).into(),
        ))),
        limit: i64::MAX,
    });
    let plan = Plan::flush_changes(update);
    let txn = begin(&store);
    let values = collect_values(&plan, &txn, &test_config()).await;
    assert_eq!(ids_of(&values), vec!["k1"]);
}

#[tokio::test]
async fn delete_plan_removes_matched_documents_and_their_index_entries() {
    let store = MemoryKv::new();
    let cx = open_collection(&store, "docs").await;
    {
        let txn = begin(&store);
        cx.clone().bind(&txn)
            .write_index_descriptor(&IndexInfo::ready("v_1", &["v"]))
            .await
            .expect("descriptor");
        txn.commit().await.expect("commit");
    }
    let cx = open_collection(&store, "docs").await;
    seed_documents(
        &store,
        &cx,
        &[
            serde_json::json!({ "_id": "k1", "v": 1 }).into(),
            serde_json::json!({ "_id": "k2", "v": 2 }).into(),
        ],
    )
    .await;

    let target = construct_filter_plan(
        &cx,
        Rc::new(Plan::TableScan { cx: cx.clone() }),
        Predicate::eq("_id", DataValue::text("k1")),
    );
    let plan = Plan::flush_changes(Plan::delete_plan(target, cx.clone(), i64::MAX));
    let txn = begin(&store);
    let deleted = collect_values(&plan, &txn, &test_config()).await;
    assert_eq!(deleted.len(), 1);
    txn.commit().await.expect("commit delete");

    let txn = begin(&store);
    let remaining = ids_of(
        &collect_values(
            &Rc::new(Plan::TableScan { cx: cx.clone() }),
            &txn,
            &test_config(),
        )
        .await,
    );
    assert_eq!(remaining, vec!["k2"]);

    // The index no longer resolves the deleted document either.
    let by_index = construct_filter_plan(
        &cx,
        Rc::new(Plan::TableScan { cx: cx.clone() }),
        Predicate::eq("v", DataValue::Int(1)),
    );
    let txn = begin(&store);
    assert!(collect_values(&by_index, &txn, &test_config()).await.is_empty());
}

#[tokio::test]
async fn insert_plan_emits_every_staged_document() {
    let store = MemoryKv::new();
    let cx = open_collection(&store, "docs").await;

    let insert: Rc<Plan> = Rc::new(Plan::Insert {
        cx: cx.clone(),
        docs: (0..3)
            .map(|i| InsertOp::new(serde_json::json!({ "_id": format!("n{i}") }).into()))
            .collect(),
    });
    let plan = Plan::flush_changes(insert);
    let txn = begin(&store);
    let values = collect_values(&plan, &txn, &test_config()).await;
    assert_eq!(values.len(), 3);
    txn.commit().await.expect("commit inserts");

    let txn = begin(&store);
    let all = ids_of(
        &collect_values(
            &Rc::new(Plan::TableScan { cx: cx.clone() }),
            &txn,
            &test_config(),
        )
        .await,
    );
    assert_eq!(all, vec!["n0", "n1", "n2"]);
}

#[tokio::test]
async fn flow_permits_are_conserved_across_a_filtering_run() {
    let store = MemoryKv::new();
    let cx = open_collection(&store, "docs").await;
    let docs: Vec<DataValue> = (0..20)
        .map(|i| serde_json::json!({ "_id": format!("k{i:02}"), "n": i }).into())
        .collect();
    seed_documents(&store, &cx, &docs).await;

    let plan = construct_filter_plan(
        &cx,
        Rc::new(Plan::TableScan { cx: cx.clone() }),
        Predicate::any("n", ValuePredicate::gte(DataValue::Int(10))),
    );
    let txn = begin(&store);
    let config = test_config();
    let checkpoint = PlanCheckpoint::new(config.flow_control_permits);
    let flow = checkpoint.flow_lock();
    let mut stream = plan.execute(&checkpoint, &txn);
    let mut count = 0;
    while let Some(doc) = next_document(&checkpoint, &mut stream).await.expect("run") {
        drop(doc);
        count += 1;
    }
    checkpoint.stop();
    assert_eq!(count, 10);
    // Every permit taken by the scan was released, either by the filter
    // dropping a document or by the sink consuming it.
    assert_eq!(flow.available(), flow.capacity());
}
