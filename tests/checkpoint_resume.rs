mod common;

use common::{begin, collect_values, open_collection, seed_documents, test_config};
use quilldb::doc::value::DataValue;
use quilldb::query::checkpoint::{PlanCheckpoint, drain_pending};
use quilldb::query::executor::next_document;
use quilldb::query::plan::Plan;
use quilldb::query::planner::construct_filter_plan;
use quilldb::query::predicate::{Predicate, ValuePredicate};
use quilldb::storage::encoded::SCAN_KEY_SENTINEL;
use quilldb::storage::kv::MemoryKv;
use std::rc::Rc;

async fn seeded_store(n: usize) -> (MemoryKv, Rc<quilldb::catalog::UnboundCollection>) {
    let store = MemoryKv::new();
    let cx = open_collection(&store, "docs").await;
    let docs: Vec<DataValue> = (0..n)
        .map(|i| serde_json::json!({ "_id": format!("k{i:04}"), "n": i }).into())
        .collect();
    seed_documents(&store, &cx, &docs).await;
    (store, cx)
}

#[tokio::test]
async fn scan_keys_are_strictly_increasing_within_bounds() {
    let (store, cx) = seeded_store(50).await;
    let plan: Rc<Plan> = Rc::new(Plan::TableScan { cx: cx.clone() });
    let txn = begin(&store);
    let config = test_config();
    let checkpoint = PlanCheckpoint::new(config.flow_control_permits);
    let mut stream = plan.execute(&checkpoint, &txn);
    let mut previous: Option<Vec<u8>> = None;
    while let Some(doc) = next_document(&checkpoint, &mut stream).await.expect("run") {
        let key = doc.scan_key().to_vec();
        assert!(key.as_slice() < SCAN_KEY_SENTINEL);
        if let Some(previous) = &previous {
            assert!(key > *previous, "scan keys must strictly increase");
        }
        previous = Some(key);
    }
    checkpoint.stop();
}

/// Interrupting a table scan partway and resuming from the computed
/// checkpoint produces every document exactly once.
#[tokio::test]
async fn split_resume_produces_each_document_exactly_once() {
    let (store, cx) = seeded_store(40).await;
    let plan: Rc<Plan> = Rc::new(Plan::TableScan { cx: cx.clone() });
    let config = test_config();

    for consumed_before_stop in [0usize, 1, 7, 39, 40] {
        let txn = begin(&store);
        let checkpoint = PlanCheckpoint::new(config.flow_control_permits);
        let mut stream = plan.execute(&checkpoint, &txn);
        let mut ids = Vec::new();
        for _ in 0..consumed_before_stop {
            let doc = next_document(&checkpoint, &mut stream)
                .await
                .expect("run")
                .expect("document available");
            ids.push(id_of_doc(&doc).await);
        }
        let undelivered = drain_pending(&mut stream);
        let resumed = checkpoint.stop_and_checkpoint_with(&undelivered);
        drop(undelivered);

        let txn = begin(&store);
        let mut stream = plan.execute(&resumed, &txn);
        while let Some(doc) = next_document(&resumed, &mut stream).await.expect("resume") {
            ids.push(id_of_doc(&doc).await);
        }
        resumed.stop();

        let expected: Vec<String> = (0..40).map(|i| format!("k{i:04}")).collect();
        assert_eq!(ids, expected, "consumed {consumed_before_stop} before stop");
    }
}

async fn id_of_doc(doc: &quilldb::doc::Document) -> String {
    match doc.to_data_value().await.expect("value").field("_id") {
        Some(DataValue::Text(id)) => id.clone(),
        other => panic!("bad _id: {other:?}"),
    }
}

/// A filter holding documents in flight at stop time must push the split
/// back to the earliest unforwarded document.
#[tokio::test]
async fn filtered_scan_resumes_without_gaps_or_repeats() {
    let (store, cx) = seeded_store(30).await;
    let plan = construct_filter_plan(
        &cx,
        Rc::new(Plan::TableScan { cx: cx.clone() }),
        Predicate::any("n", ValuePredicate::gte(DataValue::Int(10))),
    );
    let config = test_config();

    let txn = begin(&store);
    let checkpoint = PlanCheckpoint::new(config.flow_control_permits);
    let mut stream = plan.execute(&checkpoint, &txn);
    let mut ids = Vec::new();
    for _ in 0..5 {
        let doc = next_document(&checkpoint, &mut stream)
            .await
            .expect("run")
            .expect("document available");
        ids.push(id_of_doc(&doc).await);
    }
    let undelivered = drain_pending(&mut stream);
    let resumed = checkpoint.stop_and_checkpoint_with(&undelivered);
    drop(undelivered);

    let txn = begin(&store);
    let mut stream = plan.execute(&resumed, &txn);
    while let Some(doc) = next_document(&resumed, &mut stream).await.expect("resume") {
        ids.push(id_of_doc(&doc).await);
    }
    resumed.stop();

    let expected: Vec<String> = (10..30).map(|i| format!("k{i:04}")).collect();
    assert_eq!(ids, expected);
}

#[tokio::test]
async fn checkpoint_before_any_progress_keeps_bounds_unchanged() {
    let (store, cx) = seeded_store(10).await;
    let plan: Rc<Plan> = Rc::new(Plan::TableScan { cx: cx.clone() });
    let config = test_config();

    let txn = begin(&store);
    let checkpoint = PlanCheckpoint::new(config.flow_control_permits);
    let stream = plan.execute(&checkpoint, &txn);
    let (begin_before, end_before) = checkpoint.bounds(0);
    // Nothing was polled, so no document was produced or lost.
    let resumed = checkpoint.stop_and_checkpoint();
    drop(stream);
    let (begin_after, end_after) = resumed.bounds(0);
    assert_eq!(begin_before, begin_after);
    assert_eq!(end_before, end_after);

    let txn = begin(&store);
    let values = collect_values(&plan, &txn, &config).await;
    drop(resumed);
    assert_eq!(values.len(), 10);
}

#[tokio::test]
async fn skip_count_survives_a_checkpoint() {
    let (store, cx) = seeded_store(20).await;
    let plan: Rc<Plan> = Rc::new(Plan::Skip {
        source: Rc::new(Plan::TableScan { cx: cx.clone() }),
        skip: 5,
    });
    let config = test_config();

    let txn = begin(&store);
    let checkpoint = PlanCheckpoint::new(config.flow_control_permits);
    let mut stream = plan.execute(&checkpoint, &txn);
    let mut ids = Vec::new();
    for _ in 0..3 {
        let doc = next_document(&checkpoint, &mut stream)
            .await
            .expect("run")
            .expect("document available");
        ids.push(id_of_doc(&doc).await);
    }
    let undelivered = drain_pending(&mut stream);
    let resumed = checkpoint.stop_and_checkpoint_with(&undelivered);
    drop(undelivered);

    // The resumed execution must not skip another five documents.
    let txn = begin(&store);
    let mut stream = plan.execute(&resumed, &txn);
    while let Some(doc) = next_document(&resumed, &mut stream).await.expect("resume") {
        ids.push(id_of_doc(&doc).await);
    }
    resumed.stop();

    let expected: Vec<String> = (5..20).map(|i| format!("k{i:04}")).collect();
    assert_eq!(ids, expected);
}

#[tokio::test]
async fn resumed_bounds_bracket_the_interruption_point() {
    let (store, cx) = seeded_store(20).await;
    let plan: Rc<Plan> = Rc::new(Plan::TableScan { cx: cx.clone() });
    let config = test_config();

    let txn = begin(&store);
    let checkpoint = PlanCheckpoint::new(config.flow_control_permits);
    let mut stream = plan.execute(&checkpoint, &txn);
    let mut last_emitted_key = Vec::new();
    for _ in 0..4 {
        let doc = next_document(&checkpoint, &mut stream)
            .await
            .expect("run")
            .expect("document available");
        last_emitted_key = doc.scan_key().to_vec();
    }
    let undelivered = drain_pending(&mut stream);
    let first_undelivered_key = undelivered.first().map(|d| d.scan_key().to_vec());
    let resumed = checkpoint.stop_and_checkpoint_with(&undelivered);
    drop(undelivered);

    let (split, _) = resumed.bounds(0);
    assert!(split > last_emitted_key, "split must exceed all delivered keys");
    if let Some(next_key) = first_undelivered_key {
        assert!(split <= next_key, "split must not pass undelivered keys");
    }
}
