#![allow(dead_code)]

use quilldb::QuillConfig;
use quilldb::catalog::{CollectionCatalog, UnboundCollection};
use quilldb::doc::value::DataValue;
use quilldb::query::checkpoint::PlanCheckpoint;
use quilldb::query::executor::next_document;
use quilldb::query::plan::Plan;
use quilldb::storage::kv::{DocTxn, MemoryKv, TxnOptions};
use std::rc::Rc;

pub fn test_config() -> QuillConfig {
    QuillConfig::development()
}

pub fn begin(store: &MemoryKv) -> Rc<DocTxn> {
    DocTxn::begin(store, TxnOptions::default())
}

/// Opens (creating if needed) a collection and commits the metadata so that
/// later transactions see it.
pub async fn open_collection(store: &MemoryKv, name: &str) -> Rc<UnboundCollection> {
    let catalog = CollectionCatalog::new(store.clone());
    let txn = begin(store);
    let cx = catalog.open(&txn, name).await.expect("open collection");
    txn.commit().await.expect("commit metadata");
    cx
}

/// Inserts the given documents in one transaction.
pub async fn seed_documents(store: &MemoryKv, cx: &Rc<UnboundCollection>, docs: &[DataValue]) {
    let txn = begin(store);
    let bound = cx.clone().bind(&txn);
    for doc in docs {
        let staged = bound.stage_insert(doc.clone()).expect("stage insert");
        staged.commit_changes().await.expect("stage cells");
    }
    txn.commit().await.expect("commit seed");
}

pub fn doc_with_id(id: &str) -> DataValue {
    serde_json::json!({ "_id": id }).into()
}

/// Runs a plan to completion, materializing every produced document.
pub async fn collect_values(plan: &Rc<Plan>, txn: &Rc<DocTxn>, config: &QuillConfig) -> Vec<DataValue> {
    try_collect_values(plan, txn, config).await.expect("plan run")
}

pub async fn try_collect_values(
    plan: &Rc<Plan>,
    txn: &Rc<DocTxn>,
    config: &QuillConfig,
) -> Result<Vec<DataValue>, quilldb::QuillError> {
    let checkpoint = PlanCheckpoint::new(config.flow_control_permits);
    let mut stream = plan.execute(&checkpoint, txn);
    let mut values = Vec::new();
    loop {
        match next_document(&checkpoint, &mut stream).await {
            Ok(Some(doc)) => {
                values.push(doc.to_data_value().await?);
            }
            Ok(None) => {
                checkpoint.stop();
                return Ok(values);
            }
            Err(error) => {
                checkpoint.stop();
                return Err(error);
            }
        }
    }
}

pub fn ids_of(values: &[DataValue]) -> Vec<String> {
    values
        .iter()
        .map(|value| match value.field("_id") {
            Some(DataValue::Text(id)) => id.clone(),
            other => panic!("document without text _id: {other:?}"),
        })
        .collect()
}
