use crate::catalog::{CollectionCatalog, IndexInfo, IndexStatus, UnboundCollection};
use crate::config::QuillConfig;
use crate::doc::context::Document;
use crate::doc::value::{DataValue, set_path, value_at_path};
use crate::error::QuillError;
use crate::query::predicate::Predicate;
use crate::storage::kv::MemoryKv;
use std::rc::Rc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Order {
    Asc,
    Desc,
}

/// Mutation applied to each document an update plan receives.
#[derive(Debug, Clone)]
pub enum UpdateOp {
    /// Stage the given path/value assignments.
    SetFields(Vec<(String, DataValue)>),
    /// Stage removal of the whole document.
    Delete,
}

impl UpdateOp {
    pub async fn update(&self, doc: &Document) -> Result<(), QuillError> {
        match self {
            UpdateOp::SetFields(fields) => {
                for (path, value) in fields {
                    doc.set_path(path, value.clone());
                }
                Ok(())
            }
            UpdateOp::Delete => {
                doc.delete_document();
                Ok(())
            }
        }
    }
}

/// Document constructor used by inserts and upserts.
#[derive(Debug, Clone)]
pub struct InsertOp {
    pub document: DataValue,
}

impl InsertOp {
    pub fn new(document: DataValue) -> Self {
        Self { document }
    }
}

/// Projection applied by projection plans and findAndModify.
#[derive(Debug, Clone)]
pub enum Projection {
    Identity,
    Fields(Vec<String>),
}

impl Projection {
    pub async fn apply(&self, doc: &Document) -> Result<DataValue, QuillError> {
        let full = doc.to_data_value().await?;
        match self {
            Projection::Identity => Ok(full),
            Projection::Fields(paths) => {
                let mut out = DataValue::Object(Vec::new());
                for path in paths {
                    if let Some(value) = value_at_path(&full, path) {
                        set_path(&mut out, path, value.clone());
                    }
                }
                Ok(out)
            }
        }
    }
}

/// A query plan. `execute` turns a plan tree into a streaming dataflow of
/// document handles; see `query::executor` for the operator contract.
pub enum Plan {
    Empty,
    TableScan {
        cx: Rc<UnboundCollection>,
    },
    /// Point lookup when `begin == end`, a primary-key range scan otherwise.
    /// Bounds are inclusive document-key values.
    PrimaryKeyLookup {
        cx: Rc<UnboundCollection>,
        begin: Option<DataValue>,
        end: Option<DataValue>,
    },
    /// Range scan over an index subspace. Bounds are encoded value parts;
    /// `end` is inclusive at the value level (its successor is applied when
    /// the range read is issued).
    IndexScan {
        cx: Rc<UnboundCollection>,
        index: IndexInfo,
        begin: Option<Vec<u8>>,
        end: Option<Vec<u8>>,
    },
    Filter {
        cx: Rc<UnboundCollection>,
        source: Rc<Plan>,
        predicate: Rc<Predicate>,
    },
    Projection {
        source: Rc<Plan>,
        projection: Rc<Projection>,
    },
    Sort {
        source: Rc<Plan>,
        order: Vec<(String, Order)>,
        config: QuillConfig,
    },
    Skip {
        source: Rc<Plan>,
        skip: i64,
    },
    Union {
        left: Rc<Plan>,
        right: Rc<Plan>,
    },
    Update {
        source: Rc<Plan>,
        cx: Rc<UnboundCollection>,
        update_op: Rc<UpdateOp>,
        upsert_op: Option<Rc<InsertOp>>,
        limit: i64,
    },
    Insert {
        cx: Rc<UnboundCollection>,
        docs: Vec<InsertOp>,
    },
    IndexInsert {
        cx: Rc<UnboundCollection>,
        info: IndexInfo,
        config: QuillConfig,
    },
    UpdateIndexStatus {
        cx: Rc<UnboundCollection>,
        index_name: String,
        new_status: IndexStatus,
        build_id: Option<u64>,
    },
    BuildIndex {
        scan: Rc<Plan>,
        cx: Rc<UnboundCollection>,
        index: IndexInfo,
    },
    FlushChanges {
        source: Rc<Plan>,
    },
    NonIsolated {
        sub: Rc<Plan>,
        cx: Rc<UnboundCollection>,
        catalog: CollectionCatalog,
        config: QuillConfig,
        read_only: bool,
    },
    Retry {
        sub: Rc<Plan>,
        store: MemoryKv,
        config: QuillConfig,
    },
    FindAndModify {
        sub: Rc<Plan>,
        cx: Rc<UnboundCollection>,
        catalog: CollectionCatalog,
        config: QuillConfig,
        update_op: Rc<UpdateOp>,
        upsert_op: Option<Rc<InsertOp>>,
        projection: Rc<Projection>,
        project_new: bool,
    },
}

impl Plan {
    /// Delete is an update whose operation removes each matched document.
    pub fn delete_plan(source: Rc<Plan>, cx: Rc<UnboundCollection>, limit: i64) -> Rc<Plan> {
        Rc::new(Plan::Update {
            source,
            cx,
            update_op: Rc::new(UpdateOp::Delete),
            upsert_op: None,
            limit,
        })
    }

    pub fn flush_changes(source: Rc<Plan>) -> Rc<Plan> {
        Rc::new(Plan::FlushChanges { source })
    }

    /// Whether this plan can keep running after collection metadata changed
    /// under it between non-isolated transactions.
    pub fn was_metadata_change_okay(&self, new_cx: &UnboundCollection) -> bool {
        match self {
            Plan::IndexScan { index, .. } => new_cx
                .find_index(&index.name)
                .map(|found| found.paths == index.paths && found.status == IndexStatus::Ready)
                .unwrap_or(false),
            Plan::BuildIndex { scan, index, .. } => {
                new_cx
                    .find_index(&index.name)
                    .map(|found| {
                        found.status == IndexStatus::Building && found.build_id == index.build_id
                    })
                    .unwrap_or(false)
                    && scan.was_metadata_change_okay(new_cx)
            }
            Plan::Filter { source, .. }
            | Plan::Projection { source, .. }
            | Plan::Sort { source, .. }
            | Plan::Skip { source, .. }
            | Plan::Update { source, .. }
            | Plan::FlushChanges { source } => source.was_metadata_change_okay(new_cx),
            Plan::Union { left, right } => {
                left.was_metadata_change_okay(new_cx) && right.was_metadata_change_okay(new_cx)
            }
            Plan::NonIsolated { sub, .. }
            | Plan::Retry { sub, .. }
            | Plan::FindAndModify { sub, .. } => sub.was_metadata_change_okay(new_cx),
            Plan::Empty
            | Plan::TableScan { .. }
            | Plan::PrimaryKeyLookup { .. }
            | Plan::Insert { .. }
            | Plan::IndexInsert { .. }
            | Plan::UpdateIndexStatus { .. } => true,
        }
    }

    pub fn describe(&self) -> String {
        match self {
            Plan::Empty => "empty".to_string(),
            Plan::TableScan { .. } => "table_scan".to_string(),
            Plan::PrimaryKeyLookup { begin, end, .. } => {
                format!("pk_lookup({begin:?}, {end:?})")
            }
            Plan::IndexScan { index, .. } => format!("index_scan({})", index.name),
            Plan::Filter {
                source, predicate, ..
            } => {
                format!("filter({}, {})", source.describe(), predicate.describe())
            }
            Plan::Projection { source, .. } => format!("project({})", source.describe()),
            Plan::Sort { source, .. } => format!("sort({})", source.describe()),
            Plan::Skip { source, skip } => format!("skip({}, {skip})", source.describe()),
            Plan::Union { left, right } => {
                format!("union({}, {})", left.describe(), right.describe())
            }
            Plan::Update { source, limit, .. } => {
                format!("update({}, limit={limit})", source.describe())
            }
            Plan::Insert { docs, .. } => format!("insert({})", docs.len()),
            Plan::IndexInsert { info, .. } => format!("index_insert({})", info.name),
            Plan::UpdateIndexStatus { index_name, .. } => {
                format!("update_index_status({index_name})")
            }
            Plan::BuildIndex { index, .. } => format!("build_index({})", index.name),
            Plan::FlushChanges { source } => format!("flush_changes({})", source.describe()),
            Plan::NonIsolated { sub, read_only, .. } => {
                format!("non_isolated(ro={read_only}, {})", sub.describe())
            }
            Plan::Retry { sub, .. } => format!("retry({})", sub.describe()),
            Plan::FindAndModify { sub, .. } => format!("find_and_modify({})", sub.describe()),
        }
    }
}
