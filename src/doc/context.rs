use crate::catalog::{UnboundCollection, index_entry_suffixes};
use crate::doc::value::{DataValue, clear_path, eval_path, set_path};
use crate::error::QuillError;
use crate::storage::encoded::{
    decode_key_part, encode_key_part, prefix_successor, split_key_parts,
};
use crate::storage::kv::{DocTxn, KvPair, Prefetch, RangeReader};
use std::cell::RefCell;
use std::rc::Rc;
use tokio::sync::OwnedSemaphorePermit;

/// Scan id attached to documents that were not produced by a scan (upserts,
/// inserts, sort and projection outputs).
pub const SYNTHESIZED_SCAN_ID: i32 = -1;

/// A read/write view of the keyspace relative to a prefix. All keys passed
/// in and handed out are relative to that prefix.
#[derive(Clone)]
pub struct SubspaceContext {
    txn: Rc<DocTxn>,
    prefix: Vec<u8>,
}

impl SubspaceContext {
    pub fn new(txn: Rc<DocTxn>, prefix: Vec<u8>) -> Self {
        Self { txn, prefix }
    }

    pub fn sub_context(&self, part: &[u8]) -> SubspaceContext {
        SubspaceContext {
            txn: self.txn.clone(),
            prefix: [self.prefix.as_slice(), part].concat(),
        }
    }

    pub fn txn(&self) -> &Rc<DocTxn> {
        &self.txn
    }

    pub fn prefix(&self) -> &[u8] {
        &self.prefix
    }

    fn absolute(&self, rel: &[u8]) -> Vec<u8> {
        [self.prefix.as_slice(), rel].concat()
    }

    pub async fn get(&self, rel: &[u8]) -> Result<Option<Vec<u8>>, QuillError> {
        self.txn.get(&self.absolute(rel)).await
    }

    pub fn set(&self, rel: Vec<u8>, value: Vec<u8>) {
        self.txn.set(self.absolute(&rel), value);
    }

    pub fn clear(&self, rel: Vec<u8>) {
        self.txn.clear(self.absolute(&rel));
    }

    pub fn clear_prefix(&self, rel: &[u8]) {
        let lo = self.absolute(rel);
        let hi = prefix_successor(&lo);
        self.txn.clear_range(lo, hi);
    }

    /// Ordered read of `[rel_lo, rel_hi)` within this subspace, yielding
    /// relative keys.
    pub fn descendants(&self, rel_lo: Vec<u8>, rel_hi: Vec<u8>, prefetch: Prefetch) -> SubspaceReader {
        let lo = self.absolute(&rel_lo);
        let hi = self.absolute(&rel_hi);
        SubspaceReader {
            inner: self.txn.range_reader(lo, hi, prefetch),
            prefix_len: self.prefix.len(),
        }
    }
}

pub struct SubspaceReader {
    inner: RangeReader,
    prefix_len: usize,
}

impl SubspaceReader {
    pub async fn next(&mut self) -> Result<Option<KvPair>, QuillError> {
        Ok(self.inner.next().await?.map(|mut pair| {
            pair.key.drain(..self.prefix_len);
            pair
        }))
    }
}

/// Writes `value` as a cell tree rooted at `rel`: one cell per scalar plus a
/// header cell for every container, keyed by the encoded path parts.
pub fn write_value_cells(ctx: &SubspaceContext, rel: &[u8], value: &DataValue) {
    ctx.set(rel.to_vec(), encode_key_part(value));
    match value {
        DataValue::Object(fields) => {
            for (name, inner) in fields {
                let child = [rel, encode_key_part(&DataValue::text(name)).as_slice()].concat();
                write_value_cells(ctx, &child, inner);
            }
        }
        DataValue::Array(items) => {
            for (i, inner) in items.iter().enumerate() {
                let child = [rel, encode_key_part(&DataValue::Int(i as i64)).as_slice()].concat();
                write_value_cells(ctx, &child, inner);
            }
        }
        _ => {}
    }
}

/// Reassembles the value rooted at `rel` from its cells, or None when no
/// cell exists there.
pub async fn read_value_at(
    ctx: &SubspaceContext,
    rel: &[u8],
) -> Result<Option<DataValue>, QuillError> {
    let hi = prefix_successor(rel);
    let mut reader = ctx.descendants(rel.to_vec(), hi, Prefetch::Unlimited);
    let mut root: Option<DataValue> = None;
    while let Some(pair) = reader.next().await? {
        let (leaf, _) = decode_key_part(&pair.value)?;
        let suffix = &pair.key[rel.len()..];
        let parts = split_key_parts(suffix)?
            .into_iter()
            .map(|part| decode_key_part(part).map(|(v, _)| v))
            .collect::<Result<Vec<_>, _>>()?;
        let node = root.get_or_insert(DataValue::Null);
        insert_at(node, &parts, leaf);
    }
    Ok(root)
}

fn insert_at(node: &mut DataValue, parts: &[DataValue], leaf: DataValue) {
    match parts.split_first() {
        None => *node = leaf,
        Some((DataValue::Text(field), rest)) => {
            if !matches!(node, DataValue::Object(_)) {
                *node = DataValue::Object(Vec::new());
            }
            let DataValue::Object(fields) = node else {
                unreachable!()
            };
            let idx = match fields.iter().position(|(k, _)| k == field) {
                Some(idx) => idx,
                None => {
                    fields.push((field.clone(), DataValue::Null));
                    fields.len() - 1
                }
            };
            insert_at(&mut fields[idx].1, rest, leaf);
        }
        Some((DataValue::Int(i), rest)) => {
            if !matches!(node, DataValue::Array(_)) {
                *node = DataValue::Array(Vec::new());
            }
            let DataValue::Array(items) = node else {
                unreachable!()
            };
            let idx = *i as usize;
            while items.len() <= idx {
                items.push(DataValue::Null);
            }
            insert_at(&mut items[idx], rest, leaf);
        }
        Some(_) => {}
    }
}

#[derive(Debug, Clone)]
enum PendingOp {
    Set(String, DataValue),
    Clear(String),
    DeleteDoc,
    InsertDoc(DataValue),
}

/// A document inside an open transaction. Writes are deferred; they are
/// staged into the transaction, together with secondary-index maintenance,
/// by `commit_changes`.
pub struct DocumentContext {
    collection: Rc<UnboundCollection>,
    txn: Rc<DocTxn>,
    pk: Vec<u8>,
    pending: RefCell<Vec<PendingOp>>,
}

impl DocumentContext {
    pub fn new(collection: Rc<UnboundCollection>, txn: Rc<DocTxn>, pk: Vec<u8>) -> Self {
        Self {
            collection,
            txn,
            pk,
            pending: RefCell::new(Vec::new()),
        }
    }

    pub fn pk(&self) -> &[u8] {
        &self.pk
    }

    pub fn txn(&self) -> &Rc<DocTxn> {
        &self.txn
    }

    fn doc_ctx(&self) -> SubspaceContext {
        self.collection
            .doc_subspace(&self.txn)
            .sub_context(&self.pk)
    }

    pub fn stage_set(&self, path: &str, value: DataValue) {
        self.pending
            .borrow_mut()
            .push(PendingOp::Set(path.to_string(), value));
    }

    pub fn stage_clear(&self, path: &str) {
        self.pending
            .borrow_mut()
            .push(PendingOp::Clear(path.to_string()));
    }

    pub fn stage_delete(&self) {
        self.pending.borrow_mut().push(PendingOp::DeleteDoc);
    }

    pub fn stage_insert(&self, value: DataValue) {
        self.pending.borrow_mut().push(PendingOp::InsertDoc(value));
    }

    pub async fn read_path(&self, path: &str) -> Result<Option<DataValue>, QuillError> {
        let mut rel = Vec::new();
        for segment in path.split('.') {
            rel.extend_from_slice(&encode_key_part(&DataValue::text(segment)));
        }
        read_value_at(&self.doc_ctx(), &rel).await
    }

    pub async fn read_document(&self) -> Result<Option<DataValue>, QuillError> {
        read_value_at(&self.doc_ctx(), &[]).await
    }

    /// Stages all pending mutations into the transaction: computes the new
    /// document value, rewrites its cells, and maintains every index of the
    /// collection (old entries cleared, new entries set).
    pub async fn commit_changes(&self) -> Result<(), QuillError> {
        let ops: Vec<PendingOp> = self.pending.borrow_mut().drain(..).collect();
        if ops.is_empty() {
            return Ok(());
        }
        let doc_ctx = self.doc_ctx();
        let old = read_value_at(&doc_ctx, &[]).await?;
        let mut new = old.clone();
        for op in &ops {
            match op {
                PendingOp::InsertDoc(value) => new = Some(value.clone()),
                PendingOp::DeleteDoc => new = None,
                PendingOp::Set(path, value) => {
                    let base = new.get_or_insert_with(|| DataValue::Object(Vec::new()));
                    set_path(base, path, value.clone());
                }
                PendingOp::Clear(path) => {
                    if let Some(base) = new.as_mut() {
                        clear_path(base, path);
                    }
                }
            }
        }

        for index in self.collection.indexes() {
            let index_ctx = self.collection.index_subspace(&self.txn, &index.name);
            if let Some(old_doc) = &old {
                for suffix in index_entry_suffixes(old_doc, index, &self.pk) {
                    index_ctx.clear(suffix);
                }
            }
            if let Some(new_doc) = &new {
                for suffix in index_entry_suffixes(new_doc, index, &self.pk) {
                    index_ctx.set(suffix, Vec::new());
                }
            }
        }

        doc_ctx.clear_prefix(&[]);
        if let Some(new_doc) = &new {
            write_value_cells(&doc_ctx, &[], new_doc);
        }
        Ok(())
    }
}

enum DocSource {
    Stored(DocumentContext),
    Memory(RefCell<DataValue>),
}

struct DocInner {
    source: DocSource,
    scan_id: i32,
    scan_key: Vec<u8>,
    permit: RefCell<Option<OwnedSemaphorePermit>>,
}

/// Handle to a document flowing through a plan. Handles are cheap to clone
/// and share their underlying context; the flow-control permit they carry is
/// released when the last clone drops or when it is explicitly detached.
#[derive(Clone)]
pub struct Document {
    inner: Rc<DocInner>,
}

impl Document {
    pub fn stored(
        ctx: DocumentContext,
        scan_id: i32,
        scan_key: Vec<u8>,
        permit: Option<OwnedSemaphorePermit>,
    ) -> Self {
        Self {
            inner: Rc::new(DocInner {
                source: DocSource::Stored(ctx),
                scan_id,
                scan_key,
                permit: RefCell::new(permit),
            }),
        }
    }

    pub fn synthesized(ctx: DocumentContext, permit: Option<OwnedSemaphorePermit>) -> Self {
        Self::stored(ctx, SYNTHESIZED_SCAN_ID, Vec::new(), permit)
    }

    pub fn memory(
        value: DataValue,
        scan_id: i32,
        scan_key: Vec<u8>,
        permit: Option<OwnedSemaphorePermit>,
    ) -> Self {
        Self {
            inner: Rc::new(DocInner {
                source: DocSource::Memory(RefCell::new(value)),
                scan_id,
                scan_key,
                permit: RefCell::new(permit),
            }),
        }
    }

    pub fn scan_id(&self) -> i32 {
        self.inner.scan_id
    }

    pub fn scan_key(&self) -> &[u8] {
        &self.inner.scan_key
    }

    /// Values reachable at `path`, with trailing-array expansion and null
    /// imputation for missing fields.
    pub async fn get_path_values(&self, path: &str) -> Result<Vec<DataValue>, QuillError> {
        match &self.inner.source {
            DocSource::Memory(value) => Ok(eval_path(&value.borrow(), path)),
            DocSource::Stored(ctx) => Ok(match ctx.read_path(path).await? {
                None => vec![DataValue::Null],
                Some(DataValue::Array(items)) => items,
                Some(other) => vec![other],
            }),
        }
    }

    pub fn set_path(&self, path: &str, value: DataValue) {
        match &self.inner.source {
            DocSource::Memory(current) => set_path(&mut current.borrow_mut(), path, value),
            DocSource::Stored(ctx) => ctx.stage_set(path, value),
        }
    }

    pub fn clear_path(&self, path: &str) {
        match &self.inner.source {
            DocSource::Memory(current) => clear_path(&mut current.borrow_mut(), path),
            DocSource::Stored(ctx) => ctx.stage_clear(path),
        }
    }

    pub fn delete_document(&self) {
        match &self.inner.source {
            DocSource::Memory(current) => *current.borrow_mut() = DataValue::Null,
            DocSource::Stored(ctx) => ctx.stage_delete(),
        }
    }

    /// Stages this document's pending writes into its transaction. A no-op
    /// for in-memory documents.
    pub async fn commit_changes(&self) -> Result<(), QuillError> {
        match &self.inner.source {
            DocSource::Memory(_) => Ok(()),
            DocSource::Stored(ctx) => ctx.commit_changes().await,
        }
    }

    pub async fn to_data_value(&self) -> Result<DataValue, QuillError> {
        match &self.inner.source {
            DocSource::Memory(value) => Ok(value.borrow().clone()),
            DocSource::Stored(ctx) => Ok(ctx.read_document().await?.unwrap_or(DataValue::Null)),
        }
    }

    /// The stored value at `path` without array expansion, or None when the
    /// path is absent.
    pub async fn read_path(&self, path: &str) -> Result<Option<DataValue>, QuillError> {
        match &self.inner.source {
            DocSource::Memory(value) => {
                Ok(crate::doc::value::value_at_path(&value.borrow(), path).cloned())
            }
            DocSource::Stored(ctx) => ctx.read_path(path).await,
        }
    }

    pub fn release_permit(&self) {
        *self.inner.permit.borrow_mut() = None;
    }

    pub fn take_permit(&self) -> Option<OwnedSemaphorePermit> {
        self.inner.permit.borrow_mut().take()
    }

    pub fn attach_permit(&self, permit: OwnedSemaphorePermit) {
        *self.inner.permit.borrow_mut() = Some(permit);
    }
}
