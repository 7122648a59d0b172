//! Streaming plan execution.
//!
//! `Plan::execute` builds a dataflow of operator tasks over document
//! streams. The operator contract:
//!
//! - Tasks are created synchronously during `execute`, with subplans
//!   executed in a fixed left-to-right order so scan ids line up across
//!   re-executions, and are registered with the checkpoint in topological
//!   order (inputs before consumers).
//! - A task with an input stream is always suspended on that input
//!   (possibly together with other events); documents never accumulate
//!   unread.
//! - Scans take one flow-control permit per emitted document and attach a
//!   monotonically increasing scan key below the sentinel. Stages that
//!   drop a document drop its permit with it; the terminal sink releases a
//!   permit by dropping the consumed document.
//! - When an execution is stopped for a checkpoint, cancellation guards
//!   record split keys for every document received but not forwarded
//!   (see `query::checkpoint`).

use crate::catalog::{CollectionCatalog, IndexInfo, IndexStatus, UnboundCollection, cartesian_concat};
use crate::config::QuillConfig;
use crate::doc::context::{Document, DocumentContext, SYNTHESIZED_SCAN_ID};
use crate::doc::value::{DataValue, value_at_path};
use crate::error::QuillError;
use crate::query::checkpoint::{
    DocSender, DocStream, InputEvent, OpInput, PlanCheckpoint, ScanGuard, SplitKind, StateSlot,
    doc_channel, drain_pending, next_event,
};
use crate::query::checkpoint::CheckpointCore;
use crate::query::plan::{InsertOp, Order, Plan, Projection, UpdateOp};
use crate::storage::encoded::{
    SCAN_KEY_SENTINEL, encode_key_part, first_key_part_len, prefix_successor, split_key_parts,
};
use crate::storage::kv::{DocTxn, KvTransaction, MemoryKv, Prefetch, TxnOptions};
use futures::future::LocalBoxFuture;
use futures::stream::{FuturesOrdered, StreamExt};
use std::cmp::Ordering;
use std::collections::VecDeque;
use std::rc::Rc;
use tracing::{debug, warn};

type EvalQueue<T> = FuturesOrdered<LocalBoxFuture<'static, Result<T, QuillError>>>;

/// Receives the next stream event while keeping the checkpoint's operator
/// tasks running.
pub async fn recv_driving(checkpoint: &PlanCheckpoint, stream: &mut DocStream) -> InputEvent {
    tokio::select! {
        event = next_event(stream) => event,
        _ = checkpoint.drive() => InputEvent::End,
    }
}

/// Receives the next document, driving the execution. Ok(None) is normal
/// completion.
pub async fn next_document(
    checkpoint: &PlanCheckpoint,
    stream: &mut DocStream,
) -> Result<Option<Document>, QuillError> {
    match recv_driving(checkpoint, stream).await {
        InputEvent::Doc(doc) => Ok(Some(doc)),
        InputEvent::End => Ok(None),
        InputEvent::Error(error) => Err(error),
    }
}

/// Runs a plan to completion within the given transaction, returning how
/// many documents it produced.
pub async fn execute_until_completion_transactionally(
    plan: &Rc<Plan>,
    txn: &Rc<DocTxn>,
    config: &QuillConfig,
) -> Result<u64, QuillError> {
    let (count, _) = execute_until_completion_and_return_last(plan, txn, config).await?;
    Ok(count)
}

/// Like `execute_until_completion_transactionally` but also returns the last
/// document produced.
pub async fn execute_until_completion_and_return_last(
    plan: &Rc<Plan>,
    txn: &Rc<DocTxn>,
    config: &QuillConfig,
) -> Result<(u64, Option<Document>), QuillError> {
    let checkpoint = PlanCheckpoint::new(config.flow_control_permits);
    let mut stream = plan.execute(&checkpoint, txn);
    let mut count = 0u64;
    let mut last = None;
    loop {
        match next_document(&checkpoint, &mut stream).await {
            Ok(Some(doc)) => {
                last = Some(doc);
                count += 1;
            }
            Ok(None) => {
                checkpoint.stop();
                return Ok((count, last));
            }
            Err(error) => {
                checkpoint.stop();
                return Err(error);
            }
        }
    }
}

fn wrapper_txn_options(config: &QuillConfig) -> TxnOptions {
    TxnOptions {
        timeout_ms: config.txn_timeout_ms,
        retry_limit: config.txn_retry_limit,
        causal_read_risky: true,
    }
}

impl Plan {
    /// Builds this plan's operator tasks against `checkpoint` and returns
    /// the output stream of the root operator.
    pub fn execute(&self, checkpoint: &PlanCheckpoint, txn: &Rc<DocTxn>) -> DocStream {
        let (output, rx) = doc_channel();
        match self {
            Plan::Empty => {
                let out = output.clone();
                checkpoint.add_operation(
                    Box::pin(async move {
                        out.send_end();
                    }),
                    output,
                );
            }
            Plan::TableScan { cx } => {
                let scan_id = checkpoint.add_scan();
                let (bounds_begin, bounds_end) = checkpoint.bounds(scan_id);
                let lower = bounds_begin;
                let upper = bounds_end.max(lower.clone());
                let reader =
                    cx.doc_subspace(txn)
                        .descendants(lower.clone(), upper, Prefetch::one());
                // The guard exists from registration on, so stopping an
                // execution that never ran still restarts from the lower
                // bound rather than reading the scan as complete.
                let guard = ScanGuard::new(
                    checkpoint.core(),
                    scan_id,
                    lower,
                    SplitKind::PrimaryPrefix,
                );
                let task = do_pk_scan(
                    checkpoint.core(),
                    cx.clone(),
                    txn.clone(),
                    scan_id,
                    guard,
                    reader,
                    output.clone(),
                );
                checkpoint.add_operation(Box::pin(task), output);
            }
            Plan::PrimaryKeyLookup { cx, begin, end } => {
                let scan_id = checkpoint.add_scan();
                if let (Some(b), Some(e)) = (begin, end)
                    && b == e
                {
                    let key = encode_key_part(b);
                    let (bounds_begin, bounds_end) = checkpoint.bounds(scan_id);
                    let lower = key.clone().max(bounds_begin.clone());
                    let guard =
                        ScanGuard::new(checkpoint.core(), scan_id, lower, SplitKind::Point);
                    let task = do_single_pk_lookup(
                        checkpoint.core(),
                        cx.clone(),
                        txn.clone(),
                        scan_id,
                        key,
                        bounds_begin,
                        bounds_end,
                        guard,
                        output.clone(),
                    );
                    checkpoint.add_operation(Box::pin(task), output);
                } else {
                    let (bounds_begin, bounds_end) = checkpoint.bounds(scan_id);
                    let own_begin = begin.as_ref().map(encode_key_part).unwrap_or_default();
                    let own_end = end
                        .as_ref()
                        .map(|v| prefix_successor(&encode_key_part(v)))
                        .unwrap_or_else(|| SCAN_KEY_SENTINEL.to_vec());
                    let lower = own_begin.max(bounds_begin);
                    let upper = own_end.min(bounds_end).max(lower.clone());
                    let reader =
                        cx.doc_subspace(txn)
                            .descendants(lower.clone(), upper, Prefetch::one());
                    let guard = ScanGuard::new(
                        checkpoint.core(),
                        scan_id,
                        lower,
                        SplitKind::PrimaryPrefix,
                    );
                    let task = do_pk_scan(
                        checkpoint.core(),
                        cx.clone(),
                        txn.clone(),
                        scan_id,
                        guard,
                        reader,
                        output.clone(),
                    );
                    checkpoint.add_operation(Box::pin(task), output);
                }
            }
            Plan::IndexScan {
                cx,
                index,
                begin,
                end,
            } => {
                let scan_id = checkpoint.add_scan();
                let (bounds_begin, bounds_end) = checkpoint.bounds(scan_id);
                let own_begin = begin.clone().unwrap_or_default();
                let own_end = end
                    .as_ref()
                    .map(|e| prefix_successor(e))
                    .unwrap_or_else(|| SCAN_KEY_SENTINEL.to_vec());
                let lower = own_begin.max(bounds_begin);
                let upper = own_end.min(bounds_end).max(lower.clone());
                let reader = cx.index_subspace(txn, &index.name).descendants(
                    lower.clone(),
                    upper.clone(),
                    Prefetch::one(),
                );
                let (entries_tx, entries_rx) = doc_channel();
                let guard =
                    ScanGuard::new(checkpoint.core(), scan_id, lower, SplitKind::KeyAfter);
                let task = to_doc_info(
                    checkpoint.core(),
                    cx.clone(),
                    txn.clone(),
                    scan_id,
                    guard,
                    reader,
                    entries_tx.clone(),
                );
                checkpoint.add_operation(Box::pin(task), entries_tx);

                let point_read =
                    begin.is_some() && begin == end && index.is_simple();
                if point_read {
                    return entries_rx;
                }
                let dedup = do_index_dedup(
                    index.clone(),
                    upper,
                    OpInput::new(checkpoint.core(), entries_rx),
                    output.clone(),
                );
                checkpoint.add_operation(Box::pin(dedup), output);
            }
            Plan::Filter {
                source, predicate, ..
            } => {
                let input = OpInput::new(checkpoint.core(), source.execute(checkpoint, txn));
                let task = do_filter(input, output.clone(), predicate.clone());
                checkpoint.add_operation(Box::pin(task), output);
            }
            Plan::Projection { source, projection } => {
                let input = OpInput::new(checkpoint.core(), source.execute(checkpoint, txn));
                let task = do_projection(input, output.clone(), projection.clone());
                checkpoint.add_operation(Box::pin(task), output);
            }
            Plan::Sort {
                source,
                order,
                config,
            } => {
                let task = do_sort(
                    checkpoint.core(),
                    txn.clone(),
                    source.clone(),
                    order.clone(),
                    config.clone(),
                    output.clone(),
                );
                checkpoint.add_operation(Box::pin(task), output);
            }
            Plan::Skip { source, skip } => {
                let slot = checkpoint.int_state(*skip);
                let input = OpInput::new(checkpoint.core(), source.execute(checkpoint, txn));
                let task = do_skip(slot, input, output.clone());
                checkpoint.add_operation(Box::pin(task), output);
            }
            Plan::Union { left, right } => {
                let left_input = OpInput::new(checkpoint.core(), left.execute(checkpoint, txn));
                let right_input = OpInput::new(checkpoint.core(), right.execute(checkpoint, txn));
                let task = do_union(left_input, right_input, output.clone());
                checkpoint.add_operation(Box::pin(task), output);
            }
            Plan::Update {
                source,
                cx,
                update_op,
                upsert_op,
                limit,
            } => {
                let count = checkpoint.int_state(0);
                let input = OpInput::new(checkpoint.core(), source.execute(checkpoint, txn));
                let task = do_update(
                    checkpoint.core(),
                    txn.clone(),
                    input,
                    output.clone(),
                    update_op.clone(),
                    upsert_op.clone(),
                    *limit,
                    cx.clone(),
                    count,
                );
                checkpoint.add_operation(Box::pin(task), output);
            }
            Plan::Insert { cx, docs } => {
                let task = do_insert(
                    checkpoint.core(),
                    txn.clone(),
                    cx.clone(),
                    docs.clone(),
                    output.clone(),
                );
                checkpoint.add_operation(Box::pin(task), output);
            }
            Plan::IndexInsert { cx, info, config } => {
                let task = do_index_insert(
                    checkpoint.core(),
                    txn.clone(),
                    cx.clone(),
                    info.clone(),
                    config.clone(),
                    output.clone(),
                );
                checkpoint.add_operation(Box::pin(task), output);
            }
            Plan::UpdateIndexStatus {
                cx,
                index_name,
                new_status,
                build_id,
            } => {
                let task = do_update_index_status(
                    checkpoint.core(),
                    txn.clone(),
                    cx.clone(),
                    index_name.clone(),
                    *new_status,
                    *build_id,
                    output.clone(),
                );
                checkpoint.add_operation(Box::pin(task), output);
            }
            Plan::BuildIndex { scan, cx, index } => {
                let input = OpInput::new(checkpoint.core(), scan.execute(checkpoint, txn));
                let task = do_build_index(
                    checkpoint.core(),
                    txn.clone(),
                    cx.clone(),
                    index.clone(),
                    input,
                    output.clone(),
                );
                checkpoint.add_operation(Box::pin(task), output);
            }
            Plan::FlushChanges { source } => {
                let input = OpInput::new(checkpoint.core(), source.execute(checkpoint, txn));
                let task = do_flush_changes(input, output.clone());
                checkpoint.add_operation(Box::pin(task), output);
            }
            Plan::NonIsolated {
                sub,
                cx,
                catalog,
                config,
                read_only,
            } => {
                let task: LocalBoxFuture<'static, ()> = if *read_only {
                    Box::pin(do_non_isolated_ro(
                        checkpoint.core(),
                        sub.clone(),
                        cx.clone(),
                        catalog.clone(),
                        config.clone(),
                        txn.clone(),
                        output.clone(),
                    ))
                } else {
                    Box::pin(do_non_isolated_rw(
                        checkpoint.core(),
                        sub.clone(),
                        cx.clone(),
                        catalog.clone(),
                        config.clone(),
                        txn.clone(),
                        output.clone(),
                    ))
                };
                checkpoint.add_operation(task, output);
            }
            Plan::Retry { sub, store, config } => {
                let task = do_retry(
                    checkpoint.core(),
                    sub.clone(),
                    store.clone(),
                    config.clone(),
                    txn.clone(),
                    output.clone(),
                );
                checkpoint.add_operation(Box::pin(task), output);
            }
            Plan::FindAndModify {
                sub,
                cx,
                catalog,
                config,
                update_op,
                upsert_op,
                projection,
                project_new,
            } => {
                let task = do_find_and_modify(
                    checkpoint.core(),
                    sub.clone(),
                    cx.clone(),
                    catalog.clone(),
                    config.clone(),
                    update_op.clone(),
                    upsert_op.clone(),
                    projection.clone(),
                    *project_new,
                    txn.clone(),
                    output.clone(),
                );
                checkpoint.add_operation(Box::pin(task), output);
            }
        }
        rx
    }
}

/// Reads document cells in primary-key order and emits each document once,
/// keyed by the primary-key prefix of its cells.
async fn do_pk_scan(
    core: Rc<CheckpointCore>,
    cx: Rc<UnboundCollection>,
    txn: Rc<DocTxn>,
    scan_id: usize,
    mut guard: ScanGuard,
    mut reader: crate::doc::context::SubspaceReader,
    output: DocSender,
) {
    let flow = core.flow_lock();
    let mut last_pk: Option<Vec<u8>> = None;
    loop {
        match reader.next().await {
            Ok(Some(pair)) => {
                let pk_len = match first_key_part_len(&pair.key) {
                    Ok(len) => len,
                    Err(error) => {
                        output.send_error(error);
                        return;
                    }
                };
                let pk = pair.key[..pk_len].to_vec();
                let key = pair.key;
                drop(pair.permit);
                if last_pk.as_ref() != Some(&pk) {
                    last_pk = Some(pk.clone());
                    let permit = flow.take().await;
                    let ctx = DocumentContext::new(cx.clone(), txn.clone(), pk);
                    output.send_doc(Document::stored(
                        ctx,
                        scan_id as i32,
                        key.clone(),
                        Some(permit),
                    ));
                }
                // Updated only after the document is out, so a stop while
                // waiting for a permit does not skip past it.
                guard.last_key = Some(key);
            }
            Ok(None) => {
                output.send_end();
                return;
            }
            Err(error) => {
                output.send_error(error);
                return;
            }
        }
    }
}

#[allow(clippy::too_many_arguments)]
async fn do_single_pk_lookup(
    core: Rc<CheckpointCore>,
    cx: Rc<UnboundCollection>,
    txn: Rc<DocTxn>,
    scan_id: usize,
    key: Vec<u8>,
    bounds_begin: Vec<u8>,
    bounds_end: Vec<u8>,
    mut guard: ScanGuard,
    output: DocSender,
) {
    let flow = core.flow_lock();
    if key >= bounds_begin && key < bounds_end {
        match cx.doc_subspace(&txn).get(&key).await {
            Ok(Some(_)) => {
                let permit = flow.take().await;
                let ctx = DocumentContext::new(cx.clone(), txn.clone(), key.clone());
                output.send_doc(Document::stored(ctx, scan_id as i32, key.clone(), Some(permit)));
                guard.last_key = Some(key);
            }
            Ok(None) => {
                guard.last_key = Some(key);
            }
            Err(error) => {
                output.send_error(error);
                return;
            }
        }
    } else {
        guard.last_key = Some(key);
    }
    output.send_end();
}

/// Converts index entries into handles on the primary documents they point
/// at. The primary key is the last part of each index entry key.
async fn to_doc_info(
    core: Rc<CheckpointCore>,
    cx: Rc<UnboundCollection>,
    txn: Rc<DocTxn>,
    scan_id: usize,
    mut guard: ScanGuard,
    mut reader: crate::doc::context::SubspaceReader,
    output: DocSender,
) {
    let flow = core.flow_lock();
    loop {
        match reader.next().await {
            Ok(Some(pair)) => {
                let pk = match split_key_parts(&pair.key) {
                    Ok(parts) => match parts.last() {
                        Some(pk) => pk.to_vec(),
                        None => {
                            output.send_error(QuillError::Decode("empty index entry".into()));
                            return;
                        }
                    },
                    Err(error) => {
                        output.send_error(error);
                        return;
                    }
                };
                let key = pair.key;
                drop(pair.permit);
                let permit = flow.take().await;
                guard.last_key = Some(key.clone());
                let ctx = DocumentContext::new(cx.clone(), txn.clone(), pk);
                output.send_doc(Document::stored(ctx, scan_id as i32, key, Some(permit)));
            }
            Ok(None) => {
                output.send_end();
                return;
            }
            Err(error) => {
                output.send_error(error);
                return;
            }
        }
    }
}

/// Whether the current index entry is the lexicographically largest entry
/// for its document that the scan range will visit. Emitting on the last
/// occurrence keeps split keys correct: everything not yet seen for the
/// document is behind the entry that made it through.
async fn would_be_last(
    doc: Document,
    index: IndexInfo,
    index_upper_bound: Vec<u8>,
) -> Result<bool, QuillError> {
    let mut dimensions = Vec::with_capacity(index.paths.len());
    for path in &index.paths {
        let values = doc.get_path_values(path).await?;
        dimensions.push(values.iter().map(encode_key_part).collect::<Vec<_>>());
    }
    let combinations: usize = dimensions.iter().map(|d| d.len()).product();
    if combinations <= 1 {
        return Ok(true);
    }
    let mut entry_values = cartesian_concat(&dimensions);
    entry_values.sort();
    let last = entry_values
        .iter()
        .rev()
        .find(|candidate| candidate.as_slice() < index_upper_bound.as_slice())
        .cloned()
        .unwrap_or_default();
    Ok(doc.scan_key().starts_with(&last))
}

async fn do_index_dedup(
    index: IndexInfo,
    index_upper_bound: Vec<u8>,
    mut input: OpInput,
    output: DocSender,
) {
    let mut evals: EvalQueue<bool> = FuturesOrdered::new();
    loop {
        tokio::select! {
            event = input.next() => match event {
                InputEvent::Doc(doc) => {
                    let eval = would_be_last(doc.clone(), index.clone(), index_upper_bound.clone());
                    evals.push_back(Box::pin(eval));
                    input.push_pending(doc);
                }
                InputEvent::End => break,
                InputEvent::Error(error) => {
                    output.send_error(error);
                    return;
                }
            },
            Some(result) = evals.next(), if !evals.is_empty() => {
                let doc = input.pop_pending().expect("pending tracks evals");
                match result {
                    Ok(true) => output.send_doc(doc),
                    Ok(false) => drop(doc),
                    Err(error) => {
                        output.send_error(error);
                        return;
                    }
                }
            }
        }
    }
    while let Some(result) = evals.next().await {
        let doc = input.pop_pending().expect("pending tracks evals");
        match result {
            Ok(true) => output.send_doc(doc),
            Ok(false) => drop(doc),
            Err(error) => {
                output.send_error(error);
                return;
            }
        }
    }
    output.send_end();
}

/// Evaluates the predicate against each document, preserving input order.
/// Dropped documents release their flow-control permit with them.
async fn do_filter(mut input: OpInput, output: DocSender, predicate: Rc<crate::query::predicate::Predicate>) {
    let mut evals: EvalQueue<bool> = FuturesOrdered::new();
    loop {
        tokio::select! {
            event = input.next() => match event {
                InputEvent::Doc(doc) => {
                    let pred = predicate.clone();
                    let subject = doc.clone();
                    evals.push_back(Box::pin(async move { pred.matches(&subject).await }));
                    input.push_pending(doc);
                }
                InputEvent::End => break,
                InputEvent::Error(error) => {
                    output.send_error(error);
                    return;
                }
            },
            Some(result) = evals.next(), if !evals.is_empty() => {
                let doc = input.pop_pending().expect("pending tracks evals");
                match result {
                    Ok(true) => output.send_doc(doc),
                    Ok(false) => drop(doc),
                    Err(error) => {
                        output.send_error(error);
                        return;
                    }
                }
            }
        }
    }
    while let Some(result) = evals.next().await {
        let doc = input.pop_pending().expect("pending tracks evals");
        match result {
            Ok(true) => output.send_doc(doc),
            Ok(false) => drop(doc),
            Err(error) => {
                output.send_error(error);
                return;
            }
        }
    }
    output.send_end();
}

/// Applies the projection to each document, preserving input order. Output
/// documents are in-memory values that keep the source scan id, scan key
/// and permit.
async fn do_projection(mut input: OpInput, output: DocSender, projection: Rc<Projection>) {
    let mut evals: EvalQueue<DataValue> = FuturesOrdered::new();
    let emit = |output: &DocSender, doc: Document, value: DataValue| {
        let permit = doc.take_permit();
        output.send_doc(Document::memory(
            value,
            doc.scan_id(),
            doc.scan_key().to_vec(),
            permit,
        ));
    };
    loop {
        tokio::select! {
            event = input.next() => match event {
                InputEvent::Doc(doc) => {
                    let proj = projection.clone();
                    let subject = doc.clone();
                    evals.push_back(Box::pin(async move { proj.apply(&subject).await }));
                    input.push_pending(doc);
                }
                InputEvent::End => break,
                InputEvent::Error(error) => {
                    output.send_error(error);
                    return;
                }
            },
            Some(result) = evals.next(), if !evals.is_empty() => {
                let doc = input.pop_pending().expect("pending tracks evals");
                match result {
                    Ok(value) => emit(&output, doc, value),
                    Err(error) => {
                        output.send_error(error);
                        return;
                    }
                }
            }
        }
    }
    while let Some(result) = evals.next().await {
        let doc = input.pop_pending().expect("pending tracks evals");
        match result {
            Ok(value) => emit(&output, doc, value),
            Err(error) => {
                output.send_error(error);
                return;
            }
        }
    }
    output.send_end();
}

/// Blocking sort: drains the subplan under its own checkpoint, orders the
/// materialized documents, then re-emits them as in-memory documents.
async fn do_sort(
    core: Rc<CheckpointCore>,
    txn: Rc<DocTxn>,
    sub: Rc<Plan>,
    order: Vec<(String, Order)>,
    config: QuillConfig,
    output: DocSender,
) {
    let inner = PlanCheckpoint::new(config.flow_control_permits);
    let mut docs = sub.execute(&inner, &txn);
    let mut entries: Vec<(Vec<DataValue>, DataValue)> = Vec::new();
    loop {
        match recv_driving(&inner, &mut docs).await {
            InputEvent::Doc(doc) => {
                let full = match doc.to_data_value().await {
                    Ok(full) => full,
                    Err(error) => {
                        inner.stop();
                        output.send_error(error);
                        return;
                    }
                };
                let sort_key = order
                    .iter()
                    .map(|(path, _)| {
                        value_at_path(&full, path)
                            .cloned()
                            .unwrap_or(DataValue::Null)
                    })
                    .collect();
                entries.push((sort_key, full));
            }
            InputEvent::End => break,
            InputEvent::Error(error) => {
                inner.stop();
                output.send_error(error);
                return;
            }
        }
    }
    entries.sort_by(|(a, _), (b, _)| {
        for (i, (_, direction)) in order.iter().enumerate() {
            let ord = a[i].cmp_order(&b[i]);
            let ord = match direction {
                Order::Asc => ord,
                Order::Desc => ord.reverse(),
            };
            if ord != Ordering::Equal {
                return ord;
            }
        }
        Ordering::Equal
    });
    let flow = core.flow_lock();
    for (_, value) in entries {
        let permit = flow.take().await;
        output.send_doc(Document::memory(
            value,
            SYNTHESIZED_SCAN_ID,
            Vec::new(),
            Some(permit),
        ));
    }
    inner.stop();
    output.send_end();
}

/// Discards the first `skip` documents. The remaining count is checkpoint
/// state, so a resumed execution does not skip again.
async fn do_skip(slot: StateSlot, mut input: OpInput, output: DocSender) {
    loop {
        match input.next().await {
            InputEvent::Doc(doc) => {
                if slot.get() != 0 {
                    slot.set(slot.get() - 1);
                    drop(doc);
                } else {
                    output.send_doc(doc);
                }
            }
            InputEvent::End => {
                output.send_end();
                return;
            }
            InputEvent::Error(error) => {
                output.send_error(error);
                return;
            }
        }
    }
}

/// Forwards whichever side has a document ready. Sides end independently;
/// the first error wins. No deduplication.
async fn do_union(mut left: OpInput, mut right: OpInput, output: DocSender) {
    let mut left_open = true;
    let mut right_open = true;
    while left_open || right_open {
        tokio::select! {
            event = left.next(), if left_open => match event {
                InputEvent::Doc(doc) => output.send_doc(doc),
                InputEvent::End => left_open = false,
                InputEvent::Error(error) => {
                    output.send_error(error);
                    return;
                }
            },
            event = right.next(), if right_open => match event {
                InputEvent::Doc(doc) => output.send_doc(doc),
                InputEvent::End => right_open = false,
                InputEvent::Error(error) => {
                    output.send_error(error);
                    return;
                }
            },
        }
    }
    output.send_end();
}

/// Applies the update operation to each input document, stops reading after
/// `limit` documents (finishing updates already started), and falls back to
/// the upsert operation when no document arrived at all.
#[allow(clippy::too_many_arguments)]
async fn do_update(
    core: Rc<CheckpointCore>,
    txn: Rc<DocTxn>,
    mut input: OpInput,
    output: DocSender,
    update_op: Rc<UpdateOp>,
    upsert_op: Option<Rc<InsertOp>>,
    limit: i64,
    cx: Rc<UnboundCollection>,
    count: StateSlot,
) {
    let flow = core.flow_lock();
    let mut updates: EvalQueue<()> = FuturesOrdered::new();
    if limit > 0 && count.get() < limit {
        loop {
            tokio::select! {
                event = input.next() => match event {
                    InputEvent::Doc(doc) => {
                        let op = update_op.clone();
                        let subject = doc.clone();
                        updates.push_back(Box::pin(async move { op.update(&subject).await }));
                        input.push_pending(doc);
                        count.set(count.get() + 1);
                        if count.get() >= limit {
                            break;
                        }
                    }
                    InputEvent::End => break,
                    InputEvent::Error(error) => {
                        output.send_error(error);
                        return;
                    }
                },
                Some(result) = updates.next(), if !updates.is_empty() => {
                    let doc = input.pop_pending().expect("pending tracks updates");
                    match result {
                        Ok(()) => output.send_doc(doc),
                        Err(error) => {
                            output.send_error(error);
                            return;
                        }
                    }
                }
            }
        }
    }
    while let Some(result) = updates.next().await {
        let doc = input.pop_pending().expect("pending tracks updates");
        match result {
            Ok(()) => output.send_doc(doc),
            Err(error) => {
                output.send_error(error);
                return;
            }
        }
    }
    if count.get() == 0
        && let Some(insert) = upsert_op
    {
        let permit = flow.take().await;
        match cx.clone().bind(&txn).stage_insert(insert.document.clone()) {
            Ok(doc) => {
                doc.attach_permit(permit);
                output.send_doc(doc);
            }
            Err(error) => {
                output.send_error(error);
                return;
            }
        }
    }
    output.send_end();
}

/// Stages each document for insertion, bounded by the flow-control lock.
async fn do_insert(
    core: Rc<CheckpointCore>,
    txn: Rc<DocTxn>,
    cx: Rc<UnboundCollection>,
    docs: Vec<InsertOp>,
    output: DocSender,
) {
    let flow = core.flow_lock();
    let bound = cx.clone().bind(&txn);
    for insert in docs {
        let permit = flow.take().await;
        match bound.stage_insert(insert.document) {
            Ok(doc) => {
                doc.attach_permit(permit);
                output.send_doc(doc);
            }
            Err(error) => {
                output.send_error(error);
                return;
            }
        }
    }
    output.send_end();
}

fn index_descriptor_value(info: &IndexInfo) -> DataValue {
    DataValue::object(vec![
        ("name", DataValue::text(&info.name)),
        (
            "key",
            DataValue::Array(info.paths.iter().map(|p| DataValue::text(p)).collect()),
        ),
        (
            "status",
            DataValue::text(match info.status {
                IndexStatus::Ready => "ready",
                IndexStatus::Building => "building",
            }),
        ),
    ])
}

/// Creates a new index descriptor after checking for conflicts, bumping the
/// collection's metadata version on success.
async fn do_index_insert(
    core: Rc<CheckpointCore>,
    txn: Rc<DocTxn>,
    cx: Rc<UnboundCollection>,
    info: IndexInfo,
    config: QuillConfig,
    output: DocSender,
) {
    let flow = core.flow_lock();
    let permit = flow.take().await;
    let bound = cx.clone().bind(&txn);
    let existing = match bound.list_index_descriptors().await {
        Ok(existing) => existing,
        Err(error) => {
            output.send_error(error);
            return;
        }
    };
    for descriptor in &existing {
        if descriptor.paths == info.paths {
            if config.index_exists_ok {
                // Legacy clients expect creating an identical index to
                // report success.
                warn!(index = %info.name, "index key spec already exists; reporting success");
                output.send_end();
                return;
            }
            output.send_error(QuillError::IndexAlreadyExists(info.name.clone()));
            return;
        }
        if descriptor.name == info.name {
            output.send_error(QuillError::IndexNameTaken(info.name.clone()));
            return;
        }
    }
    if let Err(error) = bound.write_index_descriptor(&info).await {
        output.send_error(error);
        return;
    }
    output.send_doc(Document::memory(
        index_descriptor_value(&info),
        SYNTHESIZED_SCAN_ID,
        Vec::new(),
        Some(permit),
    ));
    output.send_end();
}

/// Transitions an index descriptor to a new status, verifying the build id
/// when one is required.
async fn do_update_index_status(
    core: Rc<CheckpointCore>,
    txn: Rc<DocTxn>,
    cx: Rc<UnboundCollection>,
    index_name: String,
    new_status: IndexStatus,
    build_id: Option<u64>,
    output: DocSender,
) {
    let bound = cx.clone().bind(&txn);
    let existing = match bound.list_index_descriptors().await {
        Ok(existing) => existing,
        Err(error) => {
            output.send_error(error);
            return;
        }
    };
    let Some(mut descriptor) = existing.into_iter().find(|d| d.name == index_name) else {
        output.send_error(QuillError::InvalidPlan(format!(
            "unknown index '{index_name}'"
        )));
        return;
    };
    if let Some(expected) = build_id
        && descriptor.build_id != Some(expected)
    {
        output.send_error(QuillError::IndexWrongBuildId);
        return;
    }
    let permit = core.flow_lock().take().await;
    descriptor.status = new_status;
    descriptor.build_id = None;
    if let Err(error) = bound.write_index_descriptor(&descriptor).await {
        output.send_error(error);
        return;
    }
    bound.clear_index_progress(&index_name);
    output.send_doc(Document::memory(
        index_descriptor_value(&descriptor),
        SYNTHESIZED_SCAN_ID,
        Vec::new(),
        Some(permit),
    ));
    output.send_end();
}

/// Re-stages the indexed field of each scanned document so that its index
/// entries are written when the document's changes are committed. A resumed
/// build records where it restarted.
async fn do_build_index(
    core: Rc<CheckpointCore>,
    txn: Rc<DocTxn>,
    cx: Rc<UnboundCollection>,
    index: IndexInfo,
    mut input: OpInput,
    output: DocSender,
) {
    let (resume_begin, _) = core.bounds(0);
    if !resume_begin.is_empty() {
        cx.clone().bind(&txn).set_index_progress(&index.name, resume_begin);
    }
    let mut rewrites: EvalQueue<()> = FuturesOrdered::new();
    let index_path = index.paths[0].clone();
    loop {
        tokio::select! {
            event = input.next() => match event {
                InputEvent::Doc(doc) => {
                    let subject = doc.clone();
                    let path = index_path.clone();
                    rewrites.push_back(Box::pin(async move {
                        match subject.read_path(&path).await? {
                            Some(value) => subject.set_path(&path, value),
                            None => subject.clear_path(&path),
                        }
                        Ok(())
                    }));
                    input.push_pending(doc);
                }
                InputEvent::End => break,
                InputEvent::Error(error) => {
                    output.send_error(error);
                    return;
                }
            },
            Some(result) = rewrites.next(), if !rewrites.is_empty() => {
                let doc = input.pop_pending().expect("pending tracks rewrites");
                match result {
                    Ok(()) => output.send_doc(doc),
                    Err(error) => {
                        output.send_error(error);
                        return;
                    }
                }
            }
        }
    }
    while let Some(result) = rewrites.next().await {
        let doc = input.pop_pending().expect("pending tracks rewrites");
        match result {
            Ok(()) => output.send_doc(doc),
            Err(error) => {
                output.send_error(error);
                return;
            }
        }
    }
    output.send_end();
}

/// Awaits `commit_changes` for each document in order, so downstream
/// consumers observe the writes inside the transaction.
async fn do_flush_changes(mut input: OpInput, output: DocSender) {
    let mut commits: EvalQueue<()> = FuturesOrdered::new();
    loop {
        tokio::select! {
            event = input.next() => match event {
                InputEvent::Doc(doc) => {
                    let subject = doc.clone();
                    commits.push_back(Box::pin(async move { subject.commit_changes().await }));
                    input.push_pending(doc);
                }
                InputEvent::End => break,
                InputEvent::Error(error) => {
                    output.send_error(error);
                    return;
                }
            },
            Some(result) = commits.next(), if !commits.is_empty() => {
                let doc = input.pop_pending().expect("pending tracks commits");
                match result {
                    Ok(()) => output.send_doc(doc),
                    Err(error) => {
                        output.send_error(error);
                        return;
                    }
                }
            }
        }
    }
    while let Some(result) = commits.next().await {
        let doc = input.pop_pending().expect("pending tracks commits");
        match result {
            Ok(()) => output.send_doc(doc),
            Err(error) => {
                output.send_error(error);
                return;
            }
        }
    }
    output.send_end();
}

/// Revalidates collection metadata at a transaction boundary. The storage
/// location moving is fatal; other changes are put to the subplan.
async fn revalidate_metadata(
    catalog: &CollectionCatalog,
    cx: &Rc<UnboundCollection>,
    sub: &Rc<Plan>,
    txn: &Rc<DocTxn>,
    metadata_version: &mut u64,
) -> Result<(), QuillError> {
    let new_version = cx.clone().bind(txn).metadata_version().await?;
    if new_version == *metadata_version {
        return Ok(());
    }
    let new_cx = catalog.refresh(cx, txn).await?;
    if new_cx.doc_prefix() != cx.doc_prefix() || new_cx.meta_prefix() != cx.meta_prefix() {
        return Err(QuillError::CollectionMetadataChanged);
    }
    if !sub.was_metadata_change_okay(&new_cx) {
        return Err(QuillError::MetadataChangedNonisolated);
    }
    *metadata_version = new_version;
    Ok(())
}

/// Executes the subplan across a sequence of read-only transactions. Each
/// segment runs until its soft timeout, is checkpointed, and resumes in a
/// fresh transaction after metadata revalidation.
async fn do_non_isolated_ro(
    core: Rc<CheckpointCore>,
    sub: Rc<Plan>,
    cx: Rc<UnboundCollection>,
    catalog: CollectionCatalog,
    config: QuillConfig,
    mut txn: Rc<DocTxn>,
    output: DocSender,
) {
    let outer_flow = core.flow_lock();
    let store = catalog.store().clone();
    let options = wrapper_txn_options(&config);
    let mut inner = PlanCheckpoint::new(config.flow_control_permits);
    let mut transactions = 0u64;
    let mut results = 0u64;
    let mut metadata_version = match cx.clone().bind(&txn).metadata_version().await {
        Ok(version) => version,
        Err(error) => {
            output.send_error(error);
            return;
        }
    };
    loop {
        let mut docs = sub.execute(&inner, &txn);
        let mut first = true;
        let timeout = tokio::time::sleep(config.nonisolated_internal_timeout);
        tokio::pin!(timeout);
        let mut segment_error: Option<QuillError> = None;
        loop {
            tokio::select! {
                event = recv_driving(&inner, &mut docs) => match event {
                    InputEvent::Doc(doc) => {
                        let permit = outer_flow.take().await;
                        doc.attach_permit(permit);
                        output.send_doc(doc);
                        results += 1;
                        if first {
                            timeout.as_mut().reset(
                                tokio::time::Instant::now() + config.nonisolated_internal_timeout,
                            );
                            first = false;
                        }
                    }
                    InputEvent::End => {
                        debug!(transactions, results, "non-isolated read finished");
                        inner.stop();
                        output.send_end();
                        return;
                    }
                    InputEvent::Error(error) => {
                        segment_error = Some(error);
                        break;
                    }
                },
                _ = &mut timeout => break,
            }
        }
        match segment_error {
            Some(error) if error.is_retryable() => {
                // A fresh transaction re-runs the current segment; the
                // bounds made no progress.
                inner.stop();
            }
            Some(error) => {
                inner.stop();
                output.send_error(error);
                return;
            }
            None => {
                // Anything still sitting in the inner output channel was
                // never forwarded; it must be produced again after resume.
                let undelivered = drain_pending(&mut docs);
                inner = inner.stop_and_checkpoint_with(&undelivered);
            }
        }
        txn = DocTxn::begin(&store, options);
        if let Err(error) =
            revalidate_metadata(&catalog, &cx, &sub, &txn, &mut metadata_version).await
        {
            output.send_error(error);
            return;
        }
        transactions += 1;
        debug!(transactions, results, "non-isolated segment boundary");
    }
}

/// Read-write variant: documents are committed per segment, buffered until
/// the transaction commit succeeds, then forwarded. A failed commit retries
/// the current segment; only a successful commit advances the checkpoint.
async fn do_non_isolated_rw(
    core: Rc<CheckpointCore>,
    sub: Rc<Plan>,
    cx: Rc<UnboundCollection>,
    catalog: CollectionCatalog,
    config: QuillConfig,
    mut txn: Rc<DocTxn>,
    output: DocSender,
) {
    let outer_flow = core.flow_lock();
    let store = catalog.store().clone();
    let options = wrapper_txn_options(&config);
    let mut inner = PlanCheckpoint::new(config.flow_control_permits);
    let mut forwarded = 0u64;
    let mut metadata_version = match cx.clone().bind(&txn).metadata_version().await {
        Ok(version) => version,
        Err(error) => {
            output.send_error(error);
            return;
        }
    };
    loop {
        let mut docs = sub.execute(&inner, &txn);
        let mut first = true;
        let mut finished = false;
        let timeout = tokio::time::sleep(config.nonisolated_internal_timeout);
        tokio::pin!(timeout);
        let mut committing: EvalQueue<()> = FuturesOrdered::new();
        let mut committing_docs: VecDeque<Document> = VecDeque::new();
        let mut buffered: VecDeque<Document> = VecDeque::new();
        let mut segment_error: Option<QuillError> = None;
        loop {
            if buffered.len() + committing_docs.len() >= config.nonisolated_rw_buffer_max {
                // Force the segment to end through the timeout arm so the
                // checkpoint below never runs with a subplan task mid-poll.
                timeout.as_mut().reset(tokio::time::Instant::now());
            }
            tokio::select! {
                event = recv_driving(&inner, &mut docs) => match event {
                    InputEvent::Doc(doc) => {
                        let subject = doc.clone();
                        committing.push_back(Box::pin(async move {
                            subject.commit_changes().await
                        }));
                        committing_docs.push_back(doc);
                        if first {
                            timeout.as_mut().reset(
                                tokio::time::Instant::now() + config.nonisolated_internal_timeout,
                            );
                            first = false;
                        }
                    }
                    InputEvent::End => {
                        finished = true;
                        break;
                    }
                    InputEvent::Error(error) => {
                        segment_error = Some(error);
                        break;
                    }
                },
                Some(result) = committing.next(), if !committing.is_empty() => {
                    match result {
                        Ok(()) => {
                            let doc = committing_docs.pop_front().expect("queue tracks commits");
                            doc.release_permit();
                            buffered.push_back(doc);
                        }
                        Err(error) => {
                            segment_error = Some(error);
                            break;
                        }
                    }
                },
                _ = &mut timeout => break,
            }
        }

        let mut next_inner = None;
        if segment_error.is_none() {
            // Cancel all ongoing work below us; documents that reached the
            // committing queue are treated as part of this transaction, so
            // their staged changes are completed before the commit.
            // Documents still in the inner output channel never made it
            // that far and belong to the next segment.
            let undelivered = drain_pending(&mut docs);
            next_inner = Some(inner.stop_and_checkpoint_with(&undelivered));
            while let Some(result) = committing.next().await {
                match result {
                    Ok(()) => {
                        let doc = committing_docs.pop_front().expect("queue tracks commits");
                        doc.release_permit();
                        buffered.push_back(doc);
                    }
                    Err(error) => {
                        segment_error = Some(error);
                        break;
                    }
                }
            }
        } else {
            inner.stop();
        }

        if segment_error.is_none() {
            match txn.commit().await {
                Ok(()) => {
                    // Emitted documents may still be read through this
                    // handle, so swap in a live transaction.
                    txn.replace(KvTransaction::begin(&store, options));
                    inner = next_inner.take().expect("checkpoint taken above");
                    while let Some(doc) = buffered.pop_front() {
                        let permit = outer_flow.take().await;
                        doc.attach_permit(permit);
                        output.send_doc(doc);
                        forwarded += 1;
                    }
                    if finished {
                        debug!(forwarded, "non-isolated write finished");
                        output.send_end();
                        return;
                    }
                }
                Err(error) => segment_error = Some(error),
            }
        }

        if let Some(error) = segment_error.take() {
            match txn.on_error(error).await {
                Ok(()) => {
                    warn!("retrying non-isolated segment");
                }
                Err(fatal) => {
                    inner.stop();
                    output.send_error(fatal);
                    return;
                }
            }
        }

        txn = DocTxn::begin(&store, options);
        if let Err(error) =
            revalidate_metadata(&catalog, &cx, &sub, &txn, &mut metadata_version).await
        {
            output.send_error(error);
            return;
        }
    }
}

/// Runs the subplan entirely inside one transaction, buffering its output;
/// retryable failures reset the transaction and re-execute from scratch.
/// Results flow downstream only after the commit succeeds.
async fn do_retry(
    core: Rc<CheckpointCore>,
    sub: Rc<Plan>,
    store: MemoryKv,
    config: QuillConfig,
    mut txn: Rc<DocTxn>,
    output: DocSender,
) {
    let outer_flow = core.flow_lock();
    let options = wrapper_txn_options(&config);
    loop {
        let inner = PlanCheckpoint::new(config.flow_control_permits);
        let mut docs = sub.execute(&inner, &txn);
        let mut committing: EvalQueue<()> = FuturesOrdered::new();
        let mut committing_docs: VecDeque<Document> = VecDeque::new();
        let mut buffered: Vec<Document> = Vec::new();
        let mut attempt_error: Option<QuillError> = None;
        loop {
            tokio::select! {
                event = recv_driving(&inner, &mut docs) => match event {
                    InputEvent::Doc(doc) => {
                        let subject = doc.clone();
                        committing.push_back(Box::pin(async move {
                            subject.commit_changes().await
                        }));
                        committing_docs.push_back(doc);
                    }
                    InputEvent::End => break,
                    InputEvent::Error(error) => {
                        attempt_error = Some(error);
                        break;
                    }
                },
                Some(result) = committing.next(), if !committing.is_empty() => {
                    match result {
                        Ok(()) => {
                            let doc = committing_docs.pop_front().expect("queue tracks commits");
                            doc.release_permit();
                            buffered.push(doc);
                        }
                        Err(error) => {
                            attempt_error = Some(error);
                            break;
                        }
                    }
                }
            }
        }
        inner.stop();
        if attempt_error.is_none() {
            while let Some(result) = committing.next().await {
                match result {
                    Ok(()) => {
                        let doc = committing_docs.pop_front().expect("queue tracks commits");
                        doc.release_permit();
                        buffered.push(doc);
                    }
                    Err(error) => {
                        attempt_error = Some(error);
                        break;
                    }
                }
            }
        }
        if attempt_error.is_none() {
            match txn.commit().await {
                Ok(()) => {
                    txn.replace(KvTransaction::begin(&store, options));
                    for doc in buffered {
                        let permit = outer_flow.take().await;
                        doc.attach_permit(permit);
                        output.send_doc(doc);
                    }
                    output.send_end();
                    return;
                }
                Err(error) => attempt_error = Some(error),
            }
        }
        let error = attempt_error.take().expect("error set on failure paths");
        if error == QuillError::CommitUnknownResult {
            output.send_error(error);
            return;
        }
        match txn.on_error(error).await {
            Ok(()) => {
                warn!("retrying plan in a fresh transaction");
                txn = DocTxn::begin(&store, options);
            }
            Err(fatal) => {
                output.send_error(fatal);
                return;
            }
        }
    }
}

/// Finds the first match across as many transactions as needed, then runs
/// the update (or upsert) and projection inside the transaction that found
/// it.
#[allow(clippy::too_many_arguments)]
async fn do_find_and_modify(
    core: Rc<CheckpointCore>,
    sub: Rc<Plan>,
    cx: Rc<UnboundCollection>,
    catalog: CollectionCatalog,
    config: QuillConfig,
    update_op: Rc<UpdateOp>,
    upsert_op: Option<Rc<InsertOp>>,
    projection: Rc<Projection>,
    project_new: bool,
    mut txn: Rc<DocTxn>,
    output: DocSender,
) {
    let outer_flow = core.flow_lock();
    let store = catalog.store().clone();
    let options = wrapper_txn_options(&config);
    let mut inner = PlanCheckpoint::new(config.flow_control_permits);
    let mut metadata_version = match cx.clone().bind(&txn).metadata_version().await {
        Ok(version) => version,
        Err(error) => {
            output.send_error(error);
            return;
        }
    };
    let mut first_doc: Option<Document> = None;
    loop {
        let mut docs = sub.execute(&inner, &txn);
        let timeout = tokio::time::sleep(config.find_first_timeout);
        tokio::pin!(timeout);
        let mut done = false;
        let mut segment_error: Option<QuillError> = None;
        loop {
            tokio::select! {
                event = recv_driving(&inner, &mut docs) => match event {
                    InputEvent::Doc(doc) => {
                        doc.release_permit();
                        first_doc = Some(doc);
                        done = true;
                        break;
                    }
                    InputEvent::End => {
                        done = true;
                        break;
                    }
                    InputEvent::Error(error) => {
                        segment_error = Some(error);
                        break;
                    }
                },
                _ = &mut timeout => break,
            }
        }
        match segment_error {
            Some(error) if error.is_retryable() => {
                inner.stop();
            }
            Some(error) => {
                inner.stop();
                output.send_error(error);
                return;
            }
            None if done => break,
            None => {
                let undelivered = drain_pending(&mut docs);
                inner = inner.stop_and_checkpoint_with(&undelivered);
            }
        }
        txn = DocTxn::begin(&store, options);
        if let Err(error) =
            revalidate_metadata(&catalog, &cx, &sub, &txn, &mut metadata_version).await
        {
            output.send_error(error);
            return;
        }
    }

    // Everything below happens in the transaction that found the document.
    // The find's resumption bounds are deliberately discarded.
    inner.stop();
    let any = first_doc.is_some();
    let mut projected: Option<DataValue> = None;
    if !project_new
        && let Some(doc) = &first_doc
    {
        match projection.apply(doc).await {
            Ok(value) => projected = Some(value),
            Err(error) => {
                output.send_error(error);
                return;
            }
        }
    }
    if let Some(doc) = &first_doc {
        if let Err(error) = update_op.update(doc).await {
            output.send_error(error);
            return;
        }
    } else if let Some(insert) = &upsert_op {
        match cx.clone().bind(&txn).stage_insert(insert.document.clone()) {
            Ok(doc) => first_doc = Some(doc),
            Err(error) => {
                output.send_error(error);
                return;
            }
        }
    }
    if let Some(doc) = &first_doc {
        if let Err(error) = doc.commit_changes().await {
            output.send_error(error);
            return;
        }
        if project_new {
            match projection.apply(doc).await {
                Ok(value) => projected = Some(value),
                Err(error) => {
                    output.send_error(error);
                    return;
                }
            }
        }
    }
    if let Err(error) = txn.commit().await {
        output.send_error(error);
        return;
    }
    txn.replace(KvTransaction::begin(&store, options));
    let permit = outer_flow.take().await;
    if any || (project_new && upsert_op.is_some()) {
        let doc = first_doc.expect("document present when emitting");
        output.send_doc(Document::memory(
            projected.unwrap_or(DataValue::Null),
            doc.scan_id(),
            doc.scan_key().to_vec(),
            Some(permit),
        ));
    }
    output.send_end();
}
