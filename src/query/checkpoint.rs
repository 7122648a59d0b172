use crate::doc::context::Document;
use crate::error::QuillError;
use crate::storage::encoded::{
    SCAN_KEY_SENTINEL, first_key_part_len, key_after, prefix_successor,
};
use futures::future::LocalBoxFuture;
use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::future::{Future, poll_fn};
use std::rc::Rc;
use std::sync::Arc;
use std::task::Poll;
use tokio::sync::mpsc::error::TryRecvError;
use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender, unbounded_channel};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

/// Permit pool limiting how many documents have been produced by a scan but
/// not yet fully consumed by the terminal sink. Permits travel with the
/// documents that hold them.
#[derive(Clone)]
pub struct FlowControlLock {
    sem: Arc<Semaphore>,
    capacity: usize,
}

impl FlowControlLock {
    pub fn new(capacity: usize) -> Self {
        Self {
            sem: Arc::new(Semaphore::new(capacity)),
            capacity,
        }
    }

    pub async fn take(&self) -> OwnedSemaphorePermit {
        self.sem
            .clone()
            .acquire_owned()
            .await
            .expect("flow control semaphore closed")
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn available(&self) -> usize {
        self.sem.available_permits()
    }
}

pub type DocResult = Result<Document, QuillError>;
pub type DocStream = UnboundedReceiver<DocResult>;

/// Sending half of a document stream. Streams terminate with an explicit
/// end-of-stream control item; a send to a dropped receiver is ignored, as
/// the receiving operator has already been cancelled.
#[derive(Clone)]
pub struct DocSender {
    tx: UnboundedSender<DocResult>,
}

impl DocSender {
    pub fn send_doc(&self, doc: Document) {
        let _ = self.tx.send(Ok(doc));
    }

    pub fn send_end(&self) {
        let _ = self.tx.send(Err(QuillError::EndOfStream));
    }

    pub fn send_error(&self, error: QuillError) {
        let _ = self.tx.send(Err(error));
    }
}

pub fn doc_channel() -> (DocSender, DocStream) {
    let (tx, rx) = unbounded_channel();
    (DocSender { tx }, rx)
}

pub enum InputEvent {
    Doc(Document),
    End,
    Error(QuillError),
}

/// Empties a stream of documents already sent but not yet received. Callers
/// checkpointing an execution pass these to `stop_and_checkpoint_with` so
/// the resumed execution produces them again.
pub fn drain_pending(rx: &mut DocStream) -> Vec<Document> {
    let mut drained = Vec::new();
    loop {
        match rx.try_recv() {
            Ok(Ok(doc)) => drained.push(doc),
            Ok(Err(_)) => continue,
            Err(TryRecvError::Empty | TryRecvError::Disconnected) => break,
        }
    }
    drained
}

pub async fn next_event(rx: &mut DocStream) -> InputEvent {
    match rx.recv().await {
        Some(Ok(doc)) => InputEvent::Doc(doc),
        Some(Err(QuillError::EndOfStream)) | None => InputEvent::End,
        Some(Err(error)) => InputEvent::Error(error),
    }
}

#[derive(Debug, Clone)]
struct ScanState {
    begin: Vec<u8>,
    end: Vec<u8>,
    split: Vec<u8>,
}

impl ScanState {
    fn fresh() -> Self {
        Self {
            begin: Vec::new(),
            end: SCAN_KEY_SENTINEL.to_vec(),
            split: SCAN_KEY_SENTINEL.to_vec(),
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct IntState {
    begin: i64,
    split: i64,
}

/// Checkpoint state shared with operator tasks and their cancellation
/// guards. Kept separate from the operator list so that tasks holding a
/// reference to it do not form a reference cycle with the checkpoint that
/// owns them.
pub struct CheckpointCore {
    scans: RefCell<Vec<ScanState>>,
    scans_added: Cell<usize>,
    states: RefCell<Vec<IntState>>,
    states_added: Cell<usize>,
    bounds_wanted: Cell<bool>,
    flow: FlowControlLock,
}

impl CheckpointCore {
    pub fn bounds_wanted(&self) -> bool {
        self.bounds_wanted.get()
    }

    pub fn flow_lock(&self) -> FlowControlLock {
        self.flow.clone()
    }

    /// Records the resumption key for a scan. The last write wins, which is
    /// why cancellation handlers iterate outstanding documents in reverse
    /// output order.
    pub fn set_split(&self, scan_id: i32, key: Vec<u8>) {
        if scan_id < 0 {
            return;
        }
        let mut scans = self.scans.borrow_mut();
        if let Some(scan) = scans.get_mut(scan_id as usize) {
            scan.split = key;
        }
    }

    pub fn bounds(&self, scan_id: usize) -> (Vec<u8>, Vec<u8>) {
        let scans = self.scans.borrow();
        match scans.get(scan_id) {
            Some(scan) => (scan.begin.clone(), scan.end.clone()),
            None => (Vec::new(), SCAN_KEY_SENTINEL.to_vec()),
        }
    }

    fn int_state_get(&self, idx: usize) -> i64 {
        self.states.borrow()[idx].split
    }

    fn int_state_set(&self, idx: usize, value: i64) {
        self.states.borrow_mut()[idx].split = value;
    }
}

/// Resumable operator counter (skip remainders, update limits). Mutations
/// update the checkpoint live so that a checkpoint taken mid-stream resumes
/// from the current value.
#[derive(Clone)]
pub struct StateSlot {
    core: Rc<CheckpointCore>,
    idx: usize,
}

impl StateSlot {
    pub fn get(&self) -> i64 {
        self.core.int_state_get(self.idx)
    }

    pub fn set(&self, value: i64) {
        self.core.int_state_set(self.idx, value);
    }
}

struct OpSlot {
    task: Option<LocalBoxFuture<'static, ()>>,
    output: DocSender,
}

/// Per-execution context: scan bounds and split keys, resumable operator
/// state, the flow-control permit pool, and ownership of every operator
/// task in topological order.
///
/// `stop_and_checkpoint` computes, for every scan, a resumption key greater
/// than the scan key of each document already delivered and no greater than
/// that of the next document the plan would have delivered. It does so by
/// dropping operator tasks in topological order with `bounds_wanted` set;
/// each task's cancellation guard records the scan keys of documents it
/// received but did not forward, in reverse output order, so the earliest
/// undelivered document's key wins for each scan. The most downstream task
/// holding a document of a given scan is dropped last, so its write is
/// final. A scan with no recorded split completed, and keeps the sentinel.
///
/// Tasks must never be on the call stack when this runs; tasks are polled,
/// never called, so dropping them here is always safe.
pub struct PlanCheckpoint {
    core: Rc<CheckpointCore>,
    ops: RefCell<Vec<OpSlot>>,
}

impl PlanCheckpoint {
    pub fn new(flow_permits: usize) -> Self {
        Self {
            core: Rc::new(CheckpointCore {
                scans: RefCell::new(Vec::new()),
                scans_added: Cell::new(0),
                states: RefCell::new(Vec::new()),
                states_added: Cell::new(0),
                bounds_wanted: Cell::new(false),
                flow: FlowControlLock::new(flow_permits),
            }),
            ops: RefCell::new(Vec::new()),
        }
    }

    pub fn core(&self) -> Rc<CheckpointCore> {
        self.core.clone()
    }

    pub fn flow_lock(&self) -> FlowControlLock {
        self.core.flow.clone()
    }

    /// Assigns the next scan id. Re-execution after a checkpoint walks the
    /// plan in the same order, so ids line up with the recorded bounds.
    pub fn add_scan(&self) -> usize {
        let id = self.scans_added_bump();
        let mut scans = self.core.scans.borrow_mut();
        if id >= scans.len() {
            scans.push(ScanState::fresh());
        } else {
            // Re-execution under retained bounds starts with a clean split.
            scans[id].split = SCAN_KEY_SENTINEL.to_vec();
        }
        id
    }

    fn scans_added_bump(&self) -> usize {
        let id = self.core.scans_added.get();
        self.core.scans_added.set(id + 1);
        id
    }

    pub fn bounds(&self, scan_id: usize) -> (Vec<u8>, Vec<u8>) {
        self.core.bounds(scan_id)
    }

    /// Registers an operator task, after its inputs, before its consumers.
    pub fn add_operation(&self, task: LocalBoxFuture<'static, ()>, output: DocSender) {
        self.ops.borrow_mut().push(OpSlot {
            task: Some(task),
            output,
        });
    }

    /// Claims the next resumable integer slot, resetting it to the value it
    /// had when this checkpoint was created.
    pub fn int_state(&self, default: i64) -> StateSlot {
        let idx = self.core.states_added.get();
        self.core.states_added.set(idx + 1);
        let mut states = self.core.states.borrow_mut();
        if idx == states.len() {
            states.push(IntState {
                begin: default,
                split: default,
            });
        } else {
            let begin = states[idx].begin;
            states[idx].split = begin;
        }
        StateSlot {
            core: self.core.clone(),
            idx,
        }
    }

    /// Polls every live operator task. Pending forever; consumers poll this
    /// alongside the output stream.
    pub fn drive(&self) -> impl Future<Output = ()> + '_ {
        poll_fn(move |cx| {
            let mut i = 0;
            loop {
                let task = {
                    let mut ops = self.ops.borrow_mut();
                    if i >= ops.len() {
                        break;
                    }
                    ops[i].task.take()
                };
                if let Some(mut task) = task {
                    if task.as_mut().poll(cx).is_pending() {
                        let mut ops = self.ops.borrow_mut();
                        if let Some(slot) = ops.get_mut(i) {
                            slot.task = Some(task);
                        }
                    }
                }
                i += 1;
            }
            Poll::Pending
        })
    }

    /// Cancels every operator task in topological order. Cancellation guards
    /// observe `bounds_wanted` (false here, so no split keys are recorded).
    /// A single `operation_cancelled` is sent to the final output after all
    /// tasks are gone; tasks themselves never send errors while unwinding,
    /// which would tear down successors out of order.
    pub fn stop(&self) {
        let mut slots: Vec<OpSlot> = self.ops.borrow_mut().drain(..).collect();
        let last_output = slots.last().map(|slot| slot.output.clone());
        for slot in &mut slots {
            drop(slot.task.take());
        }
        if let Some(output) = last_output {
            output.send_error(QuillError::OperationCancelled);
        }
        self.core.scans_added.set(0);
        self.core.states_added.set(0);
    }

    /// Stops execution and returns the checkpoint to resume from: each
    /// scan's bounds restart at its split key, each counter at its current
    /// value.
    pub fn stop_and_checkpoint(&self) -> PlanCheckpoint {
        self.stop_and_checkpoint_with(&[])
    }

    /// Like `stop_and_checkpoint`, also accounting for documents the
    /// consumer received from the final output channel but never processed.
    /// Their split keys are recorded after every task guard has run, since
    /// the consumer is downstream of every task.
    pub fn stop_and_checkpoint_with(&self, undelivered: &[Document]) -> PlanCheckpoint {
        self.core.bounds_wanted.set(true);
        self.stop();
        for doc in undelivered.iter().rev() {
            self.core.set_split(doc.scan_id(), doc.scan_key().to_vec());
        }
        self.core.bounds_wanted.set(false);

        let next = PlanCheckpoint::new(self.core.flow.capacity());
        {
            let scans = self.core.scans.borrow();
            let mut next_scans = next.core.scans.borrow_mut();
            for scan in scans.iter() {
                next_scans.push(ScanState {
                    begin: scan.split.clone(),
                    end: scan.end.clone(),
                    split: SCAN_KEY_SENTINEL.to_vec(),
                });
            }
            let states = self.core.states.borrow();
            let mut next_states = next.core.states.borrow_mut();
            for state in states.iter() {
                next_states.push(IntState {
                    begin: state.split,
                    split: state.split,
                });
            }
        }
        next
    }

    #[cfg(test)]
    pub(crate) fn split_of(&self, scan_id: usize) -> Vec<u8> {
        self.core.scans.borrow()[scan_id].split.clone()
    }
}

/// Input side of an operator that may hold documents it has not yet
/// forwarded. When dropped during a checkpoint stop, it records split keys
/// for everything still in flight: documents stranded in the channel first,
/// then the pending queue, each in reverse output order, so the earliest
/// document's key is written last.
pub struct OpInput {
    core: Rc<CheckpointCore>,
    rx: DocStream,
    pending: VecDeque<Document>,
}

impl OpInput {
    pub fn new(core: Rc<CheckpointCore>, rx: DocStream) -> Self {
        Self {
            core,
            rx,
            pending: VecDeque::new(),
        }
    }

    pub async fn next(&mut self) -> InputEvent {
        next_event(&mut self.rx).await
    }

    pub fn push_pending(&mut self, doc: Document) {
        self.pending.push_back(doc);
    }

    pub fn pop_pending(&mut self) -> Option<Document> {
        self.pending.pop_front()
    }
}

impl Drop for OpInput {
    fn drop(&mut self) {
        if !self.core.bounds_wanted() {
            return;
        }
        let mut residual = Vec::new();
        loop {
            match self.rx.try_recv() {
                Ok(Ok(doc)) => residual.push(doc),
                Ok(Err(_)) => continue,
                Err(TryRecvError::Empty | TryRecvError::Disconnected) => break,
            }
        }
        for doc in residual.iter().rev() {
            self.core.set_split(doc.scan_id(), doc.scan_key().to_vec());
        }
        for doc in self.pending.iter().rev() {
            self.core.set_split(doc.scan_id(), doc.scan_key().to_vec());
        }
    }
}

/// How a scan derives its own split key from the last key it consumed.
pub enum SplitKind {
    /// Skip past every remaining cell of the document containing the last
    /// consumed key.
    PrimaryPrefix,
    /// Resume immediately after the last consumed key.
    KeyAfter,
    /// Point lookups either delivered their document or did not.
    Point,
}

/// Cancellation guard owned by scan tasks. If the scan is stopped before
/// completing, the recorded split restarts the scan after the last document
/// it emitted; a scan that consumed nothing restarts at its lower bound.
pub struct ScanGuard {
    core: Rc<CheckpointCore>,
    scan_id: usize,
    lower: Vec<u8>,
    kind: SplitKind,
    pub last_key: Option<Vec<u8>>,
}

impl ScanGuard {
    pub fn new(core: Rc<CheckpointCore>, scan_id: usize, lower: Vec<u8>, kind: SplitKind) -> Self {
        Self {
            core,
            scan_id,
            lower,
            kind,
            last_key: None,
        }
    }
}

impl Drop for ScanGuard {
    fn drop(&mut self) {
        if !self.core.bounds_wanted() {
            return;
        }
        let split = match (&self.last_key, &self.kind) {
            (None, _) => Some(self.lower.clone()),
            (Some(_), SplitKind::Point) => None,
            (Some(key), SplitKind::KeyAfter) => Some(key_after(key)),
            (Some(key), SplitKind::PrimaryPrefix) => Some(match first_key_part_len(key) {
                Ok(len) => prefix_successor(&key[..len]),
                Err(_) => key_after(key),
            }),
        };
        if let Some(split) = split {
            self.core.set_split(self.scan_id as i32, split);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_scans_cover_the_whole_keyspace() {
        let checkpoint = PlanCheckpoint::new(4);
        let id = checkpoint.add_scan();
        let (begin, end) = checkpoint.bounds(id);
        assert!(begin.is_empty());
        assert_eq!(end, SCAN_KEY_SENTINEL.to_vec());
    }

    #[test]
    fn checkpoint_with_no_progress_keeps_bounds() {
        let checkpoint = PlanCheckpoint::new(4);
        let id = checkpoint.add_scan();
        // No task recorded a split, so the scan reads as complete.
        let next = checkpoint.stop_and_checkpoint();
        let (begin, end) = next.bounds(id);
        assert_eq!(begin, SCAN_KEY_SENTINEL.to_vec());
        assert_eq!(end, SCAN_KEY_SENTINEL.to_vec());
    }

    #[test]
    fn last_split_write_wins() {
        let checkpoint = PlanCheckpoint::new(4);
        let id = checkpoint.add_scan() as i32;
        checkpoint.core().set_split(id, vec![9]);
        checkpoint.core().set_split(id, vec![3]);
        let next = checkpoint.stop_and_checkpoint();
        assert_eq!(next.bounds(id as usize).0, vec![3]);
    }

    #[test]
    fn int_state_resumes_from_split_value() {
        let checkpoint = PlanCheckpoint::new(4);
        let slot = checkpoint.int_state(7);
        assert_eq!(slot.get(), 7);
        slot.set(3);
        let next = checkpoint.stop_and_checkpoint();
        let slot = next.int_state(7);
        assert_eq!(slot.get(), 3);
    }

    #[test]
    fn scan_guard_with_no_progress_restarts_at_lower_bound() {
        let checkpoint = PlanCheckpoint::new(4);
        let id = checkpoint.add_scan();
        checkpoint.core().bounds_wanted.set(true);
        drop(ScanGuard::new(
            checkpoint.core(),
            id,
            vec![5],
            SplitKind::KeyAfter,
        ));
        checkpoint.core().bounds_wanted.set(false);
        assert_eq!(checkpoint.split_of(id), vec![5]);
    }

    #[test]
    fn op_input_records_pending_in_reverse_order() {
        let checkpoint = PlanCheckpoint::new(4);
        let id = checkpoint.add_scan() as i32;
        let (tx, rx) = doc_channel();
        let mut input = OpInput::new(checkpoint.core(), rx);
        input.push_pending(crate::doc::Document::memory(
            crate::doc::DataValue::Null,
            id,
            vec![1],
            None,
        ));
        input.push_pending(crate::doc::Document::memory(
            crate::doc::DataValue::Null,
            id,
            vec![2],
            None,
        ));
        // A document still sitting in the channel is later in output order
        // than both pending documents.
        tx.send_doc(crate::doc::Document::memory(
            crate::doc::DataValue::Null,
            id,
            vec![3],
            None,
        ));
        checkpoint.core().bounds_wanted.set(true);
        drop(input);
        checkpoint.core().bounds_wanted.set(false);
        assert_eq!(checkpoint.split_of(id as usize), vec![1]);
    }
}
