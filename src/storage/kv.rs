use crate::error::QuillError;
use crate::storage::encoded::key_after;
use im::OrdMap;
use parking_lot::Mutex;
use std::cell::RefCell;
use std::collections::BTreeMap;
use std::ops::Bound;
use std::rc::Rc;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

/// Stored cell. Clears leave tombstones behind so that later snapshots can
/// still detect conflicting writes against earlier reads.
#[derive(Debug, Clone, PartialEq, Eq)]
struct VersionedValue {
    value: Option<Vec<u8>>,
    seq: u64,
}

#[derive(Debug, Default)]
struct StoreInner {
    entries: OrdMap<Vec<u8>, VersionedValue>,
    commit_seq: u64,
    commit_attempts: u64,
}

/// In-memory ordered keyspace with snapshot transactions and optimistic
/// conflict detection. Snapshots are O(1) clones of the persistent map.
#[derive(Debug, Clone, Default)]
pub struct MemoryKv {
    inner: Arc<Mutex<StoreInner>>,
}

impl MemoryKv {
    pub fn new() -> Self {
        Self::default()
    }

    /// Total commit attempts observed, including those that conflicted.
    pub fn commit_attempts(&self) -> u64 {
        self.inner.lock().commit_attempts
    }

    pub fn commit_seq(&self) -> u64 {
        self.inner.lock().commit_seq
    }

    fn snapshot(&self) -> (OrdMap<Vec<u8>, VersionedValue>, u64) {
        let inner = self.inner.lock();
        (inner.entries.clone(), inner.commit_seq)
    }
}

/// Options applied to a single transaction.
#[derive(Debug, Clone, Copy)]
pub struct TxnOptions {
    pub timeout_ms: u64,
    pub retry_limit: u64,
    /// Allow reads to come from a possibly stale replica. Carried for API
    /// parity; the in-memory store has a single copy.
    pub causal_read_risky: bool,
}

impl Default for TxnOptions {
    fn default() -> Self {
        Self {
            timeout_ms: 5_000,
            retry_limit: 10,
            causal_read_risky: false,
        }
    }
}

/// Prefetch throttle for a range read. Each yielded pair holds one permit
/// until the consumer releases it, keeping the reader at most `permits`
/// entries ahead.
#[derive(Clone)]
pub enum Prefetch {
    Unlimited,
    Permits(Arc<Semaphore>),
}

impl Prefetch {
    pub fn one() -> Self {
        Prefetch::Permits(Arc::new(Semaphore::new(1)))
    }
}

pub struct KvPair {
    pub key: Vec<u8>,
    pub value: Vec<u8>,
    pub permit: Option<OwnedSemaphorePermit>,
}

/// A snapshot transaction over [`MemoryKv`].
///
/// Reads are served from the snapshot merged with this transaction's own
/// buffered writes. Read keys and ranges are tracked; `commit` fails with a
/// retryable `not_committed` if any tracked read was overwritten by a commit
/// after the snapshot was taken.
pub struct KvTransaction {
    store: MemoryKv,
    snapshot: OrdMap<Vec<u8>, VersionedValue>,
    snapshot_seq: u64,
    writes: BTreeMap<Vec<u8>, Option<Vec<u8>>>,
    cleared_ranges: Vec<(Vec<u8>, Vec<u8>)>,
    read_ranges: Vec<(Vec<u8>, Vec<u8>)>,
    deadline: Instant,
    retries_used: u64,
    options: TxnOptions,
}

impl KvTransaction {
    pub fn begin(store: &MemoryKv, options: TxnOptions) -> Self {
        let (snapshot, snapshot_seq) = store.snapshot();
        Self {
            store: store.clone(),
            snapshot,
            snapshot_seq,
            writes: BTreeMap::new(),
            cleared_ranges: Vec::new(),
            read_ranges: Vec::new(),
            deadline: Instant::now() + Duration::from_millis(options.timeout_ms),
            retries_used: 0,
            options,
        }
    }

    fn check_deadline(&self) -> Result<(), QuillError> {
        if Instant::now() >= self.deadline {
            return Err(QuillError::TransactionTooOld);
        }
        Ok(())
    }

    fn is_cleared(&self, key: &[u8]) -> bool {
        self.cleared_ranges
            .iter()
            .any(|(lo, hi)| key >= lo.as_slice() && key < hi.as_slice())
    }

    pub fn get(&mut self, key: &[u8]) -> Result<Option<Vec<u8>>, QuillError> {
        self.check_deadline()?;
        self.read_ranges.push((key.to_vec(), key_after(key)));
        if let Some(buffered) = self.writes.get(key) {
            return Ok(buffered.clone());
        }
        if self.is_cleared(key) {
            return Ok(None);
        }
        Ok(self
            .snapshot
            .get(key)
            .and_then(|entry| entry.value.clone()))
    }

    pub fn set(&mut self, key: Vec<u8>, value: Vec<u8>) {
        self.writes.insert(key, Some(value));
    }

    pub fn clear(&mut self, key: Vec<u8>) {
        self.writes.insert(key, None);
    }

    pub fn clear_range(&mut self, lo: Vec<u8>, hi: Vec<u8>) {
        let buffered: Vec<Vec<u8>> = self
            .writes
            .range::<[u8], _>((Bound::Included(lo.as_slice()), Bound::Excluded(hi.as_slice())))
            .map(|(k, _)| k.clone())
            .collect();
        for key in buffered {
            self.writes.remove(&key);
        }
        self.cleared_ranges.push((lo, hi));
    }

    /// Lazy ordered read of `[lo, hi)` through this transaction's view.
    pub fn range_reader(&mut self, lo: Vec<u8>, hi: Vec<u8>, prefetch: Prefetch) -> RangeReader {
        self.read_ranges.push((lo.clone(), hi.clone()));
        RangeReader {
            snapshot: self.snapshot.clone(),
            writes: self.writes.clone(),
            cleared_ranges: self.cleared_ranges.clone(),
            cursor: lo,
            end: hi,
            prefetch,
            deadline: self.deadline,
        }
    }

    pub fn commit(&mut self) -> Result<(), QuillError> {
        self.check_deadline()?;
        let mut inner = self.store.inner.lock();
        inner.commit_attempts += 1;
        for (lo, hi) in &self.read_ranges {
            for (key, entry) in inner
                .entries
                .range((Bound::Included(lo.clone()), Bound::Excluded(hi.clone())))
            {
                if entry.seq > self.snapshot_seq {
                    return Err(QuillError::NotCommitted(format!(
                        "conflicting write at {key:02x?}"
                    )));
                }
            }
        }
        inner.commit_seq += 1;
        let seq = inner.commit_seq;
        for (lo, hi) in self.cleared_ranges.drain(..) {
            let doomed: Vec<Vec<u8>> = inner
                .entries
                .range((Bound::Included(lo), Bound::Excluded(hi)))
                .map(|(k, _)| k.clone())
                .collect();
            for key in doomed {
                inner
                    .entries
                    .insert(key, VersionedValue { value: None, seq });
            }
        }
        for (key, value) in std::mem::take(&mut self.writes) {
            inner.entries.insert(key, VersionedValue { value, seq });
        }
        Ok(())
    }

    /// Handles a retryable failure: waits with exponential backoff, then
    /// resets this transaction onto a fresh snapshot. Fatal errors and
    /// exhausted retry budgets are returned to the caller unchanged.
    pub async fn on_error(&mut self, error: QuillError) -> Result<(), QuillError> {
        if !error.is_retryable() || self.retries_used >= self.options.retry_limit {
            return Err(error);
        }
        let backoff = Duration::from_millis((2u64 << self.retries_used.min(8)).min(500));
        self.retries_used += 1;
        tokio::time::sleep(backoff).await;
        self.reset();
        Ok(())
    }

    pub fn reset(&mut self) {
        let (snapshot, snapshot_seq) = self.store.snapshot();
        self.snapshot = snapshot;
        self.snapshot_seq = snapshot_seq;
        self.writes.clear();
        self.cleared_ranges.clear();
        self.read_ranges.clear();
        self.deadline = Instant::now() + Duration::from_millis(self.options.timeout_ms);
    }

    pub fn store(&self) -> &MemoryKv {
        &self.store
    }

    pub fn options(&self) -> TxnOptions {
        self.options
    }
}

pub struct RangeReader {
    snapshot: OrdMap<Vec<u8>, VersionedValue>,
    writes: BTreeMap<Vec<u8>, Option<Vec<u8>>>,
    cleared_ranges: Vec<(Vec<u8>, Vec<u8>)>,
    cursor: Vec<u8>,
    end: Vec<u8>,
    prefetch: Prefetch,
    deadline: Instant,
}

impl RangeReader {
    pub async fn next(&mut self) -> Result<Option<KvPair>, QuillError> {
        if Instant::now() >= self.deadline {
            return Err(QuillError::TransactionTooOld);
        }
        let permit = match &self.prefetch {
            Prefetch::Unlimited => None,
            Prefetch::Permits(sem) => Some(
                sem.clone()
                    .acquire_owned()
                    .await
                    .expect("prefetch semaphore closed"),
            ),
        };
        while let Some((key, value)) = self.peek_next() {
            self.cursor = key_after(&key);
            match value {
                Some(value) => {
                    return Ok(Some(KvPair { key, value, permit }));
                }
                None => continue,
            }
        }
        Ok(None)
    }

    /// Smallest live key at or after the cursor, merging the snapshot with
    /// the transaction's buffered writes and clears.
    fn peek_next(&self) -> Option<(Vec<u8>, Option<Vec<u8>>)> {
        let snapshot_next = self
            .snapshot
            .range((
                Bound::Included(self.cursor.clone()),
                Bound::Excluded(self.end.clone()),
            ))
            .find(|(key, entry)| {
                entry.value.is_some()
                    && !self
                        .cleared_ranges
                        .iter()
                        .any(|(lo, hi)| key.as_slice() >= lo.as_slice() && key.as_slice() < hi.as_slice())
                    && !self.writes.contains_key(key.as_slice())
            })
            .map(|(key, entry)| (key.clone(), entry.value.clone()));
        let buffered_next = self
            .writes
            .range::<[u8], _>((
                Bound::Included(self.cursor.as_slice()),
                Bound::Excluded(self.end.as_slice()),
            ))
            .next()
            .map(|(key, value)| (key.clone(), value.clone()));
        match (snapshot_next, buffered_next) {
            (Some(a), Some(b)) => {
                if a.0 <= b.0 {
                    Some(a)
                } else {
                    Some(b)
                }
            }
            (a, b) => a.or(b),
        }
    }
}

/// Transaction handle shared by every document emitted under it. Wrappers
/// that span transactions swap the inner transaction in place so existing
/// handles observe the replacement.
pub struct DocTxn {
    kv: RefCell<KvTransaction>,
}

impl DocTxn {
    pub fn new(txn: KvTransaction) -> Rc<Self> {
        Rc::new(Self {
            kv: RefCell::new(txn),
        })
    }

    pub fn begin(store: &MemoryKv, options: TxnOptions) -> Rc<Self> {
        Self::new(KvTransaction::begin(store, options))
    }

    pub async fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, QuillError> {
        self.kv.borrow_mut().get(key)
    }

    pub fn set(&self, key: Vec<u8>, value: Vec<u8>) {
        self.kv.borrow_mut().set(key, value);
    }

    pub fn clear(&self, key: Vec<u8>) {
        self.kv.borrow_mut().clear(key);
    }

    pub fn clear_range(&self, lo: Vec<u8>, hi: Vec<u8>) {
        self.kv.borrow_mut().clear_range(lo, hi);
    }

    pub fn range_reader(&self, lo: Vec<u8>, hi: Vec<u8>, prefetch: Prefetch) -> RangeReader {
        self.kv.borrow_mut().range_reader(lo, hi, prefetch)
    }

    pub async fn commit(&self) -> Result<(), QuillError> {
        self.kv.borrow_mut().commit()
    }

    pub async fn on_error(&self, error: QuillError) -> Result<(), QuillError> {
        // The borrow must not be held across the backoff sleep; split the
        // decision from the reset.
        let decision = {
            let txn = self.kv.borrow();
            if !error.is_retryable() || txn.retries_used >= txn.options.retry_limit {
                None
            } else {
                Some(Duration::from_millis(
                    (2u64 << txn.retries_used.min(8)).min(500),
                ))
            }
        };
        match decision {
            None => Err(error),
            Some(backoff) => {
                tokio::time::sleep(backoff).await;
                let mut txn = self.kv.borrow_mut();
                txn.retries_used += 1;
                txn.reset();
                Ok(())
            }
        }
    }

    /// Swaps in a fresh transaction; outstanding document handles now read
    /// through the replacement.
    pub fn replace(&self, txn: KvTransaction) {
        *self.kv.borrow_mut() = txn;
    }

    pub fn store(&self) -> MemoryKv {
        self.kv.borrow().store().clone()
    }

    pub fn options(&self) -> TxnOptions {
        self.kv.borrow().options()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn commit_single(store: &MemoryKv, key: &[u8], value: &[u8]) {
        let mut txn = KvTransaction::begin(store, TxnOptions::default());
        txn.set(key.to_vec(), value.to_vec());
        txn.commit().expect("commit");
    }

    #[tokio::test]
    async fn reads_merge_snapshot_and_buffered_writes() {
        let store = MemoryKv::new();
        commit_single(&store, b"a", b"1");
        commit_single(&store, b"c", b"3");

        let mut txn = KvTransaction::begin(&store, TxnOptions::default());
        txn.set(b"b".to_vec(), b"2".to_vec());
        txn.clear(b"c".to_vec());

        let mut reader = txn.range_reader(b"a".to_vec(), b"z".to_vec(), Prefetch::Unlimited);
        let mut seen = Vec::new();
        while let Some(pair) = reader.next().await.expect("read") {
            seen.push((pair.key, pair.value));
        }
        assert_eq!(
            seen,
            vec![
                (b"a".to_vec(), b"1".to_vec()),
                (b"b".to_vec(), b"2".to_vec())
            ]
        );
    }

    #[tokio::test]
    async fn conflicting_commit_is_retryable() {
        let store = MemoryKv::new();
        commit_single(&store, b"k", b"0");

        let mut txn = KvTransaction::begin(&store, TxnOptions::default());
        let _ = txn.get(b"k").expect("read");
        commit_single(&store, b"k", b"1");
        txn.set(b"k".to_vec(), b"2".to_vec());

        let err = txn.commit().expect_err("conflict");
        assert!(err.is_retryable());
        txn.on_error(err).await.expect("reset");
        let _ = txn.get(b"k").expect("read");
        txn.set(b"k".to_vec(), b"2".to_vec());
        txn.commit().expect("second attempt");
        assert_eq!(store.commit_attempts(), 4);
    }

    #[tokio::test]
    async fn prefetch_permit_limits_lookahead() {
        let store = MemoryKv::new();
        for i in 0..4u8 {
            commit_single(&store, &[i], b"v");
        }
        let mut txn = KvTransaction::begin(&store, TxnOptions::default());
        let sem = Arc::new(Semaphore::new(1));
        let mut reader = txn.range_reader(vec![0], vec![10], Prefetch::Permits(sem.clone()));

        let first = reader.next().await.expect("read").expect("pair");
        assert_eq!(sem.available_permits(), 0);
        // The next read cannot proceed until the first permit is released.
        let blocked = tokio::time::timeout(Duration::from_millis(20), reader.next()).await;
        assert!(blocked.is_err());
        drop(first.permit);
        let second = reader.next().await.expect("read").expect("pair");
        assert_eq!(second.key, vec![1]);
    }

    #[tokio::test]
    async fn expired_transaction_reads_fail_retryably() {
        let store = MemoryKv::new();
        commit_single(&store, b"a", b"1");
        let mut txn = KvTransaction::begin(
            &store,
            TxnOptions {
                timeout_ms: 0,
                ..TxnOptions::default()
            },
        );
        let err = txn.get(b"a").expect_err("expired");
        assert_eq!(err, QuillError::TransactionTooOld);
        assert!(err.is_retryable());
    }
}
