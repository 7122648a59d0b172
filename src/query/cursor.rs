use crate::doc::context::Document;
use crate::error::QuillError;
use crate::query::checkpoint::{DocStream, PlanCheckpoint};
use crate::query::executor::next_document;
use std::cell::RefCell;
use std::collections::BTreeMap;
use std::rc::Rc;
use std::time::Instant;

/// A paused execution a client can come back to: the checkpoint keeps the
/// operator tasks alive between fetches, the stream holds their undelivered
/// output.
pub struct Cursor {
    id: i64,
    checkpoint: PlanCheckpoint,
    stream: RefCell<DocStream>,
    expiry: Instant,
}

impl Cursor {
    /// Parks a running execution. The checkpoint must be the one the stream
    /// was built against.
    pub fn open(id: i64, checkpoint: PlanCheckpoint, stream: DocStream, expiry: Instant) -> Self {
        Self {
            id,
            checkpoint,
            stream: RefCell::new(stream),
            expiry,
        }
    }

    pub fn id(&self) -> i64 {
        self.id
    }

    /// Drives the parked execution and returns up to `max` documents. The
    /// second value turns false once the plan is exhausted. One fetch at a
    /// time; the stream is held for the duration of the call.
    pub async fn next_batch(&self, max: usize) -> Result<(Vec<Document>, bool), QuillError> {
        let mut stream = self.stream.borrow_mut();
        let mut batch = Vec::new();
        while batch.len() < max {
            match next_document(&self.checkpoint, &mut stream).await? {
                Some(doc) => batch.push(doc),
                None => return Ok((batch, false)),
            }
        }
        Ok((batch, true))
    }
}

/// Registry of open cursors, pruned by expiry.
#[derive(Default)]
pub struct CursorRegistry {
    cursors: BTreeMap<i64, Rc<Cursor>>,
}

impl CursorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, cursor: Cursor) -> Rc<Cursor> {
        let cursor = Rc::new(cursor);
        self.cursors.insert(cursor.id, cursor.clone());
        cursor
    }

    pub fn get(&self, id: i64) -> Option<Rc<Cursor>> {
        self.cursors.get(&id).cloned()
    }

    /// Removes a cursor and cancels its execution.
    pub fn pluck(&mut self, id: i64) -> bool {
        match self.cursors.remove(&id) {
            Some(cursor) => {
                cursor.checkpoint.stop();
                true
            }
            None => false,
        }
    }

    /// Removes every cursor whose expiry has passed, returning how many
    /// were pruned.
    pub fn prune(&mut self, now: Instant) -> u32 {
        let expired: Vec<i64> = self
            .cursors
            .iter()
            .filter(|(_, cursor)| now >= cursor.expiry)
            .map(|(id, _)| *id)
            .collect();
        let mut pruned = 0;
        for id in expired {
            if self.pluck(id) {
                pruned += 1;
            }
        }
        pruned
    }

    pub fn len(&self) -> usize {
        self.cursors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cursors.is_empty()
    }
}
