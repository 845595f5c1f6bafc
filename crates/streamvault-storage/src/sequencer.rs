//! Callback Sequencer
//!
//! The WAL's I/O pool completes blocks in whatever order the device finishes
//! them, but the cache and the upload pipeline need records per stream in
//! offset order. The sequencer turns out-of-order physical acknowledgements
//! into in-order deliveries and a global confirm offset.
//!
//! ## How It Works
//!
//! Two structures, both FIFO:
//!
//! - a global queue of every in-flight request, in append order; popping its
//!   persisted prefix advances `wal_confirm_offset` - the greatest offset
//!   whose entire prefix is durable
//! - a per-stream queue; a persisted request is released only when it is at
//!   the head, dragging its persisted successors with it
//!
//! The maps are guarded by one mutex with short critical sections; `before`
//! runs before the WAL dispatch, `after` when the WAL signals durable, and
//! both are cheap enough that the lock never sees real contention.

use crate::error::Result;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use streamvault_core::StreamRecordBatch;
use tokio::sync::oneshot;

const UNASSIGNED_OFFSET: u64 = u64::MAX;

/// One record's journey through the WAL.
///
/// Created on append, mutated only by the committer, destroyed once the
/// record is delivered to the cache and the caller's future resolves.
pub struct WalWriteRequest {
    record: StreamRecordBatch,
    offset: AtomicU64,
    persisted: AtomicBool,
    done: Mutex<Option<oneshot::Sender<Result<()>>>>,
}

impl WalWriteRequest {
    pub fn new(record: StreamRecordBatch) -> (Arc<Self>, oneshot::Receiver<Result<()>>) {
        let (tx, rx) = oneshot::channel();
        let request = Arc::new(Self {
            record,
            offset: AtomicU64::new(UNASSIGNED_OFFSET),
            persisted: AtomicBool::new(false),
            done: Mutex::new(Some(tx)),
        });
        (request, rx)
    }

    pub fn record(&self) -> &StreamRecordBatch {
        &self.record
    }

    pub fn set_offset(&self, offset: u64) {
        self.offset.store(offset, Ordering::Release);
    }

    pub fn offset(&self) -> u64 {
        self.offset.load(Ordering::Acquire)
    }

    pub fn is_persisted(&self) -> bool {
        self.persisted.load(Ordering::Acquire)
    }

    /// Resolve the caller's append future; idempotent.
    pub fn complete(&self, result: Result<()>) {
        if let Some(tx) = self.done.lock().unwrap().take() {
            let _ = tx.send(result);
        }
    }
}

impl std::fmt::Debug for WalWriteRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WalWriteRequest")
            .field("stream_id", &self.record.stream_id)
            .field("base_offset", &self.record.base_offset)
            .field("offset", &self.offset())
            .field("persisted", &self.is_persisted())
            .finish()
    }
}

struct SequencerInner {
    wal_requests: VecDeque<Arc<WalWriteRequest>>,
    stream_requests: HashMap<u64, VecDeque<Arc<WalWriteRequest>>>,
    wal_confirm_offset: Option<u64>,
}

#[derive(Default)]
pub struct CallbackSequencer {
    inner: Mutex<SequencerInner>,
}

impl Default for SequencerInner {
    fn default() -> Self {
        Self {
            wal_requests: VecDeque::new(),
            stream_requests: HashMap::new(),
            wal_confirm_offset: None,
        }
    }
}

impl CallbackSequencer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a request before it is dispatched to the WAL.
    pub fn before(&self, request: Arc<WalWriteRequest>) {
        let mut inner = self.inner.lock().unwrap();
        inner.wal_requests.push_back(Arc::clone(&request));
        inner
            .stream_requests
            .entry(request.record().stream_id)
            .or_default()
            .push_back(request);
    }

    /// Record that the WAL persisted `request`, advance the confirm offset,
    /// and release the in-order persisted prefix of its stream.
    ///
    /// Returns empty when the request still awaits earlier records of its
    /// stream.
    pub fn after(&self, request: &Arc<WalWriteRequest>) -> Vec<Arc<WalWriteRequest>> {
        request.persisted.store(true, Ordering::Release);
        let mut inner = self.inner.lock().unwrap();

        while let Some(head) = inner.wal_requests.front() {
            if !head.is_persisted() {
                break;
            }
            let confirmed = head.offset();
            inner.wal_requests.pop_front();
            // Backoff retries can assign offsets out of arrival order; the
            // confirm offset still never regresses.
            inner.wal_confirm_offset = Some(
                inner
                    .wal_confirm_offset
                    .map_or(confirmed, |prev| prev.max(confirmed)),
            );
        }

        let stream_id = request.record().stream_id;
        let Some(queue) = inner.stream_requests.get_mut(&stream_id) else {
            return Vec::new();
        };
        let head_matches = queue
            .front()
            .map(|head| head.offset() == request.offset())
            .unwrap_or(false);
        if !head_matches {
            return Vec::new();
        }
        let mut released = Vec::new();
        while let Some(head) = queue.front() {
            if !head.is_persisted() {
                break;
            }
            released.push(queue.pop_front().unwrap());
        }
        released
    }

    /// Inclusive WAL confirm offset: the greatest record offset whose entire
    /// prefix is durable. `None` until anything persists.
    pub fn wal_confirm_offset(&self) -> Option<u64> {
        self.inner.lock().unwrap().wal_confirm_offset
    }

    /// Drop a stream's queue once it is empty; used after force-uploading a
    /// closing stream.
    pub fn try_free(&self, stream_id: u64) {
        let mut inner = self.inner.lock().unwrap();
        if inner
            .stream_requests
            .get(&stream_id)
            .map(|q| q.is_empty())
            .unwrap_or(false)
        {
            inner.stream_requests.remove(&stream_id);
        }
    }

    /// Remove a request that failed before reaching the device, so it never
    /// blocks the confirm offset or its stream's queue.
    pub fn drop_request(&self, request: &Arc<WalWriteRequest>) {
        let mut inner = self.inner.lock().unwrap();
        inner.wal_requests.retain(|r| !Arc::ptr_eq(r, request));
        if let Some(queue) = inner.stream_requests.get_mut(&request.record().stream_id) {
            queue.retain(|r| !Arc::ptr_eq(r, request));
        }
    }
}
