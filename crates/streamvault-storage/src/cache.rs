//! Log Cache
//!
//! In-memory, stream-partitioned cache of records the WAL has acknowledged
//! but the upload pipeline has not yet shipped. Records accumulate in the
//! *active* block; when it fills (by bytes or by stream count) it is
//! archived - frozen for upload - and a fresh active block takes over.
//!
//! ## Block Lifecycle
//!
//! ```text
//! active ──seal──▶ archived ──upload commits──▶ free ──force_free──▶ gone
//!                  (frozen,                     (still readable,
//!                   never evicted)               evicted oldest-first)
//! ```
//!
//! A freed block stays readable so recent consumers keep hitting memory
//! instead of the object store. The only eviction path is the out-of-memory
//! hook `force_free`, invoked under allocation pressure; it only ever
//! touches freed blocks, so an archived block still feeding an in-flight
//! upload is never dropped.
//!
//! ## Reads
//!
//! `get` returns the run of records adjacent to the cache head. If the first
//! returned record covers the requested start offset the cache satisfied the
//! read fully; otherwise the caller reads the historical gap from the block
//! cache and stitches the runs together.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use streamvault_core::StreamRecordBatch;
use tracing::debug;

/// Matches every stream in `archive_current_block_if_contains`.
pub const MATCH_ALL_STREAMS: u64 = u64::MAX;

/// A group of records from many streams, sealed together into one upload.
#[derive(Debug)]
pub struct LogCacheBlock {
    id: u64,
    limit: u64,
    max_streams: usize,
    records: HashMap<u64, Vec<StreamRecordBatch>>,
    size: u64,
    confirm_offset: u64,
}

impl LogCacheBlock {
    pub fn new(id: u64, limit: u64, max_streams: usize) -> Self {
        Self {
            id,
            limit,
            max_streams,
            records: HashMap::new(),
            size: 0,
            confirm_offset: 0,
        }
    }

    /// Add a record; returns whether the block is now full.
    ///
    /// Within a stream, callers deliver records in ascending base-offset
    /// order with duplicates already rejected upstream.
    pub fn put(&mut self, record: StreamRecordBatch) -> bool {
        let entry = self.records.entry(record.stream_id).or_default();
        debug_assert!(
            entry
                .last()
                .map(|prev| prev.last_offset() <= record.base_offset)
                .unwrap_or(true),
            "records must arrive in per-stream offset order"
        );
        self.size += record.size() as u64;
        entry.push(record);
        self.is_full()
    }

    pub fn is_full(&self) -> bool {
        self.size >= self.limit || self.records.len() >= self.max_streams
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn stream_count(&self) -> usize {
        self.records.len()
    }

    pub fn contains(&self, stream_id: u64) -> bool {
        self.records.contains_key(&stream_id)
    }

    pub fn records(&self) -> &HashMap<u64, Vec<StreamRecordBatch>> {
        &self.records
    }

    /// WAL offset whose prefix this block covers; set when the block is
    /// sealed, zero until then.
    pub fn confirm_offset(&self) -> u64 {
        self.confirm_offset
    }

    pub fn set_confirm_offset(&mut self, offset: u64) {
        self.confirm_offset = offset;
    }
}

struct ArchivedEntry {
    block: Arc<LogCacheBlock>,
    free: bool,
}

struct CacheInner {
    active: LogCacheBlock,
    /// Oldest first
    archived: Vec<ArchivedEntry>,
    confirm_offset: u64,
}

pub struct LogCache {
    block_size_limit: u64,
    max_streams_per_block: usize,
    next_block_id: AtomicU64,
    size: AtomicU64,
    inner: Mutex<CacheInner>,
}

impl LogCache {
    pub fn new(block_size_limit: u64, max_streams_per_block: usize) -> Self {
        Self {
            block_size_limit,
            max_streams_per_block,
            next_block_id: AtomicU64::new(1),
            size: AtomicU64::new(0),
            inner: Mutex::new(CacheInner {
                active: LogCacheBlock::new(0, block_size_limit, max_streams_per_block),
                archived: Vec::new(),
                confirm_offset: 0,
            }),
        }
    }

    /// Add a record to the active block; true means the block filled and the
    /// caller should archive it.
    pub fn put(&self, record: StreamRecordBatch) -> bool {
        let size = record.size() as u64;
        let full = self.inner.lock().unwrap().active.put(record);
        self.size.fetch_add(size, Ordering::AcqRel);
        full
    }

    /// Records for `[start, end)` from the contiguous run adjacent to the
    /// cache head, capped at `max_bytes` (always at least one record when
    /// any match).
    ///
    /// If the first returned record's base offset is at or below `start`,
    /// the cache can satisfy the read fully.
    pub fn get(
        &self,
        stream_id: u64,
        start: u64,
        end: u64,
        max_bytes: usize,
    ) -> Vec<StreamRecordBatch> {
        let inner = self.inner.lock().unwrap();
        let mut run: Vec<StreamRecordBatch> = Vec::new();
        let mut next_offset = None;

        let blocks = inner
            .archived
            .iter()
            .map(|e| &*e.block)
            .chain(std::iter::once(&inner.active));
        for block in blocks {
            let Some(records) = block.records().get(&stream_id) else {
                continue;
            };
            for record in records {
                if record.last_offset() <= start || record.base_offset >= end {
                    continue;
                }
                match next_offset {
                    Some(expected) if record.base_offset != expected => {
                        // A gap (evicted block); keep only the newer run.
                        run.clear();
                    }
                    _ => {}
                }
                next_offset = Some(record.last_offset());
                run.push(record.clone());
            }
        }

        let mut out = Vec::with_capacity(run.len());
        let mut budget = max_bytes;
        for record in run {
            if !out.is_empty() && record.size() > budget {
                break;
            }
            budget = budget.saturating_sub(record.size());
            out.push(record);
        }
        out
    }

    /// Seal the active block for upload and start a fresh one.
    pub fn archive_current_block(&self) -> Arc<LogCacheBlock> {
        let mut inner = self.inner.lock().unwrap();
        self.archive_locked(&mut inner)
    }

    /// Seal the active block only if it holds records for `stream_id`
    /// (or any records at all for [`MATCH_ALL_STREAMS`]).
    pub fn archive_current_block_if_contains(&self, stream_id: u64) -> Option<Arc<LogCacheBlock>> {
        let mut inner = self.inner.lock().unwrap();
        let matches = if stream_id == MATCH_ALL_STREAMS {
            inner.active.stream_count() > 0
        } else {
            inner.active.contains(stream_id)
        };
        matches.then(|| self.archive_locked(&mut inner))
    }

    fn archive_locked(&self, inner: &mut CacheInner) -> Arc<LogCacheBlock> {
        let fresh = LogCacheBlock::new(
            self.next_block_id.fetch_add(1, Ordering::Relaxed),
            self.block_size_limit,
            self.max_streams_per_block,
        );
        let mut sealed = std::mem::replace(&mut inner.active, fresh);
        sealed.set_confirm_offset(inner.confirm_offset);
        let sealed = Arc::new(sealed);
        inner.archived.push(ArchivedEntry {
            block: Arc::clone(&sealed),
            free: false,
        });
        debug!(
            block_id = sealed.id(),
            size = sealed.size(),
            streams = sealed.stream_count(),
            "log cache block archived"
        );
        sealed
    }

    pub fn set_confirm_offset(&self, offset: u64) {
        self.inner.lock().unwrap().confirm_offset = offset;
    }

    pub fn confirm_offset(&self) -> u64 {
        self.inner.lock().unwrap().confirm_offset
    }

    /// Mark an archived block's upload as committed. The block stays
    /// readable but becomes evictable by `force_free`.
    pub fn mark_free(&self, block_id: u64) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(entry) = inner.archived.iter_mut().find(|e| e.block.id() == block_id) {
            entry.free = true;
        }
    }

    /// Out-of-memory hook: drop freed blocks oldest-first until `bytes` are
    /// released or none remain. Never touches a block with an in-flight
    /// upload.
    pub fn force_free(&self, bytes: u64) -> u64 {
        let mut inner = self.inner.lock().unwrap();
        let mut released = 0u64;
        while released < bytes {
            match self.evict_oldest_free(&mut inner) {
                Some(freed) => released += freed,
                None => break,
            }
        }
        released
    }

    fn evict_oldest_free(&self, inner: &mut CacheInner) -> Option<u64> {
        let index = inner.archived.iter().position(|e| e.free)?;
        let entry = inner.archived.remove(index);
        let freed = entry.block.size();
        self.size.fetch_sub(freed, Ordering::AcqRel);
        debug!(block_id = entry.block.id(), freed, "log cache block evicted");
        Some(freed)
    }

    pub fn size(&self) -> u64 {
        self.size.load(Ordering::Acquire)
    }
}
