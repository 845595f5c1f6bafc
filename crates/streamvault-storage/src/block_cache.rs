//! Historical Read Interface
//!
//! Reads below the log cache head come from committed objects through a
//! block cache owned outside this crate. The storage service stitches its
//! result onto the log cache tail.

use crate::error::Result;
use async_trait::async_trait;
use streamvault_core::StreamRecordBatch;

#[async_trait]
pub trait BlockCache: Send + Sync {
    /// Records of `stream_id` in `[start, end)`, in offset order, capped at
    /// `max_bytes`.
    async fn read(
        &self,
        stream_id: u64,
        start: u64,
        end: u64,
        max_bytes: usize,
    ) -> Result<Vec<StreamRecordBatch>>;
}

/// A block cache that never has anything; reads are served from the log
/// cache alone.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopBlockCache;

#[async_trait]
impl BlockCache for NoopBlockCache {
    async fn read(
        &self,
        _stream_id: u64,
        _start: u64,
        _end: u64,
        _max_bytes: usize,
    ) -> Result<Vec<StreamRecordBatch>> {
        Ok(Vec::new())
    }
}
