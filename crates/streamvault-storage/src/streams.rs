//! Stream Metadata Interface
//!
//! The metadata service owns stream lifecycles; the storage layer consumes
//! it through this trait. During startup the service reports which streams
//! were open on this node so recovery can filter already-committed records
//! and detect data loss; after recovery the storage layer closes them.

use crate::error::Result;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Mutex;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamMetadata {
    pub stream_id: u64,
    pub epoch: u64,
    pub start_offset: u64,
    /// Exclusive end offset the metadata service has committed
    pub end_offset: u64,
}

#[async_trait]
pub trait StreamManager: Send + Sync {
    /// Streams that were open on this node at the time of the last session.
    async fn get_opening_streams(&self) -> Result<Vec<StreamMetadata>>;

    async fn get_streams(&self, stream_ids: Vec<u64>) -> Result<Vec<StreamMetadata>>;

    async fn close_stream(&self, stream_id: u64, epoch: u64) -> Result<()>;
}

/// In-memory stream manager for tests.
#[derive(Default)]
pub struct MemoryStreamManager {
    streams: Mutex<HashMap<u64, StreamMetadata>>,
    closed: Mutex<Vec<(u64, u64)>>,
}

impl MemoryStreamManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_streams(streams: Vec<StreamMetadata>) -> Self {
        let manager = Self::new();
        {
            let mut map = manager.streams.lock().unwrap();
            for stream in streams {
                map.insert(stream.stream_id, stream);
            }
        }
        manager
    }

    /// Streams closed so far, in close order.
    pub fn closed(&self) -> Vec<(u64, u64)> {
        self.closed.lock().unwrap().clone()
    }
}

#[async_trait]
impl StreamManager for MemoryStreamManager {
    async fn get_opening_streams(&self) -> Result<Vec<StreamMetadata>> {
        let mut streams: Vec<_> = self.streams.lock().unwrap().values().cloned().collect();
        streams.sort_by_key(|s| s.stream_id);
        Ok(streams)
    }

    async fn get_streams(&self, stream_ids: Vec<u64>) -> Result<Vec<StreamMetadata>> {
        let map = self.streams.lock().unwrap();
        Ok(stream_ids
            .into_iter()
            .filter_map(|id| map.get(&id).cloned())
            .collect())
    }

    async fn close_stream(&self, stream_id: u64, epoch: u64) -> Result<()> {
        self.streams.lock().unwrap().remove(&stream_id);
        self.closed.lock().unwrap().push((stream_id, epoch));
        Ok(())
    }
}
