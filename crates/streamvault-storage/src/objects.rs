//! Object Metadata Interface
//!
//! Object ids come from the metadata service in prepare order and objects
//! are committed in id order, which is what gives uploads their global
//! ordering guarantee. The storage layer consumes the service through this
//! trait; compaction consumes the same interface.

use crate::error::Result;
use async_trait::async_trait;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;

/// One stream's contiguous slice inside a WAL object.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectStreamRange {
    pub stream_id: u64,
    pub epoch: u64,
    pub start_offset: u64,
    /// Exclusive
    pub end_offset: u64,
    /// Encoded bytes of the slice
    pub size: u64,
}

/// A single-stream object split out of a WAL upload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamObject {
    pub object_id: u64,
    pub stream_id: u64,
    pub start_offset: u64,
    /// Exclusive
    pub end_offset: u64,
    pub object_size: u64,
}

/// Commit of one WAL upload: the multiplexed object plus any stream objects
/// split out of it, committed atomically by the metadata service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommitWalObjectRequest {
    pub object_id: u64,
    pub object_size: u64,
    pub stream_ranges: Vec<ObjectStreamRange>,
    pub stream_objects: Vec<StreamObject>,
}

/// A committed WAL object as reported back by the metadata service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WalObjectMetadata {
    pub object_id: u64,
    pub object_size: u64,
    pub stream_ranges: Vec<ObjectStreamRange>,
}

#[async_trait]
pub trait ObjectManager: Send + Sync {
    /// Reserve `count` consecutive object ids, valid for `ttl`; returns the
    /// first id.
    async fn prepare_object(&self, count: u32, ttl: Duration) -> Result<u64>;

    /// Commit an uploaded WAL object and its split stream objects.
    async fn commit_wal_object(&self, request: CommitWalObjectRequest) -> Result<()>;

    /// Committed WAL objects of this server, oldest first; consumed by
    /// compaction.
    async fn get_server_objects(&self) -> Result<Vec<WalObjectMetadata>>;
}

/// In-memory object manager for tests.
#[derive(Default)]
pub struct MemoryObjectManager {
    next_object_id: AtomicU64,
    committed: Mutex<Vec<CommitWalObjectRequest>>,
}

impl MemoryObjectManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn committed(&self) -> Vec<CommitWalObjectRequest> {
        self.committed.lock().unwrap().clone()
    }

    pub fn commit_count(&self) -> usize {
        self.committed.lock().unwrap().len()
    }
}

#[async_trait]
impl ObjectManager for MemoryObjectManager {
    async fn prepare_object(&self, count: u32, _ttl: Duration) -> Result<u64> {
        Ok(self.next_object_id.fetch_add(count as u64, Ordering::SeqCst))
    }

    async fn commit_wal_object(&self, request: CommitWalObjectRequest) -> Result<()> {
        self.committed.lock().unwrap().push(request);
        Ok(())
    }

    async fn get_server_objects(&self) -> Result<Vec<WalObjectMetadata>> {
        Ok(self
            .committed
            .lock()
            .unwrap()
            .iter()
            .map(|r| WalObjectMetadata {
                object_id: r.object_id,
                object_size: r.object_size,
                stream_ranges: r.stream_ranges.clone(),
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_prepare_hands_out_consecutive_ids() {
        let manager = MemoryObjectManager::new();
        let ttl = Duration::from_secs(60);
        assert_eq!(manager.prepare_object(1, ttl).await.unwrap(), 0);
        assert_eq!(manager.prepare_object(3, ttl).await.unwrap(), 1);
        assert_eq!(manager.prepare_object(1, ttl).await.unwrap(), 4);
    }

    #[tokio::test]
    async fn test_commit_and_list() {
        let manager = MemoryObjectManager::new();
        let request = CommitWalObjectRequest {
            object_id: 0,
            object_size: 128,
            stream_ranges: vec![ObjectStreamRange {
                stream_id: 1,
                epoch: 0,
                start_offset: 0,
                end_offset: 10,
                size: 128,
            }],
            stream_objects: vec![],
        };
        manager.commit_wal_object(request.clone()).await.unwrap();
        assert_eq!(manager.commit_count(), 1);

        let objects = manager.get_server_objects().await.unwrap();
        assert_eq!(objects.len(), 1);
        assert_eq!(objects[0].object_id, 0);
        assert_eq!(objects[0].stream_ranges, request.stream_ranges);
    }
}
