//! WAL Object Upload Task
//!
//! Uploads one sealed log cache block as an object-store artifact in three
//! stages the pipeline drives separately:
//!
//! 1. **prepare**: reserve object ids from the metadata service - one for
//!    the multiplexed WAL object plus one per split stream
//! 2. **upload**: stream the block's records to the object store, grouped
//!    per stream and sorted by base offset; a stream whose run exceeds the
//!    split threshold becomes its own object so compaction never has to
//!    rewrite it
//! 3. **commit**: report the artifact to the metadata service
//!
//! Transient store failures retry with exponential backoff inside the
//! upload; a commit that still fails after retries is terminal for the
//! process (the WAL stays un-trimmed and the id is burned, so restarting
//! and recovering via the WAL is the only safe move).

use crate::config::StorageConfig;
use crate::error::{Error, Result};
use crate::objects::{CommitWalObjectRequest, ObjectManager, ObjectStreamRange, StreamObject};
use bytes::{Bytes, BytesMut};
use object_store::path::Path;
use object_store::ObjectStore;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use streamvault_core::StreamRecordBatch;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

const UNPREPARED: u64 = u64::MAX;

/// Object key of a multiplexed WAL object.
pub fn wal_object_path(object_id: u64) -> Path {
    Path::from(format!("wal/{:020}.obj", object_id))
}

/// Object key of a single-stream object split out of a WAL upload.
pub fn stream_object_path(stream_id: u64, object_id: u64) -> Path {
    Path::from(format!("stream/{}/{:020}.obj", stream_id, object_id))
}

struct UploadOutcome {
    object_size: u64,
    stream_ranges: Vec<ObjectStreamRange>,
    stream_objects: Vec<StreamObject>,
}

pub struct WalObjectUploadTask {
    object_store: Arc<dyn ObjectStore>,
    object_manager: Arc<dyn ObjectManager>,
    /// Streams kept in the multiplexed WAL object, sorted by id
    wal_streams: Vec<(u64, Vec<StreamRecordBatch>)>,
    /// Streams whose runs exceed the split threshold
    split_streams: Vec<(u64, Vec<StreamRecordBatch>)>,
    multipart_threshold: u64,
    multipart_part_size: u64,
    retries: u32,
    ttl: Duration,
    object_id: AtomicU64,
    upload: Mutex<Option<JoinHandle<Result<UploadOutcome>>>>,
}

impl WalObjectUploadTask {
    pub fn new(
        config: &StorageConfig,
        records: &HashMap<u64, Vec<StreamRecordBatch>>,
        object_manager: Arc<dyn ObjectManager>,
        object_store: Arc<dyn ObjectStore>,
    ) -> Self {
        let mut streams: Vec<(u64, Vec<StreamRecordBatch>)> = records
            .iter()
            .filter(|(_, batches)| !batches.is_empty())
            .map(|(&stream_id, batches)| (stream_id, batches.clone()))
            .collect();
        streams.sort_by_key(|(stream_id, _)| *stream_id);

        let mut wal_streams = Vec::new();
        let mut split_streams = Vec::new();
        for (stream_id, batches) in streams {
            let run_size: u64 = batches.iter().map(|b| b.encoded_size() as u64).sum();
            if run_size >= config.wal_object_split_threshold {
                split_streams.push((stream_id, batches));
            } else {
                wal_streams.push((stream_id, batches));
            }
        }

        Self {
            object_store,
            object_manager,
            wal_streams,
            split_streams,
            multipart_threshold: config.multipart_threshold,
            multipart_part_size: config.multipart_part_size.max(1),
            retries: config.upload_retries.max(1),
            ttl: Duration::from_secs(config.object_ttl_secs),
            object_id: AtomicU64::new(UNPREPARED),
            upload: Mutex::new(None),
        }
    }

    fn object_id(&self) -> Option<u64> {
        match self.object_id.load(Ordering::Acquire) {
            UNPREPARED => None,
            id => Some(id),
        }
    }

    /// Reserve the object ids for this upload.
    pub async fn prepare(&self) -> Result<u64> {
        let count = 1 + self.split_streams.len() as u32;
        let object_id = self.object_manager.prepare_object(count, self.ttl).await?;
        self.object_id.store(object_id, Ordering::Release);
        debug!(object_id, count, "WAL object prepared");
        Ok(object_id)
    }

    /// Start streaming the records to the object store; `commit` awaits the
    /// result.
    pub fn upload(&self) -> Result<()> {
        let object_id = self.object_id().ok_or(Error::UploadNotPrepared)?;
        let store = Arc::clone(&self.object_store);
        let wal_streams = self.wal_streams.clone();
        let split_streams = self.split_streams.clone();
        let threshold = self.multipart_threshold;
        let part_size = self.multipart_part_size;
        let retries = self.retries;
        let handle = tokio::spawn(run_upload(
            store,
            object_id,
            wal_streams,
            split_streams,
            threshold,
            part_size,
            retries,
        ));
        *self.upload.lock().unwrap() = Some(handle);
        Ok(())
    }

    /// Await the upload and commit the artifact to the metadata service.
    pub async fn commit(&self) -> Result<CommitWalObjectRequest> {
        let object_id = self.object_id().ok_or(Error::UploadNotPrepared)?;
        let handle = self
            .upload
            .lock()
            .unwrap()
            .take()
            .ok_or(Error::UploadNotPrepared)?;
        let outcome = match handle.await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(e)) => return Err(Error::UploadCommitFailed(e.to_string())),
            Err(e) => return Err(Error::UploadCommitFailed(e.to_string())),
        };
        let request = CommitWalObjectRequest {
            object_id,
            object_size: outcome.object_size,
            stream_ranges: outcome.stream_ranges,
            stream_objects: outcome.stream_objects,
        };

        let mut attempt = 0;
        loop {
            match self.object_manager.commit_wal_object(request.clone()).await {
                Ok(()) => {
                    debug!(object_id, size = request.object_size, "WAL object committed");
                    return Ok(request);
                }
                Err(e) if attempt + 1 < self.retries => {
                    let backoff_ms = 100 * 2u64.pow(attempt);
                    warn!(
                        object_id,
                        attempt = attempt + 1,
                        backoff_ms,
                        error = %e,
                        "WAL object commit failed, retrying"
                    );
                    tokio::time::sleep(Duration::from_millis(backoff_ms)).await;
                    attempt += 1;
                }
                Err(e) => return Err(Error::UploadCommitFailed(e.to_string())),
            }
        }
    }
}

fn encode_run(batches: &[StreamRecordBatch]) -> (Bytes, ObjectStreamRange) {
    let mut buf = BytesMut::new();
    for batch in batches {
        buf.extend_from_slice(&batch.encode());
    }
    let range = ObjectStreamRange {
        stream_id: batches[0].stream_id,
        epoch: batches[0].epoch,
        start_offset: batches[0].base_offset,
        end_offset: batches[batches.len() - 1].last_offset(),
        size: buf.len() as u64,
    };
    (buf.freeze(), range)
}

async fn run_upload(
    store: Arc<dyn ObjectStore>,
    object_id: u64,
    wal_streams: Vec<(u64, Vec<StreamRecordBatch>)>,
    split_streams: Vec<(u64, Vec<StreamRecordBatch>)>,
    threshold: u64,
    part_size: u64,
    retries: u32,
) -> Result<UploadOutcome> {
    let mut stream_ranges = Vec::with_capacity(wal_streams.len());
    let mut body = BytesMut::new();
    for (_, batches) in &wal_streams {
        let (run, range) = encode_run(batches);
        body.extend_from_slice(&run);
        stream_ranges.push(range);
    }
    let object_size = body.len() as u64;
    if object_size > 0 {
        let path = wal_object_path(object_id);
        put_object(&store, &path, body.freeze(), threshold, part_size, retries).await?;
    }

    let mut stream_objects = Vec::with_capacity(split_streams.len());
    for (index, (stream_id, batches)) in split_streams.iter().enumerate() {
        let split_object_id = object_id + 1 + index as u64;
        let (run, range) = encode_run(batches);
        let path = stream_object_path(*stream_id, split_object_id);
        let size = run.len() as u64;
        put_object(&store, &path, run, threshold, part_size, retries).await?;
        stream_objects.push(StreamObject {
            object_id: split_object_id,
            stream_id: *stream_id,
            start_offset: range.start_offset,
            end_offset: range.end_offset,
            object_size: size,
        });
    }

    Ok(UploadOutcome {
        object_size,
        stream_ranges,
        stream_objects,
    })
}

/// Upload one object with exponential backoff on transient failures.
async fn put_object(
    store: &Arc<dyn ObjectStore>,
    path: &Path,
    data: Bytes,
    threshold: u64,
    part_size: u64,
    retries: u32,
) -> Result<()> {
    for attempt in 0..retries {
        match try_put(store, path, data.clone(), threshold, part_size).await {
            Ok(()) => {
                debug!(path = %path, size = data.len(), "object uploaded");
                return Ok(());
            }
            Err(e) if attempt + 1 < retries => {
                let backoff_ms = 100 * 2u64.pow(attempt);
                warn!(
                    path = %path,
                    attempt = attempt + 1,
                    backoff_ms,
                    error = %e,
                    "object upload failed, retrying"
                );
                tokio::time::sleep(Duration::from_millis(backoff_ms)).await;
            }
            Err(e) => return Err(e.into()),
        }
    }
    unreachable!()
}

async fn try_put(
    store: &Arc<dyn ObjectStore>,
    path: &Path,
    data: Bytes,
    threshold: u64,
    part_size: u64,
) -> object_store::Result<()> {
    if (data.len() as u64) < threshold {
        store.put(path, data.into()).await?;
        return Ok(());
    }
    let mut upload = store.put_multipart(path).await?;
    let mut offset = 0usize;
    while offset < data.len() {
        let end = (offset + part_size as usize).min(data.len());
        if let Err(e) = upload.put_part(data.slice(offset..end).into()).await {
            let _ = upload.abort().await;
            return Err(e);
        }
        offset = end;
    }
    if let Err(e) = upload.complete().await {
        let _ = upload.abort().await;
        return Err(e);
    }
    Ok(())
}
