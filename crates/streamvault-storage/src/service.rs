//! Storage Service
//!
//! Ties the pipeline together: WAL append → callback sequencer → log cache
//! → upload pipeline → WAL trim.
//!
//! ## Append Flow
//!
//! 1. Register the request with the sequencer, then append to the WAL
//! 2. When the WAL or the cache is full, the request parks in the backoff
//!    queue; a background task retries the queue head every 100ms, so
//!    earlier records always re-dispatch first
//! 3. On WAL durability the sequencer releases the per-stream in-order
//!    prefix into the log cache
//! 4. A full cache block is archived and handed to the upload pipeline
//! 5. A committed upload trims the WAL and frees the block
//!
//! ## Upload Pipeline
//!
//! Two serial queues: *prepare* (reserve object ids, start the upload) and
//! *commit* (report to the metadata service). At most one prepare and one
//! commit run at a time, so object ids are assigned in block-seal order and
//! committed in id order while uploads themselves overlap freely.
//!
//! A failed commit is terminal: the WAL is still un-trimmed, and retrying
//! would risk re-uploading a partially committed object under the same id.
//! The process logs, fails pending futures by exiting, and recovers via the
//! WAL on restart.
//!
//! ## Startup Recovery
//!
//! Replays the WAL, keeps each stream's contiguous records above the
//! metadata end offset, uploads them as one object, resets the WAL and
//! closes the recovered streams. A stream whose recovered head sits above
//! the metadata end offset means bytes were lost - startup fails fast with
//! `DataLoss` instead of silently reopening the stream.

use crate::block_cache::BlockCache;
use crate::cache::{LogCache, LogCacheBlock, MATCH_ALL_STREAMS};
use crate::config::StorageConfig;
use crate::error::{Error, Result};
use crate::objects::ObjectManager;
use crate::oom::{self, OomHandler, OomHandlerId};
use crate::sequencer::{CallbackSequencer, WalWriteRequest};
use crate::streams::{StreamManager, StreamMetadata};
use crate::upload::WalObjectUploadTask;
use futures::future::{BoxFuture, Shared};
use futures::FutureExt;
use object_store::ObjectStore;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::{Duration, Instant};
use streamvault_core::StreamRecordBatch;
use streamvault_wal::{BlockWal, WalError};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

type InflightUpload = Shared<BoxFuture<'static, ()>>;

struct UploadContext {
    id: u64,
    task: WalObjectUploadTask,
    block: Arc<LogCacheBlock>,
    done: Mutex<Option<oneshot::Sender<()>>>,
}

#[derive(Default)]
struct PipelineQueues {
    prepare: VecDeque<Arc<UploadContext>>,
    commit: VecDeque<Arc<UploadContext>>,
}

struct CacheEvictHandler {
    cache: Arc<LogCache>,
}

impl OomHandler for CacheEvictHandler {
    fn free(&self, bytes: u64) -> u64 {
        self.cache.force_free(bytes)
    }
}

pub struct StorageService {
    me: Weak<StorageService>,
    config: StorageConfig,
    wal: Arc<BlockWal>,
    cache: Arc<LogCache>,
    sequencer: Arc<CallbackSequencer>,
    stream_manager: Arc<dyn StreamManager>,
    object_manager: Arc<dyn ObjectManager>,
    object_store: Arc<dyn ObjectStore>,
    block_cache: Arc<dyn BlockCache>,
    backoff: Mutex<VecDeque<Arc<WalWriteRequest>>>,
    /// Serializes WAL acknowledgement handling so records enter the cache
    /// in the order the sequencer releases them.
    delivery: Mutex<()>,
    pipeline: Mutex<PipelineQueues>,
    inflight: Mutex<Vec<(u64, InflightUpload)>>,
    next_upload_id: AtomicU64,
    last_backoff_log: Mutex<Option<Instant>>,
    drain_task: Mutex<Option<JoinHandle<()>>>,
    oom_handler: Mutex<Option<OomHandlerId>>,
}

impl StorageService {
    pub fn new(
        config: StorageConfig,
        wal: Arc<BlockWal>,
        stream_manager: Arc<dyn StreamManager>,
        object_manager: Arc<dyn ObjectManager>,
        object_store: Arc<dyn ObjectStore>,
        block_cache: Arc<dyn BlockCache>,
    ) -> Arc<Self> {
        let cache = Arc::new(LogCache::new(
            config.wal_object_size,
            config.max_streams_per_wal_object,
        ));
        Arc::new_cyclic(|me| Self {
            me: me.clone(),
            config,
            wal,
            cache,
            sequencer: Arc::new(CallbackSequencer::new()),
            stream_manager,
            object_manager,
            object_store,
            block_cache,
            backoff: Mutex::new(VecDeque::new()),
            delivery: Mutex::new(()),
            pipeline: Mutex::new(PipelineQueues::default()),
            inflight: Mutex::new(Vec::new()),
            next_upload_id: AtomicU64::new(0),
            last_backoff_log: Mutex::new(None),
            drain_task: Mutex::new(None),
            oom_handler: Mutex::new(None),
        })
    }

    /// Start the WAL, replay and upload whatever it holds, close the
    /// recovered streams, then begin serving appends.
    pub async fn start(&self) -> Result<()> {
        self.wal.start().await?;
        let streams = self.stream_manager.get_opening_streams().await?;

        let wal = Arc::clone(&self.wal);
        let recovered = tokio::task::spawn_blocking(move || -> Result<Vec<(u64, StreamRecordBatch)>> {
            let mut out = Vec::new();
            for result in wal.recover()? {
                match StreamRecordBatch::decode(result.record.clone()) {
                    Ok(batch) => out.push((result.record_offset, batch)),
                    Err(e) => warn!(
                        offset = result.record_offset,
                        error = %e,
                        "skipping undecodable WAL record"
                    ),
                }
            }
            Ok(out)
        })
        .await
        .map_err(|_| Error::Shutdown)??;

        let block = recover_continuous_records(recovered, &streams)?;
        let mut end_offsets: HashMap<u64, u64> = HashMap::new();
        for (&stream_id, records) in block.records() {
            if let Some(last) = records.last() {
                end_offsets.insert(stream_id, last.last_offset());
            }
        }

        if block.size() > 0 {
            info!(bytes = block.size(), "uploading records recovered from WAL");
            self.upload_wal_object(Arc::new(block)).await;
        }
        self.wal.reset().await?;

        for stream in &streams {
            let end_offset = end_offsets
                .get(&stream.stream_id)
                .copied()
                .unwrap_or(stream.end_offset);
            info!(
                stream_id = stream.stream_id,
                end_offset, "closing stream after recovery"
            );
            self.stream_manager
                .close_stream(stream.stream_id, stream.epoch)
                .await?;
        }

        let handler_id = oom::register(Arc::new(CacheEvictHandler {
            cache: Arc::clone(&self.cache),
        }));
        *self.oom_handler.lock().unwrap() = Some(handler_id);
        self.spawn_backoff_drainer();
        info!("storage service started");
        Ok(())
    }

    /// Append a record batch; resolves once the record is WAL-durable and
    /// delivered to the log cache in stream order.
    pub async fn append(&self, record: StreamRecordBatch) -> Result<()> {
        let (request, rx) = WalWriteRequest::new(record);
        self.sequencer.before(Arc::clone(&request));
        self.append0(request, false);
        rx.await.map_err(|_| Error::Shutdown)?
    }

    /// Returns whether the request went to the backoff queue.
    fn append0(&self, request: Arc<WalWriteRequest>, from_backoff: bool) -> bool {
        // Preserve fairness: nothing overtakes records already backing off.
        if !from_backoff && !self.backoff.lock().unwrap().is_empty() {
            self.backoff.lock().unwrap().push_back(request);
            return true;
        }
        if self.cache.size() >= self.config.wal_cache_size {
            // The cache at its limit is allocation pressure: ask the OOM
            // hooks to shed committed blocks before parking the append.
            let overage = self.cache.size() - self.config.wal_cache_size;
            oom::try_free(overage + request.record().size() as u64);
        }
        if self.cache.size() >= self.config.wal_cache_size {
            if !from_backoff {
                self.backoff.lock().unwrap().push_back(request);
            }
            let reason = Error::CacheFull {
                size: self.cache.size(),
                limit: self.config.wal_cache_size,
            };
            self.log_backoff(&reason.to_string());
            return true;
        }

        let body = request.record().encode();
        match self.wal.append(body, 0) {
            Ok(result) => {
                request.set_offset(result.record_offset);
                if let Some(this) = self.me.upgrade() {
                    let request = Arc::clone(&request);
                    tokio::spawn(async move {
                        match result.done.await {
                            Ok(Ok(_)) => this.handle_append_callback(&request),
                            Ok(Err(e)) => request.complete(Err(e.into())),
                            Err(_) => request.complete(Err(Error::Shutdown)),
                        }
                    });
                }
                false
            }
            Err(WalError::OverCapacity { .. }) => {
                // The WAL aligns writes to device blocks, so it can fill
                // while the current cache block is still open; push what we
                // have to make trim progress.
                if let Some(this) = self.me.upgrade() {
                    tokio::spawn(async move {
                        let _ = this.force_upload(MATCH_ALL_STREAMS).await;
                    });
                }
                if !from_backoff {
                    self.backoff.lock().unwrap().push_back(request);
                }
                self.log_backoff("WAL over capacity");
                true
            }
            Err(e) => {
                self.sequencer.drop_request(&request);
                request.complete(Err(e.into()));
                false
            }
        }
    }

    fn handle_append_callback(&self, request: &Arc<WalWriteRequest>) {
        let _delivery = self.delivery.lock().unwrap();
        let ready = self.sequencer.after(request);
        let confirm = self.sequencer.wal_confirm_offset();
        for released in ready {
            let full = self.cache.put(released.record().clone());
            if full {
                if let Some(confirm) = confirm {
                    self.cache.set_confirm_offset(confirm);
                }
                let block = self.cache.archive_current_block();
                self.upload_wal_object(block);
            }
            released.complete(Ok(()));
        }
    }

    /// Read `[start, end)` of a stream, serving the head from history when
    /// the log cache only covers the tail.
    pub async fn read(
        &self,
        stream_id: u64,
        start: u64,
        end: u64,
        max_bytes: usize,
    ) -> Result<Vec<StreamRecordBatch>> {
        let cached = self.cache.get(stream_id, start, end, max_bytes);
        if let Some(first) = cached.first() {
            if first.base_offset <= start {
                return Ok(cached);
            }
        }
        let history_end = cached.first().map(|r| r.base_offset).unwrap_or(end);
        let mut records = self
            .block_cache
            .read(stream_id, start, history_end, max_bytes)
            .await?;
        let mut budget =
            max_bytes.saturating_sub(records.iter().map(|r| r.size()).sum::<usize>());
        for record in cached {
            if budget == 0 {
                break;
            }
            budget = budget.saturating_sub(record.size());
            records.push(record);
        }
        continuous_check(stream_id, &records)?;
        Ok(records)
    }

    /// Flush a stream's cached records (or all of them) through the upload
    /// pipeline and wait for every upload in flight to commit.
    ///
    /// Grouping into one forced object avoids spraying tiny objects when a
    /// broker shuts down with thousands of open streams.
    pub async fn force_upload(&self, stream_id: u64) -> Result<()> {
        let inflight = self.inflight_uploads();
        futures::future::join_all(inflight).await;

        if let Some(confirm) = self.sequencer.wal_confirm_offset() {
            self.cache.set_confirm_offset(confirm);
        }
        if let Some(block) = self.cache.archive_current_block_if_contains(stream_id) {
            self.upload_wal_object(block);
        }
        let inflight = self.inflight_uploads();
        futures::future::join_all(inflight).await;

        if stream_id != MATCH_ALL_STREAMS {
            self.sequencer.try_free(stream_id);
        }
        Ok(())
    }

    /// Stop accepting appends, fail everything parked in backoff, and drain
    /// the WAL. Returns whether the WAL drained cleanly.
    pub async fn shutdown(&self) -> bool {
        if let Some(task) = self.drain_task.lock().unwrap().take() {
            task.abort();
        }
        let parked: Vec<_> = self.backoff.lock().unwrap().drain(..).collect();
        for request in parked {
            request.complete(Err(Error::Shutdown));
        }
        if let Some(handler_id) = self.oom_handler.lock().unwrap().take() {
            oom::unregister(handler_id);
        }
        self.wal.shutdown_gracefully().await
    }

    pub fn cache(&self) -> &LogCache {
        &self.cache
    }

    pub fn wal(&self) -> &Arc<BlockWal> {
        &self.wal
    }

    /// Greatest WAL offset whose entire prefix is durable.
    pub fn wal_confirm_offset(&self) -> Option<u64> {
        self.sequencer.wal_confirm_offset()
    }

    fn inflight_uploads(&self) -> Vec<InflightUpload> {
        self.inflight
            .lock()
            .unwrap()
            .iter()
            .map(|(_, fut)| fut.clone())
            .collect()
    }

    /// Hand a sealed block to the upload pipeline; the returned future
    /// resolves once the block's object is committed.
    fn upload_wal_object(&self, block: Arc<LogCacheBlock>) -> InflightUpload {
        let task = WalObjectUploadTask::new(
            &self.config,
            block.records(),
            Arc::clone(&self.object_manager),
            Arc::clone(&self.object_store),
        );
        let (tx, rx) = oneshot::channel::<()>();
        let fut: InflightUpload = rx.map(|_| ()).boxed().shared();
        let id = self.next_upload_id.fetch_add(1, Ordering::Relaxed);
        self.inflight.lock().unwrap().push((id, fut.clone()));

        let ctx = Arc::new(UploadContext {
            id,
            task,
            block,
            done: Mutex::new(Some(tx)),
        });
        let start_prepare = {
            let mut queues = self.pipeline.lock().unwrap();
            queues.prepare.push_back(Arc::clone(&ctx));
            queues.prepare.len() == 1
        };
        if start_prepare {
            if let Some(this) = self.me.upgrade() {
                tokio::spawn(async move {
                    this.process_prepare(ctx).await;
                });
            }
        }
        fut
    }

    fn process_prepare(self: Arc<Self>, ctx: Arc<UploadContext>) -> BoxFuture<'static, ()> {
        async move {
        let prepared = match ctx.task.prepare().await {
            Ok(_) => ctx.task.upload(),
            Err(e) => Err(e),
        };
        if let Err(e) = prepared {
            error!(error = %e, "failed to prepare WAL object upload, exiting");
            std::process::exit(1);
        }

        let (next_prepare, start_commit) = {
            let mut queues = self.pipeline.lock().unwrap();
            queues.prepare.pop_front();
            let commit_was_empty = queues.commit.is_empty();
            queues.commit.push_back(Arc::clone(&ctx));
            (queues.prepare.front().cloned(), commit_was_empty)
        };
        if start_commit {
            let this = Arc::clone(&self);
            tokio::spawn(async move {
                this.process_commit(ctx).await;
            });
        }
        if let Some(next) = next_prepare {
            let this = Arc::clone(&self);
            tokio::spawn(async move {
                this.process_prepare(next).await;
            });
        }
        }
        .boxed()
    }

    fn process_commit(self: Arc<Self>, ctx: Arc<UploadContext>) -> BoxFuture<'static, ()> {
        async move {
        match ctx.task.commit().await {
            Ok(request) => {
                debug!(
                    object_id = request.object_id,
                    size = request.object_size,
                    "WAL object committed"
                );
                let next = {
                    let mut queues = self.pipeline.lock().unwrap();
                    queues.commit.pop_front();
                    queues.commit.front().cloned()
                };

                let confirm = ctx.block.confirm_offset();
                if confirm != 0 {
                    let wal = Arc::clone(&self.wal);
                    tokio::spawn(async move {
                        if let Err(e) = wal.trim(confirm).await {
                            warn!(offset = confirm, error = %e, "best-effort WAL trim failed");
                        }
                    });
                }
                self.cache.mark_free(ctx.block.id());
                if let Some(tx) = ctx.done.lock().unwrap().take() {
                    let _ = tx.send(());
                }
                self.inflight.lock().unwrap().retain(|(id, _)| *id != ctx.id);

                if let Some(next) = next {
                    let this = Arc::clone(&self);
                    tokio::spawn(async move {
                        this.process_commit(next).await;
                    });
                }
            }
            Err(e) => {
                // The WAL is still un-trimmed and the object id is burned;
                // re-uploading under the same id could tear a half-committed
                // object. Restarting and recovering via the WAL is the only
                // safe continuation.
                error!(error = %e, "WAL object commit failed, exiting");
                std::process::exit(1);
            }
        }
        }
        .boxed()
    }

    fn spawn_backoff_drainer(&self) {
        let me = self.me.clone();
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_millis(100));
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                let Some(this) = me.upgrade() else { break };
                this.try_drain_backoff();
            }
        });
        *self.drain_task.lock().unwrap() = Some(task);
    }

    fn try_drain_backoff(&self) {
        loop {
            let Some(request) = self.backoff.lock().unwrap().front().cloned() else {
                break;
            };
            if self.append0(request, true) {
                break;
            }
            self.backoff.lock().unwrap().pop_front();
        }
    }

    /// At most one backoff warning per second.
    fn log_backoff(&self, reason: &str) {
        let mut last = self.last_backoff_log.lock().unwrap();
        let due = last
            .map(|at| at.elapsed() >= Duration::from_secs(1))
            .unwrap_or(true);
        if due {
            warn!(
                cache_size = self.cache.size(),
                cache_limit = self.config.wal_cache_size,
                reason,
                "append backing off"
            );
            *last = Some(Instant::now());
        }
    }
}

fn continuous_check(stream_id: u64, records: &[StreamRecordBatch]) -> Result<()> {
    let mut expected = None;
    for record in records {
        if let Some(expected) = expected {
            if record.base_offset != expected {
                return Err(Error::Discontinuous {
                    stream_id,
                    expected,
                    actual: record.base_offset,
                });
            }
        }
        expected = Some(record.last_offset());
    }
    Ok(())
}

/// Filter replayed WAL records down to what must be re-uploaded.
///
/// Drops records of safely closed streams, records below the committed end
/// offset, and anything after a per-stream gap. A recovered head above the
/// committed end offset is data loss and fails startup.
fn recover_continuous_records(
    results: Vec<(u64, StreamRecordBatch)>,
    opening: &[StreamMetadata],
) -> Result<LogCacheBlock> {
    let opening_ends: HashMap<u64, u64> = opening
        .iter()
        .map(|s| (s.stream_id, s.end_offset))
        .collect();
    let mut block = LogCacheBlock::new(0, u64::MAX, usize::MAX);
    let mut log_end = None;
    let mut next_offsets: HashMap<u64, u64> = HashMap::new();

    for (record_offset, batch) in results {
        log_end = Some(record_offset);
        let Some(&opening_end) = opening_ends.get(&batch.stream_id) else {
            // Stream already safely closed; its records are committed.
            continue;
        };
        if batch.base_offset < opening_end {
            continue;
        }
        if let Some(&expected) = next_offsets.get(&batch.stream_id) {
            if expected != batch.base_offset {
                error!(
                    stream_id = batch.stream_id,
                    expected,
                    actual = batch.base_offset,
                    "unexpected WAL record after gap, dropping"
                );
                continue;
            }
        }
        next_offsets.insert(batch.stream_id, batch.last_offset());
        block.put(batch);
    }
    if let Some(end) = log_end {
        block.set_confirm_offset(end);
    }

    for (&stream_id, records) in block.records() {
        if let Some(first) = records.first() {
            let expected_end = opening_ends.get(&stream_id).copied().unwrap_or(first.base_offset);
            if first.base_offset > expected_end {
                return Err(Error::DataLoss {
                    stream_id,
                    expected_end,
                    recovered_start: first.base_offset,
                });
            }
        }
    }
    Ok(block)
}
