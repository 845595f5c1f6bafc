//! Block WAL Service
//!
//! The public facade of the WAL. Owns the block channel, the header store
//! and the sliding window, and implements crash recovery.
//!
//! ## Lifecycle
//!
//! 1. `open` validates the configuration and opens the device
//! 2. `start` recovers the header (and, after an ungraceful shutdown, scans
//!    the ring to rebuild the window), then starts the writer pool and the
//!    periodic header flusher
//! 3. `recover` hands back an iterator over every untrimmed record
//! 4. `reset` clears the recovered region; must be called exactly once after
//!    recovery, before the first `append`
//! 5. `append` / `trim` serve steady-state traffic
//! 6. `shutdown_gracefully` drains the window and marks the header clean
//!
//! ## Crash Recovery
//!
//! After an ungraceful shutdown the window pointers in the header are stale
//! by up to one flush interval. The window was bounded by `max_length`, but
//! that maximum itself lives in the header, so the recovery scan walks the
//! whole ring starting at the last known window start: a safe
//! over-approximation that tolerates a grown-then-shrunk window. Frames from
//! an earlier lap of the ring fail the body-offset check and are skipped as
//! stale; frames with a bad CRC are skipped as corruption. Either way the
//! scan jumps to the next block boundary and keeps going.

use crate::channel::BlockChannel;
use crate::config::WalConfig;
use crate::error::{ReadRecordError, Result, WalError};
use crate::header::{self, HeaderStore, ShutdownType, WalHeader};
use crate::layout::{align_down, align_up, header_reserve, record_position};
use crate::record::{decode_header, encode_record, verify_body, RECORD_HEADER_SIZE};
use crate::recovery::RecoverIterator;
use crate::window::SlidingWindowService;
use bytes::Bytes;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

/// Handle returned by [`BlockWal::append`].
///
/// `record_offset` is assigned synchronously; `done` resolves with the WAL
/// confirm offset once the record's block is durable.
pub struct AppendResult {
    pub record_offset: u64,
    pub done: oneshot::Receiver<Result<u64>>,
}

impl AppendResult {
    /// Wait for durability.
    pub async fn wait(self) -> Result<u64> {
        self.done.await.map_err(|_| WalError::Aborted)?
    }
}

pub struct BlockWal {
    config: WalConfig,
    channel: Arc<BlockChannel>,
    header: Arc<HeaderStore>,
    window: Arc<SlidingWindowService>,
    ready: AtomicBool,
    flusher: Mutex<Option<JoinHandle<()>>>,
}

impl BlockWal {
    /// Validate the configuration and open the device.
    pub fn open(mut config: WalConfig) -> Result<Self> {
        config.capacity = align_down(config.capacity, config.block_size);
        let reserve = header_reserve(config.block_size);
        if config.capacity <= reserve {
            return Err(WalError::InvalidConfig(format!(
                "capacity {} leaves no record section after {} reserved header bytes",
                config.capacity, reserve
            )));
        }
        let record_section = config.capacity - reserve;
        config.window_initial = config.window_initial.min(record_section);
        config.window_upper_limit = config.window_upper_limit.min(record_section);

        let channel = Arc::new(BlockChannel::open(
            &config.device_path,
            config.capacity,
            config.block_size,
            config.direct_io,
        )?);
        let header = Arc::new(HeaderStore::new(
            Arc::clone(&channel),
            WalHeader::new(config.capacity, config.window_initial),
        ));
        let window = Arc::new(SlidingWindowService::new(
            Arc::clone(&channel),
            Arc::clone(&header),
            config.io_threads,
            config.window_upper_limit,
            config.window_scale_unit,
            config.block_soft_limit,
        ));
        Ok(Self {
            config,
            channel,
            header,
            window,
            ready: AtomicBool::new(false),
            flusher: Mutex::new(None),
        })
    }

    /// Recover the header, start the writer pool and the header flusher.
    pub async fn start(&self) -> Result<()> {
        let channel = Arc::clone(&self.channel);
        let config = self.config.clone();
        let recovered =
            tokio::task::spawn_blocking(move || recover_or_init(&channel, &config))
                .await
                .map_err(|_| WalError::Aborted)??;

        if recovered.capacity != self.config.capacity {
            return Err(WalError::CorruptHeader(format!(
                "capacity is immutable after first start: header says {}, configured {}",
                recovered.capacity, self.config.capacity
            )));
        }

        self.header.install(recovered.clone());
        let header = Arc::clone(&self.header);
        tokio::task::spawn_blocking(move || header.flush(None, ShutdownType::Ungraceful))
            .await
            .map_err(|_| WalError::Aborted)??;

        Arc::clone(&self.window).start(
            recovered.window_start_offset,
            recovered.window_next_write_offset,
            recovered.window_max_length,
        );
        self.spawn_header_flusher();
        self.ready.store(true, Ordering::Release);

        info!(
            capacity = self.config.capacity,
            trim_offset = recovered.trim_offset,
            window_start = recovered.window_start_offset,
            "block WAL service started"
        );
        Ok(())
    }

    /// Append a framed record body to the ring.
    ///
    /// Never blocks: the record is staged under a short critical section and
    /// written by the I/O pool. Fails synchronously with `OverCapacity` when
    /// the ring has no room until the caller trims; the body is returned to
    /// the caller untouched in that case.
    pub fn append(&self, body: Bytes, body_crc: u32) -> Result<AppendResult> {
        self.check_ready()?;
        if body.is_empty() {
            return Err(WalError::EmptyBody);
        }
        if body.len() > self.config.max_record_body_size {
            return Err(WalError::BodyTooLarge {
                size: body.len(),
                limit: self.config.max_record_body_size,
            });
        }
        let record_size = (RECORD_HEADER_SIZE + body.len()) as u64;
        let crc = if body_crc == 0 {
            crc32fast::hash(&body)
        } else {
            body_crc
        };
        let (record_offset, done) = self
            .window
            .append(record_size, |offset| encode_record(&body, crc, offset))?;
        Ok(AppendResult {
            record_offset,
            done,
        })
    }

    /// Iterate every untrimmed record, tolerating ring wrap and corruption.
    pub fn recover(&self) -> Result<RecoverIterator<'_>> {
        self.check_ready()?;
        let trim = self.header.trim_offset();
        let start = align_down(trim, self.config.block_size);
        // The record at the trim boundary itself was already consumed.
        let skip = if trim == 0 { None } else { Some(trim) };
        Ok(RecoverIterator::new(self, start, skip))
    }

    /// Discard everything recovered and open a fresh window.
    ///
    /// The window restarts one block past the previous next-write offset:
    /// the deliberate gap keeps a half-flushed record at the old boundary
    /// from ever decoding as current data. Must be called exactly once after
    /// recovery completes, before the first `append`.
    pub async fn reset(&self) -> Result<()> {
        self.check_ready()?;
        let previous = self.window.next_write_offset();
        self.window.reset_to(previous + self.config.block_size);
        info!(offset = previous, "sliding window reset, trimming WAL");
        self.trim(previous).await
    }

    /// Advance the trim offset and flush the header.
    ///
    /// Trimming at or above the window start would discard records that are
    /// not durable yet; that is a caller bug and fails without mutating.
    pub async fn trim(&self, offset: u64) -> Result<()> {
        self.check_ready()?;
        let window_start = self.window.start_offset();
        if offset >= window_start {
            return Err(WalError::TrimBeyondWindow {
                offset,
                window_start,
            });
        }
        self.header.update_trim(offset);
        let header = Arc::clone(&self.header);
        let snapshot = self.window.snapshot();
        tokio::task::spawn_blocking(move || {
            header.flush(Some(snapshot), ShutdownType::Ungraceful)
        })
        .await
        .map_err(|_| WalError::Aborted)??;
        Ok(())
    }

    /// Drain the window and mark the header clean.
    ///
    /// Returns whether the window drained within the configured timeout; on
    /// expiry the shutdown downgrades to ungraceful.
    pub async fn shutdown_gracefully(&self) -> bool {
        self.ready.store(false, Ordering::Release);
        if let Some(task) = self.flusher.lock().unwrap().take() {
            task.abort();
        }
        let timeout = Duration::from_millis(self.config.shutdown_timeout_ms);
        let drained = self.window.shutdown(timeout).await;
        let shutdown_type = if drained {
            ShutdownType::Graceful
        } else {
            ShutdownType::Ungraceful
        };
        let header = Arc::clone(&self.header);
        let snapshot = self.window.snapshot();
        match tokio::task::spawn_blocking(move || header.flush(Some(snapshot), shutdown_type)).await
        {
            Ok(Ok(())) => {}
            Ok(Err(e)) => error!(error = %e, "failed to flush WAL header during shutdown"),
            Err(e) => error!(error = %e, "WAL header flush task failed during shutdown"),
        }
        info!(drained, "block WAL service shut down");
        drained
    }

    pub fn start_offset(&self) -> u64 {
        self.window.start_offset()
    }

    pub fn next_write_offset(&self) -> u64 {
        self.window.next_write_offset()
    }

    pub fn trim_offset(&self) -> u64 {
        self.header.trim_offset()
    }

    pub fn block_size(&self) -> u64 {
        self.config.block_size
    }

    pub(crate) fn channel(&self) -> &BlockChannel {
        &self.channel
    }

    pub(crate) fn record_section_capacity(&self) -> u64 {
        self.config.capacity - header_reserve(self.config.block_size)
    }

    pub(crate) fn max_body_length(&self) -> u32 {
        self.config.max_record_body_size.min(u32::MAX as usize) as u32
    }

    fn check_ready(&self) -> Result<()> {
        if !self.ready.load(Ordering::Acquire) {
            return Err(WalError::NotReady);
        }
        Ok(())
    }

    fn spawn_header_flusher(&self) {
        let header = Arc::clone(&self.header);
        let window = Arc::clone(&self.window);
        let interval = Duration::from_secs(self.config.header_flush_interval_s.max(1));
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let header = Arc::clone(&header);
                let snapshot = window.snapshot();
                match tokio::task::spawn_blocking(move || {
                    header.flush(Some(snapshot), ShutdownType::Ungraceful)
                })
                .await
                {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => warn!(error = %e, "periodic WAL header flush failed"),
                    Err(_) => break,
                }
            }
        });
        *self.flusher.lock().unwrap() = Some(task);
    }
}

impl Drop for BlockWal {
    fn drop(&mut self) {
        if let Ok(mut flusher) = self.flusher.lock() {
            if let Some(task) = flusher.take() {
                task.abort();
            }
        }
    }
}

fn recover_or_init(channel: &BlockChannel, config: &WalConfig) -> Result<WalHeader> {
    match header::recover_header(channel) {
        Some(recovered) if recovered.shutdown_type == ShutdownType::Graceful => {
            info!(
                trim_offset = recovered.trim_offset,
                window_start = recovered.window_start_offset,
                "recovered WAL header from graceful shutdown"
            );
            Ok(recovered)
        }
        Some(recovered) => {
            let max_body = config.max_record_body_size.min(u32::MAX as usize) as u32;
            Ok(recover_entire_wal(channel, recovered, max_body))
        }
        None => {
            info!("no valid WAL header found, starting empty");
            Ok(WalHeader::new(config.capacity, config.window_initial))
        }
    }
}

/// Rebuild the window pointers after an ungraceful shutdown by scanning one
/// full lap of the ring from the last known window start.
fn recover_entire_wal(channel: &BlockChannel, mut header: WalHeader, max_body: u32) -> WalHeader {
    let block_size = channel.block_size();
    let cap = header.record_section_capacity(block_size);
    let mut offset = align_down(header.window_start_offset, block_size);
    let mut remaining = cap as i64;
    let mut next = offset;
    let mut skipped = 0u64;

    info!(
        scan_start = offset,
        scan_bytes = cap,
        "recovering WAL window from ungraceful shutdown"
    );
    while remaining > 0 {
        match read_record(channel, cap, offset, max_body) {
            Ok(body) => next = offset + (RECORD_HEADER_SIZE + body.len()) as u64,
            Err(e) => {
                next = e.jump_to;
                skipped += 1;
            }
        }
        remaining -= (next - offset) as i64;
        offset = next;
    }

    let rebuilt = align_up(next, block_size);
    header.window_start_offset = rebuilt;
    header.window_next_write_offset = rebuilt;
    info!(window = rebuilt, skipped, "WAL window rebuilt");
    header
}

/// Read one record frame at a logical offset, verifying the header, the
/// slot binding and both CRCs.
///
/// On any failure the error carries the next block boundary to resume from.
pub(crate) fn read_record(
    channel: &BlockChannel,
    record_section_capacity: u64,
    offset: u64,
    max_body_length: u32,
) -> std::result::Result<Bytes, ReadRecordError> {
    let block_size = channel.block_size();
    let next_block = align_down(offset, block_size) + block_size;

    let header_position = record_position(offset, record_section_capacity, block_size);
    let header_bytes = read_exact_at(channel, header_position, RECORD_HEADER_SIZE).map_err(
        |e| ReadRecordError {
            jump_to: next_block,
            reason: format!("failed to read record header at {}: {}", offset, e),
        },
    )?;
    let record_header =
        decode_header(&header_bytes, offset, max_body_length).map_err(|e| ReadRecordError {
            jump_to: next_block,
            reason: format!("invalid record header at {}: {}", offset, e),
        })?;

    let body_length = record_header.body_length as usize;
    let body_end = offset + (RECORD_HEADER_SIZE + body_length) as u64;
    let jump_past_body = align_down(body_end, block_size) + block_size;
    let body_position = record_position(
        record_header.body_offset,
        record_section_capacity,
        block_size,
    );
    let body = read_exact_at(channel, body_position, body_length).map_err(|e| ReadRecordError {
        jump_to: jump_past_body,
        reason: format!("failed to read record body at {}: {}", offset, e),
    })?;
    verify_body(&record_header, &body).map_err(|e| ReadRecordError {
        jump_to: jump_past_body,
        reason: format!("invalid record body at {}: {}", offset, e),
    })?;
    Ok(Bytes::from(body))
}

/// Read `len` bytes at an arbitrary device position through aligned reads.
fn read_exact_at(channel: &BlockChannel, position: u64, len: usize) -> Result<Vec<u8>> {
    let block_size = channel.block_size();
    let aligned_start = align_down(position, block_size);
    let aligned_end = align_up(position + len as u64, block_size);
    let mut buf = vec![0u8; (aligned_end - aligned_start) as usize];
    let read = channel.read(&mut buf, aligned_start)?;
    let skip = (position - aligned_start) as usize;
    if read < skip + len {
        return Err(WalError::ShortWrite {
            position: aligned_start + read as u64,
        });
    }
    Ok(buf[skip..skip + len].to_vec())
}
