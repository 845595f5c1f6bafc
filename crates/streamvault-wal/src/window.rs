//! Sliding Window Service
//!
//! The in-memory committer of the WAL. It assigns logical offsets, coalesces
//! records into write blocks, dispatches sealed blocks to a bounded pool of
//! block-device writers, and tracks which prefix of the log is durable.
//!
//! ## Write Flow
//!
//! ```text
//! append(frame)
//!     ↓ short critical section
//! current Block        ← staged frames, offsets assigned
//!     ↓ sealed (full, soft limit, or pool idle)
//! writer pool          ← pads to the block boundary, writes, fsyncs
//!     ↓ out-of-order completion
//! pending map          ← window start advances over the finished prefix
//! ```
//!
//! ## Batching vs Latency
//!
//! The current block is rolled onto the device as soon as the writer pool is
//! idle, so a lone record does not wait for the block to fill. Under load the
//! pool stays busy and records batch into larger blocks, sealed by the hard
//! cap (ring seam or window end) or the soft limit.
//!
//! ## Window Invariants
//!
//! - `start_offset` advances only over the contiguous prefix of finished
//!   blocks; completion order between writers is not the logical order
//! - `next_write_offset - start_offset` never exceeds `max_length`; growing
//!   `max_length` flushes the header first so the recovery scan bound on
//!   disk is never smaller than the live window
//! - a record never crosses the ring-wrap seam: the committer pads
//!   `next_write_offset` past the seam instead

use crate::block::{Block, Completion};
use crate::channel::BlockChannel;
use crate::error::{Result, WalError};
use crate::header::{HeaderStore, ShutdownType, WindowSnapshot};
use crate::layout::{align_up, header_reserve, record_position};
use bytes::Bytes;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, oneshot, OwnedSemaphorePermit, Semaphore};
use tracing::{debug, error, trace};

const STATE_UNINITIALIZED: u8 = 0;
const STATE_RUNNING: u8 = 1;
const STATE_SHUTTING_DOWN: u8 = 2;
const STATE_CLOSED: u8 = 3;

struct WindowCoreData {
    start_offset: AtomicU64,
    next_write_offset: AtomicU64,
    max_length: AtomicU64,
}

struct WindowInner {
    current: Block,
}

pub(crate) struct SlidingWindowService {
    channel: Arc<BlockChannel>,
    header: Arc<HeaderStore>,
    record_section_capacity: u64,
    block_size: u64,
    upper_limit: u64,
    scale_unit: u64,
    block_soft_limit: u64,
    core: WindowCoreData,
    state: AtomicU8,
    inner: Mutex<WindowInner>,
    /// Sealed blocks by start offset; `Some(end)` once written and fsynced.
    pending: Mutex<BTreeMap<u64, Option<u64>>>,
    inflight: AtomicU64,
    io_permits: Arc<Semaphore>,
    write_tx: mpsc::UnboundedSender<Block>,
    write_rx: Mutex<Option<mpsc::UnboundedReceiver<Block>>>,
}

impl SlidingWindowService {
    pub fn new(
        channel: Arc<BlockChannel>,
        header: Arc<HeaderStore>,
        io_threads: usize,
        upper_limit: u64,
        scale_unit: u64,
        block_soft_limit: u64,
    ) -> Self {
        let block_size = channel.block_size();
        let record_section_capacity = channel.capacity() - header_reserve(block_size);
        let (write_tx, write_rx) = mpsc::unbounded_channel();
        Self {
            channel,
            header,
            record_section_capacity,
            block_size,
            upper_limit,
            scale_unit,
            block_soft_limit,
            core: WindowCoreData {
                start_offset: AtomicU64::new(0),
                next_write_offset: AtomicU64::new(0),
                max_length: AtomicU64::new(0),
            },
            state: AtomicU8::new(STATE_UNINITIALIZED),
            inner: Mutex::new(WindowInner {
                current: Block::new(0, 0, block_soft_limit),
            }),
            pending: Mutex::new(BTreeMap::new()),
            inflight: AtomicU64::new(0),
            io_permits: Arc::new(Semaphore::new(io_threads)),
            write_tx,
            write_rx: Mutex::new(Some(write_rx)),
        }
    }

    /// Install the recovered window and spawn the writer pool.
    pub fn start(self: Arc<Self>, start_offset: u64, next_write_offset: u64, max_length: u64) {
        self.core.start_offset.store(start_offset, Ordering::Release);
        self.core
            .next_write_offset
            .store(next_write_offset, Ordering::Release);
        self.core.max_length.store(max_length, Ordering::Release);
        {
            let mut inner = self.inner.lock().unwrap();
            inner.current = self.follow_block(next_write_offset);
        }
        let rx = self.write_rx.lock().unwrap().take();
        self.state.store(STATE_RUNNING, Ordering::Release);

        if let Some(mut rx) = rx {
            let this = Arc::clone(&self);
            tokio::spawn(async move {
                while let Some(block) = rx.recv().await {
                    let permit = match Arc::clone(&this.io_permits).acquire_owned().await {
                        Ok(permit) => permit,
                        Err(_) => break,
                    };
                    let worker = Arc::clone(&this);
                    tokio::spawn(async move {
                        worker.write_block(block, permit).await;
                    });
                }
            });
        }
    }

    /// Stage a record, sealing the current block if it cannot take it.
    ///
    /// `frame` receives the record's assigned offset and returns the framed
    /// bytes. The returned receiver resolves with the WAL confirm offset once
    /// the record's block is durable.
    pub fn append<F>(
        &self,
        record_size: u64,
        frame: F,
    ) -> Result<(u64, oneshot::Receiver<Result<u64>>)>
    where
        F: FnOnce(u64) -> Bytes,
    {
        if self.state.load(Ordering::Acquire) != STATE_RUNNING {
            return Err(WalError::NotReady);
        }
        let (tx, rx) = oneshot::channel();
        let mut sealed = None;
        let offset = {
            let mut inner = self.inner.lock().unwrap();
            if !inner.current.has_room(record_size) {
                let next = self.checked_block(inner.current.end_offset(), record_size)?;
                sealed = Some(std::mem::replace(&mut inner.current, next));
            }
            let offset = inner.current.next_offset();
            inner.current.add(frame(offset), tx);
            self.core
                .next_write_offset
                .store(inner.current.end_offset(), Ordering::Release);
            offset
        };
        if let Some(block) = sealed {
            self.submit(block);
        }
        self.try_write_current();
        Ok((offset, rx))
    }

    /// Build the successor block for a record of `record_size` bytes,
    /// enforcing the seam, ring-capacity and window invariants.
    fn checked_block(&self, prev_end: u64, record_size: u64) -> Result<Block> {
        let cap = self.record_section_capacity;
        let mut start = align_up(prev_end, self.block_size);

        // Pad past the seam rather than let a record straddle it.
        let to_seam = cap - start % cap;
        if record_size > to_seam {
            start += to_seam;
        }

        // The live range must fit the ring. Only a trim offset that reached
        // the device counts: until the header is flushed, the trimmed region
        // must still be recoverable.
        let flushed_trim = self.header.flushed_trim_offset();
        if start + record_size - flushed_trim > cap {
            return Err(WalError::OverCapacity {
                needed: record_size,
                available: cap.saturating_sub(start - flushed_trim),
            });
        }

        let window_start = self.core.start_offset.load(Ordering::Acquire);
        let needed = start + record_size - window_start;
        let mut max = self.core.max_length.load(Ordering::Acquire);
        if needed > max {
            let grown = needed.max(max + self.scale_unit).min(self.upper_limit);
            if grown < needed {
                return Err(WalError::OverCapacity {
                    needed: record_size,
                    available: (window_start + max).saturating_sub(start),
                });
            }
            // Persist the larger window before using it: the on-disk scan
            // bound must never be smaller than the live window.
            self.header.flush(
                Some(WindowSnapshot {
                    start_offset: window_start,
                    next_write_offset: self.core.next_write_offset.load(Ordering::Acquire),
                    max_length: grown,
                }),
                ShutdownType::Ungraceful,
            )?;
            self.core.max_length.store(grown, Ordering::Release);
            max = grown;
            debug!(max_length = grown, "sliding window grown");
        }

        let window_end = window_start + max;
        let ring_end = flushed_trim + cap;
        let to_seam = cap - start % cap;
        let limit = to_seam.min(window_end - start).min(ring_end - start);
        Ok(Block::new(start, limit, self.block_soft_limit))
    }

    /// Build a successor block bounded by the seam, the window and the ring,
    /// but without growing anything; a record that does not fit its limit
    /// goes through `checked_block` on the append path.
    fn follow_block(&self, prev_end: u64) -> Block {
        let cap = self.record_section_capacity;
        let start = align_up(prev_end, self.block_size);
        let to_seam = cap - start % cap;
        let window_end = self.core.start_offset.load(Ordering::Acquire)
            + self.core.max_length.load(Ordering::Acquire);
        let ring_end = self.header.flushed_trim_offset() + cap;
        let limit = to_seam
            .min(window_end.saturating_sub(start))
            .min(ring_end.saturating_sub(start));
        Block::new(start, limit, self.block_soft_limit)
    }

    fn submit(&self, block: Block) {
        if block.is_empty() {
            return;
        }
        let start = block.start_offset();
        self.inflight.fetch_add(1, Ordering::AcqRel);
        self.pending.lock().unwrap().insert(start, None);
        if self.write_tx.send(block).is_err() {
            self.inflight.fetch_sub(1, Ordering::AcqRel);
            self.pending.lock().unwrap().remove(&start);
        }
    }

    /// Roll the current block onto the device if the writer pool is idle.
    pub fn try_write_current(&self) {
        let state = self.state.load(Ordering::Acquire);
        if state != STATE_RUNNING && state != STATE_SHUTTING_DOWN {
            return;
        }
        if self.inflight.load(Ordering::Acquire) > 0 {
            return;
        }
        let sealed = {
            let mut inner = self.inner.lock().unwrap();
            if inner.current.is_empty() {
                return;
            }
            let next = self.follow_block(inner.current.end_offset());
            std::mem::replace(&mut inner.current, next)
        };
        self.submit(sealed);
    }

    async fn write_block(self: Arc<Self>, block: Block, permit: OwnedSemaphorePermit) {
        let (start, size, frames, completions) = block.into_parts();
        let channel = Arc::clone(&self.channel);
        let block_size = self.block_size;
        let cap = self.record_section_capacity;
        let write = tokio::task::spawn_blocking(move || -> Result<()> {
            let padded = align_up(size, block_size) as usize;
            let mut buf = Vec::with_capacity(padded);
            for frame in &frames {
                buf.extend_from_slice(frame);
            }
            buf.resize(padded, 0);
            let position = record_position(start, cap, block_size);
            channel.write(&buf, position)?;
            channel.flush()
        })
        .await;
        drop(permit);

        match write {
            Ok(Ok(())) => self.finish_block(start, start + size, completions),
            Ok(Err(e)) => {
                error!(start_offset = start, error = %e, "WAL block write failed");
                self.fail_block(completions, &e);
            }
            Err(e) => {
                error!(start_offset = start, error = %e, "WAL block writer panicked");
                self.fail_block(completions, &WalError::Aborted);
            }
        }
        self.try_write_current();
    }

    fn finish_block(&self, start: u64, end: u64, completions: Vec<Completion>) {
        self.inflight.fetch_sub(1, Ordering::AcqRel);
        let confirm = {
            let mut pending = self.pending.lock().unwrap();
            if let Some(entry) = pending.get_mut(&start) {
                *entry = Some(end);
            }
            let mut advanced = self.core.start_offset.load(Ordering::Acquire);
            loop {
                let head = match pending.first_key_value() {
                    Some((&offset, &Some(block_end))) => Some((offset, block_end)),
                    _ => None,
                };
                match head {
                    Some((offset, block_end)) => {
                        pending.remove(&offset);
                        advanced = block_end;
                    }
                    None => break,
                }
            }
            self.core.start_offset.store(advanced, Ordering::Release);
            advanced
        };
        for tx in completions {
            let _ = tx.send(Ok(confirm));
        }
        trace!(start, end, confirm, "WAL block flushed");
    }

    fn fail_block(&self, completions: Vec<Completion>, e: &WalError) {
        // The pending entry stays unfinished so the window never advances
        // past bytes that did not reach the device.
        self.inflight.fetch_sub(1, Ordering::AcqRel);
        let message = e.to_string();
        for tx in completions {
            let _ = tx.send(Err(WalError::WriteFailed(message.clone())));
        }
    }

    /// Drain the window, waiting up to `timeout` for in-flight writes.
    pub async fn shutdown(&self, timeout: Duration) -> bool {
        self.state.store(STATE_SHUTTING_DOWN, Ordering::Release);
        let deadline = Instant::now() + timeout;
        let drained = loop {
            self.try_write_current();
            let idle = self.inflight.load(Ordering::Acquire) == 0
                && self.pending.lock().unwrap().is_empty()
                && self.inner.lock().unwrap().current.is_empty();
            if idle {
                break true;
            }
            if Instant::now() >= deadline {
                break false;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        };
        self.state.store(STATE_CLOSED, Ordering::Release);
        drained
    }

    /// Move the window to `offset`, dropping any staged records.
    ///
    /// Only valid while the window is empty; called once after recovery.
    pub fn reset_to(&self, offset: u64) {
        let mut inner = self.inner.lock().unwrap();
        self.core.start_offset.store(offset, Ordering::Release);
        self.core.next_write_offset.store(offset, Ordering::Release);
        inner.current = self.follow_block(offset);
    }

    pub fn snapshot(&self) -> WindowSnapshot {
        WindowSnapshot {
            start_offset: self.start_offset(),
            next_write_offset: self.next_write_offset(),
            max_length: self.max_length(),
        }
    }

    pub fn start_offset(&self) -> u64 {
        self.core.start_offset.load(Ordering::Acquire)
    }

    pub fn next_write_offset(&self) -> u64 {
        self.core.next_write_offset.load(Ordering::Acquire)
    }

    pub fn max_length(&self) -> u64 {
        self.core.max_length.load(Ordering::Acquire)
    }
}
