//! WAL Header
//!
//! The on-disk superblock of the WAL. Two redundant copies occupy the first
//! two device blocks and are flushed round-robin, so a torn header write can
//! never destroy both; recovery keeps the survivor with the greatest
//! `last_write_ts`.
//!
//! ## Layout
//!
//! All integers are big-endian:
//!
//! ```text
//! ┌───────┬──────────┬─────────────┬───────────────┬────────────┬──────────────┬────────────┬───────────────┬───────┐
//! │ Magic │ Capacity │ Trim Offset │ Last Write TS │ Next Write │ Window Start │ Window Max │ Shutdown Type │ CRC32 │
//! │ (4B)  │ (8B)     │ (8B)        │ (8B)          │ (8B)       │ (8B)         │ (8B)       │ (4B)          │ (4B)  │
//! └───────┴──────────┴─────────────┴───────────────┴────────────┴──────────────┴────────────┴───────────────┴───────┘
//! ```
//!
//! The rest of the header block is zero and not covered by the CRC.
//!
//! `last_write_ts` comes from the system clock in nanoseconds, bumped to be
//! strictly greater than the previously flushed value so alternating slot
//! writes within one process always order correctly.

use crate::channel::BlockChannel;
use crate::error::Result;
use crate::layout::{header_reserve, WAL_HEADER_SLOTS};
use bytes::{Buf, BufMut};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{SystemTime, UNIX_EPOCH};
use thiserror::Error;
use tracing::debug;

pub const WAL_HEADER_MAGIC: u32 = 0x1234_5678;
pub const WAL_HEADER_SIZE: usize = 4 + 8 + 8 + 8 + 8 + 8 + 8 + 4 + 4;

/// How the previous process left the WAL.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownType {
    Graceful,
    Ungraceful,
}

impl ShutdownType {
    fn code(self) -> u32 {
        match self {
            ShutdownType::Graceful => 0,
            ShutdownType::Ungraceful => 1,
        }
    }

    fn from_code(code: u32) -> Option<Self> {
        match code {
            0 => Some(ShutdownType::Graceful),
            1 => Some(ShutdownType::Ungraceful),
            _ => None,
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum HeaderDecodeError {
    #[error("header magic mismatch: found 0x{0:08x}")]
    Magic(u32),

    #[error("header CRC mismatch: stored {stored}, computed {computed}")]
    Crc { stored: u32, computed: u32 },

    #[error("header truncated: {0} bytes")]
    Truncated(usize),

    #[error("unknown shutdown type code {0}")]
    ShutdownType(u32),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WalHeader {
    /// Device capacity; immutable after the first start
    pub capacity: u64,

    /// Smallest logical offset still retained; monotonic
    pub trim_offset: u64,

    /// Nanosecond timestamp of the last flush; latest-wins across slots
    pub last_write_ts: u64,

    /// Offset the next record will be written at
    pub window_next_write_offset: u64,

    /// Start of the in-flight window; everything below is durable
    pub window_start_offset: u64,

    /// Current maximum window length; bounds the recovery scan
    pub window_max_length: u64,

    pub shutdown_type: ShutdownType,
}

impl WalHeader {
    pub fn new(capacity: u64, window_initial: u64) -> Self {
        Self {
            capacity,
            trim_offset: 0,
            last_write_ts: 0,
            window_next_write_offset: 0,
            window_start_offset: 0,
            window_max_length: window_initial,
            shutdown_type: ShutdownType::Ungraceful,
        }
    }

    /// Bytes of the device available to records.
    pub fn record_section_capacity(&self, block_size: u64) -> u64 {
        self.capacity - header_reserve(block_size)
    }

    pub fn encode(&self) -> [u8; WAL_HEADER_SIZE] {
        let mut buf = [0u8; WAL_HEADER_SIZE];
        {
            let mut cursor = &mut buf[..];
            cursor.put_u32(WAL_HEADER_MAGIC);
            cursor.put_u64(self.capacity);
            cursor.put_u64(self.trim_offset);
            cursor.put_u64(self.last_write_ts);
            cursor.put_u64(self.window_next_write_offset);
            cursor.put_u64(self.window_start_offset);
            cursor.put_u64(self.window_max_length);
            cursor.put_u32(self.shutdown_type.code());
        }
        let crc = crc32fast::hash(&buf[..WAL_HEADER_SIZE - 4]);
        buf[WAL_HEADER_SIZE - 4..].copy_from_slice(&crc.to_be_bytes());
        buf
    }

    pub fn decode(buf: &[u8]) -> std::result::Result<Self, HeaderDecodeError> {
        if buf.len() < WAL_HEADER_SIZE {
            return Err(HeaderDecodeError::Truncated(buf.len()));
        }
        let mut cursor = &buf[..WAL_HEADER_SIZE];
        let magic = cursor.get_u32();
        if magic != WAL_HEADER_MAGIC {
            return Err(HeaderDecodeError::Magic(magic));
        }
        let capacity = cursor.get_u64();
        let trim_offset = cursor.get_u64();
        let last_write_ts = cursor.get_u64();
        let window_next_write_offset = cursor.get_u64();
        let window_start_offset = cursor.get_u64();
        let window_max_length = cursor.get_u64();
        let shutdown_code = cursor.get_u32();
        let stored_crc = cursor.get_u32();

        let computed = crc32fast::hash(&buf[..WAL_HEADER_SIZE - 4]);
        if stored_crc != computed {
            return Err(HeaderDecodeError::Crc {
                stored: stored_crc,
                computed,
            });
        }
        let shutdown_type = ShutdownType::from_code(shutdown_code)
            .ok_or(HeaderDecodeError::ShutdownType(shutdown_code))?;

        Ok(Self {
            capacity,
            trim_offset,
            last_write_ts,
            window_next_write_offset,
            window_start_offset,
            window_max_length,
            shutdown_type,
        })
    }
}

/// Snapshot of the sliding window handed to a header flush.
#[derive(Debug, Clone, Copy)]
pub(crate) struct WindowSnapshot {
    pub start_offset: u64,
    pub next_write_offset: u64,
    pub max_length: u64,
}

/// Owns the in-memory header and serializes flushes to the device.
pub(crate) struct HeaderStore {
    channel: Arc<BlockChannel>,
    header: Mutex<WalHeader>,
    /// Trim offset of the last header that actually reached the device;
    /// the ring-full check must use this, not the in-memory value.
    flushed_trim_offset: AtomicU64,
    round: AtomicU64,
}

impl HeaderStore {
    pub fn new(channel: Arc<BlockChannel>, header: WalHeader) -> Self {
        let flushed_trim = header.trim_offset;
        Self {
            channel,
            header: Mutex::new(header),
            flushed_trim_offset: AtomicU64::new(flushed_trim),
            round: AtomicU64::new(0),
        }
    }

    /// Replace the in-memory header with a recovered one.
    pub fn install(&self, header: WalHeader) {
        self.flushed_trim_offset
            .store(header.trim_offset, Ordering::Release);
        *self.header.lock().unwrap() = header;
    }

    pub fn snapshot(&self) -> WalHeader {
        self.header.lock().unwrap().clone()
    }

    pub fn trim_offset(&self) -> u64 {
        self.header.lock().unwrap().trim_offset
    }

    pub fn flushed_trim_offset(&self) -> u64 {
        self.flushed_trim_offset.load(Ordering::Acquire)
    }

    /// Advance the trim offset, keeping it monotonic.
    pub fn update_trim(&self, offset: u64) {
        let mut header = self.header.lock().unwrap();
        header.trim_offset = header.trim_offset.max(offset);
    }

    pub fn record_section_capacity(&self) -> u64 {
        self.header
            .lock()
            .unwrap()
            .record_section_capacity(self.channel.block_size())
    }

    /// Flush the header to the next slot in round-robin order.
    ///
    /// Synchronous device I/O; callers on the async runtime wrap this in
    /// `spawn_blocking` except on the rare window-growth path.
    pub fn flush(&self, window: Option<WindowSnapshot>, shutdown: ShutdownType) -> Result<()> {
        let block_size = self.channel.block_size();
        let (encoded, trim_offset, slot) = {
            let mut header = self.header.lock().unwrap();
            if let Some(window) = window {
                header.window_start_offset = window.start_offset;
                header.window_next_write_offset = window.next_write_offset;
                header.window_max_length = window.max_length;
            }
            header.shutdown_type = shutdown;
            let now = SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_nanos() as u64)
                .unwrap_or(0);
            header.last_write_ts = now.max(header.last_write_ts + 1);
            let slot = self.round.fetch_add(1, Ordering::Relaxed) % WAL_HEADER_SLOTS;
            (header.encode(), header.trim_offset, slot)
        };

        let mut block = vec![0u8; block_size as usize];
        block[..WAL_HEADER_SIZE].copy_from_slice(&encoded);
        self.channel.write(&block, slot * block_size)?;
        self.channel.flush()?;

        self.flushed_trim_offset.store(trim_offset, Ordering::Release);
        debug!(slot, trim_offset, "WAL header flushed");
        Ok(())
    }
}

/// Read both header slots and keep the youngest valid copy.
pub(crate) fn recover_header(channel: &BlockChannel) -> Option<WalHeader> {
    let block_size = channel.block_size();
    let mut best: Option<WalHeader> = None;
    for slot in 0..WAL_HEADER_SLOTS {
        let mut buf = vec![0u8; block_size as usize];
        let read = match channel.read(&mut buf, slot * block_size) {
            Ok(n) => n,
            Err(_) => continue,
        };
        if read < WAL_HEADER_SIZE {
            continue;
        }
        match WalHeader::decode(&buf) {
            Ok(header) => {
                let newer = best
                    .as_ref()
                    .map(|b| header.last_write_ts > b.last_write_ts)
                    .unwrap_or(true);
                if newer {
                    best = Some(header);
                }
            }
            Err(e) => debug!(slot, error = %e, "discarding WAL header slot"),
        }
    }
    best
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::NamedTempFile;

    const BLOCK: u64 = 4096;

    fn sample_header() -> WalHeader {
        WalHeader {
            capacity: 64 << 20,
            trim_offset: 12288,
            last_write_ts: 42,
            window_next_write_offset: 65536,
            window_start_offset: 16384,
            window_max_length: 1 << 20,
            shutdown_type: ShutdownType::Ungraceful,
        }
    }

    // ---------------------------------------------------------------
    // Codec
    // ---------------------------------------------------------------

    #[test]
    fn test_encode_decode_roundtrip() {
        let header = sample_header();
        let encoded = header.encode();
        assert_eq!(encoded.len(), WAL_HEADER_SIZE);
        let decoded = WalHeader::decode(&encoded).unwrap();
        assert_eq!(header, decoded);
    }

    #[test]
    fn test_decode_graceful_shutdown_type() {
        let mut header = sample_header();
        header.shutdown_type = ShutdownType::Graceful;
        let decoded = WalHeader::decode(&header.encode()).unwrap();
        assert_eq!(decoded.shutdown_type, ShutdownType::Graceful);
    }

    #[test]
    fn test_decode_bad_magic() {
        let mut encoded = sample_header().encode();
        encoded[0] ^= 0xFF;
        assert!(matches!(
            WalHeader::decode(&encoded),
            Err(HeaderDecodeError::Magic(_))
        ));
    }

    #[test]
    fn test_decode_bad_crc() {
        let mut encoded = sample_header().encode();
        // Flip a bit in the capacity field; magic stays intact.
        encoded[5] ^= 0x01;
        assert!(matches!(
            WalHeader::decode(&encoded),
            Err(HeaderDecodeError::Crc { .. })
        ));
    }

    #[test]
    fn test_decode_truncated() {
        let encoded = sample_header().encode();
        assert!(matches!(
            WalHeader::decode(&encoded[..WAL_HEADER_SIZE - 1]),
            Err(HeaderDecodeError::Truncated(_))
        ));
    }

    #[test]
    fn test_record_section_capacity() {
        let header = sample_header();
        assert_eq!(
            header.record_section_capacity(BLOCK),
            (64 << 20) - 2 * BLOCK
        );
    }

    // ---------------------------------------------------------------
    // HeaderStore flush / recover
    // ---------------------------------------------------------------

    fn store_on_temp(capacity: u64) -> (NamedTempFile, Arc<BlockChannel>, HeaderStore) {
        let file = NamedTempFile::new().unwrap();
        let channel = Arc::new(BlockChannel::open(file.path(), capacity, BLOCK, false).unwrap());
        let store = HeaderStore::new(channel.clone(), WalHeader::new(capacity, 1 << 20));
        (file, channel, store)
    }

    #[test]
    fn test_flush_alternates_slots_and_recovers_latest() {
        let (_file, channel, store) = store_on_temp(16 * BLOCK);

        store.update_trim(100);
        store.flush(None, ShutdownType::Ungraceful).unwrap(); // slot 0
        store.update_trim(200);
        store.flush(None, ShutdownType::Ungraceful).unwrap(); // slot 1

        let recovered = recover_header(&channel).unwrap();
        assert_eq!(recovered.trim_offset, 200);
    }

    #[test]
    fn test_last_write_ts_strictly_increases() {
        let (_file, channel, store) = store_on_temp(16 * BLOCK);

        store.flush(None, ShutdownType::Ungraceful).unwrap();
        let first = recover_header(&channel).unwrap().last_write_ts;
        store.flush(None, ShutdownType::Ungraceful).unwrap();
        let second = recover_header(&channel).unwrap().last_write_ts;
        assert!(second > first);
    }

    #[test]
    fn test_recover_survives_zeroed_slot_zero() {
        let (_file, channel, store) = store_on_temp(16 * BLOCK);

        store.update_trim(4096);
        store.flush(None, ShutdownType::Ungraceful).unwrap(); // slot 0
        store.flush(None, ShutdownType::Ungraceful).unwrap(); // slot 1

        // Zero the first header block.
        channel.write(&vec![0u8; BLOCK as usize], 0).unwrap();

        let recovered = recover_header(&channel).unwrap();
        assert_eq!(recovered.trim_offset, 4096);
    }

    #[test]
    fn test_recover_empty_device_yields_none() {
        let (_file, channel, _store) = store_on_temp(16 * BLOCK);
        assert!(recover_header(&channel).is_none());
    }

    #[test]
    fn test_flush_records_flushed_trim_offset() {
        let (_file, _channel, store) = store_on_temp(16 * BLOCK);

        store.update_trim(8192);
        assert_eq!(store.flushed_trim_offset(), 0);
        store.flush(None, ShutdownType::Ungraceful).unwrap();
        assert_eq!(store.flushed_trim_offset(), 8192);
    }

    #[test]
    fn test_window_snapshot_applied_on_flush() {
        let (_file, channel, store) = store_on_temp(16 * BLOCK);

        store
            .flush(
                Some(WindowSnapshot {
                    start_offset: 4096,
                    next_write_offset: 12288,
                    max_length: 2 << 20,
                }),
                ShutdownType::Graceful,
            )
            .unwrap();

        let recovered = recover_header(&channel).unwrap();
        assert_eq!(recovered.window_start_offset, 4096);
        assert_eq!(recovered.window_next_write_offset, 12288);
        assert_eq!(recovered.window_max_length, 2 << 20);
        assert_eq!(recovered.shutdown_type, ShutdownType::Graceful);
    }
}
