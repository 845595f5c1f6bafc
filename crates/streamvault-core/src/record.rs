//! Stream Record Batch
//!
//! This module defines `StreamRecordBatch` - the unit of durability in
//! StreamVault - and its binary wire codec.
//!
//! ## Structure
//!
//! Each batch carries:
//! - **stream_id**: Which stream the records belong to
//! - **epoch**: Writer epoch of the stream at append time
//! - **base_offset**: Offset of the first record in the batch
//! - **count**: Number of records (last_offset = base_offset + count)
//! - **payload**: The encoded records themselves (opaque to the core)
//!
//! ## Wire Format
//!
//! Fixed-width big-endian header followed by the payload:
//!
//! ```text
//! ┌───────┬───────────┬────────┬─────────────┬───────┬─────────────┬─────────┐
//! │ Magic │ Stream ID │ Epoch  │ Base Offset │ Count │ Payload Len │ Payload │
//! │ (1B)  │ (8B)      │ (8B)   │ (8B)        │ (4B)  │ (4B)        │ (N B)   │
//! └───────┴───────────┴────────┴─────────────┴───────┴─────────────┴─────────┘
//! ```
//!
//! The payload is immutable once the batch is handed to the durability core;
//! `Bytes` makes sharing it across the WAL, cache and upload stages zero-copy.

use crate::error::{Error, Result};
use bytes::{Buf, BufMut, Bytes, BytesMut};

/// Magic byte identifying an encoded stream record batch.
pub const BATCH_MAGIC: u8 = 0x56;

/// Size of the encoded batch header in bytes.
pub const BATCH_HEADER_SIZE: usize = 1 + 8 + 8 + 8 + 4 + 4;

/// A batch of records for a single stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamRecordBatch {
    /// Stream this batch belongs to
    pub stream_id: u64,

    /// Writer epoch of the stream
    pub epoch: u64,

    /// Offset of the first record in the batch
    pub base_offset: u64,

    /// Number of records in the batch
    pub count: u32,

    /// Encoded records (opaque payload)
    pub payload: Bytes,
}

impl StreamRecordBatch {
    pub fn new(stream_id: u64, epoch: u64, base_offset: u64, count: u32, payload: Bytes) -> Self {
        Self {
            stream_id,
            epoch,
            base_offset,
            count,
            payload,
        }
    }

    /// Exclusive end offset of the batch.
    pub fn last_offset(&self) -> u64 {
        self.base_offset + self.count as u64
    }

    /// Payload size in bytes.
    pub fn size(&self) -> usize {
        self.payload.len()
    }

    /// Total encoded size (header + payload) in bytes.
    pub fn encoded_size(&self) -> usize {
        BATCH_HEADER_SIZE + self.payload.len()
    }

    /// Encode the batch into its wire representation.
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(self.encoded_size());
        buf.put_u8(BATCH_MAGIC);
        buf.put_u64(self.stream_id);
        buf.put_u64(self.epoch);
        buf.put_u64(self.base_offset);
        buf.put_u32(self.count);
        buf.put_u32(self.payload.len() as u32);
        buf.extend_from_slice(&self.payload);
        buf.freeze()
    }

    /// Decode a batch from its wire representation.
    pub fn decode(mut buf: Bytes) -> Result<Self> {
        if buf.remaining() < BATCH_HEADER_SIZE {
            return Err(Error::TruncatedBatch {
                needed: BATCH_HEADER_SIZE,
                remaining: buf.remaining(),
            });
        }
        let magic = buf.get_u8();
        if magic != BATCH_MAGIC {
            return Err(Error::InvalidMagic(magic));
        }
        let stream_id = buf.get_u64();
        let epoch = buf.get_u64();
        let base_offset = buf.get_u64();
        let count = buf.get_u32();
        if count == 0 {
            return Err(Error::EmptyBatch);
        }
        let payload_len = buf.get_u32() as usize;
        if buf.remaining() < payload_len {
            return Err(Error::TruncatedBatch {
                needed: payload_len,
                remaining: buf.remaining(),
            });
        }
        let payload = buf.slice(..payload_len);
        Ok(Self {
            stream_id,
            epoch,
            base_offset,
            count,
            payload,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_batch() -> StreamRecordBatch {
        StreamRecordBatch::new(7, 1, 100, 10, Bytes::from(vec![0xABu8; 256]))
    }

    // ---------------------------------------------------------------
    // Construction
    // ---------------------------------------------------------------

    #[test]
    fn test_new() {
        let batch = sample_batch();
        assert_eq!(batch.stream_id, 7);
        assert_eq!(batch.epoch, 1);
        assert_eq!(batch.base_offset, 100);
        assert_eq!(batch.count, 10);
        assert_eq!(batch.payload.len(), 256);
    }

    #[test]
    fn test_last_offset_exclusive() {
        let batch = sample_batch();
        assert_eq!(batch.last_offset(), 110);
        assert!(batch.last_offset() > batch.base_offset);
    }

    #[test]
    fn test_sizes() {
        let batch = sample_batch();
        assert_eq!(batch.size(), 256);
        assert_eq!(batch.encoded_size(), BATCH_HEADER_SIZE + 256);
    }

    // ---------------------------------------------------------------
    // Codec round-trip
    // ---------------------------------------------------------------

    #[test]
    fn test_encode_decode_roundtrip() {
        let batch = sample_batch();
        let encoded = batch.encode();
        assert_eq!(encoded.len(), batch.encoded_size());
        let decoded = StreamRecordBatch::decode(encoded).unwrap();
        assert_eq!(batch, decoded);
    }

    #[test]
    fn test_roundtrip_empty_payload() {
        let batch = StreamRecordBatch::new(1, 0, 0, 1, Bytes::new());
        let decoded = StreamRecordBatch::decode(batch.encode()).unwrap();
        assert_eq!(batch, decoded);
    }

    #[test]
    fn test_roundtrip_max_values() {
        let batch = StreamRecordBatch::new(u64::MAX, u64::MAX, u64::MAX - 5, 5, Bytes::from("x"));
        let decoded = StreamRecordBatch::decode(batch.encode()).unwrap();
        assert_eq!(batch, decoded);
    }

    #[test]
    fn test_roundtrip_binary_payload() {
        let payload = Bytes::from((0..=255u8).collect::<Vec<u8>>());
        let batch = StreamRecordBatch::new(3, 2, 42, 3, payload);
        let decoded = StreamRecordBatch::decode(batch.encode()).unwrap();
        assert_eq!(batch, decoded);
    }

    // ---------------------------------------------------------------
    // Decode failures
    // ---------------------------------------------------------------

    #[test]
    fn test_decode_bad_magic() {
        let mut encoded = sample_batch().encode().to_vec();
        encoded[0] = 0x00;
        let result = StreamRecordBatch::decode(Bytes::from(encoded));
        assert!(matches!(result, Err(Error::InvalidMagic(0x00))));
    }

    #[test]
    fn test_decode_truncated_header() {
        let encoded = sample_batch().encode();
        let result = StreamRecordBatch::decode(encoded.slice(..BATCH_HEADER_SIZE - 1));
        assert!(matches!(result, Err(Error::TruncatedBatch { .. })));
    }

    #[test]
    fn test_decode_truncated_payload() {
        let encoded = sample_batch().encode();
        let result = StreamRecordBatch::decode(encoded.slice(..encoded.len() - 1));
        assert!(matches!(result, Err(Error::TruncatedBatch { .. })));
    }

    #[test]
    fn test_decode_zero_count() {
        let batch = StreamRecordBatch::new(1, 0, 0, 0, Bytes::from("p"));
        let result = StreamRecordBatch::decode(batch.encode());
        assert!(matches!(result, Err(Error::EmptyBatch)));
    }

    #[test]
    fn test_decode_ignores_trailing_bytes() {
        // A decoded batch may be followed by other data in the same buffer.
        let batch = sample_batch();
        let mut buf = batch.encode().to_vec();
        buf.extend_from_slice(b"trailing garbage");
        let decoded = StreamRecordBatch::decode(Bytes::from(buf)).unwrap();
        assert_eq!(batch, decoded);
    }
}
