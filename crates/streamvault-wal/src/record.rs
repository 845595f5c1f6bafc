//! Record Frame Codec
//!
//! Frames a record body for the ring. The header pins the frame to its slot:
//! `body_offset` must equal the record's own logical offset plus the header
//! size, so a stale frame left over from an earlier lap of the ring never
//! decodes as current data.
//!
//! ## Layout
//!
//! All integers are big-endian:
//!
//! ```text
//! ┌───────┬─────────────┬─────────────┬──────────┬────────────┬──────────┐
//! │ Magic │ Body Length │ Body Offset │ Body CRC │ Header CRC │ Body     │
//! │ (4B)  │ (4B)        │ (8B)        │ (4B)     │ (4B)       │ (N B)    │
//! └───────┴─────────────┴─────────────┴──────────┴────────────┴──────────┘
//! ```

use crate::error::DecodeError;
use bytes::{Buf, BufMut, Bytes, BytesMut};

pub const RECORD_MAGIC: u32 = 0x8765_4321;
pub const RECORD_HEADER_SIZE: usize = 4 + 4 + 8 + 4 + 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecordHeader {
    pub body_length: u32,
    pub body_offset: u64,
    pub body_crc: u32,
    pub header_crc: u32,
}

/// Frame `body` for the slot at `start_offset`.
///
/// A zero `body_crc` means "compute it for me".
pub fn encode_record(body: &Bytes, body_crc: u32, start_offset: u64) -> Bytes {
    let crc = if body_crc == 0 {
        crc32fast::hash(body)
    } else {
        body_crc
    };
    let mut buf = BytesMut::with_capacity(RECORD_HEADER_SIZE + body.len());
    buf.put_u32(RECORD_MAGIC);
    buf.put_u32(body.len() as u32);
    buf.put_u64(start_offset + RECORD_HEADER_SIZE as u64);
    buf.put_u32(crc);
    let header_crc = crc32fast::hash(&buf[..RECORD_HEADER_SIZE - 4]);
    buf.put_u32(header_crc);
    buf.extend_from_slice(body);
    buf.freeze()
}

/// Decode and verify a record header read from `record_offset`.
///
/// `max_body_length` bounds `body_length`; anything above it is treated the
/// same as a non-positive length.
pub fn decode_header(
    buf: &[u8],
    record_offset: u64,
    max_body_length: u32,
) -> std::result::Result<RecordHeader, DecodeError> {
    if buf.len() < RECORD_HEADER_SIZE {
        return Err(DecodeError::BodyLength);
    }
    let mut cursor = &buf[..RECORD_HEADER_SIZE];
    let magic = cursor.get_u32();
    if magic != RECORD_MAGIC {
        return Err(DecodeError::Magic);
    }
    let body_length = cursor.get_u32();
    let body_offset = cursor.get_u64();
    let body_crc = cursor.get_u32();
    let header_crc = cursor.get_u32();

    let computed = crc32fast::hash(&buf[..RECORD_HEADER_SIZE - 4]);
    if header_crc != computed {
        return Err(DecodeError::HeaderCrc);
    }
    if body_length == 0 || body_length > max_body_length {
        return Err(DecodeError::BodyLength);
    }
    if body_offset != record_offset + RECORD_HEADER_SIZE as u64 {
        // A valid frame from an earlier lap of the ring, not this slot's.
        return Err(DecodeError::OffsetMismatch);
    }
    Ok(RecordHeader {
        body_length,
        body_offset,
        body_crc,
        header_crc,
    })
}

/// Verify a record body against its decoded header.
pub fn verify_body(header: &RecordHeader, body: &[u8]) -> std::result::Result<(), DecodeError> {
    if crc32fast::hash(body) != header.body_crc {
        return Err(DecodeError::BodyCrc);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::{Rng, RngCore};

    #[test]
    fn test_roundtrip() {
        let body = Bytes::from_static(b"the quick brown fox");
        let frame = encode_record(&body, 0, 4096);

        assert_eq!(frame.len(), RECORD_HEADER_SIZE + body.len());
        let header = decode_header(&frame, 4096, 1 << 20).unwrap();
        assert_eq!(header.body_length as usize, body.len());
        assert_eq!(header.body_offset, 4096 + RECORD_HEADER_SIZE as u64);
        verify_body(&header, &frame[RECORD_HEADER_SIZE..]).unwrap();
        assert_eq!(&frame[RECORD_HEADER_SIZE..], &body[..]);
    }

    #[test]
    fn test_caller_supplied_crc_is_kept() {
        let body = Bytes::from_static(b"payload");
        let crc = crc32fast::hash(&body);
        let frame = encode_record(&body, crc, 0);
        let header = decode_header(&frame, 0, 1 << 20).unwrap();
        assert_eq!(header.body_crc, crc);
    }

    #[test]
    fn test_roundtrip_random_bodies() {
        let mut rng = rand::thread_rng();
        for _ in 0..100 {
            let len = rng.gen_range(1..=4096);
            let mut body = vec![0u8; len];
            rng.fill_bytes(&mut body);
            let body = Bytes::from(body);
            let offset = rng.gen_range(0..u64::MAX / 2);

            let frame = encode_record(&body, 0, offset);
            let header = decode_header(&frame, offset, 1 << 20).unwrap();
            assert_eq!(header.body_length as usize, body.len());
            verify_body(&header, &frame[RECORD_HEADER_SIZE..]).unwrap();
            assert_eq!(&frame[RECORD_HEADER_SIZE..], &body[..]);
        }
    }

    #[test]
    fn test_single_bit_flip_in_header_detected() {
        let body = Bytes::from(vec![7u8; 128]);
        let frame = encode_record(&body, 0, 8192);

        for bit in 0..RECORD_HEADER_SIZE * 8 {
            let mut corrupted = frame.to_vec();
            corrupted[bit / 8] ^= 1 << (bit % 8);
            let result = decode_header(&corrupted, 8192, 1 << 20);
            assert!(result.is_err(), "bit flip at {} went undetected", bit);
        }
    }

    #[test]
    fn test_single_bit_flip_in_body_detected() {
        let body = Bytes::from(vec![42u8; 64]);
        let frame = encode_record(&body, 0, 0);
        let header = decode_header(&frame, 0, 1 << 20).unwrap();

        let mut rng = rand::thread_rng();
        for _ in 0..32 {
            let bit = rng.gen_range(0..body.len() * 8);
            let mut corrupted = frame[RECORD_HEADER_SIZE..].to_vec();
            corrupted[bit / 8] ^= 1 << (bit % 8);
            assert_eq!(verify_body(&header, &corrupted), Err(DecodeError::BodyCrc));
        }
    }

    #[test]
    fn test_stale_slot_detected_by_offset_mismatch() {
        // A frame written at offset 0 read back as if it sat at a later lap.
        let body = Bytes::from_static(b"stale");
        let frame = encode_record(&body, 0, 0);
        let result = decode_header(&frame, 1 << 20, 1 << 20);
        assert_eq!(result, Err(DecodeError::OffsetMismatch));
    }

    #[test]
    fn test_wrong_magic() {
        let body = Bytes::from_static(b"x");
        let mut frame = encode_record(&body, 0, 0).to_vec();
        frame[0] = 0;
        assert_eq!(decode_header(&frame, 0, 1 << 20), Err(DecodeError::Magic));
    }

    #[test]
    fn test_body_length_above_limit_rejected() {
        let body = Bytes::from(vec![0u8; 2048]);
        let frame = encode_record(&body, 0, 0);
        assert_eq!(
            decode_header(&frame, 0, 1024),
            Err(DecodeError::BodyLength)
        );
    }

    #[test]
    fn test_truncated_header_rejected() {
        let body = Bytes::from_static(b"x");
        let frame = encode_record(&body, 0, 0);
        assert!(decode_header(&frame[..RECORD_HEADER_SIZE - 1], 0, 1 << 20).is_err());
    }
}
