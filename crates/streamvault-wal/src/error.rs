//! WAL Error Types
//!
//! ## Error Categories
//!
//! ### Append-side
//! - `OverCapacity`: the ring is full; retryable once the caller trims
//! - `NotReady`: the service was used before `start` or after shutdown
//!
//! ### Recovery-side
//! - `CorruptHeader`: neither header slot decoded (a fresh header is created
//!   instead of surfacing this; the variant exists for callers that probe)
//! - `DecodeError`: reasons a record frame fails verification; recovery skips
//!   to the next block boundary on any of them
//!
//! ### Device-side
//! - `ShortWrite`, `Unaligned`, `Io`: transient or programming errors from
//!   the block channel

use thiserror::Error;

pub type Result<T> = std::result::Result<T, WalError>;

#[derive(Debug, Error)]
pub enum WalError {
    #[error("WAL ring over capacity: appending {needed} bytes, {available} available")]
    OverCapacity { needed: u64, available: u64 },

    #[error("WAL service is not ready to serve")]
    NotReady,

    #[error("Invalid WAL configuration: {0}")]
    InvalidConfig(String),

    #[error("Corrupt WAL header: {0}")]
    CorruptHeader(String),

    #[error("Cannot trim to {offset}: records at and above window start {window_start} are not yet flushed")]
    TrimBeyondWindow { offset: u64, window_start: u64 },

    #[error("Short write to block device at position {position}")]
    ShortWrite { position: u64 },

    #[error("Unaligned {what}: {value} is not a multiple of the {block_size} byte block size")]
    Unaligned {
        what: &'static str,
        value: u64,
        block_size: u64,
    },

    #[error("Record body of {size} bytes exceeds the {limit} byte limit")]
    BodyTooLarge { size: usize, limit: usize },

    #[error("Record body is empty")]
    EmptyBody,

    #[error("WAL block write failed: {0}")]
    WriteFailed(String),

    #[error("Append was aborted before the record reached the device")]
    Aborted,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Reasons a record frame fails to decode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum DecodeError {
    #[error("record magic mismatch")]
    Magic,

    #[error("record header CRC mismatch")]
    HeaderCrc,

    #[error("record body CRC mismatch")]
    BodyCrc,

    #[error("invalid record body length")]
    BodyLength,

    #[error("record body offset does not match its slot")]
    OffsetMismatch,
}

/// A failed attempt to read a record during recovery.
///
/// `jump_to` is the next offset worth trying, always the following block
/// boundary of the offset that failed.
#[derive(Debug)]
pub(crate) struct ReadRecordError {
    pub jump_to: u64,
    pub reason: String,
}
