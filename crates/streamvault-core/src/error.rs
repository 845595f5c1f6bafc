//! Core Error Types

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Invalid record batch magic: 0x{0:02x}")]
    InvalidMagic(u8),

    #[error("Truncated record batch: need {needed} bytes, have {remaining}")]
    TruncatedBatch { needed: usize, remaining: usize },

    #[error("Record batch has zero records")]
    EmptyBatch,
}
