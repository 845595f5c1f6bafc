//! Storage Error Types
//!
//! ## Error Categories
//!
//! ### Append-side (retryable via the backoff queue)
//! - `Wal(OverCapacity)`: the WAL ring is full until an upload trims it
//! - `CacheFull`: the log cache is at its limit until an upload frees it;
//!   appends park in the backoff queue instead of failing with it
//!
//! ### Recovery-side (fatal)
//! - `DataLoss`: the WAL recovered a stream whose head is above the end
//!   offset the metadata service has committed - an integrity violation,
//!   not a recovery gap
//!
//! ### Upload-side
//! - `ObjectStore`: transient; retried with exponential backoff
//! - `UploadCommitFailed`: terminal - a failed commit leaves the WAL
//!   un-trimmed and the object id burned, so the process restarts and
//!   recovers via the WAL

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("WAL error: {0}")]
    Wal(#[from] streamvault_wal::WalError),

    #[error("Log cache full: {size} of {limit} bytes in use")]
    CacheFull { size: u64, limit: u64 },

    #[error("Record codec error: {0}")]
    Codec(#[from] streamvault_core::Error),

    #[error("Object store error: {0}")]
    ObjectStore(#[from] object_store::Error),

    #[error("Metadata operation failed: {0}")]
    Metadata(String),

    #[error(
        "Data loss detected on stream {stream_id}: metadata end offset {expected_end}, \
         recovered start offset {recovered_start}"
    )]
    DataLoss {
        stream_id: u64,
        expected_end: u64,
        recovered_start: u64,
    },

    #[error("WAL object commit failed: {0}")]
    UploadCommitFailed(String),

    #[error("Discontinuous records on stream {stream_id}: expected offset {expected}, got {actual}")]
    Discontinuous {
        stream_id: u64,
        expected: u64,
        actual: u64,
    },

    #[error("Upload task used before prepare completed")]
    UploadNotPrepared,

    #[error("Storage service is shut down")]
    Shutdown,
}
