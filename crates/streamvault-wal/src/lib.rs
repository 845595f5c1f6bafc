//! StreamVault Block WAL
//!
//! This crate implements a write-ahead log on a raw block device (or a
//! preallocated file), used by the storage layer to make records durable
//! before they are uploaded to object storage.
//!
//! ## Problem
//!
//! Records buffered in memory are lost if the broker crashes before the
//! upload pipeline ships them to the object store. A file-append WAL would
//! solve durability but grows without bound and fights the page cache for
//! memory on a machine that already manages its own caches.
//!
//! ## Solution
//!
//! A fixed-capacity circular WAL directly on block storage:
//!
//! - Records are framed with CRC-protected headers and written to a ring of
//!   `capacity - 2 blocks` bytes; logical offsets grow forever and map into
//!   the ring by modulo
//! - A sliding window tracks the in-flight region `[start, next_write)`;
//!   everything below `start` is durable, everything below `trim` has been
//!   uploaded and may be overwritten
//! - Two redundant header blocks at the front of the device persist the
//!   window so crash recovery knows where to scan
//!
//! ## Layout
//!
//! ```text
//! 0x0000 ┌────────────────────┐
//!        │ WAL header slot 0  │  one device block
//! 0x1000 ├────────────────────┤
//!        │ WAL header slot 1  │  one device block
//! 0x2000 ├────────────────────┤
//!        │                    │
//!        │   record section   │  capacity - 2 blocks, written as a ring
//!        │                    │
//!        └────────────────────┘
//! ```
//!
//! ## Usage
//!
//! ```ignore
//! use streamvault_wal::{BlockWal, WalConfig};
//!
//! let wal = BlockWal::open(WalConfig::new("/dev/vdb", 64 << 20))?;
//! wal.start().await?;
//!
//! // Replay anything a previous process left behind.
//! for result in wal.recover()? {
//!     replay(result.record);
//! }
//! wal.reset().await?;
//!
//! // Append returns as soon as the record is staged; await durability.
//! let append = wal.append(body, 0)?;
//! let flushed = append.wait().await?;
//!
//! // After records are uploaded, allow the ring to reuse their space.
//! wal.trim(uploaded_up_to).await?;
//!
//! wal.shutdown_gracefully().await;
//! ```

mod block;
pub mod channel;
pub mod config;
pub mod error;
pub mod header;
pub mod layout;
pub mod record;
pub mod recovery;
pub mod service;
mod window;

pub use channel::BlockChannel;
pub use config::WalConfig;
pub use error::{DecodeError, Result, WalError};
pub use header::{ShutdownType, WalHeader};
pub use recovery::{RecoverIterator, RecoverResult};
pub use service::{AppendResult, BlockWal};
