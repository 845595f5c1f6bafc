//! StreamVault Core Types
//!
//! This crate defines the fundamental unit of durability in StreamVault - the
//! `StreamRecordBatch` - together with its binary wire codec.
//!
//! ## What is a StreamRecordBatch?
//!
//! A batch of records for a single stream, handed to the durability core as an
//! opaque payload. It is what producers append, what the WAL frames onto the
//! block device, and what the upload pipeline groups into objects:
//!
//! ```text
//! Producer → StreamRecordBatch → WAL frame → Log Cache → Upload Object
//! ```
//!
//! ## Design Decisions
//!
//! - Uses `bytes::Bytes` for the payload so batches can be shared between the
//!   WAL, the log cache and the upload pipeline without copying
//! - The wire encoding is fixed-width big-endian so recovery can decode
//!   batches out of raw WAL frames without a schema
//! - `last_offset` is exclusive and always greater than `base_offset`

pub mod error;
pub mod record;

pub use error::{Error, Result};
pub use record::StreamRecordBatch;
