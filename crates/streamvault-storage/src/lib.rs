//! StreamVault Storage Layer
//!
//! This crate turns a stream of appended records into committed object-store
//! artifacts, with the block-device WAL underneath for crash durability.
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌─────────────┐
//! │  Producers  │
//! └──────┬──────┘
//!        │ StreamRecordBatch
//!        ▼
//! ┌──────────────────┐   backoff queue when WAL or cache is full
//! │ StorageService   │──────────────────────────────┐
//! └──────┬───────────┘                              │ retried every 100ms
//!        │ append                                   │
//!        ▼                                          │
//! ┌──────────────────┐  out-of-order fsync acks     │
//! │   Block WAL      │─────────────┐                │
//! └──────────────────┘             ▼                │
//!                        ┌───────────────────┐      │
//!                        │ CallbackSequencer │ ← re-orders per stream
//!                        └─────────┬─────────┘
//!                                  │ in-order records
//!                                  ▼
//!                        ┌───────────────────┐
//!                        │    Log Cache      │ ← blocks sealed by size
//!                        └─────────┬─────────┘
//!                                  │ sealed blocks
//!                                  ▼
//!                        ┌───────────────────┐
//!                        │  Upload Pipeline  │ prepare → upload → commit
//!                        └─────────┬─────────┘
//!                                  │ commit
//!                                  ▼
//!                          WAL trim + cache free
//! ```
//!
//! ## Ordering Guarantees
//!
//! - Per stream, records reach the object store in base-offset order with no
//!   gaps; recovery re-verifies this
//! - Object ids are assigned in block-seal order and committed in id order
//! - The WAL confirm offset never exceeds the youngest gap-free frontier
//!
//! ## External Collaborators
//!
//! The metadata service ([`StreamManager`], [`ObjectManager`]) and the
//! historical read path ([`BlockCache`]) are consumed through traits; this
//! crate ships in-memory implementations for tests.

pub mod block_cache;
pub mod cache;
pub mod config;
pub mod error;
pub mod objects;
pub mod oom;
pub mod sequencer;
pub mod service;
pub mod streams;
pub mod upload;

pub use block_cache::{BlockCache, NoopBlockCache};
pub use cache::{LogCache, LogCacheBlock, MATCH_ALL_STREAMS};
pub use config::StorageConfig;
pub use error::{Error, Result};
pub use objects::{
    CommitWalObjectRequest, MemoryObjectManager, ObjectManager, ObjectStreamRange, StreamObject,
    WalObjectMetadata,
};
pub use sequencer::{CallbackSequencer, WalWriteRequest};
pub use service::StorageService;
pub use streams::{MemoryStreamManager, StreamManager, StreamMetadata};
pub use upload::WalObjectUploadTask;
