//! Storage Configuration
//!
//! Controls the log cache and the upload pipeline:
//!
//! - **wal_cache_size**: ceiling on log-cache bytes; appends back off above it
//! - **wal_object_size**: target size of one uploaded WAL object; also the
//!   seal threshold of a log cache block
//! - **max_streams_per_wal_object**: cap on streams multiplexed into one
//!   object, keeping compaction fan-in bounded
//! - **wal_object_split_threshold**: a single stream's run larger than this
//!   is uploaded as its own stream object instead of riding the WAL object
//! - **upload retry knobs**: transient object-store failures retry with
//!   exponential backoff before escalating
//!
//! ## Usage
//!
//! ```ignore
//! use streamvault_storage::StorageConfig;
//!
//! // Small sizes for tests so uploads trigger quickly
//! let config = StorageConfig {
//!     wal_cache_size: 1 << 20,
//!     wal_object_size: 64 << 10,
//!     ..Default::default()
//! };
//! ```

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Max log-cache bytes before appends back off (default: 1 GiB)
    #[serde(default = "default_wal_cache_size")]
    pub wal_cache_size: u64,

    /// Target upload object size and cache block seal threshold
    /// (default: 64 MiB)
    #[serde(default = "default_wal_object_size")]
    pub wal_object_size: u64,

    /// Cap on streams multiplexed per WAL object (default: 10000)
    #[serde(default = "default_max_streams_per_wal_object")]
    pub max_streams_per_wal_object: usize,

    /// A stream run above this size splits into its own object
    /// (default: 16 MiB)
    #[serde(default = "default_wal_object_split_threshold")]
    pub wal_object_split_threshold: u64,

    /// Use multipart upload above this object size (default: 8 MiB)
    #[serde(default = "default_multipart_threshold")]
    pub multipart_threshold: u64,

    /// Part size for multipart uploads (default: 8 MiB)
    #[serde(default = "default_multipart_part_size")]
    pub multipart_part_size: u64,

    /// Retries for transient object-store failures (default: 3)
    #[serde(default = "default_upload_retries")]
    pub upload_retries: u32,

    /// TTL in seconds for prepared-but-uncommitted object ids
    /// (default: 30 minutes)
    #[serde(default = "default_object_ttl_secs")]
    pub object_ttl_secs: u64,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            wal_cache_size: default_wal_cache_size(),
            wal_object_size: default_wal_object_size(),
            max_streams_per_wal_object: default_max_streams_per_wal_object(),
            wal_object_split_threshold: default_wal_object_split_threshold(),
            multipart_threshold: default_multipart_threshold(),
            multipart_part_size: default_multipart_part_size(),
            upload_retries: default_upload_retries(),
            object_ttl_secs: default_object_ttl_secs(),
        }
    }
}

fn default_wal_cache_size() -> u64 {
    1 << 30 // 1 GiB
}

fn default_wal_object_size() -> u64 {
    64 << 20 // 64 MiB
}

fn default_max_streams_per_wal_object() -> usize {
    10_000
}

fn default_wal_object_split_threshold() -> u64 {
    16 << 20 // 16 MiB
}

fn default_multipart_threshold() -> u64 {
    8 << 20 // 8 MiB
}

fn default_multipart_part_size() -> u64 {
    8 << 20 // 8 MiB, the S3 minimum is 5 MiB
}

fn default_upload_retries() -> u32 {
    3
}

fn default_object_ttl_secs() -> u64 {
    30 * 60
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = StorageConfig::default();
        assert_eq!(config.wal_cache_size, 1 << 30);
        assert_eq!(config.wal_object_size, 64 << 20);
        assert_eq!(config.max_streams_per_wal_object, 10_000);
        assert_eq!(config.upload_retries, 3);
    }

    #[test]
    fn test_serde_defaults_fill_in() {
        let config: StorageConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(config.wal_object_size, 64 << 20);
        assert_eq!(config.object_ttl_secs, 1800);
    }
}
