//! WAL Configuration
//!
//! Controls the device geometry, the sliding window and the I/O pool:
//!
//! - **device_path / capacity**: where the ring lives and how large it is.
//!   Capacity is rounded down to a block boundary at first start and is
//!   immutable afterwards (the recovered header wins over the config).
//! - **window_initial / window_upper_limit / window_scale_unit**: the
//!   sliding window starts small and grows on demand, bounding how much of
//!   the ring crash recovery has to consider live
//! - **block_soft_limit**: seal a write block early once it crosses this
//!   size, to cap append latency
//! - **io_threads**: number of concurrent block-device writes
//!
//! ## Usage
//!
//! ```ignore
//! use streamvault_wal::WalConfig;
//!
//! // Production: a raw block device with direct I/O
//! let config = WalConfig {
//!     direct_io: true,
//!     ..WalConfig::new("/dev/nvme1n1", 2 << 30)
//! };
//!
//! // Tests: a small preallocated file
//! let config = WalConfig::new(temp.path(), 16 << 20);
//! ```

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WalConfig {
    /// Path to the raw block device or preallocated file
    pub device_path: PathBuf,

    /// Device bytes available to the WAL; rounded down to a block boundary
    pub capacity: u64,

    /// Device block size in bytes (default: 4096)
    #[serde(default = "default_block_size")]
    pub block_size: u64,

    /// Open the device with O_DIRECT (default: false, so tests run on tmpfs)
    #[serde(default)]
    pub direct_io: bool,

    /// Seconds between background header flushes (default: 10)
    #[serde(default = "default_header_flush_interval_s")]
    pub header_flush_interval_s: u64,

    /// Concurrent block-device writers (default: 8)
    #[serde(default = "default_io_threads")]
    pub io_threads: usize,

    /// Initial sliding window length (default: 1 MiB)
    #[serde(default = "default_window_initial")]
    pub window_initial: u64,

    /// Hard cap on the sliding window length (default: 512 MiB)
    #[serde(default = "default_window_upper_limit")]
    pub window_upper_limit: u64,

    /// Step by which the window grows when appends outrun it (default: 4 MiB)
    #[serde(default = "default_window_scale_unit")]
    pub window_scale_unit: u64,

    /// Seal a write block early once it crosses this size (default: 128 KiB)
    #[serde(default = "default_block_soft_limit")]
    pub block_soft_limit: u64,

    /// Upper bound on a single record body (default: 64 MiB)
    #[serde(default = "default_max_record_body_size")]
    pub max_record_body_size: usize,

    /// How long a graceful shutdown waits for the window to drain
    /// (default: 24 hours)
    #[serde(default = "default_shutdown_timeout_ms")]
    pub shutdown_timeout_ms: u64,
}

impl WalConfig {
    pub fn new(device_path: impl Into<PathBuf>, capacity: u64) -> Self {
        Self {
            device_path: device_path.into(),
            capacity,
            block_size: default_block_size(),
            direct_io: false,
            header_flush_interval_s: default_header_flush_interval_s(),
            io_threads: default_io_threads(),
            window_initial: default_window_initial(),
            window_upper_limit: default_window_upper_limit(),
            window_scale_unit: default_window_scale_unit(),
            block_soft_limit: default_block_soft_limit(),
            max_record_body_size: default_max_record_body_size(),
            shutdown_timeout_ms: default_shutdown_timeout_ms(),
        }
    }
}

fn default_block_size() -> u64 {
    4096
}

fn default_header_flush_interval_s() -> u64 {
    10
}

fn default_io_threads() -> usize {
    8
}

fn default_window_initial() -> u64 {
    1 << 20 // 1 MiB
}

fn default_window_upper_limit() -> u64 {
    512 << 20 // 512 MiB
}

fn default_window_scale_unit() -> u64 {
    4 << 20 // 4 MiB
}

fn default_block_soft_limit() -> u64 {
    1 << 17 // 128 KiB
}

fn default_max_record_body_size() -> usize {
    64 << 20 // 64 MiB
}

fn default_shutdown_timeout_ms() -> u64 {
    24 * 60 * 60 * 1000
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = WalConfig::new("/dev/null", 64 << 20);
        assert_eq!(config.block_size, 4096);
        assert_eq!(config.header_flush_interval_s, 10);
        assert_eq!(config.io_threads, 8);
        assert_eq!(config.window_initial, 1 << 20);
        assert_eq!(config.window_upper_limit, 512 << 20);
        assert_eq!(config.window_scale_unit, 4 << 20);
        assert_eq!(config.block_soft_limit, 128 << 10);
        assert!(!config.direct_io);
    }

    #[test]
    fn test_serde_defaults_fill_in() {
        let json = r#"{"device_path": "/tmp/wal", "capacity": 1048576}"#;
        let config: WalConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config.capacity, 1048576);
        assert_eq!(config.block_size, 4096);
        assert_eq!(config.io_threads, 8);
    }

    #[test]
    fn test_serde_roundtrip() {
        let config = WalConfig::new("/tmp/wal", 2 << 20);
        let json = serde_json::to_string(&config).unwrap();
        let back: WalConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(back.capacity, config.capacity);
        assert_eq!(back.device_path, config.device_path);
    }
}
