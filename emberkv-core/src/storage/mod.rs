//! Storage engine - coordinates all storage components

mod engine;
mod flush;

pub use engine::{EngineStats, RangeIter, StorageEngine};
pub(crate) use engine::EngineInner;

use crate::sstable::TableFormat;
use crate::{EmberError, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Storage engine configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Data directory
    pub data_dir: PathBuf,
    /// Rotate the active MemTable once it holds more than this many bytes
    pub flush_threshold_bytes: u64,
    /// Rotated tables that may wait for the flush worker before writers block
    pub flush_queue_capacity: usize,
    /// Compact once more than this many tables are on disk
    pub max_disk_tables: usize,
    /// Layout of newly written tables
    pub table_format: TableFormat,
    /// Bits in every bloom filter (multiple of 64)
    pub bloom_filter_bits: usize,
    /// Delay between retries of a failed flush
    pub flush_retry_interval_ms: u64,
    /// How long [`StorageEngine::flush`] waits for durability
    pub flush_timeout_ms: u64,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("data"),
            flush_threshold_bytes: crate::config::FLUSH_THRESHOLD_BYTES,
            flush_queue_capacity: crate::config::FLUSH_QUEUE_CAPACITY,
            max_disk_tables: crate::config::MAX_DISK_TABLES,
            table_format: TableFormat::default(),
            bloom_filter_bits: crate::config::BLOOM_FILTER_BITS,
            flush_retry_interval_ms: crate::config::FLUSH_RETRY_INTERVAL_MS,
            flush_timeout_ms: crate::config::FLUSH_TIMEOUT_MS,
        }
    }
}

impl StorageConfig {
    /// Configuration rooted at `data_dir` with default tuning
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
            ..Default::default()
        }
    }

    /// Reject settings the engine cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.flush_queue_capacity == 0 {
            return Err(EmberError::Config(
                "flush_queue_capacity must be at least 1".into(),
            ));
        }
        if self.max_disk_tables == 0 {
            return Err(EmberError::Config("max_disk_tables must be at least 1".into()));
        }
        if self.bloom_filter_bits == 0 || self.bloom_filter_bits % 64 != 0 {
            return Err(EmberError::Config(format!(
                "bloom_filter_bits must be a positive multiple of 64, got {}",
                self.bloom_filter_bits
            )));
        }
        if self.flush_retry_interval_ms == 0 {
            return Err(EmberError::Config(
                "flush_retry_interval_ms must be positive".into(),
            ));
        }
        Ok(())
    }

    pub fn flush_retry_interval(&self) -> Duration {
        Duration::from_millis(self.flush_retry_interval_ms)
    }

    pub fn flush_timeout(&self) -> Duration {
        Duration::from_millis(self.flush_timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        assert!(StorageConfig::default().validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_bad_settings() {
        let bad = [
            StorageConfig { flush_queue_capacity: 0, ..Default::default() },
            StorageConfig { max_disk_tables: 0, ..Default::default() },
            StorageConfig { bloom_filter_bits: 100, ..Default::default() },
            StorageConfig { bloom_filter_bits: 0, ..Default::default() },
            StorageConfig { flush_retry_interval_ms: 0, ..Default::default() },
        ];
        for config in bad {
            assert!(matches!(config.validate(), Err(EmberError::Config(_))));
        }
    }

    #[test]
    fn test_deserialize_partial_config() {
        let config: StorageConfig = serde_json::from_str(
            r#"{"data_dir": "/tmp/ember", "max_disk_tables": 3, "table_format": "plain"}"#,
        )
        .unwrap();

        assert_eq!(config.data_dir, PathBuf::from("/tmp/ember"));
        assert_eq!(config.max_disk_tables, 3);
        assert_eq!(config.table_format, TableFormat::Plain);
        assert_eq!(config.flush_queue_capacity, crate::config::FLUSH_QUEUE_CAPACITY);
    }
}
