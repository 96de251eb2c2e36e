//! EmberKV Core - Embedded LSM Key-Value Storage Engine
//!
//! A log-structured merge store for replicated key-value nodes:
//! - Writes land in memory and never wait on disk I/O (except backpressure)
//! - Reads see the newest version of a key across memory and disk
//! - Deletes are timestamped tombstones, so replicas can reconcile versions
//!
//! # Architecture
//!
//! - **MemTable**: Concurrent in-memory sorted map with a bloom filter
//! - **TablePool**: The active MemTable plus rotated tables awaiting flush
//! - **SSTable**: Immutable sorted files on disk with an offset index
//! - **Compaction**: Merges all on-disk tables into one, newest version wins
//!
//! # Durability
//!
//! There is no write-ahead log. Data still in the active MemTable is lost if
//! the process crashes; [`StorageEngine::flush`] and [`StorageEngine::close`]
//! are the points at which writes are known to be on disk. Tables are
//! published by atomic rename, so a crash never leaves a half-written table
//! under its final name.

pub mod compaction;
pub mod memtable;
pub mod pool;
pub mod sstable;
pub mod storage;

mod error;
mod types;

pub use error::{EmberError, Result};
pub use storage::{EngineStats, RangeIter, StorageConfig, StorageEngine};
pub use types::*;

/// EmberKV version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Default configuration values
pub mod config {
    /// Active MemTable size before rotation (4MB)
    pub const FLUSH_THRESHOLD_BYTES: u64 = 4 * 1024 * 1024;

    /// Rotated tables allowed to wait for the flush worker
    pub const FLUSH_QUEUE_CAPACITY: usize = 2;

    /// On-disk tables tolerated before compaction
    pub const MAX_DISK_TABLES: usize = 10;

    /// Bloom filter size in bits (128KB)
    pub const BLOOM_FILTER_BITS: usize = 1024 * 1024;

    /// Delay between flush retries
    pub const FLUSH_RETRY_INTERVAL_MS: u64 = 1000;

    /// Upper bound on a blocking flush
    pub const FLUSH_TIMEOUT_MS: u64 = 30_000;
}
