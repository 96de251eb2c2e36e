//! SSTable (Sorted String Table) implementation
//!
//! Immutable on-disk storage for cells. All integers are big-endian:
//!
//! ```text
//! repeat rows times:
//!   key_len   : u32
//!   key       : key_len bytes
//!   timestamp : i64          negative => tombstone, abs() = real timestamp
//!   [value_len: u32]         only when timestamp >= 0
//!   [value    : value_len bytes]
//! [bloom words : n * u64]    bloom variant only
//! [n           : u32]        bloom variant only
//! offsets   : rows * u64     file offset of each record, ascending by key
//! rows      : u64
//! ```
//!
//! The variant is part of the file name, so a reader always knows whether a
//! filter is embedded without probing the file.

mod bloom;
mod builder;
mod merge;
mod reader;

pub use bloom::BloomFilter;
pub use builder::SSTableBuilder;
pub use merge::{CellIterator, MergeIterator};
pub use reader::{SSTableIter, SSTableReader};

use crate::{EmberError, Result, Timestamp, Value};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Prefix of every table file name
pub const FILE_PREFIX: &str = "table_";

/// Extension of plain tables
pub const PLAIN_EXTENSION: &str = "dat";

/// Extension of tables carrying a bloom filter
pub const BLOOM_EXTENSION: &str = "bdat";

/// Extension of tables still being written
pub const TEMP_EXTENSION: &str = "tmp";

/// On-disk layout variant
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TableFormat {
    /// Cells, offsets and row count only
    Plain,
    /// Bloom filter embedded before the offset index
    Bloom,
}

impl TableFormat {
    /// File extension encoding this variant
    pub fn extension(self) -> &'static str {
        match self {
            TableFormat::Plain => PLAIN_EXTENSION,
            TableFormat::Bloom => BLOOM_EXTENSION,
        }
    }

    fn from_extension(ext: &str) -> Option<Self> {
        match ext {
            PLAIN_EXTENSION => Some(TableFormat::Plain),
            BLOOM_EXTENSION => Some(TableFormat::Bloom),
            _ => None,
        }
    }
}

impl Default for TableFormat {
    fn default() -> Self {
        TableFormat::Bloom
    }
}

/// SSTable metadata
#[derive(Debug, Clone)]
pub struct SSTableMeta {
    /// File path
    pub path: PathBuf,
    /// Generation number
    pub generation: u64,
    /// Layout variant
    pub format: TableFormat,
    /// Number of cells
    pub rows: u64,
    /// File size in bytes
    pub file_size: u64,
}

/// Final file name of a table
pub fn table_file_name(generation: u64, format: TableFormat) -> String {
    format!("{}{:020}.{}", FILE_PREFIX, generation, format.extension())
}

/// Temporary file name used while a table is written
pub fn temp_file_name(generation: u64) -> String {
    format!("{}{:020}.{}", FILE_PREFIX, generation, TEMP_EXTENSION)
}

/// Recover generation and variant from a table path
pub fn parse_table_path(path: &Path) -> Option<(u64, TableFormat)> {
    let name = path.file_name()?.to_str()?;
    let (stem, ext) = name.strip_prefix(FILE_PREFIX)?.rsplit_once('.')?;
    let format = TableFormat::from_extension(ext)?;
    if stem.is_empty() || !stem.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    let generation = stem.parse().ok()?;
    Some((generation, format))
}

/// Whether a path is a leftover temporary table
pub fn is_temp_path(path: &Path) -> bool {
    path.file_name()
        .and_then(|n| n.to_str())
        .map(|n| n.starts_with(FILE_PREFIX) && n.ends_with(&format!(".{}", TEMP_EXTENSION)))
        .unwrap_or(false)
}

/// Encode a value's version into the signed timestamp field
pub(crate) fn encode_timestamp(value: &Value) -> Result<i64> {
    match value {
        Value::Present { timestamp, .. } if *timestamp >= 0 => Ok(*timestamp),
        Value::Tombstone { timestamp } if *timestamp > 0 => Ok(-*timestamp),
        Value::Present { timestamp, .. } | Value::Tombstone { timestamp } => {
            Err(EmberError::InvalidTimestamp(*timestamp))
        }
        Value::Absent => Err(EmberError::InvalidFormat(
            "Absent values are never persisted".into(),
        )),
    }
}

/// Split a stored timestamp field into (is_tombstone, real timestamp)
pub(crate) fn decode_timestamp(stored: i64) -> Result<(bool, Timestamp)> {
    if stored == i64::MIN {
        return Err(EmberError::Corruption("Timestamp field out of range".into()));
    }
    Ok((stored < 0, stored.abs()))
}
