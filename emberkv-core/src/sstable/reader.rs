//! SSTable reader for querying data

use super::{decode_timestamp, parse_table_path, BloomFilter, SSTableMeta, TableFormat};
use crate::{Cell, EmberError, Result, Value};
use bytes::{Buf, Bytes};
use memmap2::Mmap;
use std::cmp::Ordering;
use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// SSTable reader
///
/// The file is memory-mapped once; keys and values handed out are zero-copy
/// slices that keep the mapping alive, so they remain valid after the table
/// is dropped from the registry or its file is deleted.
pub struct SSTableReader {
    path: PathBuf,
    generation: u64,
    format: TableFormat,
    data: Bytes,
    rows: usize,
    /// End of the cell region
    cells_end: usize,
    /// Start of the offset index
    index_start: usize,
    bloom: Option<BloomFilter>,
}

impl SSTableReader {
    /// Open an SSTable file; generation and variant come from its name
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let (generation, format) = parse_table_path(&path).ok_or_else(|| {
            EmberError::InvalidFormat(format!("Not a table file name: {:?}", path))
        })?;

        let file = File::open(&path)?;
        // The file is never modified after publication
        let mmap = unsafe { Mmap::map(&file)? };
        Self::from_bytes(path, generation, format, Bytes::from_owner(mmap))
    }

    /// Parse the trailer of an in-memory table image
    pub fn from_bytes(path: PathBuf, generation: u64, format: TableFormat, data: Bytes) -> Result<Self> {
        let len = data.len();
        if len < 8 {
            return Err(EmberError::Corruption(format!("{:?} too short: {} bytes", path, len)));
        }

        let rows = (&data[len - 8..]).get_u64();
        let index_len = rows
            .checked_mul(8)
            .filter(|n| *n <= (len - 8) as u64)
            .ok_or_else(|| {
                EmberError::Corruption(format!("{:?} claims {} rows in {} bytes", path, rows, len))
            })? as usize;
        let index_start = len - 8 - index_len;

        let (cells_end, bloom) = match format {
            TableFormat::Plain => (index_start, None),
            TableFormat::Bloom => {
                if index_start < 4 {
                    return Err(EmberError::Corruption(format!("{:?} missing bloom filter", path)));
                }
                let num_words = (&data[index_start - 4..index_start]).get_u32() as usize;
                let bloom_len = num_words * 8;
                if bloom_len > index_start - 4 {
                    return Err(EmberError::Corruption(format!(
                        "{:?} bloom filter of {} words overruns file",
                        path, num_words
                    )));
                }
                let bloom_start = index_start - 4 - bloom_len;
                let bloom = BloomFilter::decode_words(&data[bloom_start..index_start - 4], num_words)?;
                (bloom_start, Some(bloom))
            }
        };

        let reader = Self {
            path,
            generation,
            format,
            data,
            rows: rows as usize,
            cells_end,
            index_start,
            bloom,
        };

        if reader.rows > 0 && reader.offset_at(reader.rows - 1)? >= cells_end {
            return Err(EmberError::Corruption(format!(
                "{:?} offset index points past the cell region",
                reader.path
            )));
        }

        Ok(reader)
    }

    /// Get SSTable metadata
    pub fn meta(&self) -> SSTableMeta {
        SSTableMeta {
            path: self.path.clone(),
            generation: self.generation,
            format: self.format,
            rows: self.rows as u64,
            file_size: self.data.len() as u64,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn format(&self) -> TableFormat {
        self.format
    }

    /// Number of cells
    pub fn rows(&self) -> usize {
        self.rows
    }

    /// Embedded bloom filter, if this variant carries one
    pub fn bloom(&self) -> Option<&BloomFilter> {
        self.bloom.as_ref()
    }

    /// Bloom filter check; tables without a filter always answer `true`
    pub fn may_contain(&self, key: &[u8]) -> bool {
        self.bloom.as_ref().map_or(true, |b| b.might_contain(key))
    }

    /// Key of the cell at row `i`
    pub fn key_at(&self, i: usize) -> Result<Bytes> {
        let offset = self.offset_at(i)?;
        let (key, _) = self.read_key(offset)?;
        Ok(key)
    }

    /// Cell at row `i`
    pub fn cell_at(&self, i: usize) -> Result<Cell> {
        let offset = self.offset_at(i)?;
        let (key, mut pos) = self.read_key(offset)?;

        let stored = self.read_slice(pos, 8)?.get_i64();
        pos += 8;
        let (removed, timestamp) = decode_timestamp(stored)?;
        if removed {
            return Ok(Cell::new(key, Value::Tombstone { timestamp }));
        }

        let value_len = self.read_slice(pos, 4)?.get_u32() as usize;
        pos += 4;
        self.read_slice(pos, value_len)?;
        let data = self.data.slice(pos..pos + value_len);
        Ok(Cell::new(key, Value::Present { timestamp, data }))
    }

    /// Index of the first row whose key is `>= target`
    pub fn position(&self, target: &[u8]) -> Result<usize> {
        let mut low = 0;
        let mut high = self.rows;
        while low < high {
            let mid = low + (high - low) / 2;
            match self.key_at(mid)?.as_ref().cmp(target) {
                Ordering::Less => low = mid + 1,
                _ => high = mid,
            }
        }
        Ok(low)
    }

    /// Point lookup of the stored version of a key
    pub fn get(&self, key: &[u8]) -> Result<Option<Cell>> {
        if !self.may_contain(key) {
            return Ok(None);
        }
        let pos = self.position(key)?;
        if pos >= self.rows || self.key_at(pos)?.as_ref() != key {
            return Ok(None);
        }
        self.cell_at(pos).map(Some)
    }

    /// Ascending iterator over cells with keys `>= from`
    pub fn iter_from(self: &Arc<Self>, from: &[u8]) -> Result<SSTableIter> {
        let next = self.position(from)?;
        Ok(SSTableIter {
            table: Arc::clone(self),
            next,
        })
    }

    fn offset_at(&self, i: usize) -> Result<usize> {
        if i >= self.rows {
            return Err(EmberError::Internal(format!(
                "Row {} out of range for {} rows",
                i, self.rows
            )));
        }
        let pos = self.index_start + i * 8;
        Ok((&self.data[pos..pos + 8]).get_u64() as usize)
    }

    fn read_key(&self, offset: usize) -> Result<(Bytes, usize)> {
        let key_len = self.read_slice(offset, 4)?.get_u32() as usize;
        let start = offset + 4;
        self.read_slice(start, key_len)?;
        Ok((self.data.slice(start..start + key_len), start + key_len))
    }

    fn read_slice(&self, pos: usize, len: usize) -> Result<&[u8]> {
        match pos.checked_add(len) {
            Some(end) if end <= self.cells_end => Ok(&self.data[pos..end]),
            _ => Err(EmberError::Corruption(format!(
                "{:?} record at {} overruns the cell region",
                self.path, pos
            ))),
        }
    }
}

/// Lazy ascending cursor over an SSTable
pub struct SSTableIter {
    table: Arc<SSTableReader>,
    next: usize,
}

impl Iterator for SSTableIter {
    type Item = Result<Cell>;

    fn next(&mut self) -> Option<Result<Cell>> {
        if self.next >= self.table.rows {
            return None;
        }
        let cell = self.table.cell_at(self.next);
        // Stop after a corrupt record instead of yielding errors forever
        self.next = if cell.is_ok() { self.next + 1 } else { self.table.rows };
        Some(cell)
    }
}
