//! SSTable builder for writing sorted cells to disk

use super::{
    encode_timestamp, table_file_name, temp_file_name, BloomFilter, SSTableMeta, TableFormat,
};
use crate::{Cell, EmberError, Result};
use bytes::{BufMut, Bytes, BytesMut};
use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// SSTable builder
///
/// Cells are streamed into a temporary file which is renamed into place by
/// [`SSTableBuilder::finish`]; a builder dropped before that removes its
/// temporary file.
pub struct SSTableBuilder {
    dir: PathBuf,
    generation: u64,
    format: TableFormat,
    temp_path: PathBuf,
    file: Option<BufWriter<File>>,

    offsets: Vec<u64>,
    offset: u64,
    bloom: Option<BloomFilter>,
    last_key: Option<Bytes>,
}

impl SSTableBuilder {
    /// Create a new SSTable builder in `dir`
    pub fn new(dir: &Path, generation: u64, format: TableFormat, bloom_bits: usize) -> Result<Self> {
        let temp_path = dir.join(temp_file_name(generation));
        // A failed earlier attempt at this generation may have left the file behind
        let file = File::create(&temp_path)?;

        let bloom = match format {
            TableFormat::Bloom => Some(BloomFilter::new(bloom_bits)),
            TableFormat::Plain => None,
        };

        Ok(Self {
            dir: dir.to_path_buf(),
            generation,
            format,
            temp_path,
            file: Some(BufWriter::new(file)),
            offsets: Vec::new(),
            offset: 0,
            bloom,
            last_key: None,
        })
    }

    /// Start the table's filter from an existing one (compaction inputs)
    pub fn seed_bloom(&mut self, seed: &BloomFilter) -> Result<()> {
        if let Some(bloom) = &self.bloom {
            bloom.union(seed)?;
        }
        Ok(())
    }

    /// Append a cell; keys must be strictly ascending
    pub fn add(&mut self, cell: &Cell) -> Result<()> {
        if let Some(last) = &self.last_key {
            if cell.key <= *last {
                return Err(EmberError::InvalidFormat(format!(
                    "Cells must be strictly ascending: {:?} after {:?}",
                    cell.key, last
                )));
            }
        }

        let key_len = u32::try_from(cell.key.len())
            .map_err(|_| EmberError::InvalidFormat("Key longer than 4 GiB".into()))?;
        let stored_timestamp = encode_timestamp(&cell.value)?;

        let mut buf = BytesMut::with_capacity(4 + cell.key.len() + 8 + 4 + cell.value.payload_len());
        buf.put_u32(key_len);
        buf.put_slice(&cell.key);
        buf.put_i64(stored_timestamp);
        if let Some(data) = cell.value.data() {
            let value_len = u32::try_from(data.len())
                .map_err(|_| EmberError::InvalidFormat("Value longer than 4 GiB".into()))?;
            buf.put_u32(value_len);
            buf.put_slice(data);
        }

        self.writer()?.write_all(&buf)?;

        if let Some(bloom) = &self.bloom {
            bloom.insert(&cell.key);
        }
        self.offsets.push(self.offset);
        self.offset += buf.len() as u64;
        self.last_key = Some(cell.key.clone());
        Ok(())
    }

    /// Write the trailer, sync and atomically publish the file
    pub fn finish(mut self) -> Result<SSTableMeta> {
        let mut buf = BytesMut::new();
        if let Some(bloom) = &self.bloom {
            bloom.encode(&mut buf);
        }
        for offset in &self.offsets {
            buf.put_u64(*offset);
        }
        buf.put_u64(self.offsets.len() as u64);

        let mut file = self
            .file
            .take()
            .ok_or_else(|| EmberError::Internal("SSTable builder already finished".into()))?;
        let outcome = file
            .write_all(&buf)
            .and_then(|_| file.flush())
            .and_then(|_| file.get_ref().sync_all());
        drop(file);
        if let Err(e) = outcome {
            self.discard();
            return Err(e.into());
        }

        let path = self.dir.join(table_file_name(self.generation, self.format));
        if let Err(e) = fs::rename(&self.temp_path, &path) {
            self.discard();
            return Err(e.into());
        }
        sync_dir(&self.dir);

        Ok(SSTableMeta {
            path,
            generation: self.generation,
            format: self.format,
            rows: self.offsets.len() as u64,
            file_size: self.offset + buf.len() as u64,
        })
    }

    /// Stream a whole sorted sequence into a published table
    pub fn build<I>(
        dir: &Path,
        generation: u64,
        format: TableFormat,
        bloom_bits: usize,
        cells: I,
    ) -> Result<SSTableMeta>
    where
        I: IntoIterator<Item = Result<Cell>>,
    {
        let mut builder = Self::new(dir, generation, format, bloom_bits)?;
        for cell in cells {
            builder.add(&cell?)?;
        }
        builder.finish()
    }

    fn writer(&mut self) -> Result<&mut BufWriter<File>> {
        self.file
            .as_mut()
            .ok_or_else(|| EmberError::Internal("SSTable builder already finished".into()))
    }

    fn discard(&mut self) {
        self.file = None;
        if let Err(e) = fs::remove_file(&self.temp_path) {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!("Failed to remove temporary table {:?}: {}", self.temp_path, e);
            }
        }
    }
}

impl Drop for SSTableBuilder {
    fn drop(&mut self) {
        if self.file.is_some() {
            self.discard();
        }
    }
}

fn sync_dir(dir: &Path) {
    // Persists the rename; not supported on every platform
    if let Err(e) = File::open(dir).and_then(|handle| handle.sync_all()) {
        debug!("Failed to sync directory {:?}: {}", dir, e);
    }
}
