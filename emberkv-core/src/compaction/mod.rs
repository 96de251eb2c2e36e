//! Compaction: merge every on-disk table into one

use crate::sstable::{CellIterator, MergeIterator, SSTableBuilder, SSTableMeta, SSTableReader};
use crate::storage::EngineInner;
use crate::Result;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};

/// Outcome of one compaction run
#[derive(Debug, Clone)]
pub struct CompactionResult {
    /// Generations that were merged and removed
    pub inputs: Vec<u64>,
    /// The table that replaced them
    pub output: SSTableMeta,
}

/// Merge all registered tables into a single new table.
///
/// The newest version of every key survives, tombstones included. The new
/// table is registered before the inputs are unregistered, so readers never
/// observe a state without the data. Returns `None` with fewer than two
/// tables.
pub(crate) fn compact_all(inner: &EngineInner) -> Result<Option<CompactionResult>> {
    let _guard = inner.compaction_lock.lock();

    let inputs: Vec<Arc<SSTableReader>> = inner
        .tables
        .iter()
        .map(|entry| Arc::clone(entry.value()))
        .collect();
    if inputs.len() < 2 {
        debug!("Skipping compaction of {} tables", inputs.len());
        return Ok(None);
    }

    let started = Instant::now();
    let generation = inner.pool.allocate_generation();
    let config = &inner.config;
    info!("Compacting {} tables into generation {}", inputs.len(), generation);

    let mut builder = SSTableBuilder::new(
        &config.data_dir,
        generation,
        config.table_format,
        config.bloom_filter_bits,
    )?;
    for input in &inputs {
        if let Some(bloom) = input.bloom() {
            // Filters of a different size cannot be unioned; the keys are re-added below anyway
            if let Err(e) = builder.seed_bloom(bloom) {
                debug!("Not seeding filter from generation {}: {}", input.generation(), e);
            }
        }
    }

    let sources = inputs
        .iter()
        .map(|reader| -> Result<CellIterator> { Ok(Box::new(reader.iter_from(b"")?)) })
        .collect::<Result<Vec<_>>>()?;
    for cell in MergeIterator::new(sources) {
        builder.add(&cell?)?;
    }
    let output = builder.finish()?;

    let reader = Arc::new(SSTableReader::open(&output.path)?);
    inner.tables.insert(generation, reader);
    for input in &inputs {
        inner.tables.remove(&input.generation());
    }

    // Open readers keep their mapping; the files themselves can go
    for input in &inputs {
        if let Err(e) = std::fs::remove_file(input.path()) {
            warn!("Failed to delete compacted table {:?}: {}", input.path(), e);
        }
    }

    info!(
        "Compacted {} tables into generation {} ({} rows, {} bytes) in {:?}",
        inputs.len(),
        generation,
        output.rows,
        output.file_size,
        started.elapsed()
    );

    Ok(Some(CompactionResult {
        inputs: inputs.iter().map(|r| r.generation()).collect(),
        output,
    }))
}

/// Compact when the registry holds more tables than allowed
pub(crate) fn maybe_compact(inner: &EngineInner) -> Result<Option<CompactionResult>> {
    let tables = inner.tables.len();
    if tables <= inner.config.max_disk_tables {
        return Ok(None);
    }
    debug!(
        "{} tables on disk exceeds limit of {}",
        tables, inner.config.max_disk_tables
    );
    compact_all(inner)
}
