//! Background flush worker
//!
//! Drains rotated MemTables from the pool's queue in order, writes each one
//! as an SSTable, registers it and acknowledges the generation. Failed
//! flushes stay in a local backlog and are retried; the pending table stays
//! readable in the meantime.

use super::EngineInner;
use crate::compaction;
use crate::pool::FlushTask;
use crate::sstable::{SSTableBuilder, SSTableReader};
use crate::{EmberError, Result};
use crossbeam_channel::{Receiver, RecvTimeoutError};
use std::collections::VecDeque;
use std::sync::Arc;
use std::thread;
use tracing::{debug, error, info};

/// Attempts at the final drain before giving up on close
const FINAL_FLUSH_ATTEMPTS: usize = 3;

/// Worker loop; returns once the final task has been flushed
pub(crate) fn run(inner: Arc<EngineInner>, queue: Receiver<FlushTask>) -> Result<()> {
    let retry_interval = inner.config.flush_retry_interval();
    let mut backlog: VecDeque<FlushTask> = VecDeque::new();

    loop {
        let received = if backlog.is_empty() {
            queue.recv().ok()
        } else {
            match queue.recv_timeout(retry_interval) {
                Ok(task) => Some(task),
                Err(RecvTimeoutError::Timeout) => None,
                Err(RecvTimeoutError::Disconnected) => break,
            }
        };
        let Some(task) = received else {
            if backlog.is_empty() {
                // Every sender is gone without a final task
                break;
            }
            drain(&inner, &mut backlog);
            continue;
        };

        let poison = task.poison;
        backlog.push_back(task);

        if poison {
            return finish(&inner, &mut backlog);
        }
        drain(&inner, &mut backlog);
    }

    debug!("Flush queue disconnected with {} tables in backlog", backlog.len());
    Ok(())
}

/// Flush the backlog in generation order, stopping at the first failure
fn drain(inner: &EngineInner, backlog: &mut VecDeque<FlushTask>) -> Option<EmberError> {
    while let Some(task) = backlog.front() {
        match flush_table(inner, task) {
            Ok(()) => {
                backlog.pop_front();
                if let Err(e) = compaction::maybe_compact(inner) {
                    error!("Compaction failed: {}", e);
                }
            }
            Err(e) => {
                error!(
                    "Failed to flush generation {} ({} queued for retry): {}",
                    task.generation,
                    backlog.len(),
                    e
                );
                return Some(e);
            }
        }
    }
    None
}

/// Final drain on close; the last error is returned if the backlog never empties
fn finish(inner: &EngineInner, backlog: &mut VecDeque<FlushTask>) -> Result<()> {
    let retry_interval = inner.config.flush_retry_interval();
    for attempt in 1..=FINAL_FLUSH_ATTEMPTS {
        let Some(e) = drain(inner, backlog) else {
            info!("Flush worker stopped");
            return Ok(());
        };
        if attempt == FINAL_FLUSH_ATTEMPTS {
            return Err(e);
        }
        thread::sleep(retry_interval);
    }
    Ok(())
}

/// Persist one rotated table and make it visible in the registry
fn flush_table(inner: &EngineInner, task: &FlushTask) -> Result<()> {
    if task.table.is_empty() {
        debug!("Skipping flush of empty generation {}", task.generation);
        inner.pool.flushed(task.generation);
        return Ok(());
    }

    let config = &inner.config;
    let cells = task.table.iter_from(b"").map(Ok);
    let meta = SSTableBuilder::build(
        &config.data_dir,
        task.generation,
        config.table_format,
        config.bloom_filter_bits,
        cells,
    )?;
    let reader = SSTableReader::open(&meta.path)?;

    // Registered before acknowledging so the data is never invisible
    inner.tables.insert(task.generation, Arc::new(reader));
    inner.pool.flushed(task.generation);

    info!(
        "Flushed generation {} to {:?} ({} rows, {} bytes)",
        task.generation, meta.path, meta.rows, meta.file_size
    );
    Ok(())
}
