//! Table pool - the active MemTable plus tables waiting to be flushed
//!
//! Writes land in the single active table. Once it grows past the flush
//! threshold it is frozen into the pending set, handed to the flush worker
//! through a bounded queue, and replaced by an empty table with the next
//! generation. A full queue blocks the rotating writer until the worker
//! catches up.

use crate::memtable::MemTable;
use crate::sstable::{CellIterator, MergeIterator};
use crate::{EmberError, Result, Value};
use bytes::Bytes;
use crossbeam_channel::{Receiver, Sender};
use parking_lot::{Condvar, Mutex, RwLock};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::debug;

/// A rotated table handed to the flush worker
pub struct FlushTask {
    pub generation: u64,
    pub table: Arc<MemTable>,
    /// Final task; the worker exits after flushing it
    pub poison: bool,
}

/// Table pool configuration
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Rotate once the active table holds more than this many bytes
    pub flush_threshold_bytes: u64,
    /// Capacity of the rotation queue
    pub queue_capacity: usize,
    /// Bits in each MemTable's bloom filter
    pub bloom_bits: usize,
}

struct PoolState {
    active: Arc<MemTable>,
    active_generation: u64,
    pending: BTreeMap<u64, Arc<MemTable>>,
    next_generation: u64,
}

impl PoolState {
    /// Move the active table into the pending set and install a fresh one
    fn rotate(&mut self, bloom_bits: usize) -> (u64, Arc<MemTable>) {
        let generation = self.active_generation;
        let fresh = Arc::new(MemTable::new(bloom_bits));
        let table = std::mem::replace(&mut self.active, fresh);
        self.pending.insert(generation, Arc::clone(&table));
        self.active_generation = self.take_generation();
        (generation, table)
    }

    fn take_generation(&mut self) -> u64 {
        let generation = self.next_generation;
        self.next_generation += 1;
        generation
    }
}

/// Active and pending-flush MemTables with the rotation queue
pub struct TablePool {
    config: PoolConfig,
    state: RwLock<PoolState>,
    flush_tx: Sender<FlushTask>,
    flush_rx: Receiver<FlushTask>,
    /// Held from rotation until the task is queued, so tasks enter the queue
    /// in generation order and the final task is always last
    send_lock: Mutex<()>,
    closed: AtomicBool,
    last_flushed: AtomicU64,
    flush_signal: Condvar,
    flush_signal_lock: Mutex<()>,
}

impl TablePool {
    /// Create a pool whose first table gets `start_generation`
    pub fn new(config: PoolConfig, start_generation: u64) -> Self {
        let (flush_tx, flush_rx) = crossbeam_channel::bounded(config.queue_capacity);
        let state = PoolState {
            active: Arc::new(MemTable::new(config.bloom_bits)),
            active_generation: start_generation,
            pending: BTreeMap::new(),
            next_generation: start_generation + 1,
        };

        Self {
            config,
            state: RwLock::new(state),
            flush_tx,
            flush_rx,
            send_lock: Mutex::new(()),
            closed: AtomicBool::new(false),
            last_flushed: AtomicU64::new(0),
            flush_signal: Condvar::new(),
            flush_signal_lock: Mutex::new(()),
        }
    }

    /// Insert or replace a value
    pub fn upsert(&self, key: Bytes, data: Bytes) -> Result<()> {
        self.write(|table| table.upsert(key, data))
    }

    /// Delete a key
    pub fn remove(&self, key: Bytes) -> Result<()> {
        self.write(|table| table.remove(key))
    }

    fn write<F: FnOnce(&MemTable)>(&self, apply: F) -> Result<()> {
        let size = {
            // Shared lock: writers run in parallel but never race a rotation
            let state = self.state.read();
            if self.closed.load(Ordering::Acquire) {
                return Err(EmberError::Closed);
            }
            apply(&*state.active);
            state.active.size_in_bytes()
        };

        if size > self.config.flush_threshold_bytes {
            self.rotate_if(|table| table.size_in_bytes() > self.config.flush_threshold_bytes)?;
        }
        Ok(())
    }

    /// Rotate the active table even below the threshold.
    ///
    /// Returns the rotated generation, or `None` when the table was empty.
    pub fn force_rotate(&self) -> Result<Option<u64>> {
        if self.closed.load(Ordering::Acquire) {
            return Err(EmberError::Closed);
        }
        self.rotate_if(|table| !table.is_empty())
    }

    fn rotate_if<P: Fn(&MemTable) -> bool>(&self, should_rotate: P) -> Result<Option<u64>> {
        let _sending = self.send_lock.lock();
        let task = {
            let mut state = self.state.write();
            // Another writer may have rotated while we waited for the lock
            if self.closed.load(Ordering::Acquire) || !should_rotate(&*state.active) {
                return Ok(None);
            }
            let (generation, table) = state.rotate(self.config.bloom_bits);
            debug!(
                generation,
                bytes = table.size_in_bytes(),
                "Rotated memtable for flushing"
            );
            FlushTask {
                generation,
                table,
                poison: false,
            }
        };

        let generation = task.generation;
        self.flush_tx
            .send(task)
            .map_err(|_| EmberError::Internal("Flush worker is gone".into()))?;
        Ok(Some(generation))
    }

    /// Point lookup over the active and pending tables
    pub fn get(&self, key: &[u8]) -> Value {
        let tables = self.snapshot();
        Value::newest(tables.iter().filter_map(|t| t.get(key)))
    }

    /// Merged, collapsed cells with keys `>= from`, tombstones included
    pub fn iter_from(&self, from: &[u8]) -> MergeIterator {
        let sources: Vec<CellIterator> = self
            .snapshot()
            .iter()
            .map(|table| Box::new(table.iter_from(from).map(Ok)) as CellIterator)
            .collect();
        MergeIterator::new(sources)
    }

    /// Pending tables oldest first, then the active table
    fn snapshot(&self) -> Vec<Arc<MemTable>> {
        let state = self.state.read();
        state
            .pending
            .values()
            .cloned()
            .chain(std::iter::once(Arc::clone(&state.active)))
            .collect()
    }

    /// Blocking take of the next rotated table
    pub fn flush_queue(&self) -> Receiver<FlushTask> {
        self.flush_rx.clone()
    }

    /// Acknowledge that `generation` is durable on disk
    pub fn flushed(&self, generation: u64) {
        {
            let mut state = self.state.write();
            state.pending.remove(&generation);
        }
        self.last_flushed.fetch_max(generation, Ordering::AcqRel);

        let _guard = self.flush_signal_lock.lock();
        self.flush_signal.notify_all();
    }

    /// Wait until `generation` has left the pending set
    pub fn wait_flushed(&self, generation: u64, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut guard = self.flush_signal_lock.lock();
        loop {
            if !self.state.read().pending.contains_key(&generation) {
                return true;
            }
            if self.flush_signal.wait_until(&mut guard, deadline).timed_out() {
                return !self.state.read().pending.contains_key(&generation);
            }
        }
    }

    /// Reserve a generation that no MemTable will use
    pub fn allocate_generation(&self) -> u64 {
        self.state.write().take_generation()
    }

    /// Highest generation flushed so far
    pub fn last_flushed_generation(&self) -> u64 {
        self.last_flushed.load(Ordering::Acquire)
    }

    /// Bytes held by the active and pending tables
    pub fn size_in_bytes(&self) -> u64 {
        self.snapshot().iter().map(|t| t.size_in_bytes()).sum()
    }

    /// Bytes held by the active table
    pub fn active_size_in_bytes(&self) -> u64 {
        self.state.read().active.size_in_bytes()
    }

    /// Generation of the active table
    pub fn active_generation(&self) -> u64 {
        self.state.read().active_generation
    }

    /// Number of tables waiting for the flush worker
    pub fn pending_count(&self) -> usize {
        self.state.read().pending.len()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Freeze the active table and enqueue the final task.
    ///
    /// Idempotent. Waits for rotations already in flight to be queued and
    /// for room in the queue, but not for the flush itself.
    pub fn close(&self) -> Result<()> {
        let _sending = self.send_lock.lock();
        let task = {
            let mut state = self.state.write();
            if self.closed.swap(true, Ordering::AcqRel) {
                return Ok(());
            }
            let (generation, table) = state.rotate(self.config.bloom_bits);
            FlushTask {
                generation,
                table,
                poison: true,
            }
        };

        debug!(generation = task.generation, "Enqueued final flush");
        self.flush_tx
            .send(task)
            .map_err(|_| EmberError::Internal("Flush worker is gone".into()))
    }
}
