//! MemTable implementation using a concurrent skip list
//!
//! The MemTable is an in-memory data structure that stores recent writes
//! in sorted order, allowing for fast writes and efficient range scans.
//! Readers never block; mutations are serialized by an internal lock so the
//! size accounting stays exact with several writers.

use crate::sstable::BloomFilter;
use crate::{Cell, Value};
use bytes::Bytes;
use crossbeam_skiplist::SkipMap;
use parking_lot::Mutex;
use std::ops::Bound;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// MemTable for in-memory writes
pub struct MemTable {
    /// Newest version per key
    data: SkipMap<Bytes, Value>,
    /// Filter over every key ever written here
    bloom: BloomFilter,
    /// Key and payload bytes held by the table
    size_bytes: AtomicU64,
    write_lock: Mutex<()>,
}

impl MemTable {
    /// Create an empty MemTable whose filter has `bloom_bits` bits
    pub fn new(bloom_bits: usize) -> Self {
        Self {
            data: SkipMap::new(),
            bloom: BloomFilter::new(bloom_bits),
            size_bytes: AtomicU64::new(0),
            write_lock: Mutex::new(()),
        }
    }

    /// Insert or replace the value for a key
    pub fn upsert(&self, key: Bytes, data: Bytes) {
        self.apply(key, || Value::present(data));
    }

    /// Record a deletion of a key
    pub fn remove(&self, key: Bytes) {
        self.apply(key, Value::tombstone);
    }

    // Timestamps are taken under the write lock so the last writer of a key
    // always holds the newest version.
    fn apply<F>(&self, key: Bytes, make: F)
    where
        F: FnOnce() -> Value,
    {
        let _guard = self.write_lock.lock();

        let previous = self.data.get(&key);
        let value = make();

        let new_len = value.payload_len() as u64;
        match &previous {
            None => self.grow(key.len() as u64 + new_len),
            Some(entry) => {
                let old_len = entry.value().payload_len() as u64;
                if new_len >= old_len {
                    self.grow(new_len - old_len);
                } else {
                    self.size_bytes.fetch_sub(old_len - new_len, Ordering::Relaxed);
                }
            }
        }
        drop(previous);

        self.bloom.insert(&key);
        self.data.insert(key, value);
    }

    /// Look up the stored version of a key
    pub fn get(&self, key: &[u8]) -> Option<Value> {
        if !self.bloom.might_contain(key) {
            return None;
        }
        self.data.get(key).map(|entry| entry.value().clone())
    }

    /// Ascending iterator over cells with keys `>= from`
    pub fn iter_from(self: &Arc<Self>, from: &[u8]) -> MemTableIter {
        MemTableIter {
            table: Arc::clone(self),
            lower: Bound::Included(Bytes::copy_from_slice(from)),
            done: false,
        }
    }

    /// Get the current size in bytes
    pub fn size_in_bytes(&self) -> u64 {
        self.size_bytes.load(Ordering::Relaxed)
    }

    /// Filter over every key written to this table
    pub fn bloom(&self) -> &BloomFilter {
        &self.bloom
    }

    /// Get entry count
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Check if empty
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    fn grow(&self, delta: u64) {
        self.size_bytes.fetch_add(delta, Ordering::Relaxed);
    }
}

/// Lazy ascending cursor over a MemTable.
///
/// Owns a handle on the table and re-seeks past the last returned key on each
/// step, so it stays valid while writers keep inserting.
pub struct MemTableIter {
    table: Arc<MemTable>,
    lower: Bound<Bytes>,
    done: bool,
}

impl Iterator for MemTableIter {
    type Item = Cell;

    fn next(&mut self) -> Option<Cell> {
        if self.done {
            return None;
        }

        let bound = match &self.lower {
            Bound::Included(key) => Bound::Included(key.as_ref()),
            Bound::Excluded(key) => Bound::Excluded(key.as_ref()),
            Bound::Unbounded => Bound::Unbounded,
        };

        match self.table.data.lower_bound(bound) {
            Some(entry) => {
                let cell = Cell::new(entry.key().clone(), entry.value().clone());
                self.lower = Bound::Excluded(cell.key.clone());
                Some(cell)
            }
            None => {
                self.done = true;
                None
            }
        }
    }
}
