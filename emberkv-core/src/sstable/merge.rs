//! K-way merge over sorted cell sources.
//!
//! Produces cells in ascending key order with one cell per key: the version
//! with the highest timestamp. The same primitive assembles read views, flush
//! input and compaction input.

use crate::{Cell, EmberError, Result};
use std::cmp::Ordering;
use std::collections::{BinaryHeap, VecDeque};

/// A sorted, duplicate-free source of cells
pub type CellIterator = Box<dyn Iterator<Item = Result<Cell>> + Send>;

/// Head cell of one source, ordered for a max-heap
struct HeapEntry {
    cell: Cell,
    /// Index into `sources`
    source: usize,
}

impl PartialEq for HeapEntry {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for HeapEntry {}

impl PartialOrd for HeapEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for HeapEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        // BinaryHeap pops the greatest entry: smallest key first, newest
        // version first, and on a full tie the later source.
        other
            .cell
            .cmp(&self.cell)
            .then_with(|| self.source.cmp(&other.source))
    }
}

/// Merges several sorted sources into one sorted, collapsed stream
pub struct MergeIterator {
    sources: Vec<CellIterator>,
    heap: BinaryHeap<HeapEntry>,
    errors: VecDeque<EmberError>,
}

impl MergeIterator {
    /// Create a merge over `sources`; on equal versions later sources win
    pub fn new(sources: Vec<CellIterator>) -> Self {
        let mut merge = Self {
            heap: BinaryHeap::with_capacity(sources.len()),
            sources,
            errors: VecDeque::new(),
        };
        for source in 0..merge.sources.len() {
            merge.advance(source);
        }
        merge
    }

    fn advance(&mut self, source: usize) {
        match self.sources[source].next() {
            Some(Ok(cell)) => self.heap.push(HeapEntry { cell, source }),
            Some(Err(e)) => self.errors.push_back(e),
            None => {}
        }
    }
}

impl Iterator for MergeIterator {
    type Item = Result<Cell>;

    fn next(&mut self) -> Option<Result<Cell>> {
        if let Some(e) = self.errors.pop_front() {
            return Some(Err(e));
        }

        let top = self.heap.pop()?;
        self.advance(top.source);

        // Older versions of the same key sit right behind the newest one
        while let Some(peek) = self.heap.peek() {
            if peek.cell.key != top.cell.key {
                break;
            }
            if let Some(older) = self.heap.pop() {
                self.advance(older.source);
            }
        }

        if let Some(e) = self.errors.pop_front() {
            return Some(Err(e));
        }
        Some(Ok(top.cell))
    }
}
