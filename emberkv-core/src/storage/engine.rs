//! Storage engine - top-level coordinator

use super::{flush, StorageConfig};
use crate::compaction::{self, CompactionResult};
use crate::pool::{PoolConfig, TablePool};
use crate::sstable::{is_temp_path, parse_table_path, CellIterator, MergeIterator, SSTableReader};
use crate::{EmberError, Result, Value};
use bytes::Bytes;
use crossbeam_skiplist::SkipMap;
use parking_lot::Mutex;
use std::fs;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use tracing::{error, info, warn};

/// State shared between the engine handle and its flush worker
pub(crate) struct EngineInner {
    pub(crate) config: StorageConfig,
    pub(crate) pool: TablePool,
    /// On-disk tables keyed by generation
    pub(crate) tables: SkipMap<u64, Arc<SSTableReader>>,
    /// Serializes compaction runs
    pub(crate) compaction_lock: Mutex<()>,
}

/// EmberKV storage engine
pub struct StorageEngine {
    inner: Arc<EngineInner>,
    flusher: Mutex<Option<JoinHandle<Result<()>>>>,
}

impl StorageEngine {
    /// Open (or create) the store in `config.data_dir`
    pub fn open(config: StorageConfig) -> Result<Self> {
        config.validate()?;
        fs::create_dir_all(&config.data_dir)?;

        let tables = SkipMap::new();
        let mut max_generation = 0;

        for entry in fs::read_dir(&config.data_dir)? {
            let path = entry?.path();

            if is_temp_path(&path) {
                warn!("Removing unfinished table {:?}", path);
                if let Err(e) = fs::remove_file(&path) {
                    warn!("Failed to remove {:?}: {}", path, e);
                }
                continue;
            }

            let Some((generation, _)) = parse_table_path(&path) else {
                continue;
            };
            // Even an unreadable table's generation must never be reused
            max_generation = max_generation.max(generation);

            match SSTableReader::open(&path) {
                Ok(reader) => {
                    tables.insert(generation, Arc::new(reader));
                }
                Err(e) => warn!("Failed to open SSTable {:?}: {}", path, e),
            }
        }

        let pool = TablePool::new(
            PoolConfig {
                flush_threshold_bytes: config.flush_threshold_bytes,
                queue_capacity: config.flush_queue_capacity,
                bloom_bits: config.bloom_filter_bits,
            },
            max_generation + 1,
        );

        info!(
            "Opened storage at {:?} with {} tables, next generation {}",
            config.data_dir,
            tables.len(),
            max_generation + 1
        );

        let inner = Arc::new(EngineInner {
            config,
            pool,
            tables,
            compaction_lock: Mutex::new(()),
        });

        let worker_inner = Arc::clone(&inner);
        let queue = inner.pool.flush_queue();
        let handle = thread::Builder::new()
            .name("emberkv-flush".into())
            .spawn(move || flush::run(worker_inner, queue))?;

        Ok(Self {
            inner,
            flusher: Mutex::new(Some(handle)),
        })
    }

    /// Latest live value for `key`
    pub fn get(&self, key: &[u8]) -> Result<Option<Bytes>> {
        Ok(match self.get_value(key)? {
            Value::Present { data, .. } => Some(data),
            Value::Tombstone { .. } | Value::Absent => None,
        })
    }

    /// Newest version of `key` across memory and disk, tombstones included
    pub fn get_value(&self, key: &[u8]) -> Result<Value> {
        // Memory before disk: a concurrent flush only moves data towards disk
        let mut versions = vec![self.inner.pool.get(key)];
        for entry in self.inner.tables.iter() {
            if let Some(cell) = entry.value().get(key)? {
                versions.push(cell.value);
            }
        }
        Ok(Value::newest(versions))
    }

    /// Live pairs with `from <= key < to` (unbounded above when `to` is `None`)
    pub fn range(&self, from: &[u8], to: Option<&[u8]>) -> Result<RangeIter> {
        let memory = self.inner.pool.iter_from(from);

        let mut sources: Vec<CellIterator> = Vec::new();
        for entry in self.inner.tables.iter() {
            sources.push(Box::new(entry.value().iter_from(from)?));
        }
        // Last source wins ties: memory is never older than disk
        sources.push(Box::new(memory));

        Ok(RangeIter {
            merge: MergeIterator::new(sources),
            to: to.map(Bytes::copy_from_slice),
            done: false,
        })
    }

    /// Insert or replace a value
    pub fn upsert(&self, key: impl Into<Bytes>, value: impl Into<Bytes>) -> Result<()> {
        self.inner.pool.upsert(key.into(), value.into())
    }

    /// Delete a key by writing a tombstone
    pub fn remove(&self, key: impl Into<Bytes>) -> Result<()> {
        self.inner.pool.remove(key.into())
    }

    /// Merge every on-disk table into one
    pub fn compact(&self) -> Result<Option<CompactionResult>> {
        compaction::compact_all(&self.inner)
    }

    /// Rotate the active table and wait until it is on disk
    pub fn flush(&self) -> Result<()> {
        let Some(generation) = self.inner.pool.force_rotate()? else {
            return Ok(());
        };
        if self
            .inner
            .pool
            .wait_flushed(generation, self.inner.config.flush_timeout())
        {
            Ok(())
        } else {
            Err(EmberError::FlushTimeout(generation))
        }
    }

    /// Stop accepting writes and wait for everything in memory to reach disk.
    ///
    /// Idempotent; a second call returns immediately.
    pub fn close(&self) -> Result<()> {
        self.inner.pool.close()?;

        let Some(handle) = self.flusher.lock().take() else {
            return Ok(());
        };
        match handle.join() {
            Ok(result) => result,
            Err(_) => Err(EmberError::Internal("Flush worker panicked".into())),
        }
    }

    /// Generations of the registered on-disk tables, ascending
    pub fn disk_generations(&self) -> Vec<u64> {
        self.inner.tables.iter().map(|entry| *entry.key()).collect()
    }

    pub fn config(&self) -> &StorageConfig {
        &self.inner.config
    }

    /// Get engine statistics
    pub fn stats(&self) -> EngineStats {
        let mut disk_rows = 0;
        let mut disk_bytes = 0;
        let mut disk_tables = 0;
        for entry in self.inner.tables.iter() {
            let meta = entry.value().meta();
            disk_tables += 1;
            disk_rows += meta.rows;
            disk_bytes += meta.file_size;
        }

        let pool = &self.inner.pool;
        EngineStats {
            disk_tables,
            disk_rows,
            disk_bytes,
            pending_tables: pool.pending_count(),
            memory_bytes: pool.size_in_bytes(),
            active_generation: pool.active_generation(),
            last_flushed_generation: pool.last_flushed_generation(),
            closed: pool.is_closed(),
        }
    }
}

impl Drop for StorageEngine {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            error!("Failed to close storage engine: {}", e);
        }
    }
}

/// Sorted live pairs produced by [`StorageEngine::range`]
pub struct RangeIter {
    merge: MergeIterator,
    to: Option<Bytes>,
    done: bool,
}

impl Iterator for RangeIter {
    type Item = Result<(Bytes, Bytes)>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        loop {
            let cell = match self.merge.next()? {
                Ok(cell) => cell,
                Err(e) => return Some(Err(e)),
            };
            if self.to.as_ref().is_some_and(|to| cell.key >= *to) {
                self.done = true;
                return None;
            }
            if let Value::Present { data, .. } = cell.value {
                return Some(Ok((cell.key, data)));
            }
        }
    }
}

/// Storage engine statistics
#[derive(Debug, Clone)]
pub struct EngineStats {
    pub disk_tables: usize,
    pub disk_rows: u64,
    pub disk_bytes: u64,
    pub pending_tables: usize,
    /// Bytes held by the active and pending MemTables
    pub memory_bytes: u64,
    pub active_generation: u64,
    pub last_flushed_generation: u64,
    pub closed: bool,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sstable::{table_file_name, temp_file_name, TableFormat};
    use rand::Rng;
    use std::collections::BTreeMap;
    use std::path::Path;
    use std::time::{Duration, Instant};
    use tempfile::TempDir;

    fn config(dir: &Path) -> StorageConfig {
        StorageConfig {
            data_dir: dir.to_path_buf(),
            bloom_filter_bits: 4096,
            flush_retry_interval_ms: 20,
            flush_timeout_ms: 5_000,
            ..StorageConfig::new(dir)
        }
    }

    fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            if condition() {
                return true;
            }
            thread::sleep(Duration::from_millis(5));
        }
        condition()
    }

    fn table_files(dir: &Path) -> Vec<String> {
        let mut names: Vec<String> = fs::read_dir(dir)
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .filter(|name| name.starts_with("table_"))
            .collect();
        names.sort();
        names
    }

    fn scan(engine: &StorageEngine, from: &[u8], to: Option<&[u8]>) -> Vec<(Bytes, Bytes)> {
        engine.range(from, to).unwrap().map(|r| r.unwrap()).collect()
    }

    #[test]
    fn test_newer_write_wins_after_flush() {
        let temp_dir = TempDir::new().unwrap();
        let engine = StorageEngine::open(config(temp_dir.path())).unwrap();

        engine.upsert("a", "1").unwrap();
        engine.upsert("a", "2").unwrap();
        engine.flush().unwrap();

        assert_eq!(engine.get(b"a").unwrap(), Some(Bytes::from("2")));
        assert_eq!(engine.disk_generations(), vec![1]);
        assert_eq!(engine.stats().pending_tables, 0);
    }

    #[test]
    fn test_tombstone_survives_flush_and_compaction() {
        let temp_dir = TempDir::new().unwrap();
        let engine = StorageEngine::open(config(temp_dir.path())).unwrap();

        engine.upsert("b", "x").unwrap();
        engine.flush().unwrap();
        engine.remove("b").unwrap();
        engine.flush().unwrap();
        assert_eq!(engine.get(b"b").unwrap(), None);
        assert!(engine.get_value(b"b").unwrap().is_tombstone());

        let result = engine.compact().unwrap().unwrap();
        assert_eq!(result.inputs, vec![1, 2]);
        assert_eq!(engine.get(b"b").unwrap(), None);
        assert!(engine.get_value(b"b").unwrap().is_tombstone());
    }

    #[test]
    fn test_missing_key() {
        let temp_dir = TempDir::new().unwrap();
        let engine = StorageEngine::open(config(temp_dir.path())).unwrap();

        assert_eq!(engine.get(b"nope").unwrap(), None);
        assert!(engine.get_value(b"nope").unwrap().is_absent());
    }

    #[test]
    fn test_rotation_flushes_in_background() {
        let temp_dir = TempDir::new().unwrap();
        let engine = StorageEngine::open(StorageConfig {
            flush_threshold_bytes: 256,
            ..config(temp_dir.path())
        })
        .unwrap();

        for i in 0..200 {
            engine.upsert(format!("key-{:04}", i), format!("value-{}", i)).unwrap();
        }

        // Everything written is readable whether or not it reached disk
        for i in 0..200 {
            let key = format!("key-{:04}", i);
            assert_eq!(
                engine.get(key.as_bytes()).unwrap(),
                Some(Bytes::from(format!("value-{}", i)))
            );
        }
        assert!(wait_until(Duration::from_secs(5), || engine.stats().pending_tables == 0));
        assert!(engine.stats().last_flushed_generation > 1);
    }

    #[test]
    fn test_compaction_merges_into_one_table() {
        let temp_dir = TempDir::new().unwrap();
        let engine = StorageEngine::open(StorageConfig {
            table_format: TableFormat::Plain,
            ..config(temp_dir.path())
        })
        .unwrap();

        for round in 0..3 {
            for i in 0..50 {
                engine.upsert(format!("k{:03}", i), format!("r{}-{}", round, i)).unwrap();
            }
            engine.remove(format!("k{:03}", round)).unwrap();
            engine.flush().unwrap();
        }
        assert_eq!(engine.disk_generations(), vec![1, 2, 3]);
        let before = scan(&engine, b"", None);

        let result = engine.compact().unwrap().unwrap();
        assert_eq!(result.output.generation, 5);
        assert_eq!(engine.disk_generations(), vec![5]);
        assert_eq!(
            table_files(temp_dir.path()),
            vec![table_file_name(5, TableFormat::Plain)]
        );
        assert_eq!(scan(&engine, b"", None), before);
        // Only the key deleted in the last round stays deleted
        assert_eq!(before.len(), 49);
        assert_eq!(before[0], (Bytes::from("k000"), Bytes::from("r2-0")));
        assert_eq!(engine.get(b"k002").unwrap(), None);

        // Nothing left to merge
        assert!(engine.compact().unwrap().is_none());
    }

    #[test]
    fn test_compaction_triggered_by_table_count() {
        let temp_dir = TempDir::new().unwrap();
        let engine = StorageEngine::open(StorageConfig {
            max_disk_tables: 2,
            ..config(temp_dir.path())
        })
        .unwrap();

        for round in 0..3 {
            engine.upsert(format!("key-{}", round), "v").unwrap();
            engine.flush().unwrap();
        }

        assert!(wait_until(Duration::from_secs(5), || engine.disk_generations().len() == 1));
        for round in 0..3 {
            let key = format!("key-{}", round);
            assert_eq!(engine.get(key.as_bytes()).unwrap(), Some(Bytes::from("v")));
        }
    }

    #[test]
    fn test_range_bounds_and_tombstones() {
        let temp_dir = TempDir::new().unwrap();
        let engine = StorageEngine::open(config(temp_dir.path())).unwrap();

        for key in ["a", "b", "c", "d", "e"] {
            engine.upsert(key, key.to_uppercase()).unwrap();
        }
        engine.flush().unwrap();
        engine.remove("c").unwrap();
        engine.upsert("b", "B2").unwrap();

        let keys = |pairs: Vec<(Bytes, Bytes)>| -> Vec<Bytes> { pairs.into_iter().map(|p| p.0).collect() };
        assert_eq!(
            keys(scan(&engine, b"b", Some(b"e".as_slice()))),
            vec![Bytes::from("b"), Bytes::from("d")]
        );
        assert_eq!(
            scan(&engine, b"a", Some(b"c".as_slice())),
            vec![
                (Bytes::from("a"), Bytes::from("A")),
                (Bytes::from("b"), Bytes::from("B2")),
            ]
        );
        assert_eq!(keys(scan(&engine, b"bb", None)).len(), 2);
        assert!(scan(&engine, b"c", Some(b"c".as_slice())).is_empty());
        assert!(scan(&engine, b"z", None).is_empty());
    }

    #[test]
    fn test_reopen_recovers_tables() {
        let temp_dir = TempDir::new().unwrap();
        {
            let engine = StorageEngine::open(config(temp_dir.path())).unwrap();
            engine.upsert("persisted", "yes").unwrap();
            engine.flush().unwrap();
            engine.upsert("unflushed", "also").unwrap();
            engine.remove("persisted-then-gone").unwrap();
            engine.close().unwrap();
        }

        let engine = StorageEngine::open(config(temp_dir.path())).unwrap();
        assert_eq!(engine.get(b"persisted").unwrap(), Some(Bytes::from("yes")));
        assert_eq!(engine.get(b"unflushed").unwrap(), Some(Bytes::from("also")));
        assert_eq!(engine.disk_generations(), vec![1, 2]);
        assert_eq!(engine.stats().active_generation, 3);
    }

    #[test]
    fn test_empty_close_writes_nothing() {
        let temp_dir = TempDir::new().unwrap();
        let engine = StorageEngine::open(config(temp_dir.path())).unwrap();
        engine.close().unwrap();
        assert!(table_files(temp_dir.path()).is_empty());
    }

    #[test]
    fn test_write_after_close_fails() {
        let temp_dir = TempDir::new().unwrap();
        let engine = StorageEngine::open(config(temp_dir.path())).unwrap();
        engine.upsert("k", "v").unwrap();
        engine.close().unwrap();

        assert!(matches!(engine.upsert("k", "v2"), Err(EmberError::Closed)));
        assert!(matches!(engine.remove("k"), Err(EmberError::Closed)));
        // Reads still work and close is idempotent
        assert_eq!(engine.get(b"k").unwrap(), Some(Bytes::from("v")));
        engine.close().unwrap();
        assert!(engine.stats().closed);
    }

    #[test]
    fn test_open_removes_stale_temp_files() {
        let temp_dir = TempDir::new().unwrap();
        let stale = temp_dir.path().join(temp_file_name(7));
        fs::write(&stale, b"half written").unwrap();
        fs::write(temp_dir.path().join("notes.txt"), b"ignored").unwrap();

        let engine = StorageEngine::open(config(temp_dir.path())).unwrap();
        assert!(!stale.exists());
        assert!(temp_dir.path().join("notes.txt").exists());
        assert!(engine.disk_generations().is_empty());
    }

    #[test]
    fn test_unreadable_table_is_skipped_but_generation_reserved() {
        let temp_dir = TempDir::new().unwrap();
        fs::write(
            temp_dir.path().join(table_file_name(9, TableFormat::Plain)),
            b"bad",
        )
        .unwrap();

        let engine = StorageEngine::open(config(temp_dir.path())).unwrap();
        assert!(engine.disk_generations().is_empty());
        assert_eq!(engine.stats().active_generation, 10);
    }

    #[test]
    fn test_invalid_config_rejected() {
        let temp_dir = TempDir::new().unwrap();
        let result = StorageEngine::open(StorageConfig {
            flush_queue_capacity: 0,
            ..config(temp_dir.path())
        });
        assert!(matches!(result, Err(EmberError::Config(_))));
    }

    #[test]
    fn test_failed_flush_is_retried() {
        let temp_dir = TempDir::new().unwrap();
        let data_dir = temp_dir.path().join("data");
        let engine = StorageEngine::open(StorageConfig {
            flush_timeout_ms: 100,
            ..config(&data_dir)
        })
        .unwrap();

        fs::remove_dir_all(&data_dir).unwrap();
        engine.upsert("k", "v").unwrap();
        assert!(matches!(engine.flush(), Err(EmberError::FlushTimeout(1))));

        // Still readable from memory while the flush keeps failing
        assert_eq!(engine.get(b"k").unwrap(), Some(Bytes::from("v")));
        assert_eq!(engine.stats().pending_tables, 1);
        assert_eq!(engine.stats().last_flushed_generation, 0);

        fs::create_dir_all(&data_dir).unwrap();
        assert!(wait_until(Duration::from_secs(5), || engine.stats().pending_tables == 0));
        assert_eq!(engine.disk_generations(), vec![1]);
        assert_eq!(engine.get(b"k").unwrap(), Some(Bytes::from("v")));
    }

    #[test]
    fn test_matches_model_across_restarts() {
        let temp_dir = TempDir::new().unwrap();
        let settings = StorageConfig {
            flush_threshold_bytes: 512,
            max_disk_tables: 4,
            ..config(temp_dir.path())
        };
        let mut rng = rand::thread_rng();
        let mut model: BTreeMap<Bytes, Bytes> = BTreeMap::new();

        for _ in 0..3 {
            let engine = StorageEngine::open(settings.clone()).unwrap();
            for _ in 0..500 {
                let key = Bytes::from(format!("key-{:03}", rng.gen_range(0..120)));
                if rng.gen_bool(0.25) {
                    engine.remove(key.clone()).unwrap();
                    model.remove(&key);
                } else {
                    let value = Bytes::from(format!("v{}", rng.gen::<u32>()));
                    engine.upsert(key.clone(), value.clone()).unwrap();
                    model.insert(key, value);
                }
            }

            let expected: Vec<(Bytes, Bytes)> =
                model.iter().map(|(k, v)| (k.clone(), v.clone())).collect();
            assert_eq!(scan(&engine, b"", None), expected);
            for i in 0..120 {
                let key = format!("key-{:03}", i);
                assert_eq!(
                    engine.get(key.as_bytes()).unwrap().as_ref(),
                    model.get(key.as_bytes())
                );
            }
            engine.close().unwrap();
        }
    }

    #[test]
    fn test_concurrent_writers_and_readers() {
        let temp_dir = TempDir::new().unwrap();
        let engine = Arc::new(
            StorageEngine::open(StorageConfig {
                flush_threshold_bytes: 1024,
                max_disk_tables: 3,
                ..config(temp_dir.path())
            })
            .unwrap(),
        );

        let writers: Vec<_> = (0..4)
            .map(|t| {
                let engine = Arc::clone(&engine);
                thread::spawn(move || {
                    for i in 0..300 {
                        engine.upsert(format!("t{}-{:04}", t, i), format!("{}", i)).unwrap();
                    }
                })
            })
            .collect();

        let reader = {
            let engine = Arc::clone(&engine);
            thread::spawn(move || {
                for _ in 0..50 {
                    let pairs: Vec<_> = engine.range(b"", None).unwrap().map(|r| r.unwrap()).collect();
                    assert!(pairs.windows(2).all(|w| w[0].0 < w[1].0));
                }
            })
        };

        for writer in writers {
            writer.join().unwrap();
        }
        reader.join().unwrap();

        assert_eq!(scan(&engine, b"", None).len(), 1200);
        assert_eq!(
            engine.get(b"t2-0299").unwrap(),
            Some(Bytes::from("299"))
        );
    }

    #[test]
    fn test_acknowledged_writes_survive_close_under_backpressure() {
        let temp_dir = TempDir::new().unwrap();
        let settings = StorageConfig {
            flush_threshold_bytes: 1,
            flush_queue_capacity: 1,
            ..config(temp_dir.path())
        };
        let engine = Arc::new(StorageEngine::open(settings.clone()).unwrap());

        let writers: Vec<_> = (0..4)
            .map(|t| {
                let engine = Arc::clone(&engine);
                thread::spawn(move || {
                    let mut acked = Vec::new();
                    for i in 0..2000 {
                        let key = format!("w{}-{:05}", t, i);
                        match engine.upsert(key.clone(), key.clone()) {
                            Ok(()) => acked.push(key),
                            Err(EmberError::Closed) => break,
                            Err(e) => panic!("unexpected write error: {}", e),
                        }
                    }
                    acked
                })
            })
            .collect();

        thread::sleep(Duration::from_millis(30));
        engine.close().unwrap();

        let acked: Vec<String> = writers
            .into_iter()
            .flat_map(|w| w.join().unwrap())
            .collect();
        assert_eq!(engine.stats().pending_tables, 0);
        drop(engine);

        let engine = StorageEngine::open(settings).unwrap();
        for key in &acked {
            assert_eq!(
                engine.get(key.as_bytes()).unwrap(),
                Some(Bytes::from(key.clone())),
                "lost {}",
                key
            );
        }
    }

    #[test]
    fn test_reads_stable_across_flush_compaction_and_reopen() {
        let temp_dir = TempDir::new().unwrap();
        let engine = StorageEngine::open(config(temp_dir.path())).unwrap();

        engine.upsert("kept", "value").unwrap();
        engine.upsert("gone", "soon").unwrap();
        engine.remove("gone").unwrap();
        engine.flush().unwrap();

        let kept = engine.get_value(b"kept").unwrap();
        let gone = engine.get_value(b"gone").unwrap();
        assert_eq!(kept.data().unwrap(), "value");
        assert!(gone.is_tombstone());
        assert_eq!(engine.get_value(b"kept").unwrap(), kept);
        assert_eq!(engine.get_value(b"gone").unwrap(), gone);

        engine.upsert("other", "1").unwrap();
        engine.flush().unwrap();
        engine.compact().unwrap().unwrap();
        assert_eq!(engine.get_value(b"kept").unwrap(), kept);
        assert_eq!(engine.get_value(b"gone").unwrap(), gone);
        engine.close().unwrap();
        drop(engine);

        let engine = StorageEngine::open(config(temp_dir.path())).unwrap();
        assert_eq!(engine.get_value(b"kept").unwrap(), kept);
        assert_eq!(engine.get_value(b"gone").unwrap(), gone);
    }
}
