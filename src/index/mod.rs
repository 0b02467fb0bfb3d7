//! Crash-safe key index.
//!
//! Maps `(table, key)` to the byte range holding the key's record. Each
//! table has its own [`TableIndex`]: sharded in-memory maps, a WAL written
//! in the background and a periodic snapshot. Tables are opened lazily on
//! first access and kept for the lifetime of the [`KeyIndex`].

pub mod shard;
pub mod snapshot;
pub mod table;

pub use table::TableIndex;

use crate::config::Options;
use crate::error::{Error, Result};
use crate::fs_util::sanitize_name;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Location of a record: `[start, end)` in block file `file`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct IndexEntry {
    /// Table whose block file holds the record
    pub file: String,
    /// First byte
    pub start: u64,
    /// One past the last byte
    pub end: u64,
}

impl IndexEntry {
    /// Creates an entry for `[start, end)` of `file`.
    pub fn new(file: impl Into<String>, start: u64, end: u64) -> Self {
        Self { file: file.into(), start, end }
    }

    /// Length of the range in bytes.
    pub fn len(&self) -> u64 {
        self.end.saturating_sub(self.start)
    }

    /// Returns true for a zero-length range.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Counters exposed for monitoring.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IndexStats {
    /// Number of open table indexes
    pub tables: usize,
    /// Live keys across all open tables
    pub keys: usize,
    /// Shard lock acquisitions slower than 100µs
    pub slow_lock_waits: u64,
    /// Overwrites whose old range was released
    pub defrag_frees: u64,
    /// Overwrites that landed on the same range, nothing to release
    pub defrag_skips: u64,
}

/// Registry of per-table indexes.
pub struct KeyIndex {
    maps_dir: PathBuf,
    options: Options,
    tables: RwLock<HashMap<String, Arc<TableIndex>>>,
    defrag_frees: AtomicU64,
    defrag_skips: AtomicU64,
}

impl KeyIndex {
    /// Creates a registry rooted at the `maps/` directory.
    pub fn new(maps_dir: impl Into<PathBuf>, options: Options) -> Self {
        Self {
            maps_dir: maps_dir.into(),
            options,
            tables: RwLock::new(HashMap::new()),
            defrag_frees: AtomicU64::new(0),
            defrag_skips: AtomicU64::new(0),
        }
    }

    /// Returns the index of `table`, opening and recovering it on first use.
    ///
    /// Tables are keyed by their sanitized name, the name their files live
    /// under, so two spellings of one directory share one index.
    pub fn table(&self, table: &str) -> Result<Arc<TableIndex>> {
        if table.trim().is_empty() {
            return Err(Error::invalid_argument("table name cannot be empty"));
        }
        let name = sanitize_name(table);
        if let Some(index) = self.tables.read().get(&name) {
            return Ok(Arc::clone(index));
        }

        let mut tables = self.tables.write();
        if let Some(index) = tables.get(&name) {
            return Ok(Arc::clone(index));
        }
        let index = TableIndex::open(&self.maps_dir, &name, &self.options)?;
        tables.insert(name, Arc::clone(&index));
        Ok(index)
    }

    /// Stores a location, returning the one it replaced.
    pub fn save(&self, table: &str, key: &str, entry: IndexEntry) -> Result<Option<IndexEntry>> {
        self.table(table)?.save(key, entry)
    }

    /// Removes a key, returning its last location.
    pub fn remove(&self, table: &str, key: &str) -> Result<Option<IndexEntry>> {
        self.table(table)?.remove(key)
    }

    /// Looks up a key.
    pub fn get(&self, table: &str, key: &str) -> Result<IndexEntry> {
        self.table(table)?
            .get(key)
            .ok_or_else(|| Error::not_found(format!("key {:?} in table {:?}", key, table)))
    }

    /// Keys of `table` matching `pattern`, at most `max` (0 = unlimited).
    pub fn keys_by_regex(&self, table: &str, pattern: &str, max: usize) -> Result<Vec<String>> {
        self.table(table)?.keys_by_regex(pattern, max)
    }

    fn open_tables(&self) -> Vec<Arc<TableIndex>> {
        self.tables.read().values().cloned().collect()
    }

    /// Snapshots every open table.
    pub fn snapshot_all(&self) -> Result<()> {
        for index in self.open_tables() {
            index.snapshot()?;
        }
        Ok(())
    }

    /// Flushes and syncs the WAL of every open table.
    pub fn flush_all(&self) -> Result<()> {
        for index in self.open_tables() {
            index.flush()?;
        }
        Ok(())
    }

    /// Counts an overwrite whose old range was released.
    pub fn record_defrag_free(&self) {
        self.defrag_frees.fetch_add(1, Ordering::Relaxed);
    }

    /// Counts an overwrite that kept its range.
    pub fn record_defrag_skip(&self) {
        self.defrag_skips.fetch_add(1, Ordering::Relaxed);
    }

    /// Returns counters over all open tables.
    pub fn stats(&self) -> IndexStats {
        let tables = self.open_tables();
        IndexStats {
            tables: tables.len(),
            keys: tables.iter().map(|t| t.len()).sum(),
            slow_lock_waits: tables.iter().map(|t| t.slow_lock_waits()).sum(),
            defrag_frees: self.defrag_frees.load(Ordering::Relaxed),
            defrag_skips: self.defrag_skips.load(Ordering::Relaxed),
        }
    }

    /// Closes every table; the first error is returned after all are tried.
    pub fn close(&self) -> Result<()> {
        let tables: Vec<_> = self.tables.write().drain().map(|(_, t)| t).collect();
        let mut first_err = None;
        for index in tables {
            if let Err(e) = index.close() {
                log::error!("Failed to close index of {}: {}", index.name(), e);
                first_err.get_or_insert(e);
            }
        }
        first_err.map_or(Ok(()), Err)
    }
}
