//! # TsunamiDB - An Embedded Block-File Key-Value Engine
//!
//! TsunamiDB maps string keys, scoped by table, to binary payloads stored in
//! shared block files. Freed byte ranges are reused by later writes, and the
//! key index survives crashes through a write-ahead log and periodic
//! snapshots.
//!
//! ## Architecture
//!
//! - **Envelope codec**: self-describing wrapper around every stored record
//! - **Block file workers**: one thread per file, batching all of its I/O
//! - **Free-block registry**: per-table best-fit allocator over freed ranges
//! - **Key index**: sharded map from key to byte range, with WAL and snapshots
//! - **Incremental tables**: fixed-size record files addressed by row id,
//!   with an optional secondary index from entry keys to rows
//!
//! ## On-disk layout
//!
//! ```text
//! <root>/data/<table>                   block files
//! <root>/inc_tables/<file>.tbl          incremental tables
//! <root>/inc_tables/<file>.tbl.idx      entry-key index
//! <root>/maps/<table>/index.snap        key index snapshot
//! <root>/maps/<table>/index.wal         key index WAL
//! <root>/maps/<table>/free_blocks.json  free list
//! ```
//!
//! ## Example Usage
//!
//! ```rust,no_run
//! use tsunamidb::{IncRead, IncSaveOptions, Options, DB};
//!
//! # fn main() -> Result<(), tsunamidb::Error> {
//! let db = DB::open("./db", Options::default())?;
//!
//! db.save("users", "alice", b"{\"age\":30}")?;
//! let value = db.read("users", "alice")?;
//! assert_eq!(value, b"{\"age\":30}");
//! db.free("users", "alice")?;
//!
//! // Incremental tables
//! let opts = IncSaveOptions::default().max_entry_size(64);
//! db.save_incremental("chat", "room-1", b"hello", opts)?;
//! let newest = db.read_incremental("chat", "room-1", IncRead::Last(10))?;
//! assert_eq!(newest[0].data, b"hello");
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]

// Module declarations
pub mod codec;
pub mod config;
pub mod error;
pub mod freelist;
mod fs_util;
pub mod incindex;
pub mod index;
pub mod wal;
pub mod worker;

// Re-exports
pub use config::Options;
pub use error::{Error, Result};
pub use fs_util::sanitize_name;
pub use index::{IndexEntry, IndexStats};
pub use worker::{CountFrom, IncWriteMode};

use codec::{check_entry_size, encode_inc_entry, skip_inc_entry, IncTableMeta};
use freelist::FreeBlockRegistry;
use incindex::IncIndexRegistry;
use index::KeyIndex;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use worker::{FileWorkerPool, IncReadKind, RawIncRecord};

/// Directory of block files under the database root.
pub const DATA_DIR: &str = "data";
/// Directory of incremental tables under the database root.
pub const INC_TABLES_DIR: &str = "inc_tables";
/// Directory of key indexes and free lists under the database root.
pub const MAPS_DIR: &str = "maps";

/// Options for [`DB::save_incremental`].
#[derive(Debug, Clone, Default)]
pub struct IncSaveOptions {
    /// Record size used when the table is created. Required on first save;
    /// ignored (with a warning) afterwards if it differs.
    pub max_entry_size: Option<u64>,
    /// Custom row id. `None` appends.
    pub id: Option<u64>,
    /// Placement of a record with a custom id.
    pub mode: IncWriteMode,
    /// Which end `id` counts from.
    pub count_from: CountFrom,
    /// Entry key bound to the written row in the secondary index.
    pub entry_key: Option<String>,
}

impl IncSaveOptions {
    /// Sets the record size used when creating the table.
    pub fn max_entry_size(mut self, size: u64) -> Self {
        self.max_entry_size = Some(size);
        self
    }

    /// Writes at a custom id instead of appending.
    pub fn id(mut self, id: u64) -> Self {
        self.id = Some(id);
        self
    }

    /// Sets insert or overwrite placement.
    pub fn mode(mut self, mode: IncWriteMode) -> Self {
        self.mode = mode;
        self
    }

    /// Sets which end the custom id counts from.
    pub fn count_from(mut self, count_from: CountFrom) -> Self {
        self.count_from = count_from;
        self
    }

    /// Binds an entry key to the written row.
    pub fn entry_key(mut self, key: impl Into<String>) -> Self {
        self.entry_key = Some(key.into());
        self
    }
}

/// Outcome of [`DB::save_incremental`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IncSaveResult {
    /// Absolute row id of the written record.
    pub id: u64,
    /// Set when a supplied `max_entry_size` did not match the existing table.
    pub warning: Option<String>,
}

/// Selects records for [`DB::read_incremental`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IncRead {
    /// One record by absolute row id.
    ById(u64),
    /// Up to N newest records, newest first.
    Last(u64),
    /// Up to N oldest records, oldest first.
    First(u64),
    /// The record bound to an entry key.
    ByKey(String),
}

/// A decoded incremental record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IncEntry {
    /// Position in the response for [`IncRead::Last`] (0 = newest),
    /// otherwise the absolute row id.
    pub id: u64,
    /// Absolute row id.
    pub row_id: u64,
    /// Record body; empty for skipped records.
    pub data: Vec<u8>,
    /// Soft-delete marker.
    pub skip: bool,
    /// Next live record hint of a skipped record, 0 if none.
    pub next_pointer: u64,
}

/// Engine-wide counters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DbStats {
    /// Key index counters
    pub index: IndexStats,
    /// Running block file workers
    pub workers: usize,
}

/// The main database handle.
///
/// # Thread Safety
///
/// `DB` is thread-safe and can be shared across threads using `Arc<DB>`.
/// Several handles on different directories can coexist in one process.
pub struct DB {
    /// Database root directory
    path: PathBuf,

    /// Key index over all tables
    index: KeyIndex,

    /// Free space per table
    free_blocks: Arc<FreeBlockRegistry>,

    /// One worker per block file or incremental table
    workers: FileWorkerPool,

    /// Entry-key index of incremental tables
    inc_index: IncIndexRegistry,

    /// Serializes row writes and entry-key updates per incremental table
    inc_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,

    closed: AtomicBool,
}

impl DB {
    /// Opens a database rooted at `path`, recovering key indexes lazily on
    /// first access to each table.
    ///
    /// # Errors
    ///
    /// Returns an error if the options are invalid, or if the directory
    /// layout is missing (with `create_if_missing` off) or cannot be created.
    ///
    /// # Example
    ///
    /// ```rust,no_run
    /// use tsunamidb::{DB, Options};
    ///
    /// # fn main() -> Result<(), tsunamidb::Error> {
    /// let db = DB::open("./my_database", Options::default())?;
    /// # Ok(())
    /// # }
    /// ```
    pub fn open<P: AsRef<Path>>(path: P, options: Options) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        options.validate()?;

        if !path.exists() && !options.create_if_missing {
            return Err(Error::NotFound(format!("Database directory does not exist: {:?}", path)));
        }
        let data_dir = path.join(DATA_DIR);
        let inc_dir = path.join(INC_TABLES_DIR);
        let maps_dir = path.join(MAPS_DIR);
        for dir in [&data_dir, &inc_dir, &maps_dir] {
            std::fs::create_dir_all(dir)?;
        }

        let free_blocks = Arc::new(FreeBlockRegistry::new(&maps_dir));
        let workers = FileWorkerPool::new(data_dir, &inc_dir, Arc::clone(&free_blocks), &options);
        let db = Self {
            path,
            index: KeyIndex::new(maps_dir, options),
            free_blocks,
            workers,
            inc_index: IncIndexRegistry::new(inc_dir),
            inc_locks: Mutex::new(HashMap::new()),
            closed: AtomicBool::new(false),
        };

        log::info!("Opened database at {:?}", db.path);
        Ok(db)
    }

    /// Opens the database at `options.data_dir`.
    pub fn open_default(options: Options) -> Result<Self> {
        let path = options.data_dir.clone();
        Self::open(path, options)
    }

    /// Root directory of this database.
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn check_open(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::InvalidState("database is closed".to_string()));
        }
        Ok(())
    }

    /// Stores `payload` under `key`, reusing freed space of the table when
    /// a block fits.
    pub fn save(&self, table: &str, key: &str, payload: &[u8]) -> Result<()> {
        self.check_open()?;
        validate_name(table, "table")?;
        validate_name(key, "key")?;
        // Entries name the table the way its files are named.
        let table = &sanitize_name(table);

        let (encoded, _) = codec::encode(payload);
        let span = self.workers.write(table, encoded)?;
        let entry = IndexEntry::new(table, span.start, span.end);

        let previous = match self.index.save(table, key, entry.clone()) {
            Ok(previous) => previous,
            Err(e) => {
                // Nothing references the new range.
                if let Err(free_err) = self.mark_free(key, &entry) {
                    log::warn!("Failed to release unindexed range of {}/{}: {}", table, key, free_err);
                }
                return Err(e);
            }
        };

        if let Some(previous) = previous {
            if previous != entry {
                self.mark_free(key, &previous)?;
                self.index.record_defrag_free();
            } else {
                self.index.record_defrag_skip();
            }
        }
        Ok(())
    }

    /// Reads the payload stored under `key`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotFound`] if the key does not exist.
    pub fn read(&self, table: &str, key: &str) -> Result<Vec<u8>> {
        self.check_open()?;
        let entry = self.index.get(table, key)?;
        self.read_entry(&entry)
    }

    /// Byte range currently holding `key`.
    pub fn locate(&self, table: &str, key: &str) -> Result<IndexEntry> {
        self.check_open()?;
        self.index.get(table, key)
    }

    fn read_entry(&self, entry: &IndexEntry) -> Result<Vec<u8>> {
        let raw = self.workers.read(&entry.file, entry.start, entry.end)?;
        Ok(codec::decode(&raw)?.data)
    }

    /// Removes `key` and releases its byte range for reuse.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotFound`] if the key does not exist.
    pub fn free(&self, table: &str, key: &str) -> Result<()> {
        self.check_open()?;
        let entry = self
            .index
            .remove(table, key)?
            .ok_or_else(|| Error::not_found(format!("key {:?} in table {:?}", key, table)))?;
        self.mark_free(key, &entry)
    }

    fn mark_free(&self, key: &str, entry: &IndexEntry) -> Result<()> {
        let registry_key = format!("{}@{}", key, entry.start);
        self.free_blocks.mark_as_free(&registry_key, &entry.file, entry.start, entry.end)
    }

    /// Keys of `table` matching `pattern`; `max == 0` means unlimited.
    pub fn keys_by_regex(&self, table: &str, pattern: &str, max: usize) -> Result<Vec<String>> {
        self.check_open()?;
        self.index.keys_by_regex(table, pattern, max)
    }

    fn load_inc_meta(&self, table: &str, key: &str) -> Result<IncTableMeta> {
        let payload = self.read(table, key)?;
        IncTableMeta::decode(&payload)
    }

    /// Lock guarding the rows and entry keys of one incremental table file.
    fn inc_lock(&self, file_name: &str) -> Arc<Mutex<()>> {
        Arc::clone(self.inc_locks.lock().entry(file_name.to_string()).or_default())
    }

    /// Returns the table descriptor, creating the table on first use.
    fn inc_meta_or_create(
        &self,
        table: &str,
        key: &str,
        max_entry_size: Option<u64>,
    ) -> Result<(IncTableMeta, Option<String>)> {
        match self.load_inc_meta(table, key) {
            Ok(meta) => {
                let warning = max_entry_size.filter(|&size| size != meta.entry_size).map(|size| {
                    format!(
                        "max_entry_size {} does not match existing table ({}); ignored",
                        size, meta.entry_size
                    )
                });
                Ok((meta, warning))
            }
            Err(Error::NotFound(_)) => {
                let entry_size = max_entry_size.ok_or_else(|| {
                    Error::invalid_argument("max_entry_size is required to create an incremental table")
                })?;
                check_entry_size(entry_size)?;
                let meta = IncTableMeta::new(entry_size, inc_file_name(table, key));
                self.save(table, key, &meta.encode())?;
                log::info!("Created incremental table {:?} for {}/{}", meta.file_name, table, key);
                Ok((meta, None))
            }
            Err(e) => Err(e),
        }
    }

    /// Writes one record into the incremental table stored at `(table, key)`.
    ///
    /// Without a custom id the record is appended. With one it is inserted
    /// (shifting later rows) or overwritten in place, per `options.mode`.
    ///
    /// # Errors
    ///
    /// - [`Error::InvalidArgument`] when creating a table without `max_entry_size`,
    ///   or with one above [`codec::MAX_ENTRY_SIZE`]
    /// - [`Error::BodyTooLarge`] when `body` exceeds the table's entry size
    /// - [`Error::IdOutOfRange`] when a custom id is outside the table
    /// - [`Error::DuplicateKey`] when `entry_key` is bound to another row
    pub fn save_incremental(
        &self,
        table: &str,
        key: &str,
        body: &[u8],
        options: IncSaveOptions,
    ) -> Result<IncSaveResult> {
        self.check_open()?;
        let (meta, warning) = self.inc_meta_or_create(table, key, options.max_entry_size)?;
        let record = encode_inc_entry(meta.entry_size, body)?;
        let entry_key = options.entry_key.as_deref().unwrap_or("");

        // Plain appends neither shift rows nor touch entry keys.
        let keyed = options.id.is_some() || !entry_key.is_empty();
        let lock = keyed.then(|| self.inc_lock(&meta.file_name));
        let _guard = lock.as_ref().map(|lock| lock.lock());

        let inserting = options.id.is_some() && options.mode == IncWriteMode::Insert;
        if !entry_key.is_empty() {
            if let Ok(owner) = self.inc_index.lookup(&meta.file_name, entry_key) {
                let taken = match (options.id, options.count_from) {
                    // A fresh row cannot already own the key.
                    (None, _) => true,
                    (Some(_), _) if inserting => true,
                    (Some(id), CountFrom::Bottom) => id != owner,
                    // Top-based targets resolve in the worker; the index rejects them after the write.
                    (Some(_), CountFrom::Top) => false,
                };
                if taken {
                    return Err(Error::DuplicateKey(entry_key.to_string()));
                }
            }
        }

        let span = match options.id {
            None => self.workers.write_inc(&meta.file_name, record, meta.entry_size)?,
            Some(pref_id) => self.workers.write_inc_at(
                &meta.file_name,
                record,
                meta.entry_size,
                pref_id,
                options.count_from,
                options.mode,
            )?,
        };

        if inserting {
            self.inc_index.insert(&meta.file_name, span.id, entry_key)?;
        } else if entry_key.is_empty() {
            // An overwritten row loses the key of the record it replaced.
            self.inc_index.clear(&meta.file_name, span.id)?;
        } else {
            self.inc_index.set(&meta.file_name, span.id, entry_key)?;
        }

        if let Some(warning) = &warning {
            log::warn!("{}/{}: {}", table, key, warning);
        }
        Ok(IncSaveResult { id: span.id, warning })
    }

    /// Reads records of the incremental table stored at `(table, key)`.
    ///
    /// Skipped records are left out of [`IncRead::Last`] and
    /// [`IncRead::First`] results; a single-record read returns them with
    /// `skip` set.
    pub fn read_incremental(&self, table: &str, key: &str, read: IncRead) -> Result<Vec<IncEntry>> {
        self.check_open()?;
        let meta = self.load_inc_meta(table, key)?;
        let lock = matches!(read, IncRead::ByKey(_)).then(|| self.inc_lock(&meta.file_name));
        let _guard = lock.as_ref().map(|lock| lock.lock());
        let (kind, ordinal_ids) = match read {
            IncRead::ById(id) => (IncReadKind::ById(id), false),
            IncRead::ByKey(entry_key) => {
                (IncReadKind::ById(self.inc_index.lookup(&meta.file_name, &entry_key)?), false)
            }
            IncRead::Last(n) => (IncReadKind::Last(n), true),
            IncRead::First(n) => (IncReadKind::First(n), false),
        };
        let single = matches!(kind, IncReadKind::ById(_));

        let raw = self.workers.read_inc(&meta.file_name, meta.entry_size, kind)?;
        let mut entries = Vec::with_capacity(raw.len());
        for (position, (row_id, bytes)) in raw.into_iter().enumerate() {
            let entry = decode_entry(meta.entry_size, position as u64, (row_id, bytes), ordinal_ids)?;
            if entry.skip && !single {
                continue;
            }
            entries.push(entry);
        }
        Ok(entries)
    }

    /// Soft-deletes row `id` (bottom-based) by overwriting it with a
    /// skip-marked record pointing at `next_pointer`. The row's entry key,
    /// if any, is released.
    pub fn mark_incremental_deleted(&self, table: &str, key: &str, id: u64, next_pointer: u64) -> Result<()> {
        self.check_open()?;
        let meta = self.load_inc_meta(table, key)?;
        let record = skip_inc_entry(meta.entry_size, next_pointer)?;
        let lock = self.inc_lock(&meta.file_name);
        let _guard = lock.lock();
        let span = self.workers.write_inc_at(
            &meta.file_name,
            record,
            meta.entry_size,
            id,
            CountFrom::Bottom,
            IncWriteMode::Overwrite,
        )?;
        self.inc_index.clear(&meta.file_name, span.id)?;
        Ok(())
    }

    /// Deletes an incremental table: its file, its entry-key index and its
    /// descriptor under `(table, key)`.
    pub fn delete_incremental(&self, table: &str, key: &str) -> Result<()> {
        self.check_open()?;
        let meta = self.load_inc_meta(table, key)?;
        let lock = self.inc_lock(&meta.file_name);
        let guard = lock.lock();
        self.workers.delete_inc(&meta.file_name)?;
        if let Err(e) = self.inc_index.drop_table(&meta.file_name) {
            log::warn!("Failed to drop entry-key index of {:?}: {}", meta.file_name, e);
        }
        drop(guard);
        self.free(table, key)?;
        log::info!("Deleted incremental table {:?}", meta.file_name);
        Ok(())
    }

    /// Writes a key index snapshot of every open table.
    pub fn snapshot(&self) -> Result<()> {
        self.check_open()?;
        self.index.snapshot_all()
    }

    /// Forces buffered WAL records of every open table to disk.
    pub fn flush_wal(&self) -> Result<()> {
        self.check_open()?;
        self.index.flush_all()
    }

    /// Returns engine counters.
    pub fn stats(&self) -> DbStats {
        DbStats { index: self.index.stats(), workers: self.workers.worker_count() }
    }

    /// Closes the database: stops file workers, then syncs and closes every
    /// key index. Later calls fail with [`Error::InvalidState`].
    ///
    /// # Errors
    ///
    /// Returns the first error hit while closing the key indexes.
    pub fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.workers.close();
        self.index.close()?;
        log::info!("Database closed successfully");
        Ok(())
    }
}

impl Drop for DB {
    fn drop(&mut self) {
        // Errors cannot be propagated from drop
        if let Err(e) = self.close() {
            log::error!("Error closing database during drop: {}", e);
        }
    }
}

fn validate_name(value: &str, what: &str) -> Result<()> {
    if value.trim().is_empty() {
        return Err(Error::invalid_argument(format!("{} cannot be empty", what)));
    }
    Ok(())
}

/// File name of the incremental table stored at `(table, key)`.
fn inc_file_name(table: &str, key: &str) -> String {
    format!("{}.tbl", sanitize_name(&format!("{}__{}", table, key)))
}

fn decode_entry(entry_size: u64, position: u64, raw: RawIncRecord, ordinal_ids: bool) -> Result<IncEntry> {
    let (row_id, bytes) = raw;
    let record = codec::decode_inc_entry(entry_size, &bytes)?;
    Ok(IncEntry {
        id: if ordinal_ids { position } else { row_id },
        row_id,
        data: record.data,
        skip: record.skip,
        next_pointer: record.next_pointer,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tempfile::TempDir;

    fn open(dir: &TempDir) -> DB {
        DB::open(dir.path(), Options::default().snapshot_interval(Duration::from_secs(3600))).unwrap()
    }

    #[test]
    fn test_db_open_creates_layout() {
        let temp_dir = TempDir::new().unwrap();
        let _db = open(&temp_dir);
        for dir in [DATA_DIR, INC_TABLES_DIR, MAPS_DIR] {
            assert!(temp_dir.path().join(dir).is_dir());
        }
    }

    #[test]
    fn test_open_missing_without_create() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("absent");
        let result = DB::open(&path, Options::default().create_if_missing(false));
        assert!(matches!(result, Err(Error::NotFound(_))));
    }

    #[test]
    fn test_save_read_free() {
        let temp_dir = TempDir::new().unwrap();
        let db = open(&temp_dir);

        db.save("t", "k1", b"hello").unwrap();
        assert_eq!(db.read("t", "k1").unwrap(), b"hello");

        db.free("t", "k1").unwrap();
        assert!(db.read("t", "k1").unwrap_err().is_not_found());
        assert!(db.free("t", "k1").unwrap_err().is_not_found());
    }

    #[test]
    fn test_overwrite_releases_old_range() {
        let temp_dir = TempDir::new().unwrap();
        let db = open(&temp_dir);

        db.save("t", "k", b"first").unwrap();
        db.save("t", "k", b"second").unwrap();
        assert_eq!(db.read("t", "k").unwrap(), b"second");
        assert_eq!(db.stats().index.defrag_frees, 1);
        assert_eq!(db.free_blocks.free_blocks("t").unwrap().len(), 1);
    }

    #[test]
    fn test_empty_names_rejected() {
        let temp_dir = TempDir::new().unwrap();
        let db = open(&temp_dir);
        assert!(matches!(db.save("", "k", b"x"), Err(Error::InvalidArgument(_))));
        assert!(matches!(db.save("t", " ", b"x"), Err(Error::InvalidArgument(_))));
    }

    #[test]
    fn test_inc_file_name_sanitized() {
        assert_eq!(inc_file_name("chat", "room/1"), "chat__room_1.tbl");
    }

    #[test]
    fn test_closed_db_rejects_calls() {
        let temp_dir = TempDir::new().unwrap();
        let db = open(&temp_dir);
        db.close().unwrap();
        assert!(matches!(db.save("t", "k", b"x"), Err(Error::InvalidState(_))));
        // Closing twice is fine.
        db.close().unwrap();
    }
}
