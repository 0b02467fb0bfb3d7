//! Secondary index of incremental tables.
//!
//! Binds an application-chosen entry key to a row id of one incremental
//! table file. Each table keeps an ordered slot array (one slot per row id,
//! empty string = unoccupied) persisted as `<file>.idx` next to the table.

use crate::error::{Error, Result};
use crate::fs_util::{atomic_write, remove_if_exists, with_suffix};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Suffix appended to an incremental table file name.
pub const INDEX_SUFFIX: &str = ".idx";

#[derive(Serialize, Deserialize, Default)]
struct DiskIndex {
    keys: Vec<String>,
}

#[derive(Debug)]
struct TableKeys {
    path: PathBuf,
    keys: Vec<String>,
    positions: HashMap<String, u64>,
}

impl TableKeys {
    fn load(path: PathBuf) -> Result<Self> {
        let keys = match fs::read(&path) {
            Ok(data) if data.is_empty() => Vec::new(),
            Ok(data) => serde_json::from_slice::<DiskIndex>(&data)?.keys,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Vec::new(),
            Err(e) => return Err(e.into()),
        };
        let mut table = Self { path, keys, positions: HashMap::new() };
        table.reindex_from(0);
        Ok(table)
    }

    fn persist(&self) -> Result<()> {
        let data = serde_json::to_vec(&DiskIndex { keys: self.keys.clone() })?;
        atomic_write(&self.path, &data)
    }

    fn ensure_len(&mut self, len: usize) {
        if self.keys.len() < len {
            self.keys.resize(len, String::new());
        }
    }

    fn reindex_from(&mut self, pos: usize) {
        for (i, key) in self.keys.iter().enumerate().skip(pos) {
            if !key.is_empty() {
                self.positions.insert(key.clone(), i as u64);
            }
        }
    }

    fn insert(&mut self, pos: usize, key: &str) -> Result<()> {
        if key.is_empty() {
            if pos >= self.keys.len() {
                return Ok(());
            }
        } else if self.positions.contains_key(key) {
            return Err(Error::DuplicateKey(key.to_string()));
        }
        self.ensure_len(pos);
        self.keys.insert(pos, key.to_string());
        self.reindex_from(pos);
        self.persist()
    }

    fn set(&mut self, pos: usize, key: &str) -> Result<()> {
        self.ensure_len(pos + 1);
        if self.keys[pos] == key {
            return Ok(());
        }
        if self.positions.contains_key(key) {
            return Err(Error::DuplicateKey(key.to_string()));
        }
        let previous = std::mem::replace(&mut self.keys[pos], key.to_string());
        if !previous.is_empty() {
            self.positions.remove(&previous);
        }
        self.positions.insert(key.to_string(), pos as u64);
        self.persist()
    }

    fn clear(&mut self, pos: usize) -> Result<bool> {
        let previous = match self.keys.get_mut(pos) {
            Some(slot) if !slot.is_empty() => std::mem::take(slot),
            _ => return Ok(false),
        };
        self.positions.remove(&previous);
        self.persist()?;
        Ok(true)
    }

    fn remove(&mut self, key: &str) -> Result<bool> {
        let Some(pos) = self.positions.remove(key) else {
            return Ok(false);
        };
        if let Some(slot) = self.keys.get_mut(pos as usize) {
            slot.clear();
        }
        self.persist()?;
        Ok(true)
    }
}

/// Per-table secondary indexes, loaded lazily and cached.
#[derive(Debug)]
pub struct IncIndexRegistry {
    dir: PathBuf,
    tables: RwLock<HashMap<String, Arc<Mutex<TableKeys>>>>,
}

impl IncIndexRegistry {
    /// Creates a registry whose index files live in `dir` (the `inc_tables/` directory).
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into(), tables: RwLock::new(HashMap::new()) }
    }

    fn index_path(&self, table_file: &str) -> PathBuf {
        with_suffix(&self.dir.join(table_file), INDEX_SUFFIX)
    }

    fn table(&self, table_file: &str) -> Result<Arc<Mutex<TableKeys>>> {
        if let Some(table) = self.tables.read().get(table_file) {
            return Ok(Arc::clone(table));
        }

        let mut tables = self.tables.write();
        if let Some(table) = tables.get(table_file) {
            return Ok(Arc::clone(table));
        }
        let table = Arc::new(Mutex::new(TableKeys::load(self.index_path(table_file))?));
        tables.insert(table_file.to_string(), Arc::clone(&table));
        Ok(table)
    }

    /// Binds `key` to `pos`, shifting every later binding up by one row.
    ///
    /// An empty key leaves the slot unbound but still shifts later bindings,
    /// so they keep following their rows.
    pub fn insert(&self, table_file: &str, pos: u64, key: &str) -> Result<()> {
        self.table(table_file)?.lock().insert(pos as usize, key)
    }

    /// Binds `key` to `pos` in place, replacing whatever key held that slot.
    ///
    /// An empty key is ignored.
    pub fn set(&self, table_file: &str, pos: u64, key: &str) -> Result<()> {
        if key.is_empty() {
            return Ok(());
        }
        self.table(table_file)?.lock().set(pos as usize, key)
    }

    /// Row id bound to `key`.
    pub fn lookup(&self, table_file: &str, key: &str) -> Result<u64> {
        self.table(table_file)?
            .lock()
            .positions
            .get(key)
            .copied()
            .ok_or_else(|| Error::not_found(format!("entry key {:?} in {:?}", key, table_file)))
    }

    /// Unbinds whatever key holds row `pos`. Returns whether one did.
    pub fn clear(&self, table_file: &str, pos: u64) -> Result<bool> {
        self.table(table_file)?.lock().clear(pos as usize)
    }

    /// Clears the slot of `key`. Other row ids are unchanged.
    ///
    /// Returns whether the key was bound.
    pub fn remove(&self, table_file: &str, key: &str) -> Result<bool> {
        if key.is_empty() {
            return Ok(false);
        }
        self.table(table_file)?.lock().remove(key)
    }

    /// Deletes the index file of a table and forgets it.
    pub fn drop_table(&self, table_file: &str) -> Result<()> {
        self.tables.write().remove(table_file);
        remove_if_exists(&self.index_path(table_file))
    }

    /// Directory holding the index files.
    pub fn dir(&self) -> &Path {
        &self.dir
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_set_and_lookup() {
        let dir = TempDir::new().unwrap();
        let idx = IncIndexRegistry::new(dir.path());
        idx.set("t.tbl", 0, "a").unwrap();
        idx.set("t.tbl", 3, "b").unwrap();

        assert_eq!(idx.lookup("t.tbl", "a").unwrap(), 0);
        assert_eq!(idx.lookup("t.tbl", "b").unwrap(), 3);
        assert!(idx.lookup("t.tbl", "c").unwrap_err().is_not_found());
    }

    #[test]
    fn test_insert_shifts_later_keys() {
        let dir = TempDir::new().unwrap();
        let idx = IncIndexRegistry::new(dir.path());
        idx.set("t.tbl", 0, "a").unwrap();
        idx.set("t.tbl", 1, "b").unwrap();
        idx.set("t.tbl", 2, "c").unwrap();

        idx.insert("t.tbl", 1, "x").unwrap();

        assert_eq!(idx.lookup("t.tbl", "a").unwrap(), 0);
        assert_eq!(idx.lookup("t.tbl", "x").unwrap(), 1);
        assert_eq!(idx.lookup("t.tbl", "b").unwrap(), 2);
        assert_eq!(idx.lookup("t.tbl", "c").unwrap(), 3);
    }

    #[test]
    fn test_insert_past_end_pads() {
        let dir = TempDir::new().unwrap();
        let idx = IncIndexRegistry::new(dir.path());
        idx.insert("t.tbl", 4, "far").unwrap();
        assert_eq!(idx.lookup("t.tbl", "far").unwrap(), 4);
    }

    #[test]
    fn test_duplicate_key() {
        let dir = TempDir::new().unwrap();
        let idx = IncIndexRegistry::new(dir.path());
        idx.set("t.tbl", 0, "a").unwrap();

        assert!(matches!(idx.insert("t.tbl", 1, "a"), Err(Error::DuplicateKey(_))));
        assert!(matches!(idx.set("t.tbl", 2, "a"), Err(Error::DuplicateKey(_))));
        // Same slot, same key is a no-op.
        idx.set("t.tbl", 0, "a").unwrap();
    }

    #[test]
    fn test_set_replaces_slot_owner() {
        let dir = TempDir::new().unwrap();
        let idx = IncIndexRegistry::new(dir.path());
        idx.set("t.tbl", 0, "old").unwrap();
        idx.set("t.tbl", 0, "new").unwrap();

        assert!(idx.lookup("t.tbl", "old").is_err());
        assert_eq!(idx.lookup("t.tbl", "new").unwrap(), 0);
    }

    #[test]
    fn test_remove_keeps_positions() {
        let dir = TempDir::new().unwrap();
        let idx = IncIndexRegistry::new(dir.path());
        idx.set("t.tbl", 0, "a").unwrap();
        idx.set("t.tbl", 1, "b").unwrap();

        assert!(idx.remove("t.tbl", "a").unwrap());
        assert!(!idx.remove("t.tbl", "a").unwrap());
        assert_eq!(idx.lookup("t.tbl", "b").unwrap(), 1);
    }

    #[test]
    fn test_clear_row() {
        let dir = TempDir::new().unwrap();
        let idx = IncIndexRegistry::new(dir.path());
        idx.set("t.tbl", 0, "a").unwrap();
        idx.set("t.tbl", 1, "b").unwrap();

        assert!(idx.clear("t.tbl", 0).unwrap());
        assert!(!idx.clear("t.tbl", 0).unwrap());
        assert!(!idx.clear("t.tbl", 9).unwrap());
        assert!(idx.lookup("t.tbl", "a").unwrap_err().is_not_found());
        assert_eq!(idx.lookup("t.tbl", "b").unwrap(), 1);

        // The key is free for another row.
        idx.set("t.tbl", 2, "a").unwrap();
        let idx = IncIndexRegistry::new(dir.path());
        assert_eq!(idx.lookup("t.tbl", "a").unwrap(), 2);
    }

    #[test]
    fn test_persisted_and_reloaded() {
        let dir = TempDir::new().unwrap();
        {
            let idx = IncIndexRegistry::new(dir.path());
            idx.set("t.tbl", 0, "a").unwrap();
            idx.insert("t.tbl", 0, "z").unwrap();
        }
        let raw = std::fs::read_to_string(dir.path().join("t.tbl.idx")).unwrap();
        assert_eq!(raw, r#"{"keys":["z","a"]}"#);

        let idx = IncIndexRegistry::new(dir.path());
        assert_eq!(idx.lookup("t.tbl", "z").unwrap(), 0);
        assert_eq!(idx.lookup("t.tbl", "a").unwrap(), 1);
    }

    #[test]
    fn test_drop_table() {
        let dir = TempDir::new().unwrap();
        let idx = IncIndexRegistry::new(dir.path());
        idx.set("t.tbl", 0, "a").unwrap();
        idx.drop_table("t.tbl").unwrap();

        assert!(!dir.path().join("t.tbl.idx").exists());
        assert!(idx.lookup("t.tbl", "a").is_err());
        // Dropping twice is fine.
        idx.drop_table("t.tbl").unwrap();
    }

    #[test]
    fn test_empty_key_ignored() {
        let dir = TempDir::new().unwrap();
        let idx = IncIndexRegistry::new(dir.path());
        idx.insert("t.tbl", 0, "").unwrap();
        idx.set("t.tbl", 0, "").unwrap();
        assert!(!dir.path().join("t.tbl.idx").exists());
    }

    #[test]
    fn test_unkeyed_insert_shifts() {
        let dir = TempDir::new().unwrap();
        let idx = IncIndexRegistry::new(dir.path());
        idx.set("t.tbl", 0, "a").unwrap();
        idx.set("t.tbl", 1, "b").unwrap();

        idx.insert("t.tbl", 1, "").unwrap();

        assert_eq!(idx.lookup("t.tbl", "a").unwrap(), 0);
        assert_eq!(idx.lookup("t.tbl", "b").unwrap(), 2);
    }
}
