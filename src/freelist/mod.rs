//! Free-block registry.
//!
//! Tracks byte ranges of block files that no live key references so later
//! writes can reuse them instead of growing the file.
//!
//! ## Layout
//!
//! Each table keeps its own list in `maps/<table>/free_blocks.json`, loaded
//! lazily and rewritten atomically after every mutation. A per-table mutex
//! makes load, mutate and persist one step with respect to other callers.

pub mod block;

pub use block::{FreeBlock, Reconcile};

use crate::error::{Error, Result};
use crate::fs_util::sanitize_name;
use block::TableFreeList;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

/// File name of a table's persisted free list.
pub const FREE_BLOCKS_FILE: &str = "free_blocks.json";

/// Registry of per-table free lists.
#[derive(Debug)]
pub struct FreeBlockRegistry {
    maps_dir: PathBuf,
    tables: RwLock<HashMap<String, Arc<Mutex<TableFreeList>>>>,
}

impl FreeBlockRegistry {
    /// Creates a registry rooted at the `maps/` directory.
    pub fn new(maps_dir: impl Into<PathBuf>) -> Self {
        Self { maps_dir: maps_dir.into(), tables: RwLock::new(HashMap::new()) }
    }

    /// Lists are keyed by the sanitized table name, like the block files.
    fn table(&self, table: &str) -> Result<Arc<Mutex<TableFreeList>>> {
        if table.is_empty() {
            return Err(Error::invalid_argument("table name cannot be empty"));
        }
        let name = sanitize_name(table);
        if let Some(list) = self.tables.read().get(&name) {
            return Ok(Arc::clone(list));
        }

        let mut tables = self.tables.write();
        let list = tables.entry(name).or_insert_with_key(|name| {
            let path = self.maps_dir.join(name).join(FREE_BLOCKS_FILE);
            Arc::new(Mutex::new(TableFreeList::new(name.clone(), path)))
        });
        Ok(Arc::clone(list))
    }

    /// Records `[start, end)` of `table` as free under `registry_key`.
    ///
    /// An existing block with the same key is replaced.
    pub fn mark_as_free(&self, registry_key: &str, table: &str, start: u64, end: u64) -> Result<()> {
        if end < start {
            return Err(Error::invalid_argument(format!("invalid range {}..{}", start, end)));
        }
        let list = self.table(table)?;
        let mut list = list.lock();
        list.load()?;
        let block = FreeBlock::new(list.name.clone(), start, end);
        list.insert(registry_key.to_string(), block);
        list.persist()?;
        log::debug!("Marked {}..{} of {} free as {}", start, end, table, registry_key);
        Ok(())
    }

    /// Takes the smallest free block of at least `size` bytes out of the registry.
    ///
    /// Returns [`Error::NoSuitableBlock`] when nothing fits; callers then append.
    pub fn get_block(&self, size: u64, table: &str) -> Result<FreeBlock> {
        let list = self.table(table)?;
        let mut list = list.lock();
        list.load()?;
        match list.take_best_fit(size) {
            Some((key, block)) => {
                list.persist()?;
                log::debug!("Reusing free block {} ({} bytes) of {}", key, block.size, table);
                Ok(block)
            }
            None => Err(Error::NoSuitableBlock { table: table.to_string(), size }),
        }
    }

    /// Reconciles a newly occupied range against the table's free blocks.
    ///
    /// Returns how the first containing block was adjusted, if any.
    pub fn save_block_check(&self, table: &str, start: u64, end: u64) -> Result<Option<Reconcile>> {
        let list = self.table(table)?;
        let mut list = list.lock();
        list.load()?;
        let outcome = list.reconcile(start, end);
        if outcome.is_some() {
            list.persist()?;
        }
        Ok(outcome)
    }

    /// Returns a copy of the table's free blocks, ordered by registry key.
    pub fn free_blocks(&self, table: &str) -> Result<Vec<(String, FreeBlock)>> {
        let list = self.table(table)?;
        let mut list = list.lock();
        list.load()?;
        Ok(list.blocks().map(|(k, b)| (k.clone(), b.clone())).collect())
    }

    /// Total number of free bytes currently tracked for `table`.
    pub fn free_bytes(&self, table: &str) -> Result<u64> {
        Ok(self.free_blocks(table)?.iter().map(|(_, b)| b.size).sum())
    }
}
