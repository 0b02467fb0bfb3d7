//! Free block records and the per-table free list.

use crate::error::Result;
use crate::fs_util::atomic_write;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::PathBuf;

/// A reusable byte range `[start, end)` inside a table's block file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FreeBlock {
    /// Table (block file) owning the range
    pub file_name: String,
    /// First byte of the range
    pub start: u64,
    /// One past the last byte
    pub end: u64,
    /// Always `end - start`
    pub size: u64,
    /// Free-form label carried through the JSON file
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tag: Option<String>,
    /// Kept for files written by older versions; never set
    #[serde(default)]
    pub in_use: bool,
}

impl FreeBlock {
    /// Creates an untagged block; `end` must not be below `start`.
    pub fn new(file_name: impl Into<String>, start: u64, end: u64) -> Self {
        Self { file_name: file_name.into(), start, end, size: end - start, tag: None, in_use: false }
    }

    #[inline]
    fn contains(&self, start: u64, end: u64) -> bool {
        start >= self.start && end <= self.end
    }
}

/// How a newly occupied range was reconciled against a free block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reconcile {
    /// The range covered the whole block; it was removed.
    Consumed,
    /// The block kept its tail.
    ShrunkFront,
    /// The block kept its head.
    ShrunkBack,
    /// The block kept both ends as two blocks.
    Split,
}

/// Free blocks of one table, persisted as a JSON map.
///
/// Ordered by registry key so that "first found" is stable across runs.
#[derive(Debug)]
pub(crate) struct TableFreeList {
    pub(crate) name: String,
    path: PathBuf,
    loaded: bool,
    blocks: BTreeMap<String, FreeBlock>,
}

impl TableFreeList {
    pub(crate) fn new(name: String, path: PathBuf) -> Self {
        Self { name, path, loaded: false, blocks: BTreeMap::new() }
    }

    /// Loads the list from disk on first use.
    pub(crate) fn load(&mut self) -> Result<()> {
        if self.loaded {
            return Ok(());
        }
        if self.path.exists() {
            let raw = fs::read(&self.path)?;
            if !raw.is_empty() {
                self.blocks = serde_json::from_slice(&raw)?;
            }
        }
        self.loaded = true;
        Ok(())
    }

    pub(crate) fn persist(&self) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_vec(&self.blocks)?;
        atomic_write(&self.path, &json)
    }

    pub(crate) fn insert(&mut self, key: String, block: FreeBlock) {
        self.blocks.insert(key, block);
    }

    /// Removes and returns the smallest block of at least `size` bytes.
    pub(crate) fn take_best_fit(&mut self, size: u64) -> Option<(String, FreeBlock)> {
        let mut best: Option<(&String, &FreeBlock)> = None;
        for (key, block) in &self.blocks {
            if block.size < size || block.file_name != self.name {
                continue;
            }
            match best {
                Some((_, current)) if current.size <= block.size => {}
                _ => best = Some((key, block)),
            }
        }
        let key = best.map(|(k, _)| k.clone())?;
        self.blocks.remove(&key).map(|block| (key, block))
    }

    /// Reconciles the first free block containing `[start, end)`.
    pub(crate) fn reconcile(&mut self, start: u64, end: u64) -> Option<Reconcile> {
        let (key, block) = self
            .blocks
            .iter()
            .find(|(_, b)| b.file_name == self.name && b.contains(start, end))
            .map(|(k, b)| (k.clone(), b.clone()))?;

        let outcome = if start == block.start && end == block.end {
            self.blocks.remove(&key);
            Reconcile::Consumed
        } else if start == block.start {
            self.blocks.insert(key, FreeBlock::new(block.file_name, end, block.end));
            Reconcile::ShrunkFront
        } else if end == block.end {
            self.blocks.insert(key, FreeBlock::new(block.file_name, block.start, start));
            Reconcile::ShrunkBack
        } else {
            let tail_key = format!("{}_{}", key, end);
            self.blocks.insert(tail_key, FreeBlock::new(block.file_name.clone(), end, block.end));
            self.blocks.insert(key, FreeBlock::new(block.file_name, block.start, start));
            Reconcile::Split
        };
        Some(outcome)
    }

    pub(crate) fn blocks(&self) -> impl Iterator<Item = (&String, &FreeBlock)> {
        self.blocks.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn list(dir: &TempDir) -> TableFreeList {
        let mut fl = TableFreeList::new("t".into(), dir.path().join("free_blocks.json"));
        fl.load().unwrap();
        fl
    }

    #[test]
    fn test_best_fit_prefers_smallest() {
        let dir = TempDir::new().unwrap();
        let mut fl = list(&dir);
        fl.insert("a".into(), FreeBlock::new("t", 0, 100));
        fl.insert("b".into(), FreeBlock::new("t", 200, 220));
        fl.insert("c".into(), FreeBlock::new("t", 300, 310));

        let (key, block) = fl.take_best_fit(15).unwrap();
        assert_eq!(key, "b");
        assert_eq!(block.size, 20);
        assert!(fl.take_best_fit(200).is_none());
    }

    #[test]
    fn test_best_fit_tie_takes_first_key() {
        let dir = TempDir::new().unwrap();
        let mut fl = list(&dir);
        fl.insert("k2".into(), FreeBlock::new("t", 50, 60));
        fl.insert("k1".into(), FreeBlock::new("t", 0, 10));
        let (key, _) = fl.take_best_fit(10).unwrap();
        assert_eq!(key, "k1");
    }

    #[test]
    fn test_reconcile_cases() {
        let dir = TempDir::new().unwrap();
        let mut fl = list(&dir);

        fl.insert("x".into(), FreeBlock::new("t", 0, 10));
        assert_eq!(fl.reconcile(0, 10), Some(Reconcile::Consumed));
        assert_eq!(fl.blocks().count(), 0);

        fl.insert("x".into(), FreeBlock::new("t", 0, 10));
        assert_eq!(fl.reconcile(0, 4), Some(Reconcile::ShrunkFront));
        assert_eq!(fl.blocks().next().unwrap().1, &FreeBlock::new("t", 4, 10));

        assert_eq!(fl.reconcile(8, 10), Some(Reconcile::ShrunkBack));
        assert_eq!(fl.blocks().next().unwrap().1, &FreeBlock::new("t", 4, 8));

        assert_eq!(fl.reconcile(5, 6), Some(Reconcile::Split));
        let blocks: Vec<_> = fl.blocks().map(|(k, b)| (k.clone(), b.clone())).collect();
        assert_eq!(
            blocks,
            vec![
                ("x".to_string(), FreeBlock::new("t", 4, 5)),
                ("x_6".to_string(), FreeBlock::new("t", 6, 8)),
            ]
        );

        assert_eq!(fl.reconcile(100, 200), None);
    }

    #[test]
    fn test_persist_and_reload() {
        let dir = TempDir::new().unwrap();
        let mut fl = list(&dir);
        fl.insert("k@0".into(), FreeBlock::new("t", 0, 32));
        fl.persist().unwrap();

        let reloaded = list(&dir);
        assert_eq!(reloaded.blocks().count(), 1);
        assert_eq!(reloaded.blocks().next().unwrap().1.size, 32);
    }
}
