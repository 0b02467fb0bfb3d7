//! Hash-partitioned in-memory key map.

use super::IndexEntry;
use crate::error::Result;
use parking_lot::RwLock;
use regex::Regex;
use std::collections::HashMap;
use std::hash::Hasher;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// Lock waits above this are counted as slow.
pub(crate) const SLOW_LOCK_THRESHOLD: Duration = Duration::from_micros(100);

/// FNV-1a hasher used to pick a shard.
struct FnvHasher {
    state: u64,
}

impl FnvHasher {
    const FNV_OFFSET_BASIS: u64 = 0xcbf29ce484222325;
    const FNV_PRIME: u64 = 0x100000001b3;

    fn new() -> Self {
        Self { state: Self::FNV_OFFSET_BASIS }
    }
}

impl Hasher for FnvHasher {
    fn finish(&self) -> u64 {
        self.state
    }

    fn write(&mut self, bytes: &[u8]) {
        for &byte in bytes {
            self.state ^= byte as u64;
            self.state = self.state.wrapping_mul(Self::FNV_PRIME);
        }
    }
}

type Shard = RwLock<HashMap<String, IndexEntry>>;

/// A fixed number of independently locked key maps.
pub(crate) struct ShardSet {
    shards: Vec<Shard>,
    slow_locks: AtomicU64,
}

impl ShardSet {
    pub(crate) fn new(count: usize) -> Self {
        let shards = (0..count.max(1)).map(|_| RwLock::new(HashMap::new())).collect();
        Self { shards, slow_locks: AtomicU64::new(0) }
    }

    fn shard(&self, key: &str) -> &Shard {
        let mut hasher = FnvHasher::new();
        hasher.write(key.as_bytes());
        &self.shards[(hasher.finish() % self.shards.len() as u64) as usize]
    }

    fn note_wait(&self, started: Instant) {
        if started.elapsed() > SLOW_LOCK_THRESHOLD {
            self.slow_locks.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Stores `entry`, running `log` under the shard lock first.
    ///
    /// The map is left untouched when `log` fails, so memory never gets
    /// ahead of the log and per-key log order matches memory order.
    pub(crate) fn store_logged<F>(&self, key: &str, entry: IndexEntry, log: F) -> Result<Option<IndexEntry>>
    where
        F: FnOnce() -> Result<()>,
    {
        let shard = self.shard(key);
        let started = Instant::now();
        let mut map = shard.write();
        self.note_wait(started);
        log()?;
        Ok(map.insert(key.to_string(), entry))
    }

    /// Removes `key`, running `log` under the shard lock first.
    pub(crate) fn delete_logged<F>(&self, key: &str, log: F) -> Result<Option<IndexEntry>>
    where
        F: FnOnce() -> Result<()>,
    {
        let shard = self.shard(key);
        let started = Instant::now();
        let mut map = shard.write();
        self.note_wait(started);
        if !map.contains_key(key) {
            return Ok(None);
        }
        log()?;
        Ok(map.remove(key))
    }

    /// Unlogged store, used while replaying.
    pub(crate) fn store(&self, key: String, entry: IndexEntry) -> Option<IndexEntry> {
        let shard = self.shard(&key);
        shard.write().insert(key, entry)
    }

    /// Unlogged delete, used while replaying.
    pub(crate) fn delete(&self, key: &str) -> Option<IndexEntry> {
        self.shard(key).write().remove(key)
    }

    pub(crate) fn load(&self, key: &str) -> Option<IndexEntry> {
        self.shard(key).read().get(key).cloned()
    }

    pub(crate) fn len(&self) -> usize {
        self.shards.iter().map(|s| s.read().len()).sum()
    }

    /// Visits every entry, one shard at a time under its read lock.
    pub(crate) fn try_for_each<F>(&self, mut f: F) -> Result<()>
    where
        F: FnMut(&str, &IndexEntry) -> Result<()>,
    {
        for shard in &self.shards {
            let map = shard.read();
            for (key, entry) in map.iter() {
                f(key, entry)?;
            }
        }
        Ok(())
    }

    /// Keys matching `pattern`, at most `max` of them (0 = unlimited).
    pub(crate) fn matching_keys(&self, pattern: &Regex, max: usize) -> Vec<String> {
        let mut out = Vec::new();
        for shard in &self.shards {
            let map = shard.read();
            for key in map.keys() {
                if pattern.is_match(key) {
                    out.push(key.clone());
                    if max > 0 && out.len() >= max {
                        return out;
                    }
                }
            }
        }
        out
    }

    pub(crate) fn slow_lock_waits(&self) -> u64 {
        self.slow_locks.load(Ordering::Relaxed)
    }
}
