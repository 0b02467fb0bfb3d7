//! Per-table key index: shards, WAL and snapshot timer.

use super::shard::ShardSet;
use super::snapshot::{self, SNAPSHOT_FILE, WAL_FILE};
use super::IndexEntry;
use crate::config::Options;
use crate::error::{Error, Result};
use crate::fs_util::sanitize_name;
use crate::wal::{WalRecord, WalWriter};
use crossbeam::channel::{self, RecvTimeoutError, Sender};
use parking_lot::{Mutex, RwLock};
use regex::Regex;
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};
use std::time::Duration;

enum TimerMessage {
    Trigger,
    Shutdown,
}

struct SnapshotTimer {
    sender: Sender<TimerMessage>,
    handle: JoinHandle<()>,
}

/// Key index of one table.
pub struct TableIndex {
    name: String,
    dir: PathBuf,
    shards: ShardSet,
    wal: WalWriter,
    snapshot_lock: Mutex<()>,
    regex_cache: RwLock<HashMap<String, Regex>>,
    max_regex_cache: usize,
    timer: Mutex<Option<SnapshotTimer>>,
}

impl TableIndex {
    /// Opens the index of `table` under `maps_dir`, recovering its state.
    ///
    /// Recovery order: snapshot, retired WAL (if a rotation was interrupted),
    /// then the live WAL. A table with no files of its own imports its
    /// entries from the legacy global map once.
    pub fn open(maps_dir: &Path, table: &str, options: &Options) -> Result<Arc<Self>> {
        let dir = maps_dir.join(sanitize_name(table));
        fs::create_dir_all(&dir)?;

        let snap_path = dir.join(SNAPSHOT_FILE);
        let wal_path = dir.join(WAL_FILE);
        let shards = ShardSet::new(options.shard_count);

        let wal = WalWriter::open(&wal_path, options)?;
        let retired = wal.retired_path();
        let fresh = !snap_path.exists() && !retired.exists() && wal_empty(&wal_path);

        let mut needs_snapshot = false;
        if fresh {
            needs_snapshot = snapshot::import_legacy(maps_dir, table, &shards)? > 0;
        } else {
            if snap_path.exists() {
                let n = snapshot::load_snapshot(&snap_path, &shards)?;
                log::debug!("Loaded {} entries from snapshot of {}", n, table);
            }
            if retired.exists() {
                snapshot::replay_wal(&retired, &shards)?;
                needs_snapshot = true;
            }
            let n = snapshot::replay_wal(&wal_path, &shards)?;
            log::debug!("Replayed {} WAL records for {}", n, table);
        }

        if needs_snapshot {
            snapshot::write_snapshot(&snap_path, &shards)?;
            wal.discard_retired()?;
        }

        let index = Arc::new(Self {
            name: table.to_string(),
            dir,
            shards,
            wal,
            snapshot_lock: Mutex::new(()),
            regex_cache: RwLock::new(HashMap::new()),
            max_regex_cache: options.max_regex_cache,
            timer: Mutex::new(None),
        });
        index.start_timer(options.snapshot_interval)?;

        log::info!("Opened index for table {} ({} keys)", table, index.len());
        Ok(index)
    }

    fn start_timer(self: &Arc<Self>, interval: Duration) -> Result<()> {
        let (sender, receiver) = channel::unbounded();
        let weak: Weak<Self> = Arc::downgrade(self);
        let handle = thread::Builder::new()
            .name(format!("tsunamidb-snapshot-{}", self.name))
            .spawn(move || loop {
                let triggered = match receiver.recv_timeout(interval) {
                    Ok(TimerMessage::Trigger) | Err(RecvTimeoutError::Timeout) => true,
                    Ok(TimerMessage::Shutdown) | Err(RecvTimeoutError::Disconnected) => false,
                };
                if !triggered {
                    break;
                }
                let Some(index) = weak.upgrade() else { break };
                if let Err(e) = index.snapshot() {
                    log::error!("Background snapshot of {} failed: {}", index.name, e);
                }
            })?;
        *self.timer.lock() = Some(SnapshotTimer { sender, handle });
        Ok(())
    }

    /// Table name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Directory holding this table's snapshot and WAL.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Stores `entry` under `key`, returning the previous entry.
    pub fn save(&self, key: &str, entry: IndexEntry) -> Result<Option<IndexEntry>> {
        validate_field(key, "key")?;
        validate_field(&entry.file, "file")?;
        if entry.file.contains('|') {
            return Err(Error::invalid_argument("file must not contain '|'"));
        }
        let record = WalRecord::Set { key: key.to_string(), entry: entry.clone() };
        self.shards.store_logged(key, entry, || self.wal.append(record))
    }

    /// Removes `key`, returning the removed entry.
    pub fn remove(&self, key: &str) -> Result<Option<IndexEntry>> {
        validate_field(key, "key")?;
        let record = WalRecord::Delete { key: key.to_string() };
        self.shards.delete_logged(key, || self.wal.append(record))
    }

    /// Looks up `key`.
    pub fn get(&self, key: &str) -> Option<IndexEntry> {
        self.shards.load(key)
    }

    /// Keys matching `pattern`; `max == 0` means unlimited. Order is unspecified.
    pub fn keys_by_regex(&self, pattern: &str, max: usize) -> Result<Vec<String>> {
        let cached = self.regex_cache.read().get(pattern).cloned();
        let regex = match cached {
            Some(regex) => regex,
            None => {
                let compiled = Regex::new(pattern)?;
                let mut cache = self.regex_cache.write();
                if cache.len() >= self.max_regex_cache {
                    cache.clear();
                }
                cache.insert(pattern.to_string(), compiled.clone());
                compiled
            }
        };
        Ok(self.shards.matching_keys(&regex, max))
    }

    /// Number of live keys.
    pub fn len(&self) -> usize {
        self.shards.len()
    }

    /// Returns true if the index holds no keys.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub(crate) fn slow_lock_waits(&self) -> u64 {
        self.shards.slow_lock_waits()
    }

    /// Forces buffered WAL records to disk.
    pub fn flush(&self) -> Result<()> {
        self.wal.flush()
    }

    /// Writes a snapshot and restarts the WAL.
    ///
    /// The log is rotated before the dump, so every record in the retired
    /// log is already reflected in memory when the shards are read. The
    /// retired log is deleted only once the snapshot is in place.
    pub fn snapshot(&self) -> Result<usize> {
        let _guard = self.snapshot_lock.lock();
        self.wal.rotate()?;
        let count = snapshot::write_snapshot(&self.dir.join(SNAPSHOT_FILE), &self.shards)?;
        self.wal.discard_retired()?;
        log::info!("Snapshot of table {} written ({} keys)", self.name, count);
        Ok(count)
    }

    /// Asks the background timer to snapshot now without waiting.
    pub fn request_snapshot(&self) {
        if let Some(timer) = self.timer.lock().as_ref() {
            let _ = timer.sender.send(TimerMessage::Trigger);
        }
    }

    /// Stops the timer and closes the WAL, syncing everything queued.
    pub fn close(&self) -> Result<()> {
        let timer = self.timer.lock().take();
        if let Some(timer) = timer {
            let _ = timer.sender.send(TimerMessage::Shutdown);
            if timer.handle.thread().id() != thread::current().id() {
                let _ = timer.handle.join();
            }
        }
        self.wal.close()
    }
}

impl Drop for TableIndex {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            log::error!("Failed to close index of {}: {}", self.name, e);
        }
    }
}

fn wal_empty(path: &Path) -> bool {
    fs::metadata(path).map(|m| m.len() == 0).unwrap_or(true)
}

fn validate_field(value: &str, what: &str) -> Result<()> {
    if value.contains(&['\n', '\r'][..]) {
        return Err(Error::invalid_argument(format!("{} must not contain line breaks", what)));
    }
    Ok(())
}
