//! Index snapshot files and the legacy global map import.
//!
//! A snapshot is one `key|file|start|end` line per live key. It is written
//! to a temporary file in the same directory, fsynced, then renamed over
//! the previous snapshot.

use super::shard::ShardSet;
use crate::error::Result;
use crate::fs_util::{sanitize_name, with_suffix};
use crate::wal::record::parse_location;
use crate::wal::{WalReader, WalRecord};
use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::Path;

/// Snapshot file name inside a table's map directory.
pub const SNAPSHOT_FILE: &str = "index.snap";
/// WAL file name inside a table's map directory.
pub const WAL_FILE: &str = "index.wal";
/// Legacy single-file snapshot inside `maps/`.
pub const LEGACY_SNAPSHOT_FILE: &str = "data_map.snap";
/// Legacy single-file WAL inside `maps/`.
pub const LEGACY_WAL_FILE: &str = "data_map.wal";

/// Dumps all shards to `path` atomically. Returns the number of entries.
pub(crate) fn write_snapshot(path: &Path, shards: &ShardSet) -> Result<usize> {
    let tmp_path = with_suffix(path, ".tmp");
    let mut count = 0usize;
    {
        let file = OpenOptions::new().write(true).create(true).truncate(true).open(&tmp_path)?;
        let mut writer = BufWriter::new(file);
        shards.try_for_each(|key, entry| {
            writeln!(writer, "{}|{}|{}|{}", key, entry.file, entry.start, entry.end)?;
            count += 1;
            Ok(())
        })?;
        writer.flush()?;
        writer.get_ref().sync_all()?;
    }
    fs::rename(&tmp_path, path)?;
    Ok(count)
}

/// Visits every well-formed snapshot line; malformed lines are skipped.
fn for_each_snapshot_line<F>(path: &Path, mut f: F) -> Result<usize>
where
    F: FnMut(String, super::IndexEntry),
{
    let reader = BufReader::new(File::open(path)?);
    let mut loaded = 0usize;
    for (no, line) in reader.split(b'\n').enumerate() {
        let line = line?;
        let line = String::from_utf8_lossy(&line);
        let line = line.trim_end_matches('\r');
        if line.is_empty() {
            continue;
        }
        match parse_location(line) {
            Ok((key, entry)) => {
                f(key, entry);
                loaded += 1;
            }
            Err(e) => log::warn!("Skipping snapshot line {} of {:?}: {}", no + 1, path, e),
        }
    }
    Ok(loaded)
}

/// Loads a snapshot into `shards`. Returns the number of entries read.
pub(crate) fn load_snapshot(path: &Path, shards: &ShardSet) -> Result<usize> {
    for_each_snapshot_line(path, |key, entry| {
        shards.store(key, entry);
    })
}

/// Replays a WAL on top of `shards`. Returns the number of records applied.
pub(crate) fn replay_wal(path: &Path, shards: &ShardSet) -> Result<usize> {
    let mut reader = WalReader::new(path)?;
    let mut applied = 0usize;
    while let Some(record) = reader.read_next()? {
        match record {
            WalRecord::Set { key, entry } => {
                shards.store(key, entry);
            }
            WalRecord::Delete { key } => {
                shards.delete(&key);
            }
        }
        applied += 1;
    }
    Ok(applied)
}

/// Replays a legacy WAL, keeping only sets whose file maps to `table`.
fn replay_legacy_wal(path: &Path, shards: &ShardSet, table: &str) -> Result<usize> {
    let mut reader = WalReader::new(path)?;
    let mut applied = 0usize;
    while let Some(record) = reader.read_next()? {
        match record {
            WalRecord::Set { key, mut entry } => {
                if sanitize_name(&entry.file) == table {
                    entry.file = table.to_string();
                    shards.store(key, entry);
                    applied += 1;
                }
            }
            WalRecord::Delete { key } => {
                shards.delete(&key);
                applied += 1;
            }
        }
    }
    Ok(applied)
}

/// Imports entries of `table` from the legacy global snapshot and WAL.
///
/// Deletes in the legacy WAL carry no file name; they only affect keys
/// already imported for this table.
pub(crate) fn import_legacy(maps_dir: &Path, table: &str, shards: &ShardSet) -> Result<usize> {
    let mut imported = 0usize;

    let snap = maps_dir.join(LEGACY_SNAPSHOT_FILE);
    if snap.exists() {
        for_each_snapshot_line(&snap, |key, mut entry| {
            if sanitize_name(&entry.file) == table {
                entry.file = table.to_string();
                shards.store(key, entry);
                imported += 1;
            }
        })?;
    }

    let wal = maps_dir.join(LEGACY_WAL_FILE);
    if wal.exists() {
        imported += replay_legacy_wal(&wal, shards, table)?;
    }

    if imported > 0 {
        log::info!("Imported legacy index records for table {}", table);
    }
    Ok(imported)
}
