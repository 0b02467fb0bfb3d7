//! Batch execution against a worker's file handle.
//!
//! Requests of one batch run grouped by kind, FIFO within a group:
//! inc inserts/overwrites, inc appends, plain writes, inc reads, plain reads.
//! Errors go to the request's own reply and never stop the batch.

use super::request::{CountFrom, IncReadKind, IncSpan, IncWriteMode, RawIncRecord, Request, Span};
use crate::codec::inc_entry::record_size;
use crate::error::{Error, Result};
use crate::freelist::FreeBlockRegistry;
use crate::fs_util::remove_if_exists;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// What a worker knows about the file it serves.
pub(crate) struct WorkerContext {
    pub(crate) path: PathBuf,
    /// Set for block files: the registry and table used for space reuse.
    pub(crate) free_list: Option<(Arc<FreeBlockRegistry>, String)>,
}

pub(crate) fn open_file(path: &Path, truncate: bool) -> Result<File> {
    Ok(OpenOptions::new().read(true).write(true).create(true).truncate(truncate).open(path)?)
}

/// Runs one batch.
pub(crate) fn execute_batch(file: Option<&mut File>, ctx: &WorkerContext, mut batch: Vec<Request>) {
    batch.sort_by_key(Request::group);
    let Some(file) = file else {
        for req in batch {
            reply_unavailable(req, &ctx.path);
        }
        return;
    };

    for req in batch {
        match req {
            Request::WriteIncAt { record, entry_size, pref_id, count_from, mode, reply } => {
                let _ = reply.send(write_inc_at(file, &record, entry_size, pref_id, count_from, mode));
            }
            Request::WriteInc { record, entry_size, reply } => {
                let _ = reply.send(write_inc(file, &record, entry_size));
            }
            Request::Write { data, reply } => {
                let _ = reply.send(write_plain(file, ctx, &data));
            }
            Request::ReadInc { entry_size, kind, reply } => {
                let _ = reply.send(read_inc(file, entry_size, kind));
            }
            Request::Read { start, end, reply } => {
                let _ = reply.send(read_plain(file, start, end));
            }
            Request::DeleteInc { reply } => {
                // Normally handled by the loop before batching.
                let _ = reply.send(Err(Error::InvalidState("delete_inc inside a batch".into())));
            }
        }
    }
}

fn reply_unavailable(req: Request, path: &Path) {
    let err = || Error::InvalidState(format!("file {:?} is not open", path));
    match req {
        Request::Read { reply, .. } => drop(reply.send(Err(err()))),
        Request::Write { reply, .. } => drop(reply.send(Err(err()))),
        Request::WriteInc { reply, .. } | Request::WriteIncAt { reply, .. } => {
            drop(reply.send(Err(err())))
        }
        Request::ReadInc { reply, .. } => drop(reply.send(Err(err()))),
        Request::DeleteInc { reply } => drop(reply.send(Err(err()))),
    }
}

/// Closes, removes and recreates the file empty.
pub(crate) fn delete_inc(slot: &mut Option<File>, path: &Path) -> Result<()> {
    slot.take();
    if let Err(e) = remove_if_exists(path) {
        *slot = open_file(path, false).ok();
        return Err(e);
    }
    *slot = Some(open_file(path, true)?);
    Ok(())
}

fn write_at(file: &mut File, offset: u64, data: &[u8]) -> Result<()> {
    file.seek(SeekFrom::Start(offset))?;
    file.write_all(data)?;
    Ok(())
}

fn read_at(file: &mut File, offset: u64, len: usize) -> Result<Vec<u8>> {
    let mut buf = vec![0u8; len];
    file.seek(SeekFrom::Start(offset))?;
    file.read_exact(&mut buf)?;
    Ok(buf)
}

/// Pads the file with zeros up to a whole number of records.
///
/// Returns the record count after padding.
fn align_records(file: &mut File, rec_size: u64) -> Result<u64> {
    let size = file.seek(SeekFrom::End(0))?;
    let rem = size % rec_size;
    if rem == 0 {
        return Ok(size / rec_size);
    }
    let pad = (rec_size - rem) as usize;
    log::warn!("Incremental file misaligned by {} bytes, padding {}", rem, pad);
    file.write_all(&vec![0u8; pad])?;
    Ok((size + pad as u64) / rec_size)
}

fn check_record(record: &[u8], entry_size: u64) -> Result<u64> {
    let rec_size = record_size(entry_size);
    if record.len() as u64 != rec_size {
        return Err(Error::invalid_argument(format!(
            "record length {} does not match record size {}",
            record.len(),
            rec_size
        )));
    }
    Ok(rec_size)
}

fn write_inc(file: &mut File, record: &[u8], entry_size: u64) -> Result<IncSpan> {
    let rec_size = check_record(record, entry_size)?;
    let id = align_records(file, rec_size)?;
    let start = id * rec_size;
    write_at(file, start, record)?;
    Ok(IncSpan { id, start, end: start + rec_size })
}

fn write_inc_at(
    file: &mut File,
    record: &[u8],
    entry_size: u64,
    pref_id: u64,
    count_from: CountFrom,
    mode: IncWriteMode,
) -> Result<IncSpan> {
    let rec_size = check_record(record, entry_size)?;
    let count = align_records(file, rec_size)?;

    let id = match mode {
        IncWriteMode::Insert => {
            if pref_id > count {
                return Err(Error::IdOutOfRange { id: pref_id, count });
            }
            let eff = match count_from {
                CountFrom::Top => count - pref_id,
                CountFrom::Bottom => pref_id,
            };
            file.set_len((count + 1) * rec_size)?;
            // Highest index first so nothing is overwritten before it is copied.
            for src in (eff..count).rev() {
                let buf = read_at(file, src * rec_size, rec_size as usize)?;
                write_at(file, (src + 1) * rec_size, &buf)?;
            }
            eff
        }
        IncWriteMode::Overwrite => {
            if pref_id >= count {
                return Err(Error::IdOutOfRange { id: pref_id, count });
            }
            match count_from {
                CountFrom::Top => count - 1 - pref_id,
                CountFrom::Bottom => pref_id,
            }
        }
    };

    let start = id * rec_size;
    write_at(file, start, record)?;
    Ok(IncSpan { id, start, end: start + rec_size })
}

fn write_plain(file: &mut File, ctx: &WorkerContext, data: &[u8]) -> Result<Span> {
    let len = data.len() as u64;
    let reused = match &ctx.free_list {
        Some((registry, table)) => match registry.get_block(len, table) {
            Ok(block) => {
                if block.size > len {
                    let rest = block.start + len;
                    registry.mark_as_free(&format!("split@{}", rest), table, rest, block.end)?;
                }
                Some(block.start)
            }
            Err(Error::NoSuitableBlock { .. }) => None,
            Err(e) => {
                log::warn!("Free block lookup failed for {}: {}", table, e);
                None
            }
        },
        None => None,
    };

    let start = match reused {
        Some(start) => start,
        None => file.seek(SeekFrom::End(0))?,
    };
    if let Err(e) = write_at(file, start, data) {
        if let (Some(start), Some((registry, table))) = (reused, &ctx.free_list) {
            // Hand the taken block back; nothing references it.
            let end = start + len;
            if let Err(free_err) = registry.mark_as_free(&format!("unwritten@{}", start), table, start, end) {
                log::warn!("Failed to return block {}..{} of {}: {}", start, end, table, free_err);
            }
        }
        return Err(e);
    }
    let end = start + len;

    if let Some((registry, table)) = &ctx.free_list {
        if let Err(e) = registry.save_block_check(table, start, end) {
            log::warn!("Free block reconcile failed for {} {}..{}: {}", table, start, end, e);
        }
    }
    Ok(Span { start, end })
}

fn read_inc(file: &mut File, entry_size: u64, kind: IncReadKind) -> Result<Vec<RawIncRecord>> {
    let rec_size = record_size(entry_size);
    let count = file.metadata()?.len() / rec_size;

    match kind {
        IncReadKind::ById(id) => {
            if id >= count {
                return Err(Error::IdOutOfRange { id, count });
            }
            Ok(vec![(id, read_at(file, id * rec_size, rec_size as usize)?)])
        }
        IncReadKind::Last(n) | IncReadKind::First(n) if n == 0 || count == 0 => Ok(Vec::new()),
        IncReadKind::Last(n) => {
            let n = n.min(count);
            let first = count - n;
            let block = read_at(file, first * rec_size, (n * rec_size) as usize)?;
            Ok(block
                .chunks_exact(rec_size as usize)
                .enumerate()
                .map(|(i, chunk)| (first + i as u64, chunk.to_vec()))
                .rev()
                .collect())
        }
        IncReadKind::First(n) => {
            let n = n.min(count);
            let block = read_at(file, 0, (n * rec_size) as usize)?;
            Ok(block
                .chunks_exact(rec_size as usize)
                .enumerate()
                .map(|(i, chunk)| (i as u64, chunk.to_vec()))
                .collect())
        }
    }
}

fn read_plain(file: &mut File, start: u64, end: u64) -> Result<Vec<u8>> {
    if end <= start {
        return Err(Error::invalid_argument(format!("invalid read range {}..{}", start, end)));
    }
    read_at(file, start, (end - start) as usize)
}
