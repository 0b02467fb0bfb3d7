//! Fixed-width record format of incremental tables.
//!
//! A record is `entry_size + 3` bytes. Byte 0 holds control bits:
//! - bit 0: skip (soft-deleted)
//! - bit 1: a next-live-entry pointer follows in bytes 1..9 (LE u64)
//!
//! A live record is right-aligned: zero padding, a `0x01` marker, then the
//! body. Scanning from byte 1 therefore always finds the marker first.

use crate::error::{Error, Result};

const SKIP_BIT: u8 = 0b0000_0001;
const NEXT_POINTER_BIT: u8 = 0b0000_0010;
const DATA_MARKER: u8 = 0x01;

/// Bytes of overhead on top of the entry size.
pub const RECORD_OVERHEAD: u64 = 3;

/// Largest accepted entry size.
pub const MAX_ENTRY_SIZE: u64 = u32::MAX as u64;

/// Returns the on-disk size of one record for `entry_size`.
#[inline]
pub fn record_size(entry_size: u64) -> u64 {
    entry_size.saturating_add(RECORD_OVERHEAD)
}

/// Rejects entry sizes above [`MAX_ENTRY_SIZE`].
pub fn check_entry_size(entry_size: u64) -> Result<()> {
    if entry_size > MAX_ENTRY_SIZE {
        return Err(Error::invalid_argument(format!(
            "entry size {} exceeds the maximum of {}",
            entry_size, MAX_ENTRY_SIZE
        )));
    }
    Ok(())
}

/// A decoded incremental-table record.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct IncRecord {
    /// Body bytes; empty for skipped records
    pub data: Vec<u8>,
    /// Soft-deleted
    pub skip: bool,
    /// Next live row, 0 when absent
    pub next_pointer: u64,
}

/// Encodes `body` into a record of `entry_size + 3` bytes.
pub fn encode_inc_entry(entry_size: u64, body: &[u8]) -> Result<Vec<u8>> {
    check_entry_size(entry_size)?;
    if body.len() as u64 > entry_size {
        return Err(Error::BodyTooLarge { size: body.len(), entry_size });
    }
    let total = record_size(entry_size) as usize;
    let mut buf = vec![0u8; total];
    let pos = total - body.len() - 1;
    buf[pos] = DATA_MARKER;
    buf[pos + 1..].copy_from_slice(body);
    Ok(buf)
}

/// Marks an encoded record as skipped.
///
/// A non-zero `next_pointer` sets the pointer bit; its value is only stored
/// when the record is at least 9 bytes long.
pub fn set_skip_inc_entry(entry: &mut [u8], next_pointer: u64) {
    if entry.is_empty() {
        return;
    }
    entry[0] |= SKIP_BIT;
    if next_pointer > 0 {
        entry[0] |= NEXT_POINTER_BIT;
        if entry.len() >= 9 {
            entry[1..9].copy_from_slice(&next_pointer.to_le_bytes());
        }
    }
}

/// Builds a fresh zeroed record with the skip bit set.
pub fn skip_inc_entry(entry_size: u64, next_pointer: u64) -> Result<Vec<u8>> {
    check_entry_size(entry_size)?;
    let mut buf = vec![0u8; record_size(entry_size) as usize];
    set_skip_inc_entry(&mut buf, next_pointer);
    Ok(buf)
}

/// Decodes a raw record.
pub fn decode_inc_entry(entry_size: u64, raw: &[u8]) -> Result<IncRecord> {
    check_entry_size(entry_size)?;
    let total = record_size(entry_size) as usize;
    if raw.len() != total {
        return Err(Error::corruption(format!(
            "Invalid entry length: expected {}, got {}",
            total,
            raw.len()
        )));
    }

    let control = raw[0];
    if control & SKIP_BIT != 0 {
        let next_pointer = if control & NEXT_POINTER_BIT != 0 && raw.len() >= 9 {
            let mut ptr = [0u8; 8];
            ptr.copy_from_slice(&raw[1..9]);
            u64::from_le_bytes(ptr)
        } else {
            0
        };
        return Ok(IncRecord { data: Vec::new(), skip: true, next_pointer });
    }

    let data = match raw[1..].iter().position(|&b| b == DATA_MARKER) {
        Some(pos) => raw[pos + 2..].to_vec(),
        None => Vec::new(),
    };
    Ok(IncRecord { data, skip: false, next_pointer: 0 })
}
