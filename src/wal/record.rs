//! WAL record format implementation.
//!
//! Records are text lines, one per index mutation:
//! - `S|key|file|start|end`: key now points at `[start, end)` of `file`
//! - `D|key`: key was removed
//!
//! Fields are parsed from the right so keys may contain `|`; file names may
//! not. Neither may contain line breaks.

use crate::error::{Error, Result};
use crate::index::IndexEntry;

/// A single index mutation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WalRecord {
    /// Key stored at a location
    Set {
        /// Index key
        key: String,
        /// New location
        entry: IndexEntry,
    },
    /// Key removed
    Delete {
        /// Index key
        key: String,
    },
}

impl WalRecord {
    /// Returns the key this record mutates.
    pub fn key(&self) -> &str {
        match self {
            WalRecord::Set { key, .. } | WalRecord::Delete { key } => key,
        }
    }

    /// Encodes the record as a line, including the trailing newline.
    pub fn encode(&self) -> String {
        match self {
            WalRecord::Set { key, entry } => {
                format!("S|{}|{}|{}|{}\n", key, entry.file, entry.start, entry.end)
            }
            WalRecord::Delete { key } => format!("D|{}\n", key),
        }
    }

    /// Decodes a line (with or without trailing newline).
    pub fn decode(line: &str) -> Result<Self> {
        let line = line.trim_end_matches(&['\n', '\r'][..]);
        if let Some(rest) = line.strip_prefix("S|") {
            let (key, entry) = parse_location(rest)?;
            return Ok(WalRecord::Set { key, entry });
        }
        if let Some(key) = line.strip_prefix("D|") {
            return Ok(WalRecord::Delete { key: key.to_string() });
        }
        Err(Error::corruption(format!("Unknown WAL record: {:?}", line)))
    }
}

/// Parses `key|file|start|end` from the right.
pub(crate) fn parse_location(line: &str) -> Result<(String, IndexEntry)> {
    let mut parts = line.rsplitn(4, '|');
    let end = parts.next();
    let start = parts.next();
    let file = parts.next();
    let key = parts.next();
    match (key, file, start, end) {
        (Some(key), Some(file), Some(start), Some(end)) => {
            let start = start
                .parse::<u64>()
                .map_err(|e| Error::corruption(format!("Bad start offset {:?}: {}", start, e)))?;
            let end = end
                .parse::<u64>()
                .map_err(|e| Error::corruption(format!("Bad end offset {:?}: {}", end, e)))?;
            Ok((key.to_string(), IndexEntry::new(file, start, end)))
        }
        _ => Err(Error::corruption(format!("Malformed location line: {:?}", line))),
    }
}
