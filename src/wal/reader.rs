//! WAL reader implementation for recovery.

use super::record::WalRecord;
use crate::error::Result;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;

/// WAL reader that replays records in file order.
///
/// Malformed lines are logged and skipped so a torn tail never blocks recovery.
pub struct WalReader {
    reader: BufReader<File>,
    line_no: u64,
    skipped: u64,
}

impl WalReader {
    /// Open a WAL file for reading.
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self> {
        let file = File::open(path)?;
        Ok(Self { reader: BufReader::new(file), line_no: 0, skipped: 0 })
    }

    /// Read the next well-formed record, or `None` at EOF.
    pub fn read_next(&mut self) -> Result<Option<WalRecord>> {
        let mut buf = Vec::new();
        loop {
            buf.clear();
            let n = self.reader.read_until(b'\n', &mut buf)?;
            if n == 0 {
                return Ok(None);
            }
            self.line_no += 1;

            let line = String::from_utf8_lossy(&buf);
            if line.trim().is_empty() {
                continue;
            }
            match WalRecord::decode(&line) {
                Ok(record) => return Ok(Some(record)),
                Err(e) => {
                    log::warn!("Skipping WAL line {}: {}", self.line_no, e);
                    self.skipped += 1;
                }
            }
        }
    }

    /// Number of malformed lines skipped so far.
    pub fn skipped(&self) -> u64 {
        self.skipped
    }

    /// Read every remaining well-formed record.
    pub fn recover_all(&mut self) -> Result<Vec<WalRecord>> {
        let mut records = Vec::new();
        while let Some(record) = self.read_next()? {
            records.push(record);
        }
        if self.skipped > 0 {
            log::warn!("WAL recovery skipped {} malformed lines", self.skipped);
        }
        Ok(records)
    }
}
