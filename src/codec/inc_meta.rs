//! Incremental table descriptor.
//!
//! Stored as the value of the owning `(table, key)` pair:
//! `[entry_size: u64 LE][name_len: u32 LE][file name bytes]`

use super::inc_entry::MAX_ENTRY_SIZE;
use crate::error::{Error, Result};
use bytes::{Buf, BufMut, BytesMut};

const FIXED_LEN: usize = 8 + 4;

/// Describes the file backing an incremental table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IncTableMeta {
    /// Maximum body size of one record.
    pub entry_size: u64,
    /// File name relative to the incremental tables directory.
    pub file_name: String,
}

impl IncTableMeta {
    /// Creates a descriptor.
    pub fn new(entry_size: u64, file_name: impl Into<String>) -> Self {
        Self { entry_size, file_name: file_name.into() }
    }

    /// Serializes the descriptor.
    pub fn encode(&self) -> Vec<u8> {
        let name = self.file_name.as_bytes();
        let mut buf = BytesMut::with_capacity(FIXED_LEN + name.len());
        buf.put_u64_le(self.entry_size);
        buf.put_u32_le(name.len() as u32);
        buf.put_slice(name);
        buf.to_vec()
    }

    /// Parses a descriptor written by [`IncTableMeta::encode`].
    pub fn decode(mut data: &[u8]) -> Result<Self> {
        if data.len() < FIXED_LEN {
            return Err(Error::corruption(format!(
                "Incremental table metadata too short: {} bytes",
                data.len()
            )));
        }
        let entry_size = data.get_u64_le();
        if entry_size > MAX_ENTRY_SIZE {
            return Err(Error::corruption(format!("Entry size {} out of range", entry_size)));
        }
        let name_len = data.get_u32_le() as usize;
        if data.len() < name_len {
            return Err(Error::corruption("Truncated incremental table file name"));
        }
        let file_name = String::from_utf8(data[..name_len].to_vec())
            .map_err(|e| Error::corruption(format!("Invalid table file name: {}", e)))?;
        Ok(Self { entry_size, file_name })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_meta_roundtrip() {
        let meta = IncTableMeta::new(128, "events__log.tbl");
        let decoded = IncTableMeta::decode(&meta.encode()).unwrap();
        assert_eq!(decoded, meta);
    }

    #[test]
    fn test_meta_truncated() {
        let mut raw = IncTableMeta::new(8, "abc.tbl").encode();
        raw.truncate(raw.len() - 2);
        assert!(matches!(IncTableMeta::decode(&raw), Err(Error::Corruption(_))));
        assert!(IncTableMeta::decode(&[0u8; 5]).is_err());
    }
}
