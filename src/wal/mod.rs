//! Write-Ahead Log (WAL) implementation.
//!
//! The WAL makes key-index mutations durable between snapshots. Every
//! save or remove is appended as a text line and replayed on startup on
//! top of the last snapshot.
//!
//! ## Architecture
//!
//! - **Record Format**: `S|key|file|start|end` or `D|key`, one per line
//! - **Batching**: a background writer flushes every N records or T ms
//! - **Group sync**: a background syncer lets one fsync cover many flushes
//! - **Rotation**: after a snapshot the log is retired and restarted empty
//!
//! ## Usage
//!
//! ```rust,no_run
//! use tsunamidb::index::IndexEntry;
//! use tsunamidb::wal::{WalReader, WalRecord, WalWriter};
//! use tsunamidb::Options;
//!
//! # fn main() -> Result<(), tsunamidb::Error> {
//! let wal = WalWriter::open("index.wal", &Options::default())?;
//! wal.append(WalRecord::Set { key: "k1".into(), entry: IndexEntry::new("t", 0, 9) })?;
//! wal.append(WalRecord::Delete { key: "k1".into() })?;
//! wal.flush()?;
//!
//! let mut reader = WalReader::new("index.wal")?;
//! while let Some(record) = reader.read_next()? {
//!     println!("Recovered: {:?}", record);
//! }
//! # Ok(())
//! # }
//! ```

pub mod reader;
pub mod record;
pub mod writer;

pub use reader::WalReader;
pub use record::WalRecord;
pub use writer::{WalWriter, OLD_WAL_SUFFIX};
