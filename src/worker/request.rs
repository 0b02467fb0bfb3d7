//! Requests understood by a block file worker.

use crate::error::Result;
use crossbeam::channel::Sender;

/// Which end of an incremental table a custom id counts from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CountFrom {
    /// 0 is the newest record.
    #[default]
    Top,
    /// 0 is the oldest record.
    Bottom,
}

/// How a record with a custom id is placed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum IncWriteMode {
    /// Shift the target and everything after it one slot up.
    #[default]
    Insert,
    /// Replace the record in place.
    Overwrite,
}

/// Which records of an incremental table to read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IncReadKind {
    /// One record by absolute row id.
    ById(u64),
    /// Up to N newest records, newest first.
    Last(u64),
    /// Up to N oldest records, oldest first.
    First(u64),
}

/// Byte range written by a plain write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Span {
    /// First byte of the write
    pub start: u64,
    /// One past the last byte
    pub end: u64,
}

/// Result of an incremental write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IncSpan {
    /// Absolute (bottom-based) row id.
    pub id: u64,
    /// Byte offset of the record
    pub start: u64,
    /// One past the record's last byte
    pub end: u64,
}

/// A raw incremental record with its absolute row id.
pub type RawIncRecord = (u64, Vec<u8>);

pub(crate) type Reply<T> = Sender<Result<T>>;

pub(crate) enum Request {
    Read {
        start: u64,
        end: u64,
        reply: Reply<Vec<u8>>,
    },
    Write {
        data: Vec<u8>,
        reply: Reply<Span>,
    },
    WriteInc {
        record: Vec<u8>,
        entry_size: u64,
        reply: Reply<IncSpan>,
    },
    WriteIncAt {
        record: Vec<u8>,
        entry_size: u64,
        pref_id: u64,
        count_from: CountFrom,
        mode: IncWriteMode,
        reply: Reply<IncSpan>,
    },
    ReadInc {
        entry_size: u64,
        kind: IncReadKind,
        reply: Reply<Vec<RawIncRecord>>,
    },
    DeleteInc {
        reply: Reply<()>,
    },
}

impl Request {
    /// Execution group inside a batch; lower runs first.
    pub(crate) fn group(&self) -> u8 {
        match self {
            Request::WriteIncAt { .. } => 0,
            Request::WriteInc { .. } => 1,
            Request::Write { .. } => 2,
            Request::ReadInc { .. } => 3,
            Request::Read { .. } => 4,
            Request::DeleteInc { .. } => 5,
        }
    }
}
