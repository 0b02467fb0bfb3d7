//! Error types for the TsunamiDB storage engine.

use std::io;
use thiserror::Error;

/// The result type used throughout TsunamiDB.
pub type Result<T> = std::result::Result<T, Error>;

/// The error type for TsunamiDB operations.
#[derive(Debug, Error)]
pub enum Error {
    /// An I/O error occurred.
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// Data corruption was detected (malformed header, short buffer, bad metadata).
    #[error("Data corruption: {0}")]
    Corruption(String),

    /// The requested key, table or entry was not found.
    #[error("Not found: {0}")]
    NotFound(String),

    /// An invalid argument was provided.
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// An incremental-table body does not fit the table's entry size.
    #[error("Body size {size} exceeds entry size {entry_size}")]
    BodyTooLarge {
        /// Length of the rejected body.
        size: usize,
        /// Entry size of the target table.
        entry_size: u64,
    },

    /// No free block in the table is large enough for the request.
    #[error("No suitable free block of {size} bytes in table {table}")]
    NoSuitableBlock {
        /// Table that was searched.
        table: String,
        /// Requested size in bytes.
        size: u64,
    },

    /// A row id falls outside the occupied range of an incremental table.
    #[error("Row id {id} out of range (record count {count})")]
    IdOutOfRange {
        /// Requested row id.
        id: u64,
        /// Number of records currently in the table.
        count: u64,
    },

    /// An entry key is already bound to another row.
    #[error("Duplicate entry key: {0}")]
    DuplicateKey(String),

    /// The write-ahead log queue stayed full for the whole enqueue timeout.
    #[error("WAL timeout: enqueue blocked for too long")]
    WalTimeout,

    /// A block file worker did not accept a request in time.
    #[error("Worker is unresponsive (send timeout)")]
    WorkerSendTimeout,

    /// A block file worker died before answering.
    #[error("Worker crashed")]
    WorkerCrashed,

    /// A serialization or deserialization error occurred.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// A key pattern failed to compile.
    #[error("Invalid pattern: {0}")]
    Regex(String),

    /// The engine is in an invalid state (e.g. already closed).
    #[error("Invalid state: {0}")]
    InvalidState(String),
}

impl Error {
    /// Creates a new corruption error.
    pub fn corruption(msg: impl Into<String>) -> Self {
        Error::Corruption(msg.into())
    }

    /// Creates a new not found error.
    pub fn not_found(msg: impl Into<String>) -> Self {
        Error::NotFound(msg.into())
    }

    /// Creates a new invalid argument error.
    pub fn invalid_argument(msg: impl Into<String>) -> Self {
        Error::InvalidArgument(msg.into())
    }

    /// Returns true for errors that may succeed when re-issued later.
    ///
    /// The engine never retries on its own; this only helps callers pick a
    /// retry policy.
    pub fn is_transient(&self) -> bool {
        matches!(self, Error::WalTimeout | Error::WorkerSendTimeout | Error::WorkerCrashed)
    }

    /// Returns true when the error reports an absent key, block or row.
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            Error::NotFound(_) | Error::NoSuitableBlock { .. } | Error::IdOutOfRange { .. }
        )
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Serialization(err.to_string())
    }
}

impl From<regex::Error> for Error {
    fn from(err: regex::Error) -> Self {
        Error::Regex(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = Error::corruption("short header");
        assert_eq!(err.to_string(), "Data corruption: short header");

        let err = Error::BodyTooLarge { size: 20, entry_size: 16 };
        assert!(err.to_string().contains("20"));
        assert!(err.to_string().contains("16"));
    }

    #[test]
    fn test_error_from_io() {
        let io_err = io::Error::new(io::ErrorKind::NotFound, "file not found");
        let err: Error = io_err.into();
        assert!(matches!(err, Error::Io(_)));
    }

    #[test]
    fn test_error_classification() {
        assert!(Error::WalTimeout.is_transient());
        assert!(Error::WorkerCrashed.is_transient());
        assert!(!Error::not_found("k").is_transient());

        assert!(Error::IdOutOfRange { id: 3, count: 1 }.is_not_found());
        assert!(!Error::DuplicateKey("a".into()).is_not_found());
    }

    #[test]
    fn test_error_from_regex() {
        let err: Error = regex::Regex::new("(").unwrap_err().into();
        assert!(matches!(err, Error::Regex(_)));
    }
}
