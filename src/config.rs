//! Configuration options for the TsunamiDB storage engine.

use std::path::PathBuf;
use std::time::Duration;

/// Default root directory used by [`crate::DB::open_default`].
pub const DEFAULT_DATA_DIR: &str = "./db";

/// Configuration options for opening a database.
#[derive(Debug, Clone)]
pub struct Options {
    /// Root directory holding `data/`, `inc_tables/` and `maps/`.
    /// Only consulted by [`crate::DB::open_default`].
    /// Default: `./db`
    pub data_dir: PathBuf,

    /// Create the directory layout if it doesn't exist.
    /// Default: true
    pub create_if_missing: bool,

    /// Number of independently locked partitions per table index.
    /// Default: 256
    pub shard_count: usize,

    /// Number of buffered WAL records that triggers a flush.
    /// Default: 100
    pub wal_flush_ops: usize,

    /// Maximum time a WAL record stays buffered before a flush.
    /// Default: 50ms
    pub wal_flush_interval: Duration,

    /// Capacity of the WAL command queue.
    /// Default: 100_000
    pub wal_channel_capacity: usize,

    /// How long an index mutation may block on a full WAL queue.
    /// Default: 5s
    pub wal_enqueue_timeout: Duration,

    /// Interval between background index snapshots.
    /// Default: 5 minutes
    pub snapshot_interval: Duration,

    /// Capacity of each block file worker's request queue.
    /// Default: 10_000
    pub worker_queue_capacity: usize,

    /// How long a caller waits for a block file worker to accept a request.
    /// Default: 1s
    pub worker_send_timeout: Duration,

    /// Maximum number of compiled key patterns kept per table.
    /// Default: 1024
    pub max_regex_cache: usize,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from(DEFAULT_DATA_DIR),
            create_if_missing: true,
            shard_count: 256,
            wal_flush_ops: 100,
            wal_flush_interval: Duration::from_millis(50),
            wal_channel_capacity: 100_000,
            wal_enqueue_timeout: Duration::from_secs(5),
            snapshot_interval: Duration::from_secs(5 * 60),
            worker_queue_capacity: 10_000,
            worker_send_timeout: Duration::from_secs(1),
            max_regex_cache: 1024,
        }
    }
}

impl Options {
    /// Creates a new Options with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the root data directory.
    pub fn data_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.data_dir = dir.into();
        self
    }

    /// Sets whether to create the directory layout if it doesn't exist.
    pub fn create_if_missing(mut self, value: bool) -> Self {
        self.create_if_missing = value;
        self
    }

    /// Sets the number of index shards per table.
    pub fn shard_count(mut self, count: usize) -> Self {
        self.shard_count = count;
        self
    }

    /// Sets the WAL flush thresholds.
    pub fn wal_flush(mut self, ops: usize, interval: Duration) -> Self {
        self.wal_flush_ops = ops;
        self.wal_flush_interval = interval;
        self
    }

    /// Sets the WAL enqueue timeout.
    pub fn wal_enqueue_timeout(mut self, timeout: Duration) -> Self {
        self.wal_enqueue_timeout = timeout;
        self
    }

    /// Sets the background snapshot interval.
    pub fn snapshot_interval(mut self, interval: Duration) -> Self {
        self.snapshot_interval = interval;
        self
    }

    /// Sets the per-worker queue capacity.
    pub fn worker_queue_capacity(mut self, capacity: usize) -> Self {
        self.worker_queue_capacity = capacity;
        self
    }

    /// Sets the worker send timeout.
    pub fn worker_send_timeout(mut self, timeout: Duration) -> Self {
        self.worker_send_timeout = timeout;
        self
    }

    /// Validates the options and returns an error if any are invalid.
    pub fn validate(&self) -> crate::Result<()> {
        if self.shard_count == 0 {
            return Err(crate::Error::invalid_argument("shard_count must be > 0"));
        }
        if self.wal_flush_ops == 0 {
            return Err(crate::Error::invalid_argument("wal_flush_ops must be > 0"));
        }
        if self.wal_channel_capacity == 0 || self.worker_queue_capacity == 0 {
            return Err(crate::Error::invalid_argument("queue capacities must be > 0"));
        }
        if self.wal_flush_interval.is_zero() || self.snapshot_interval.is_zero() {
            return Err(crate::Error::invalid_argument("intervals must be non-zero"));
        }
        if self.wal_enqueue_timeout.is_zero() || self.worker_send_timeout.is_zero() {
            return Err(crate::Error::invalid_argument("timeouts must be non-zero"));
        }
        if self.max_regex_cache == 0 {
            return Err(crate::Error::invalid_argument("max_regex_cache must be > 0"));
        }
        Ok(())
    }
}
