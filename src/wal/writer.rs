//! WAL writer implementation.
//!
//! Two background threads serve each log:
//! - the writer owns the buffered file and appends queued records, flushing
//!   every `wal_flush_ops` records or `wal_flush_interval`, whichever first
//! - the syncer fsyncs on request; one fsync may cover many flush requests
//!
//! Flush requests travel through the same queue as records, so a completed
//! flush covers everything enqueued before it.

use super::record::WalRecord;
use crate::config::Options;
use crate::error::{Error, Result};
use crate::fs_util::with_suffix;
use crossbeam::channel::{self, Receiver, RecvTimeoutError, SendTimeoutError, Sender};
use parking_lot::{Condvar, Mutex, RwLock};
use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

const WAL_BUFFER_SIZE: usize = 4 << 20;

/// Suffix of the log being retired during a rotation.
pub const OLD_WAL_SUFFIX: &str = ".old";

enum WalCommand {
    Append(WalRecord),
    Flush(Sender<Result<u64>>),
    Rotate(Sender<Result<()>>),
}

#[derive(Default)]
struct SyncState {
    requested: u64,
    completed: u64,
    error: Option<String>,
    closed: bool,
}

struct WalFile {
    writer: BufWriter<File>,
    sync_handle: File,
}

struct WalShared {
    path: PathBuf,
    file: Mutex<WalFile>,
    state: Mutex<SyncState>,
    cond: Condvar,
}

impl WalShared {
    fn open_file(path: &Path) -> Result<WalFile> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        let sync_handle = file.try_clone()?;
        Ok(WalFile { writer: BufWriter::with_capacity(WAL_BUFFER_SIZE, file), sync_handle })
    }

    /// Flushes the buffer and asks the syncer for an fsync.
    fn flush(&self) -> Result<u64> {
        self.file.lock().writer.flush()?;
        let mut state = self.state.lock();
        state.requested += 1;
        let seq = state.requested;
        self.cond.notify_all();
        Ok(seq)
    }

    /// Blocks until the fsync numbered `seq` (or a later one) has completed.
    fn wait_for_sync(&self, seq: u64) -> Result<()> {
        let mut state = self.state.lock();
        while state.completed < seq && !state.closed {
            self.cond.wait(&mut state);
        }
        if let Some(msg) = &state.error {
            return Err(Error::Io(std::io::Error::other(msg.clone())));
        }
        if state.completed < seq {
            return Err(Error::InvalidState("WAL closed before sync".into()));
        }
        Ok(())
    }

    /// Syncs, renames the log to `.old` and reopens it empty.
    fn rotate(&self) -> Result<()> {
        let old_path = with_suffix(&self.path, OLD_WAL_SUFFIX);
        let mut file = self.file.lock();
        file.writer.flush()?;
        file.sync_handle.sync_all()?;
        fs::rename(&self.path, &old_path)?;
        *file = Self::open_file(&self.path)?;
        log::info!("Rotated WAL {:?}", self.path);
        Ok(())
    }
}

/// Handle to a background-written WAL file.
pub struct WalWriter {
    shared: Arc<WalShared>,
    sender: RwLock<Option<Sender<WalCommand>>>,
    enqueue_timeout: Duration,
    threads: Mutex<Vec<JoinHandle<()>>>,
}

impl WalWriter {
    /// Opens (or creates) the log at `path` in append mode and starts its threads.
    pub fn open<P: AsRef<Path>>(path: P, options: &Options) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = WalShared::open_file(&path)?;
        let shared = Arc::new(WalShared {
            path,
            file: Mutex::new(file),
            state: Mutex::new(SyncState::default()),
            cond: Condvar::new(),
        });

        let (sender, receiver) = channel::bounded(options.wal_channel_capacity);

        let writer_shared = Arc::clone(&shared);
        let flush_ops = options.wal_flush_ops;
        let flush_interval = options.wal_flush_interval;
        let writer_thread = thread::Builder::new()
            .name("tsunamidb-wal-writer".into())
            .spawn(move || writer_loop(writer_shared, receiver, flush_ops, flush_interval))?;

        let sync_shared = Arc::clone(&shared);
        let sync_thread = thread::Builder::new()
            .name("tsunamidb-wal-sync".into())
            .spawn(move || sync_loop(sync_shared))?;

        Ok(Self {
            shared,
            sender: RwLock::new(Some(sender)),
            enqueue_timeout: options.wal_enqueue_timeout,
            threads: Mutex::new(vec![writer_thread, sync_thread]),
        })
    }

    fn send(&self, cmd: WalCommand) -> Result<()> {
        let sender = self
            .sender
            .read()
            .clone()
            .ok_or_else(|| Error::InvalidState("WAL is closed".into()))?;
        match sender.send_timeout(cmd, self.enqueue_timeout) {
            Ok(()) => Ok(()),
            Err(SendTimeoutError::Timeout(_)) => {
                log::warn!("WAL {:?} blocked for {:?}", self.shared.path, self.enqueue_timeout);
                Err(Error::WalTimeout)
            }
            Err(SendTimeoutError::Disconnected(_)) => {
                Err(Error::InvalidState("WAL writer stopped".into()))
            }
        }
    }

    /// Queues a record; it reaches the file on the next flush.
    pub fn append(&self, record: WalRecord) -> Result<()> {
        self.send(WalCommand::Append(record))
    }

    /// Writes out everything queued so far and waits for the fsync.
    pub fn flush(&self) -> Result<()> {
        let (ack, done) = channel::bounded(1);
        self.send(WalCommand::Flush(ack))?;
        let seq = done
            .recv()
            .map_err(|_| Error::InvalidState("WAL writer stopped".into()))??;
        self.shared.wait_for_sync(seq)
    }

    /// Syncs and starts a fresh empty log.
    ///
    /// Records queued before the call land in the retired `<path>.old`, which
    /// stays on disk until [`WalWriter::discard_retired`] so it can still be
    /// replayed if the process dies mid-snapshot.
    pub fn rotate(&self) -> Result<()> {
        let (ack, done) = channel::bounded(1);
        self.send(WalCommand::Rotate(ack))?;
        done.recv().map_err(|_| Error::InvalidState("WAL writer stopped".into()))?
    }

    /// Deletes the log retired by the last rotation.
    pub fn discard_retired(&self) -> Result<()> {
        crate::fs_util::remove_if_exists(&self.retired_path())
    }

    /// Path of the log retired by a rotation.
    pub fn retired_path(&self) -> PathBuf {
        with_suffix(&self.shared.path, OLD_WAL_SUFFIX)
    }

    /// Path of the log file.
    pub fn path(&self) -> &Path {
        &self.shared.path
    }

    /// Drains the queue, syncs, and stops the background threads.
    pub fn close(&self) -> Result<()> {
        // Dropping the last sender lets the writer drain and exit.
        if self.sender.write().take().is_none() {
            return Ok(());
        }
        let mut threads = std::mem::take(&mut *self.threads.lock()).into_iter();
        if let Some(writer) = threads.next() {
            let _ = writer.join();
        }
        let result = self.shared.flush().and_then(|seq| self.shared.wait_for_sync(seq));

        {
            let mut state = self.shared.state.lock();
            state.closed = true;
            self.shared.cond.notify_all();
        }
        for handle in threads {
            let _ = handle.join();
        }
        result
    }
}

impl Drop for WalWriter {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            log::error!("Failed to close WAL {:?}: {}", self.shared.path, e);
        }
    }
}

fn writer_loop(
    shared: Arc<WalShared>,
    receiver: Receiver<WalCommand>,
    flush_ops: usize,
    flush_interval: Duration,
) {
    let mut pending = 0usize;
    let mut last_flush = Instant::now();

    loop {
        let wait = flush_interval.saturating_sub(last_flush.elapsed());
        match receiver.recv_timeout(wait) {
            Ok(WalCommand::Append(record)) => {
                let line = record.encode();
                if let Err(e) = shared.file.lock().writer.write_all(line.as_bytes()) {
                    log::error!("WAL write failed for key {:?}: {}", record.key(), e);
                }
                pending += 1;
                if pending >= flush_ops {
                    flush_pending(&shared, &mut pending, &mut last_flush);
                }
            }
            Ok(WalCommand::Flush(ack)) => {
                pending = 0;
                last_flush = Instant::now();
                let _ = ack.send(shared.flush());
            }
            Ok(WalCommand::Rotate(ack)) => {
                pending = 0;
                last_flush = Instant::now();
                let _ = ack.send(shared.rotate());
            }
            Err(RecvTimeoutError::Timeout) => {
                if pending > 0 {
                    flush_pending(&shared, &mut pending, &mut last_flush);
                } else {
                    last_flush = Instant::now();
                }
            }
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }
}

fn flush_pending(shared: &WalShared, pending: &mut usize, last_flush: &mut Instant) {
    if let Err(e) = shared.flush() {
        log::error!("WAL flush failed: {}", e);
    }
    *pending = 0;
    *last_flush = Instant::now();
}

fn sync_loop(shared: Arc<WalShared>) {
    loop {
        let target = {
            let mut state = shared.state.lock();
            while state.completed == state.requested && !state.closed {
                shared.cond.wait(&mut state);
            }
            if state.completed == state.requested {
                break;
            }
            state.requested
        };

        let result = shared.file.lock().sync_handle.sync_all();

        let mut state = shared.state.lock();
        match result {
            Ok(()) => state.error = None,
            Err(e) => {
                log::error!("WAL sync failed for {:?}: {}", shared.path, e);
                state.error = Some(e.to_string());
            }
        }
        state.completed = target;
        shared.cond.notify_all();
    }
}
