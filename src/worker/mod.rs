//! Block file workers.
//!
//! Every physical file is served by exactly one worker thread that owns its
//! handle. Callers talk to it through a bounded queue; the worker blocks
//! until a request arrives, drains whatever else is queued into one batch
//! and runs it (see [`batch`]). Every drained batch runs at once, so
//! nothing is left pending between wakeups.
//!
//! A worker that panics drops its queue and every pending reply, so callers
//! see [`Error::WorkerCrashed`]; the next request for that path starts a
//! fresh worker.

pub mod batch;
pub mod request;

pub use request::{CountFrom, IncReadKind, IncSpan, IncWriteMode, RawIncRecord, Span};

use crate::config::Options;
use crate::error::{Error, Result};
use crate::freelist::FreeBlockRegistry;
use crate::fs_util::sanitize_name;
use batch::WorkerContext;
use crossbeam::channel::{self, Receiver, SendTimeoutError, Sender};
use parking_lot::{Mutex, RwLock};
use request::{Reply, Request};
use std::collections::HashMap;
use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

/// Upper bound on requests drained into one batch.
const MAX_BATCH: usize = 1024;

/// Pool of per-file workers for block files and incremental tables.
pub struct FileWorkerPool {
    data_dir: PathBuf,
    inc_dir: PathBuf,
    free_blocks: Arc<FreeBlockRegistry>,
    queue_capacity: usize,
    send_timeout: Duration,
    workers: RwLock<HashMap<PathBuf, Sender<Request>>>,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl FileWorkerPool {
    /// Creates an empty pool. Workers start on first use of each path.
    pub fn new(
        data_dir: impl Into<PathBuf>,
        inc_dir: impl Into<PathBuf>,
        free_blocks: Arc<FreeBlockRegistry>,
        options: &Options,
    ) -> Self {
        Self {
            data_dir: data_dir.into(),
            inc_dir: inc_dir.into(),
            free_blocks,
            queue_capacity: options.worker_queue_capacity,
            send_timeout: options.worker_send_timeout,
            workers: RwLock::new(HashMap::new()),
            handles: Mutex::new(Vec::new()),
        }
    }

    /// Path of the block file backing `table`.
    pub fn data_path(&self, table: &str) -> PathBuf {
        self.data_dir.join(sanitize_name(table))
    }

    /// Path of an incremental table file.
    pub fn inc_path(&self, file_name: &str) -> PathBuf {
        self.inc_dir.join(file_name)
    }

    fn worker(&self, path: &Path, table: Option<&str>) -> Result<Sender<Request>> {
        if let Some(sender) = self.workers.read().get(path) {
            return Ok(sender.clone());
        }

        let mut workers = self.workers.write();
        if let Some(sender) = workers.get(path) {
            return Ok(sender.clone());
        }

        let file = batch::open_file(path, false)?;
        let (sender, receiver) = channel::bounded(self.queue_capacity);
        let ctx = WorkerContext {
            path: path.to_path_buf(),
            free_list: table.map(|t| (Arc::clone(&self.free_blocks), t.to_string())),
        };
        let handle = thread::Builder::new()
            .name(format!("tsunamidb-file-{}", path.display()))
            .spawn(move || worker_loop(file, ctx, receiver))?;

        self.handles.lock().push(handle);
        workers.insert(path.to_path_buf(), sender.clone());
        log::debug!("Started file worker for {:?}", path);
        Ok(sender)
    }

    fn evict(&self, path: &Path, dead: &Sender<Request>) {
        let mut workers = self.workers.write();
        if workers.get(path).is_some_and(|s| s.same_channel(dead)) {
            workers.remove(path);
            log::warn!("File worker for {:?} crashed, evicted", path);
        }
    }

    fn submit<T>(
        &self,
        path: &Path,
        table: Option<&str>,
        make: impl FnOnce(Reply<T>) -> Request,
    ) -> Result<T> {
        let sender = self.worker(path, table)?;
        let (reply, response) = channel::bounded(1);
        match sender.send_timeout(make(reply), self.send_timeout) {
            Ok(()) => {}
            Err(SendTimeoutError::Timeout(_)) => return Err(Error::WorkerSendTimeout),
            Err(SendTimeoutError::Disconnected(_)) => {
                self.evict(path, &sender);
                return Err(Error::WorkerCrashed);
            }
        }
        match response.recv() {
            Ok(result) => result,
            Err(_) => {
                self.evict(path, &sender);
                Err(Error::WorkerCrashed)
            }
        }
    }

    /// Reads `[start, end)` of a table's block file.
    pub fn read(&self, table: &str, start: u64, end: u64) -> Result<Vec<u8>> {
        let path = self.data_path(table);
        self.submit(&path, Some(table), |reply| Request::Read { start, end, reply })
    }

    /// Writes `data` into a table's block file, reusing free space when possible.
    pub fn write(&self, table: &str, data: Vec<u8>) -> Result<Span> {
        let path = self.data_path(table);
        self.submit(&path, Some(table), |reply| Request::Write { data, reply })
    }

    /// Appends an encoded record to an incremental table.
    pub fn write_inc(&self, file_name: &str, record: Vec<u8>, entry_size: u64) -> Result<IncSpan> {
        let path = self.inc_path(file_name);
        self.submit(&path, None, |reply| Request::WriteInc { record, entry_size, reply })
    }

    /// Inserts or overwrites an encoded record at a custom id.
    pub fn write_inc_at(
        &self,
        file_name: &str,
        record: Vec<u8>,
        entry_size: u64,
        pref_id: u64,
        count_from: CountFrom,
        mode: IncWriteMode,
    ) -> Result<IncSpan> {
        let path = self.inc_path(file_name);
        self.submit(&path, None, |reply| Request::WriteIncAt {
            record,
            entry_size,
            pref_id,
            count_from,
            mode,
            reply,
        })
    }

    /// Reads raw records of an incremental table.
    pub fn read_inc(&self, file_name: &str, entry_size: u64, kind: IncReadKind) -> Result<Vec<RawIncRecord>> {
        let path = self.inc_path(file_name);
        self.submit(&path, None, |reply| Request::ReadInc { entry_size, kind, reply })
    }

    /// Empties an incremental table file; ids restart at 0.
    pub fn delete_inc(&self, file_name: &str) -> Result<()> {
        let path = self.inc_path(file_name);
        self.submit(&path, None, |reply| Request::DeleteInc { reply })
    }

    /// Number of live workers.
    pub fn worker_count(&self) -> usize {
        self.workers.read().len()
    }

    /// Stops all workers after they finish queued requests.
    pub fn close(&self) {
        self.workers.write().clear();
        let handles = std::mem::take(&mut *self.handles.lock());
        for handle in handles {
            if handle.join().is_err() {
                log::error!("A file worker panicked");
            }
        }
    }
}

impl Drop for FileWorkerPool {
    fn drop(&mut self) {
        self.close();
    }
}

fn worker_loop(file: File, ctx: WorkerContext, receiver: Receiver<Request>) {
    let mut file = Some(file);
    let mut pending: Vec<Request> = Vec::new();

    // Ends once every sender is gone.
    while let Ok(first) = receiver.recv() {
        let mut next = Some(first);
        while let Some(req) = next.take() {
            if let Request::DeleteInc { reply } = req {
                if !pending.is_empty() {
                    batch::execute_batch(file.as_mut(), &ctx, std::mem::take(&mut pending));
                }
                let _ = reply.send(batch::delete_inc(&mut file, &ctx.path));
            } else {
                pending.push(req);
            }
            if pending.len() < MAX_BATCH {
                next = receiver.try_recv().ok();
            }
        }

        if !pending.is_empty() {
            log::debug!("Executing batch of {} requests on {:?}", pending.len(), ctx.path);
            batch::execute_batch(file.as_mut(), &ctx, std::mem::take(&mut pending));
        }
    }
    log::debug!("File worker for {:?} stopped", ctx.path);
}
