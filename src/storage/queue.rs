//! # Log Writer Queue
//!
//! Single-consumer background writer that turns promoted cache pages into
//! durable log-file bytes. Producers enqueue readable pages whose log
//! positions were already reserved; one dedicated thread drains the queue,
//! writes each page at its position, and flushes when the queue runs dry.
//!
//! ```text
//! write_async ──┐
//! write_async ──┼──► FIFO ──► [quilldb-log-writer] ──► write_at ──► sync
//! write_async ──┘                    │
//!                                    └──► page.release()  (queue's share)
//! ```
//!
//! ## State Machine
//!
//! ```text
//! Idle ──(page enqueued)──► Draining ──(queue empty)──► Flushing ──ok──► Idle
//!                                                        │
//!                                                        └──(I/O error)──► Failed (terminal)
//! ```
//!
//! ## Ordering
//!
//! Pages enqueued by one thread are written in enqueue order. Across
//! threads only eventual write-out is guaranteed; positions are unique and
//! preassigned, so inter-producer order is irrelevant. After [`LogWriterQueue::wait`]
//! returns, everything enqueued before the call is durable.
//!
//! ## Failure
//!
//! The consumer stops on the first write or flush error. The error is
//! recorded on the engine state (for global reporting) and parked on the
//! queue, from where the next `enqueue_page` or `wait` rethrows it: a
//! producer can never silently lose a write to a dead consumer.
//!
//! Visibility note: a page is readable from the cache as soon as it is
//! promoted, before this queue has flushed it. The cache is the source of
//! truth for readers; this thread only makes bytes durable.

use std::collections::VecDeque;
use std::sync::Arc;
use std::thread::JoinHandle;

use eyre::{bail, ensure, Result};
use parking_lot::{Condvar, Mutex};
use tracing::{debug, error, info};

use crate::config::POSITION_UNSET;
use crate::engine::EngineState;
use crate::memory::PageBuffer;
use crate::storage::file::RandomAccess;
use crate::storage::FileOrigin;

struct QueueState {
    pending: VecDeque<Arc<PageBuffer>>,
    /// True from the moment the consumer picks up a batch until that
    /// batch's flush completes with the queue still empty. `wait` must not
    /// return during this window even though `pending` is empty.
    writing: bool,
    shutdown: bool,
}

struct QueueShared {
    file: Arc<dyn RandomAccess>,
    engine: Arc<EngineState>,
    state: Mutex<QueueState>,
    not_empty: Condvar,
    drained: Condvar,
    failure: Mutex<Option<String>>,
}

/// Asynchronous, unbounded, single-consumer writer for the log file.
pub struct LogWriterQueue {
    shared: Arc<QueueShared>,
    consumer: Mutex<Option<JoinHandle<()>>>,
}

impl LogWriterQueue {
    pub fn new(file: Arc<dyn RandomAccess>, engine: Arc<EngineState>) -> Self {
        let shared = Arc::new(QueueShared {
            file,
            engine,
            state: Mutex::new(QueueState {
                pending: VecDeque::new(),
                writing: false,
                shutdown: false,
            }),
            not_empty: Condvar::new(),
            drained: Condvar::new(),
            failure: Mutex::new(None),
        });

        let consumer = {
            let shared = Arc::clone(&shared);
            std::thread::Builder::new()
                .name("quilldb-log-writer".to_string())
                .spawn(move || run(shared))
                .expect("failed to spawn log writer thread")
        };

        Self {
            shared,
            consumer: Mutex::new(Some(consumer)),
        }
    }

    /// Hands one readable page (carrying the queue's share) to the
    /// consumer. Rethrows a prior asynchronous failure instead of
    /// accepting work a dead consumer would drop.
    pub fn enqueue_page(&self, page: Arc<PageBuffer>) -> Result<()> {
        if let Some(message) = self.shared.failure.lock().as_ref() {
            bail!("log writer queue failed: {message}");
        }

        ensure!(
            page.origin() == Some(FileOrigin::Log),
            "only log pages can be enqueued, got {:?}",
            page.origin()
        );
        ensure!(
            page.position() != POSITION_UNSET,
            "page enqueued before a log position was assigned"
        );

        let mut state = self.shared.state.lock();
        state.pending.push_back(page);
        drop(state);
        self.shared.not_empty.notify_one();
        Ok(())
    }

    /// Blocks until the queue is empty and its last batch has been
    /// flushed. Callers serialise against concurrent producers (normally
    /// by holding the database write lock). Rethrows a stored failure.
    pub fn wait(&self) -> Result<()> {
        let mut state = self.shared.state.lock();
        loop {
            if let Some(message) = self.shared.failure.lock().as_ref() {
                bail!("log writer queue failed: {message}");
            }
            if state.pending.is_empty() && !state.writing {
                return Ok(());
            }
            self.shared.drained.wait(&mut state);
        }
    }

    pub fn len(&self) -> usize {
        self.shared.state.lock().pending.len()
    }

    pub fn is_empty(&self) -> bool {
        let state = self.shared.state.lock();
        state.pending.is_empty() && !state.writing
    }
}

impl Drop for LogWriterQueue {
    fn drop(&mut self) {
        {
            let mut state = self.shared.state.lock();
            state.shutdown = true;
        }
        self.shared.not_empty.notify_all();

        if let Some(handle) = self.consumer.lock().take() {
            let _ = handle.join();
        }
    }
}

fn run(shared: Arc<QueueShared>) {
    info!("log writer started");

    loop {
        {
            let mut state = shared.state.lock();
            while state.pending.is_empty() && !state.shutdown {
                shared.not_empty.wait(&mut state);
            }
            if state.pending.is_empty() && state.shutdown {
                break;
            }
            state.writing = true;
        }

        let mut written = 0usize;
        loop {
            let page = shared.state.lock().pending.pop_front();
            let Some(page) = page else { break };

            let result = shared.file.write_at(page.as_slice(), page.position());
            page.release();

            match result {
                Ok(()) => written += 1,
                Err(cause) => {
                    fail(&shared, cause);
                    return;
                }
            }
        }

        if let Err(cause) = shared.file.sync() {
            fail(&shared, cause);
            return;
        }
        debug!(pages = written, "log batch flushed");

        {
            let mut state = shared.state.lock();
            if state.pending.is_empty() {
                state.writing = false;
                shared.drained.notify_all();
                if state.shutdown {
                    break;
                }
            }
        }
    }

    info!("log writer stopped");
}

fn fail(shared: &QueueShared, cause: eyre::Report) {
    let cause = cause.wrap_err("log writer failed");
    error!(error = %format!("{cause:#}"), "log writer terminated");

    shared.engine.handle(&cause);
    *shared.failure.lock() = Some(format!("{cause:#}"));

    {
        let mut state = shared.state.lock();
        state.writing = false;
    }
    shared.drained.notify_all();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PAGE_SIZE;
    use crate::memory::MemoryCache;
    use crate::storage::file::RandomAccessFile;
    use tempfile::tempdir;

    fn log_page(cache: &MemoryCache, position: u64, value: u8) -> Arc<PageBuffer> {
        let mut page = cache.new_page();
        page.set_position(position);
        page.set_origin(FileOrigin::Log);
        page.bytes_mut().fill(value);
        cache.move_to_readable(page).unwrap()
    }

    #[test]
    fn enqueued_pages_become_durable_after_wait() {
        let dir = tempdir().unwrap();
        let file: Arc<dyn RandomAccess> =
            Arc::new(RandomAccessFile::open(dir.path().join("q-log.db"), false).unwrap());
        let cache = MemoryCache::new();
        let queue = LogWriterQueue::new(Arc::clone(&file), Arc::new(EngineState::new()));

        for i in 0..4u8 {
            let page = log_page(&cache, i as u64 * PAGE_SIZE as u64, i + 1);
            queue.enqueue_page(page).unwrap();
        }
        queue.wait().unwrap();
        assert!(queue.is_empty());

        assert_eq!(file.len().unwrap(), 4 * PAGE_SIZE as u64);
        for i in 0..4u8 {
            let mut buf = vec![0u8; PAGE_SIZE];
            file.read_page_into(&mut buf, i as u64 * PAGE_SIZE as u64).unwrap();
            assert!(buf.iter().all(|&b| b == i + 1), "page {i} bytes mismatch");
        }
    }

    #[test]
    fn queue_reference_is_released_after_write() {
        let dir = tempdir().unwrap();
        let file: Arc<dyn RandomAccess> =
            Arc::new(RandomAccessFile::open(dir.path().join("q-log.db"), false).unwrap());
        let cache = MemoryCache::new();
        let queue = LogWriterQueue::new(file, Arc::new(EngineState::new()));

        let page = log_page(&cache, 0, 0xCD);
        assert_eq!(page.share(), 1);

        queue.enqueue_page(Arc::clone(&page)).unwrap();
        queue.wait().unwrap();

        assert_eq!(page.share(), 0);
    }

    #[test]
    fn drop_flushes_pending_pages() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("q-log.db");
        let file: Arc<dyn RandomAccess> =
            Arc::new(RandomAccessFile::open(&path, false).unwrap());
        let cache = MemoryCache::new();

        {
            let queue = LogWriterQueue::new(Arc::clone(&file), Arc::new(EngineState::new()));
            for i in 0..8u8 {
                queue
                    .enqueue_page(log_page(&cache, i as u64 * PAGE_SIZE as u64, i))
                    .unwrap();
            }
        }

        assert_eq!(std::fs::metadata(&path).unwrap().len(), 8 * PAGE_SIZE as u64);
    }

    #[test]
    fn enqueue_rejects_non_log_pages() {
        let dir = tempdir().unwrap();
        let file: Arc<dyn RandomAccess> =
            Arc::new(RandomAccessFile::open(dir.path().join("q-log.db"), false).unwrap());
        let cache = MemoryCache::new();
        let queue = LogWriterQueue::new(file, Arc::new(EngineState::new()));

        let mut page = cache.new_page();
        page.set_position(0);
        page.set_origin(FileOrigin::Data);
        let page = cache.move_to_readable(page).unwrap();

        assert!(queue.enqueue_page(page).is_err());
    }
}
