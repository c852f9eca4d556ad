//! # Disk Service
//!
//! Orchestrates the storage core: both file factories, the shared memory
//! cache, and the lazily-created log writer queue. Everything higher
//! layers know about pages on disk goes through this type or the
//! per-transaction [`DiskReader`] it hands out.
//!
//! ## Data Flow
//!
//! ```text
//!            read_page (miss)                    write_async
//!                  │                                  │
//!                  ▼                                  ▼
//!            MemoryCache ◄── move_to_readable ── WritablePage
//!                  │                                  │
//!       loader: read_page_into                 reserve log position
//!                  │                                  │
//!        ┌─────────┴─────────┐                        ▼
//!        ▼                   ▼                 LogWriterQueue ──► log file
//!    data file            log file
//! ```
//!
//! ## Length Accounting
//!
//! `data_length` and `log_length` store the *last reserved page offset*
//! (`-PAGE_SIZE` when the file holds no pages), so virtual length is
//! always `counter + PAGE_SIZE`. The log counter is bumped with an atomic
//! add at reservation time, long before the writer thread extends the
//! kernel-visible file; readers must therefore use
//! [`DiskService::get_virtual_length`], never the file metadata.
//!
//! ## Read-Only Mode
//!
//! Opening read-only rejects every mutating operation (`new_page`,
//! `write_async`, `write_pages`, `set_length`, `mark_as_invalid_state`)
//! up front with a dedicated diagnostic, and the writer queue is never
//! created.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, OnceLock};

use eyre::{bail, ensure, Result};
use parking_lot::Mutex;
use smallvec::SmallVec;
use tracing::{debug, info, warn};

use crate::config::{
    Collation, StorageSettings, MARK_INVALID_MAX_RETRIES, MARK_INVALID_RETRY_DELAY,
    MAX_ITEMS_PAGE_MARGIN, MAX_ITEMS_PER_PAGE, PAGE_SIZE, POSITION_UNSET,
};
use crate::engine::EngineState;
use crate::memory::{MemoryCache, PageBuffer, WritablePage};
use crate::storage::factory::FileFactory;
use crate::storage::file::RandomAccess;
use crate::storage::header::{build_header_page, read_header, INVALID_STATE_OFFSET};
use crate::storage::queue::LogWriterQueue;
use crate::storage::FileOrigin;

/// How many contiguous pages one gather write covers at most.
const WRITE_GATHER_MAX: usize = 8;

/// Disk orchestrator for one open database.
pub struct DiskService {
    read_only: bool,
    collation: Collation,
    is_new: bool,
    engine: Arc<EngineState>,
    cache: Arc<MemoryCache>,
    data_factory: Arc<FileFactory>,
    log_factory: Arc<FileFactory>,
    data_file: Arc<dyn RandomAccess>,
    queue: OnceLock<LogWriterQueue>,
    queue_init: Mutex<()>,
    data_length: AtomicI64,
    log_length: AtomicI64,
}

impl DiskService {
    /// Opens (or creates) the data and log files described by `settings`.
    /// A fresh datafile gets its header page written synchronously before
    /// this returns.
    pub fn new(settings: &StorageSettings, engine: Arc<EngineState>) -> Result<Self> {
        settings.validate()?;

        let data_factory = Arc::new(FileFactory::new(&settings.filename, settings.read_only));
        let log_factory = Arc::new(FileFactory::new(settings.log_path(), settings.read_only));

        let is_new = data_factory.len()? == 0;
        ensure!(
            !(is_new && settings.read_only),
            "cannot create datafile '{}' in read-only mode",
            settings.filename.display()
        );

        let data_file = data_factory.access()?;

        let collation = if is_new {
            info!(path = %settings.filename.display(), "creating new datafile");
            let header = build_header_page(settings.collation);
            data_file
                .write_at(&header, 0)
                .map_err(|error| error.wrap_err("failed to write initial header page"))?;
            data_file.sync()?;
            settings.collation
        } else {
            let mut page = vec![0u8; PAGE_SIZE];
            data_file.read_page_into(&mut page, 0)?;
            let header = read_header(&page)?;
            Collation::from_code(header.collation())
                .ok_or_else(|| eyre::eyre!("unknown collation code {} in header", header.collation()))?
        };

        let data_length = data_factory.len()? as i64 - PAGE_SIZE as i64;
        let log_length = if log_factory.exists() {
            log_factory.len()? as i64 - PAGE_SIZE as i64
        } else {
            -(PAGE_SIZE as i64)
        };

        Ok(Self {
            read_only: settings.read_only,
            collation,
            is_new,
            engine,
            cache: Arc::new(MemoryCache::new()),
            data_factory,
            log_factory,
            data_file,
            queue: OnceLock::new(),
            queue_init: Mutex::new(()),
            data_length: AtomicI64::new(data_length),
            log_length: AtomicI64::new(log_length),
        })
    }

    /// True when this open created the datafile.
    pub fn is_new(&self) -> bool {
        self.is_new
    }

    /// Collation pragma stored in the header page.
    pub fn collation(&self) -> Collation {
        self.collation
    }

    pub fn cache(&self) -> &Arc<MemoryCache> {
        &self.cache
    }

    /// A reader bound to both files and the shared cache; one per
    /// executing transaction, not thread-safe.
    pub fn get_reader(&self) -> DiskReader<'_> {
        DiskReader { service: self }
    }

    /// A zeroed writable page, not yet placed in any file.
    pub fn new_page(&self) -> Result<WritablePage> {
        self.ensure_writable()?;
        Ok(self.cache.new_page())
    }

    /// Promotes each writable page into the cache under a freshly
    /// reserved log position and hands it to the background writer.
    /// Readers observe the pages immediately; durability comes later (see
    /// [`Self::wait_queue`]). Returns the number of pages enqueued.
    pub fn write_async<I>(&self, pages: I) -> Result<usize>
    where
        I: IntoIterator<Item = WritablePage>,
    {
        self.ensure_writable()?;
        let queue = self.log_queue()?;

        let mut count = 0usize;
        for mut page in pages {
            let position = self.log_length.fetch_add(PAGE_SIZE as i64, Ordering::AcqRel)
                + PAGE_SIZE as i64;

            page.set_position(position as u64);
            page.set_origin(FileOrigin::Log);

            let readable = self.cache.move_to_readable(page)?;
            queue.enqueue_page(readable)?;
            count += 1;
        }

        Ok(count)
    }

    /// Synchronous direct write of single-use page images, used by the
    /// checkpoint collaborator. Contiguous runs are gathered into vectored
    /// writes; the file is flushed before returning.
    pub fn write_pages<I>(&self, pages: I, origin: FileOrigin) -> Result<usize>
    where
        I: IntoIterator<Item = RawPage>,
    {
        self.ensure_writable()?;
        let file = self.file_for(origin)?;

        let mut count = 0usize;
        let mut run: SmallVec<[RawPage; WRITE_GATHER_MAX]> = SmallVec::new();
        let mut run_start = 0u64;

        for page in pages {
            let position = page.position();
            ensure!(
                position % PAGE_SIZE as u64 == 0,
                "page position {position} is not page-aligned"
            );

            if origin == FileOrigin::Data {
                self.data_length.fetch_max(position as i64, Ordering::AcqRel);
            }

            let extends_run = !run.is_empty()
                && run.len() < WRITE_GATHER_MAX
                && position == run_start + (run.len() * PAGE_SIZE) as u64;

            if run.is_empty() {
                run_start = position;
            } else if !extends_run {
                write_run(file.as_ref(), &mut run, run_start)?;
                run_start = position;
            }
            run.push(page);
            count += 1;
        }
        write_run(file.as_ref(), &mut run, run_start)?;

        file.sync()?;
        debug!(count, ?origin, "direct page write flushed");
        Ok(count)
    }

    /// Truncates or extends a file and resets its length counter. For the
    /// log this requires the writer queue to be fully drained.
    pub fn set_length(&self, length: u64, origin: FileOrigin) -> Result<()> {
        self.ensure_writable()?;
        ensure!(
            length % PAGE_SIZE as u64 == 0,
            "file length {length} is not page-aligned"
        );

        match origin {
            FileOrigin::Log => {
                if let Some(queue) = self.queue.get() {
                    ensure!(
                        queue.is_empty(),
                        "log length changed while the writer queue holds pages"
                    );
                }
                self.log_length
                    .store(length as i64 - PAGE_SIZE as i64, Ordering::Release);
                self.log_factory.access()?.set_len(length)?;
            }
            FileOrigin::Data => {
                self.data_length
                    .store(length as i64 - PAGE_SIZE as i64, Ordering::Release);
                self.data_file.set_len(length)?;
            }
        }
        Ok(())
    }

    /// Highest reserved offset plus one page. May exceed the kernel-visible
    /// file length while the async writer lags; equal after a queue wait.
    pub fn get_virtual_length(&self, origin: FileOrigin) -> u64 {
        let counter = match origin {
            FileOrigin::Data => self.data_length.load(Ordering::Acquire),
            FileOrigin::Log => self.log_length.load(Ordering::Acquire),
        };
        (counter + PAGE_SIZE as i64) as u64
    }

    /// Sequential, cache-bypassing scan of a whole file, one single-use
    /// page image per page.
    pub fn read_full(&self, origin: FileOrigin) -> Result<FullFileReader> {
        let file = match origin {
            FileOrigin::Data => Some(Arc::clone(&self.data_file)),
            FileOrigin::Log => {
                if self.log_factory.exists() {
                    Some(self.log_factory.access()?)
                } else {
                    None
                }
            }
        };

        let length = match &file {
            Some(file) => {
                file.advise_sequential();
                file.len()?
            }
            None => 0,
        };

        Ok(FullFileReader {
            file,
            origin,
            offset: 0,
            length,
        })
    }

    /// Blocks until every page handed to the writer queue is durable.
    /// No-op when the queue was never created.
    pub fn wait_queue(&self) -> Result<()> {
        match self.queue.get() {
            Some(queue) => queue.wait(),
            None => Ok(()),
        }
    }

    /// Pages still sitting in the writer queue.
    pub fn queue_length(&self) -> usize {
        self.queue.get().map_or(0, LogWriterQueue::len)
    }

    /// Sets the invalid-state flag byte in the header page, requesting
    /// recovery on the next open. Used during abnormal close, when the
    /// file may be contended, so failures are retried with backoff.
    pub fn mark_as_invalid_state(&self) -> Result<()> {
        self.ensure_writable()?;

        let mut last_error = None;
        for attempt in 0..MARK_INVALID_MAX_RETRIES {
            let result = self
                .data_file
                .write_at(&[1], INVALID_STATE_OFFSET as u64)
                .and_then(|()| self.data_file.sync());

            match result {
                Ok(()) => {
                    warn!(path = %self.data_factory.path().display(), "datafile marked invalid");
                    return Ok(());
                }
                Err(error) => {
                    warn!(attempt, error = %format!("{error:#}"), "invalid-state mark failed, retrying");
                    last_error = Some(error);
                    std::thread::sleep(MARK_INVALID_RETRY_DELAY);
                }
            }
        }

        Err(last_error
            .expect("at least one attempt ran")
            .wrap_err(format!(
                "failed to mark datafile invalid after {MARK_INVALID_MAX_RETRIES} attempts"
            )))
    }

    /// Reads the invalid-state flag back from the header page.
    pub fn is_invalid_state(&self) -> Result<bool> {
        let mut flag = [0u8; 1];
        self.data_file
            .read_at(&mut flag, INVALID_STATE_OFFSET as u64)?;
        Ok(flag[0] != 0)
    }

    /// Rollback path for modified pages: straight back to the free list.
    pub fn discard_dirty_pages<I>(&self, pages: I)
    where
        I: IntoIterator<Item = WritablePage>,
    {
        for page in pages {
            self.cache.discard_page(page);
        }
    }

    /// Rollback path for unmodified pages: promoted into the readable pool
    /// when their key is still vacant (the load was paid for, keep it),
    /// discarded otherwise.
    pub fn discard_clean_pages<I>(&self, pages: I) -> Result<()>
    where
        I: IntoIterator<Item = WritablePage>,
    {
        for page in pages {
            if page.position() == POSITION_UNSET {
                self.cache.discard_page(page);
            } else {
                self.cache.try_move_to_readable(page)?;
            }
        }
        Ok(())
    }

    /// Conservative ceiling on the total number of items both files can
    /// currently address. Higher layers compare running counts against
    /// this to detect pointer loops in corrupted page chains.
    pub fn max_items_count(&self) -> u64 {
        let data = self.get_virtual_length(FileOrigin::Data);
        let log = self.get_virtual_length(FileOrigin::Log);
        ((data + log) / PAGE_SIZE as u64 + MAX_ITEMS_PAGE_MARGIN) * MAX_ITEMS_PER_PAGE
    }

    fn ensure_writable(&self) -> Result<()> {
        if self.read_only {
            bail!("database is open in read-only mode");
        }
        Ok(())
    }

    fn file_for(&self, origin: FileOrigin) -> Result<Arc<dyn RandomAccess>> {
        match origin {
            FileOrigin::Data => Ok(Arc::clone(&self.data_file)),
            FileOrigin::Log => self.log_factory.access(),
        }
    }

    fn log_queue(&self) -> Result<&LogWriterQueue> {
        if let Some(queue) = self.queue.get() {
            return Ok(queue);
        }

        let _guard = self.queue_init.lock();
        if self.queue.get().is_none() {
            let file = self.log_factory.access()?;
            let queue = LogWriterQueue::new(file, Arc::clone(&self.engine));
            let _ = self.queue.set(queue);
        }
        Ok(self.queue.get().expect("queue initialised above"))
    }
}

impl Drop for DiskService {
    fn drop(&mut self) {
        if let Some(queue) = self.queue.get() {
            let _ = queue.wait();
        }

        if !self.read_only
            && self.log_factory.exists()
            && self.get_virtual_length(FileOrigin::Log) == 0
        {
            let _ = self.log_factory.delete();
        }

        self.log_factory.close();
        self.data_factory.close();
        // the queue field drop joins the consumer thread
    }
}

impl std::fmt::Debug for DiskService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DiskService")
            .field("data", &self.data_factory.path())
            .field("log", &self.log_factory.path())
            .field("read_only", &self.read_only)
            .field("data_virtual_len", &self.get_virtual_length(FileOrigin::Data))
            .field("log_virtual_len", &self.get_virtual_length(FileOrigin::Log))
            .finish()
    }
}

fn write_run(
    file: &dyn RandomAccess,
    run: &mut SmallVec<[RawPage; WRITE_GATHER_MAX]>,
    run_start: u64,
) -> Result<()> {
    match run.len() {
        0 => Ok(()),
        1 => {
            let result = file.write_at(run[0].bytes(), run_start);
            run.clear();
            result
        }
        _ => {
            let bufs: SmallVec<[&[u8]; WRITE_GATHER_MAX]> =
                run.iter().map(RawPage::bytes).collect();
            let result = file.write_vectored_at(&bufs, run_start);
            drop(bufs);
            run.clear();
            result
        }
    }
}

/// A single-use, heap-owned page image, detached from the cache.
/// Produced by [`DiskService::read_full`] and consumed by
/// [`DiskService::write_pages`].
#[derive(Debug, Clone)]
pub struct RawPage {
    position: u64,
    origin: FileOrigin,
    data: Box<[u8]>,
}

impl RawPage {
    pub fn new(position: u64, origin: FileOrigin) -> Self {
        Self {
            position,
            origin,
            data: vec![0u8; PAGE_SIZE].into_boxed_slice(),
        }
    }

    pub fn position(&self) -> u64 {
        self.position
    }

    /// Retargets the image, typically from its log offset to the data
    /// position it is checkpointed into.
    pub fn set_position(&mut self, position: u64) {
        self.position = position;
    }

    pub fn origin(&self) -> FileOrigin {
        self.origin
    }

    pub fn set_origin(&mut self, origin: FileOrigin) {
        self.origin = origin;
    }

    pub fn bytes(&self) -> &[u8] {
        &self.data
    }

    pub fn bytes_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }
}

/// Sequential whole-file page iterator, bypassing the cache.
pub struct FullFileReader {
    file: Option<Arc<dyn RandomAccess>>,
    origin: FileOrigin,
    offset: u64,
    length: u64,
}

impl Iterator for FullFileReader {
    type Item = Result<RawPage>;

    fn next(&mut self) -> Option<Self::Item> {
        let file = self.file.as_ref()?;

        if self.offset >= self.length {
            return None;
        }
        if self.length - self.offset < PAGE_SIZE as u64 {
            let short = self.length - self.offset;
            self.offset = self.length;
            return Some(Err(eyre::eyre!(
                "file ends with a partial page: {} of {} bytes at offset {}",
                short,
                PAGE_SIZE,
                self.length - short
            )));
        }

        let mut page = RawPage::new(self.offset, self.origin);
        let result = read_exact_at(file.as_ref(), page.bytes_mut(), self.offset);
        self.offset += PAGE_SIZE as u64;

        match result {
            Ok(()) => Some(Ok(page)),
            Err(error) => Some(Err(error)),
        }
    }
}

fn read_exact_at(file: &dyn RandomAccess, buf: &mut [u8], offset: u64) -> Result<()> {
    let mut filled = 0usize;
    while filled < buf.len() {
        let read = file.read_at(&mut buf[filled..], offset + filled as u64)?;
        ensure!(
            read > 0,
            "short read at offset {}: wanted {} more bytes",
            offset + filled as u64,
            buf.len() - filled
        );
        filled += read;
    }
    Ok(())
}

/// Per-transaction page reader bound to both files and the shared cache.
///
/// Not thread-safe by contract: one reader per executing transaction.
/// Dropping a reader frees no shared resources; released pages go back
/// through the cache's share counters.
pub struct DiskReader<'a> {
    service: &'a DiskService,
}

impl<'a> DiskReader<'a> {
    /// Shared (readable) view of a page, loaded through the cache. The
    /// returned buffer carries one share the caller must release.
    pub fn read_page(&self, position: u64, origin: FileOrigin) -> Result<Arc<PageBuffer>> {
        ensure!(
            position % PAGE_SIZE as u64 == 0,
            "page position {position} is not page-aligned"
        );

        let file = self.service.file_for(origin)?;
        self.service
            .cache
            .get_readable_page(position, origin, |pos, buf| file.read_page_into(buf, pos))
    }

    /// Private writable copy of a page for read-modify-write; the caller
    /// installs it later with the service's promotion paths.
    pub fn read_writable_page(&self, position: u64, origin: FileOrigin) -> Result<WritablePage> {
        ensure!(
            position % PAGE_SIZE as u64 == 0,
            "page position {position} is not page-aligned"
        );
        self.service.ensure_writable()?;

        let file = self.service.file_for(origin)?;
        self.service
            .cache
            .get_writable_page(position, origin, |pos, buf| file.read_page_into(buf, pos))
    }

    /// A zeroed, unplaced writable page.
    pub fn new_page(&self) -> Result<WritablePage> {
        self.service.new_page()
    }
}

impl std::fmt::Debug for DiskReader<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DiskReader").finish_non_exhaustive()
    }
}
