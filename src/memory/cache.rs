//! # Memory Cache
//!
//! Share-counted page cache sitting between the disk service and both
//! files. All page bytes live in *segments*: large, never-freed batches of
//! `PAGE_SIZE` slots allocated on demand, so steady-state operation does no
//! per-page heap traffic.
//!
//! ## Pools
//!
//! Every buffer is in exactly one of three pools at any quiescent point:
//!
//! ```text
//! +-----------+   new_page / loaders    +------------+
//! | free list | ──────────────────────► |  writable  |  (out on loan,
//! +-----------+                         +------------+   one owner each)
//!       ▲                                     │
//!       │ discard_page                        │ move_to_readable
//!       │ replacement                         ▼
//!       │                        +-------------------------+
//!       └─────────────────────── | readable index          |
//!                                | (origin, position) → buf|
//!                                +-------------------------+
//! ```
//!
//! A readable buffer whose share counter has dropped to 0 *stays indexed*:
//! it still serves cache hits, and it is the pool `new_page` recycles from
//! when the free list runs dry. Only replacement and discard move a buffer
//! back to the free list.
//!
//! ## Concurrency
//!
//! One mutex serialises every transition that touches the free list or the
//! readable index; a transition is pointer moves plus an atomic store, so
//! the critical sections stay short. Loading a missed page from disk
//! happens *outside* the lock on a detached buffer, with a re-check on
//! insert in case a concurrent reader loaded the same key first. Share
//! counter decrements on release are plain atomics and take no lock.

use std::sync::Arc;

use eyre::{ensure, Result};
use hashbrown::HashMap;
use parking_lot::Mutex;
use tracing::info;

use crate::config::{BUFFER_WRITABLE, MEMORY_SEGMENT_SIZES, PAGE_SIZE, POSITION_UNSET};
use crate::memory::{PageBuffer, WritablePage};
use crate::storage::FileOrigin;

type CacheKey = (FileOrigin, u64);

/// One batch of `pages * PAGE_SIZE` bytes. Held only to keep the
/// allocation alive; buffers address into it by raw pointer. Never freed
/// or shrunk while the cache lives.
struct Segment {
    _bytes: Box<[u8]>,
}

struct CacheState {
    free: Vec<Arc<PageBuffer>>,
    readable: HashMap<CacheKey, Arc<PageBuffer>>,
    segments: Vec<Segment>,
    next_unique_id: usize,
}

/// Share-counted page cache with segment allocation.
pub struct MemoryCache {
    state: Mutex<CacheState>,
}

impl Default for MemoryCache {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryCache {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(CacheState {
                free: Vec::new(),
                readable: HashMap::new(),
                segments: Vec::new(),
                next_unique_id: 0,
            }),
        }
    }

    /// Takes a zeroed buffer in the writable state, not yet placed in any
    /// file. Source order: free list, then a recyclable readable buffer,
    /// then a brand new segment.
    pub fn new_page(&self) -> WritablePage {
        let buffer = self.acquire_buffer();
        // SAFETY: the buffer was just detached from every pool under the
        // cache lock; this thread is its only owner.
        unsafe { buffer.raw_mut().fill(0) };
        WritablePage::new(buffer)
    }

    /// Returns the shared buffer for `(origin, position)`, loading it
    /// through `loader` on a miss. Every successful call takes one share
    /// the caller must `release`.
    pub fn get_readable_page<F>(
        &self,
        position: u64,
        origin: FileOrigin,
        loader: F,
    ) -> Result<Arc<PageBuffer>>
    where
        F: FnOnce(u64, &mut [u8]) -> Result<()>,
    {
        let key = (origin, position);

        {
            let state = self.state.lock();
            if let Some(page) = state.readable.get(&key) {
                page.retain();
                return Ok(Arc::clone(page));
            }
        }

        let buffer = self.acquire_buffer();

        // SAFETY: detached buffer, sole owner until inserted below.
        let load = loader(position, unsafe { buffer.raw_mut() });
        if let Err(error) = load {
            self.move_to_free(buffer);
            return Err(error);
        }

        buffer.set_position(position);
        buffer.set_origin(Some(origin));

        let mut state = self.state.lock();
        if let Some(existing) = state.readable.get(&key) {
            // a concurrent reader loaded the same key while we were on disk
            existing.retain();
            let existing = Arc::clone(existing);
            drop(state);
            self.move_to_free(buffer);
            return Ok(existing);
        }

        buffer.set_share(1);
        state.readable.insert(key, Arc::clone(&buffer));
        Ok(buffer)
    }

    /// Returns a *fresh* writable buffer pre-filled with the current
    /// content of `(origin, position)` for read-modify-write. The readable
    /// index is not touched; the writer installs its new version later via
    /// [`Self::move_to_readable`].
    ///
    /// When a readable buffer exists under the key its bytes are copied
    /// from memory: while the async log writer lags, the cache is ahead of
    /// the file and a disk read would be stale.
    pub fn get_writable_page<F>(
        &self,
        position: u64,
        origin: FileOrigin,
        loader: F,
    ) -> Result<WritablePage>
    where
        F: FnOnce(u64, &mut [u8]) -> Result<()>,
    {
        let key = (origin, position);
        let buffer = self.acquire_buffer();

        let copied = {
            let state = self.state.lock();
            match state.readable.get(&key) {
                Some(readable) => {
                    // SAFETY: detached buffer, sole owner; the source is a
                    // readable (immutable) buffer pinned by the index.
                    unsafe { buffer.raw_mut() }.copy_from_slice(readable.as_slice());
                    true
                }
                None => false,
            }
        };

        if !copied {
            // SAFETY: detached buffer, sole owner.
            let load = loader(position, unsafe { buffer.raw_mut() });
            if let Err(error) = load {
                self.move_to_free(buffer);
                return Err(error);
            }
        }

        buffer.set_position(position);
        buffer.set_origin(Some(origin));
        Ok(WritablePage::new(buffer))
    }

    /// Promotes a writable buffer to the readable pool under its
    /// `(origin, position)` key and returns it with share counter 1 (the
    /// caller's reference). An existing buffer under the key is replaced
    /// and returned to the free list; replacing a key some reader still
    /// shares is a caller bug and fails.
    pub fn move_to_readable(&self, page: WritablePage) -> Result<Arc<PageBuffer>> {
        let buffer = page.into_buffer();
        let key = readable_key(&buffer)?;

        let mut state = self.state.lock();

        if let Some(current) = state.readable.get(&key) {
            ensure!(
                current.share() == 0,
                "page {:?} replaced while shared ({} holders)",
                key,
                current.share()
            );
            let old = state.readable.remove(&key).expect("entry checked above");
            old.reset();
            state.free.push(old);
        }

        buffer.set_share(1);
        state.readable.insert(key, Arc::clone(&buffer));
        Ok(buffer)
    }

    /// Promotes a writable buffer only when its key is still absent from
    /// the readable pool; the clean-page rollback path uses this so an
    /// unmodified copy never clobbers a version some reader already sees.
    /// On conflict the buffer goes back to the free list and `false` is
    /// returned. The installed buffer keeps share counter 0: nothing holds
    /// it, it is immediately recyclable.
    pub fn try_move_to_readable(&self, page: WritablePage) -> Result<bool> {
        let buffer = page.into_buffer();
        let key = readable_key(&buffer)?;

        let mut state = self.state.lock();

        if state.readable.contains_key(&key) {
            drop(state);
            self.move_to_free(buffer);
            return Ok(false);
        }

        buffer.set_share(0);
        state.readable.insert(key, buffer);
        Ok(true)
    }

    /// Sends a writable buffer straight back to the free list.
    pub fn discard_page(&self, page: WritablePage) {
        self.move_to_free(page.into_buffer());
    }

    fn move_to_free(&self, buffer: Arc<PageBuffer>) {
        let mut state = self.state.lock();

        if let Some(origin) = buffer.origin() {
            let key = (origin, buffer.position());
            let points_here = state
                .readable
                .get(&key)
                .map(|entry| Arc::ptr_eq(entry, &buffer))
                .unwrap_or(false);
            if points_here {
                state.readable.remove(&key);
            }
        }

        buffer.reset();
        state.free.push(buffer);
    }

    fn acquire_buffer(&self) -> Arc<PageBuffer> {
        let mut state = self.state.lock();

        if let Some(buffer) = state.free.pop() {
            buffer.set_share(BUFFER_WRITABLE);
            return buffer;
        }

        if let Some(key) = state
            .readable
            .iter()
            .find(|(_, page)| page.share() == 0)
            .map(|(key, _)| *key)
        {
            let buffer = state.readable.remove(&key).expect("key found above");
            buffer.set_share(BUFFER_WRITABLE);
            buffer.set_position(POSITION_UNSET);
            buffer.set_origin(None);
            return buffer;
        }

        self.allocate_segment(&mut state);
        let buffer = state.free.pop().expect("new segment fills the free list");
        buffer.set_share(BUFFER_WRITABLE);
        buffer
    }

    fn allocate_segment(&self, state: &mut CacheState) {
        let index = state.segments.len();
        let pages = MEMORY_SEGMENT_SIZES[index.min(MEMORY_SEGMENT_SIZES.len() - 1)];

        let mut bytes = vec![0u8; pages * PAGE_SIZE].into_boxed_slice();
        let base = bytes.as_mut_ptr();

        for slot in 0..pages {
            // SAFETY: slot * PAGE_SIZE < pages * PAGE_SIZE, inside the
            // allocation made just above.
            let data = unsafe { base.add(slot * PAGE_SIZE) };
            let data = std::ptr::NonNull::new(data).expect("segment allocation is non-null");
            let unique_id = state.next_unique_id;
            state.next_unique_id += 1;
            state
                .free
                .push(Arc::new(PageBuffer::new(unique_id, index, slot, data)));
        }

        state.segments.push(Segment { _bytes: bytes });

        info!(segment = index, pages, "allocated new cache segment");
    }

    /// Number of segment batches allocated so far.
    pub fn segment_count(&self) -> usize {
        self.state.lock().segments.len()
    }

    /// Buffers currently on the free list.
    pub fn free_count(&self) -> usize {
        self.state.lock().free.len()
    }

    /// Buffers currently in the readable index (shared or recyclable).
    pub fn readable_count(&self) -> usize {
        self.state.lock().readable.len()
    }

    /// Total buffers allocated across all segments.
    pub fn page_count(&self) -> usize {
        let state = self.state.lock();
        state.next_unique_id
    }

    /// Buffers some holder is actively using: shared readable pages plus
    /// writable pages out on loan.
    pub fn pages_in_use(&self) -> usize {
        let state = self.state.lock();
        let shared = state
            .readable
            .values()
            .filter(|page| page.share() > 0)
            .count();
        let loaned = state.next_unique_id - state.free.len() - state.readable.len();
        shared + loaned
    }
}

impl std::fmt::Debug for MemoryCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("MemoryCache")
            .field("segments", &state.segments.len())
            .field("free", &state.free.len())
            .field("readable", &state.readable.len())
            .finish()
    }
}

fn readable_key(buffer: &Arc<PageBuffer>) -> Result<CacheKey> {
    let position = buffer.position();
    ensure!(
        position != POSITION_UNSET,
        "page promoted before a position was assigned"
    );
    let origin = buffer
        .origin()
        .ok_or_else(|| eyre::eyre!("page promoted before an origin was assigned"))?;
    Ok((origin, position))
}
