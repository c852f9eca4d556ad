//! # Page Buffers
//!
//! A [`PageBuffer`] is an in-memory handle to one page: a fixed slot inside
//! a cache segment plus the metadata that places the page in a file. The
//! slot's bytes live inside a segment allocation owned by the cache and are
//! never freed or moved while the cache is alive, so the buffer can carry a
//! raw pointer instead of a borrow.
//!
//! ## Share Counter State Machine
//!
//! The share counter is the single source of truth for who may touch the
//! bytes:
//!
//! ```text
//!  -1 (BUFFER_WRITABLE)   exactly one writer, bytes are being mutated
//!   0                     idle: on the free list, or parked in the
//!                         readable index waiting to be reused
//!   n >= 1                immutable, shared by n holders
//! ```
//!
//! Transitions between states go through the cache (which serialises them
//! under its lock); `release` is the one lock-free edge, a plain atomic
//! decrement taken when a holder is done with a readable page.
//!
//! ## Writable Pages
//!
//! Mutable access is only reachable through [`WritablePage`], an owning,
//! non-clonable wrapper created by the cache when it hands a buffer to a
//! single writer. `bytes_mut` takes `&mut self`, so exclusive access is
//! visible in the signatures rather than depending on caller discipline.

use std::ptr::NonNull;
use std::sync::atomic::{AtomicI32, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;

use crate::config::{BUFFER_WRITABLE, PAGE_SIZE, POSITION_UNSET};
use crate::storage::FileOrigin;

/// In-memory handle to one `PAGE_SIZE` slot of a cache segment.
pub struct PageBuffer {
    unique_id: usize,
    segment: usize,
    slot: usize,
    data: NonNull<u8>,
    position: AtomicU64,
    origin: AtomicU8,
    share: AtomicI32,
}

// SAFETY: the raw pointer targets a segment allocation that outlives every
// buffer and never moves. Concurrent access to the bytes is governed by the
// share counter: mutation only happens while the counter is BUFFER_WRITABLE
// and the sole WritablePage owner holds `&mut self`; shared readers only
// exist while the counter is >= 0 and the bytes are immutable.
unsafe impl Send for PageBuffer {}
unsafe impl Sync for PageBuffer {}

impl PageBuffer {
    pub(crate) fn new(unique_id: usize, segment: usize, slot: usize, data: NonNull<u8>) -> Self {
        Self {
            unique_id,
            segment,
            slot,
            data,
            position: AtomicU64::new(POSITION_UNSET),
            origin: AtomicU8::new(0),
            share: AtomicI32::new(0),
        }
    }

    /// Monotonic id assigned at allocation, unique across all segments.
    pub fn unique_id(&self) -> usize {
        self.unique_id
    }

    /// Index of the segment this buffer's bytes live in.
    pub fn segment(&self) -> usize {
        self.segment
    }

    /// Slot index within the segment.
    pub fn slot(&self) -> usize {
        self.slot
    }

    /// Byte offset of this page within its file, or [`POSITION_UNSET`].
    pub fn position(&self) -> u64 {
        self.position.load(Ordering::Acquire)
    }

    pub(crate) fn set_position(&self, position: u64) {
        self.position.store(position, Ordering::Release);
    }

    pub fn origin(&self) -> Option<FileOrigin> {
        FileOrigin::from_u8(self.origin.load(Ordering::Acquire))
    }

    pub(crate) fn set_origin(&self, origin: Option<FileOrigin>) {
        self.origin.store(origin.map_or(0, FileOrigin::as_u8), Ordering::Release);
    }

    pub fn share(&self) -> i32 {
        self.share.load(Ordering::Acquire)
    }

    pub fn is_writable(&self) -> bool {
        self.share() == BUFFER_WRITABLE
    }

    pub(crate) fn set_share(&self, share: i32) {
        self.share.store(share, Ordering::Release);
    }

    /// Takes one more share of an already-shared buffer.
    pub(crate) fn retain(&self) {
        let prev = self.share.fetch_add(1, Ordering::AcqRel);
        debug_assert!(prev >= 0, "retain on a writable buffer");
    }

    /// Drops one share. Called by every holder handed out by
    /// `get_readable_page`/`move_to_readable`, including the log writer
    /// queue for its own reference. A buffer that reaches share 0 stays
    /// where it is (the readable index keeps it recyclable).
    pub fn release(&self) {
        let prev = self.share.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(prev >= 1, "release on an unshared buffer");
    }

    /// The page bytes. Immutable for every holder of a readable buffer; the
    /// cache and [`WritablePage`] use [`Self::raw_mut`] for the writable
    /// state instead.
    pub fn as_slice(&self) -> &[u8] {
        // SAFETY: `data` points at PAGE_SIZE valid bytes inside a live,
        // pinned segment. Mutation is confined to the BUFFER_WRITABLE state
        // whose single owner cannot coexist with other holders.
        unsafe { std::slice::from_raw_parts(self.data.as_ptr(), PAGE_SIZE) }
    }

    /// Mutable view of the page bytes.
    ///
    /// # Safety
    ///
    /// The caller must be the buffer's only owner: either holding it in the
    /// BUFFER_WRITABLE state, or loading/zeroing it while it is detached
    /// from every pool under the cache lock.
    #[allow(clippy::mut_from_ref)]
    pub(crate) unsafe fn raw_mut(&self) -> &mut [u8] {
        std::slice::from_raw_parts_mut(self.data.as_ptr(), PAGE_SIZE)
    }

    /// Resets placement metadata when the buffer goes back to the free list.
    pub(crate) fn reset(&self) {
        self.set_share(0);
        self.set_position(POSITION_UNSET);
        self.set_origin(None);
    }
}

impl std::fmt::Debug for PageBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PageBuffer")
            .field("unique_id", &self.unique_id)
            .field("segment", &self.segment)
            .field("slot", &self.slot)
            .field("position", &self.position())
            .field("origin", &self.origin())
            .field("share", &self.share())
            .finish()
    }
}

/// Exclusive handle to a buffer in the writable state.
///
/// Created by the cache; consumed by `move_to_readable`, `try_move_to_readable`
/// or `discard_page`. Holds the only `Arc` to its buffer while it exists, so
/// `bytes_mut(&mut self)` is the only route to the bytes.
#[derive(Debug)]
pub struct WritablePage {
    buffer: Arc<PageBuffer>,
}

impl WritablePage {
    pub(crate) fn new(buffer: Arc<PageBuffer>) -> Self {
        debug_assert!(buffer.is_writable(), "writable page over a non-writable buffer");
        Self { buffer }
    }

    pub fn unique_id(&self) -> usize {
        self.buffer.unique_id()
    }

    pub fn position(&self) -> u64 {
        self.buffer.position()
    }

    pub fn set_position(&mut self, position: u64) {
        self.buffer.set_position(position);
    }

    pub fn origin(&self) -> Option<FileOrigin> {
        self.buffer.origin()
    }

    pub fn set_origin(&mut self, origin: FileOrigin) {
        self.buffer.set_origin(Some(origin));
    }

    pub fn bytes(&self) -> &[u8] {
        self.buffer.as_slice()
    }

    pub fn bytes_mut(&mut self) -> &mut [u8] {
        // SAFETY: this wrapper holds the only Arc to a BUFFER_WRITABLE
        // buffer and `&mut self` excludes every other path to it.
        unsafe { self.buffer.raw_mut() }
    }

    pub(crate) fn buffer(&self) -> &Arc<PageBuffer> {
        &self.buffer
    }

    pub(crate) fn into_buffer(self) -> Arc<PageBuffer> {
        self.buffer
    }
}
