//! # Storage Layer
//!
//! The paged storage and durability core of QuillDB. Two fixed-size paged
//! files back every database: the *datafile* holds the committed image
//! (page 0 is the header) and the *log file* is a write-ahead journal that
//! grows append-only between checkpoints.
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────┐
//! │  DiskService / DiskReader      (disk)       │
//! ├─────────────────────┬───────────────────────┤
//! │  MemoryCache        │  LogWriterQueue       │
//! │  (crate::memory)    │  (queue)              │
//! ├─────────────────────┴───────────────────────┤
//! │  FileFactory                   (factory)    │
//! ├─────────────────────────────────────────────┤
//! │  RandomAccess / RandomAccessFile  (file)    │
//! └─────────────────────────────────────────────┘
//! ```
//!
//! Reads miss-load from the right file into the cache; writers fill fresh
//! cache buffers, then `write_async` assigns each one a log position,
//! promotes it to readable, and hands it to the background writer. Readers
//! observe a promoted page immediately, before it is flushed.
//!
//! ## Module Organization
//!
//! - `file`: positional byte I/O over one handle
//! - `factory`: lazily-opened, reference-held file binding
//! - `header`: page 0 layout and the invalid-state flag
//! - `queue`: asynchronous single-consumer log writer
//! - `disk`: the service, per-transaction readers, whole-file scans
//!
//! ## Thread Safety
//!
//! `DiskService` is `Send + Sync` and shared across all transactions.
//! `DiskReader` is handed out one per transaction and is not itself
//! thread-safe. Single-writer/many-reader discipline is enforced by the
//! transaction layer above, not here.

mod disk;
mod factory;
mod file;
mod header;
mod queue;

pub use disk::{DiskReader, DiskService, FullFileReader, RawPage};
pub use factory::FileFactory;
pub use file::{RandomAccess, RandomAccessFile};
pub use header::{
    build_header_page, read_header, DatafileHeader, HEADER_MAGIC, HEADER_VERSION,
    INVALID_STATE_OFFSET,
};
pub use queue::LogWriterQueue;

use eyre::{ensure, Result};
use zerocopy::{FromBytes, Immutable, KnownLayout};

/// Which of the two database files a page lives in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FileOrigin {
    /// The canonical committed image.
    Data,
    /// The write-ahead journal.
    Log,
}

impl FileOrigin {
    pub(crate) fn as_u8(self) -> u8 {
        match self {
            FileOrigin::Data => 1,
            FileOrigin::Log => 2,
        }
    }

    pub(crate) fn from_u8(value: u8) -> Option<Self> {
        match value {
            1 => Some(FileOrigin::Data),
            2 => Some(FileOrigin::Log),
            _ => None,
        }
    }
}

/// Parses a zerocopy struct from the front of a byte slice with size
/// validation.
#[inline]
pub fn parse_zerocopy<'a, T: FromBytes + KnownLayout + Immutable>(
    bytes: &'a [u8],
    type_name: &str,
) -> Result<&'a T> {
    let size = std::mem::size_of::<T>();
    ensure!(
        bytes.len() >= size,
        "buffer too small for {}: {} < {}",
        type_name,
        bytes.len(),
        size
    );
    T::ref_from_bytes(&bytes[..size])
        .map_err(|e| eyre::eyre!("failed to parse {}: {:?}", type_name, e))
}
