//! # QuillDB Storage Core
//!
//! QuillDB is an embedded, single-process document database. This crate is
//! its storage and durability layer: the page-addressable I/O primitives,
//! the share-counted memory cache, and the asynchronous log writer that
//! turns transaction output into durable bytes. It defines the invariants
//! every higher layer (index trees, document storage, transactions, query
//! engine) builds on: who owns a page, when a buffer may be reused, how
//! in-flight log writes interact with readers, and how file lengths
//! advance under concurrent producers.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────┐
//! │   Engine / Transactions / Indexes (above)    │
//! ├──────────────────────────────────────────────┤
//! │   DiskService · DiskReader                   │
//! ├──────────────────────┬───────────────────────┤
//! │   MemoryCache        │   LogWriterQueue      │
//! │   (segments, shares) │   (background thread) │
//! ├──────────────────────┴───────────────────────┤
//! │   FileFactory · RandomAccessFile             │
//! ├──────────────────────────────────────────────┤
//! │   datafile (committed image) · -log journal  │
//! └──────────────────────────────────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```ignore
//! use quilldb::{DiskService, EngineState, FileOrigin, StorageSettings};
//! use std::sync::Arc;
//!
//! let settings = StorageSettings::new("./app.db");
//! let disk = DiskService::new(&settings, Arc::new(EngineState::new()))?;
//!
//! let mut page = disk.new_page()?;
//! page.bytes_mut()[..5].copy_from_slice(b"hello");
//! disk.write_async([page])?;          // readable immediately
//! disk.wait_queue()?;                 // durable now
//!
//! let reader = disk.get_reader();
//! let page = reader.read_page(0, FileOrigin::Log)?;
//! assert_eq!(&page.as_slice()[..5], b"hello");
//! page.release();
//! ```
//!
//! ## Module Overview
//!
//! - [`config`]: constants and the open-settings surface
//! - [`memory`]: page buffers and the share-counted cache
//! - [`storage`]: files, factories, the log writer queue, the disk service
//! - [`engine`]: the shared error-state holder the async writer reports to

#[macro_use]
mod macros;

pub mod config;
pub mod engine;
pub mod memory;
pub mod storage;

pub use config::{Collation, StorageSettings, PAGE_SIZE};
pub use engine::EngineState;
pub use memory::{MemoryCache, PageBuffer, WritablePage};
pub use storage::{DiskReader, DiskService, FileOrigin, RawPage};
