//! # QuillDB Configuration Constants
//!
//! This module centralizes the constants of the storage core, grouping
//! interdependent values together. Constants that depend on each other are
//! co-located to prevent mismatch bugs.
//!
//! ## Dependency Graph
//!
//! ```text
//! PAGE_SIZE (8192 bytes)
//!       │
//!       ├─> every file position is a multiple of PAGE_SIZE
//!       │
//!       ├─> MEMORY_SEGMENT_SIZES entries are counted in pages, so one
//!       │   segment allocation is sizes[i] * PAGE_SIZE bytes
//!       │
//!       └─> the length counters store "last reserved offset", i.e.
//!           virtual length = counter + PAGE_SIZE
//!
//! BUFFER_WRITABLE (-1)
//!       │
//!       └─> share counter state machine: -1 writable, 0 idle, n >= 1 shared
//! ```
//!
//! ## Critical Invariants
//!
//! Enforced by compile-time assertions below:
//!
//! 1. `PAGE_SIZE` is a power of two (positions are maskable offsets)
//! 2. `MEMORY_SEGMENT_SIZES` is non-empty (the cache must be able to grow)
//! 3. `BUFFER_WRITABLE` is negative (distinct from every share count)

use std::time::Duration;

// ============================================================================
// PAGE GEOMETRY
// ============================================================================

/// Size of each page in bytes (8KB).
/// This is the fundamental unit of all disk I/O and caching.
pub const PAGE_SIZE: usize = 8192;

const _: () = assert!(PAGE_SIZE.is_power_of_two(), "PAGE_SIZE must be a power of two");

// ============================================================================
// BUFFER LIFECYCLE SENTINELS
// ============================================================================

/// Share counter sentinel for a buffer owned exclusively by one writer.
/// Any value >= 1 means "shared by that many holders"; 0 means idle.
pub const BUFFER_WRITABLE: i32 = -1;

/// Position sentinel for a buffer that has not been placed in a file yet.
pub const POSITION_UNSET: u64 = u64::MAX;

const _: () = assert!(BUFFER_WRITABLE < 0, "BUFFER_WRITABLE must not collide with share counts");

// ============================================================================
// CACHE SEGMENT ALLOCATION
// ============================================================================

/// Page counts for successive cache segment allocations. When the table is
/// exhausted the last entry repeats. Segments are never freed while the
/// cache lives.
pub const MEMORY_SEGMENT_SIZES: [usize; 5] = [1_000, 1_000, 1_000, 1_000, 1_000];

const _: () = assert!(MEMORY_SEGMENT_SIZES.len() > 0, "at least one segment size is required");
const _: () = assert!(MEMORY_SEGMENT_SIZES[0] > 0, "segments must hold at least one page");

// ============================================================================
// ITEM CEILING
// ============================================================================

/// Maximum number of items a single page can address. Used by the
/// `max_items_count` ceiling that higher layers apply to detect
/// pointer-loop corruption while walking page chains.
pub const MAX_ITEMS_PER_PAGE: u64 = 255;

/// Extra pages granted on top of the current file sizes when computing the
/// item ceiling, so in-flight allocations do not trip the limit.
pub const MAX_ITEMS_PAGE_MARGIN: u64 = 10;

// ============================================================================
// ABNORMAL-CLOSE MARKING
// ============================================================================

/// How many times marking the datafile invalid is retried when the write or
/// flush fails (e.g. a transient sharing violation during shutdown).
pub const MARK_INVALID_MAX_RETRIES: usize = 60;

/// Delay between invalid-state marking attempts.
pub const MARK_INVALID_RETRY_DELAY: Duration = Duration::from_millis(25);
