//! # Datafile Header Page
//!
//! Page 0 of the datafile. The storage core treats every other page as
//! opaque; here it commits to exactly two things:
//!
//! 1. A fixed identification prefix written once at creation time:
//!
//! ```text
//! Offset  Size  Description
//! 0       16    Magic: "QuillDB datafile"
//! 16      4     Format version (currently 1)
//! 20      4     Collation code (see config::Collation)
//! 24      8     Creation timestamp, seconds since the Unix epoch
//! 32      8     Reserved
//! ```
//!
//! 2. A single flag byte at offset 191 (`INVALID_STATE_OFFSET`): `0` after
//!    a clean close, `1` when the database was closed abnormally and the
//!    engine should consider a rebuild before trusting the file.
//!
//! Everything between and after belongs to higher layers (the engine's
//! header-page type), which is why the prefix struct stops at 40 bytes
//! instead of describing the whole page.

use std::time::{SystemTime, UNIX_EPOCH};

use eyre::{ensure, Result};
use zerocopy::little_endian::{U32, U64};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

use crate::config::{Collation, PAGE_SIZE};
use crate::storage::parse_zerocopy;

pub const HEADER_MAGIC: [u8; 16] = *b"QuillDB datafile";
pub const HEADER_VERSION: u32 = 1;

/// Byte offset within page 0 of the invalid-datafile-state flag.
pub const INVALID_STATE_OFFSET: usize = 191;

const _: () = assert!(INVALID_STATE_OFFSET >= std::mem::size_of::<DatafileHeader>());
const _: () = assert!(INVALID_STATE_OFFSET < PAGE_SIZE);

/// Identification prefix of page 0.
#[repr(C)]
#[derive(Debug, Clone, Copy, IntoBytes, FromBytes, Immutable, KnownLayout, Unaligned)]
pub struct DatafileHeader {
    magic: [u8; 16],
    version: U32,
    collation: U32,
    created_at: U64,
    _reserved: [u8; 8],
}

impl DatafileHeader {
    zerocopy_getters! {
        version: u32,
        collation: u32,
        created_at: u64,
    }

    pub fn new(collation: Collation) -> Self {
        let created_at = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|elapsed| elapsed.as_secs())
            .unwrap_or(0);

        Self {
            magic: HEADER_MAGIC,
            version: U32::new(HEADER_VERSION),
            collation: U32::new(collation.code()),
            created_at: U64::new(created_at),
            _reserved: [0; 8],
        }
    }

    pub fn magic(&self) -> &[u8; 16] {
        &self.magic
    }
}

/// Builds the initial page-0 image for a freshly created datafile.
pub fn build_header_page(collation: Collation) -> Box<[u8]> {
    let mut page = vec![0u8; PAGE_SIZE].into_boxed_slice();
    let header = DatafileHeader::new(collation);
    page[..std::mem::size_of::<DatafileHeader>()].copy_from_slice(header.as_bytes());
    page
}

/// Parses and validates the header prefix of a page-0 image.
pub fn read_header(page: &[u8]) -> Result<&DatafileHeader> {
    let header: &DatafileHeader = parse_zerocopy(page, "DatafileHeader")?;

    ensure!(
        header.magic == HEADER_MAGIC,
        "not a QuillDB datafile (bad magic)"
    );
    ensure!(
        header.version() == HEADER_VERSION,
        "unsupported datafile version {} (expected {})",
        header.version(),
        HEADER_VERSION
    );

    Ok(header)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_prefix_layout_is_stable() {
        assert_eq!(std::mem::size_of::<DatafileHeader>(), 40);
        assert_eq!(std::mem::offset_of!(DatafileHeader, version), 16);
        assert_eq!(std::mem::offset_of!(DatafileHeader, collation), 20);
        assert_eq!(std::mem::offset_of!(DatafileHeader, created_at), 24);
    }

    #[test]
    fn built_page_parses_back() {
        let page = build_header_page(Collation::NoCase);
        assert_eq!(page.len(), PAGE_SIZE);

        let header = read_header(&page).unwrap();
        assert_eq!(header.magic(), &HEADER_MAGIC);
        assert_eq!(header.version(), HEADER_VERSION);
        assert_eq!(Collation::from_code(header.collation()), Some(Collation::NoCase));
        assert!(header.created_at() > 0);
    }

    #[test]
    fn built_page_starts_with_a_clear_invalid_flag() {
        let page = build_header_page(Collation::Binary);
        assert_eq!(page[INVALID_STATE_OFFSET], 0);
    }

    #[test]
    fn read_header_rejects_bad_magic() {
        let mut page = build_header_page(Collation::Binary);
        page[0] ^= 0xFF;
        assert!(read_header(&page).is_err());
    }

    #[test]
    fn read_header_rejects_future_versions() {
        let mut page = build_header_page(Collation::Binary);
        page[16] = 0xFE;
        assert!(read_header(&page).is_err());
    }

    #[test]
    fn read_header_rejects_truncated_input() {
        assert!(read_header(&[0u8; 8]).is_err());
    }
}
