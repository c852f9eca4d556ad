//! # Storage Lifecycle Scenarios
//!
//! Cross-component tests driving the disk service the way the engine
//! does: open, write through the async log path, read back across the
//! cache, run the checkpoint primitives, roll back, and mark abnormal
//! closes. Each scenario uses a fresh temporary directory.

use std::sync::Arc;

use quilldb::storage::INVALID_STATE_OFFSET;
use quilldb::{
    Collation, DiskService, EngineState, FileOrigin, RawPage, StorageSettings, PAGE_SIZE,
};
use tempfile::tempdir;

fn open_at(dir: &tempfile::TempDir) -> DiskService {
    let settings = StorageSettings::new(dir.path().join("scenario.db"));
    DiskService::new(&settings, Arc::new(EngineState::new())).unwrap()
}

mod open_scenarios {
    use super::*;

    #[test]
    fn empty_open_writes_one_header_page_and_no_log() {
        let dir = tempdir().unwrap();
        let data_path = dir.path().join("scenario.db");
        let log_path = dir.path().join("scenario-log.db");

        let disk = open_at(&dir);

        assert!(data_path.exists());
        assert!(!log_path.exists());
        assert_eq!(
            std::fs::metadata(&data_path).unwrap().len(),
            PAGE_SIZE as u64
        );
        assert_eq!(disk.get_virtual_length(FileOrigin::Data), PAGE_SIZE as u64);
        assert_eq!(disk.get_virtual_length(FileOrigin::Log), 0);
    }

    #[test]
    fn reopen_preserves_lengths_and_collation() {
        let dir = tempdir().unwrap();
        {
            let settings = StorageSettings::new(dir.path().join("scenario.db"))
                .collation(Collation::NoCase);
            let disk = DiskService::new(&settings, Arc::new(EngineState::new())).unwrap();
            assert!(disk.is_new());

            let mut image = RawPage::new(2 * PAGE_SIZE as u64, FileOrigin::Data);
            image.bytes_mut().fill(0x11);
            disk.write_pages([image], FileOrigin::Data).unwrap();
        }

        let disk = open_at(&dir);
        assert!(!disk.is_new());
        assert_eq!(disk.collation(), Collation::NoCase);
        assert_eq!(disk.get_virtual_length(FileOrigin::Data), 3 * PAGE_SIZE as u64);
    }
}

mod log_write_scenarios {
    use super::*;

    #[test]
    fn pattern_written_through_the_cache_reads_back_with_one_share() {
        let dir = tempdir().unwrap();
        let disk = open_at(&dir);

        let mut page = disk.new_page().unwrap();
        page.bytes_mut().fill(0xAB);
        assert_eq!(disk.write_async([page]).unwrap(), 1);
        disk.wait_queue().unwrap();

        let reader = disk.get_reader();
        let page = reader.read_page(0, FileOrigin::Log).unwrap();
        assert!(page.as_slice().iter().all(|&b| b == 0xAB));
        assert_eq!(page.share(), 1);
        page.release();
    }

    #[test]
    fn every_log_page_is_durable_after_wait() {
        let dir = tempdir().unwrap();
        let disk = open_at(&dir);

        let pages: Vec<_> = (0..16u8)
            .map(|i| {
                let mut page = disk.new_page().unwrap();
                page.bytes_mut().fill(i.wrapping_mul(17));
                page
            })
            .collect();
        disk.write_async(pages).unwrap();
        disk.wait_queue().unwrap();
        assert_eq!(disk.queue_length(), 0);

        let log = std::fs::read(dir.path().join("scenario-log.db")).unwrap();
        assert_eq!(log.len(), 16 * PAGE_SIZE);
        for i in 0..16usize {
            let page = &log[i * PAGE_SIZE..(i + 1) * PAGE_SIZE];
            assert!(
                page.iter().all(|&b| b == (i as u8).wrapping_mul(17)),
                "log page {i} bytes mismatch"
            );
        }
    }

    #[test]
    fn concurrent_producers_get_unique_positions() {
        let dir = tempdir().unwrap();
        let disk = Arc::new(open_at(&dir));

        let handles: Vec<_> = (0..4u8)
            .map(|_| {
                let disk = Arc::clone(&disk);
                std::thread::spawn(move || {
                    for _ in 0..8 {
                        let page = disk.new_page().unwrap();
                        disk.write_async([page]).unwrap();
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        disk.wait_queue().unwrap();
        assert_eq!(
            disk.get_virtual_length(FileOrigin::Log),
            32 * PAGE_SIZE as u64
        );
        assert_eq!(
            std::fs::metadata(dir.path().join("scenario-log.db"))
                .unwrap()
                .len(),
            32 * PAGE_SIZE as u64
        );
    }
}

mod checkpoint_scenarios {
    use super::*;

    #[test]
    fn full_checkpoint_cycle_moves_log_pages_into_the_datafile() {
        let dir = tempdir().unwrap();
        let disk = open_at(&dir);

        let pages: Vec<_> = (0..5u8)
            .map(|i| {
                let mut page = disk.new_page().unwrap();
                page.bytes_mut().fill(i + 1);
                page
            })
            .collect();
        assert_eq!(disk.write_async(pages).unwrap(), 5);
        disk.wait_queue().unwrap();

        // replay: each log page lands at the matching data position
        let mut images: Vec<RawPage> = disk
            .read_full(FileOrigin::Log)
            .unwrap()
            .collect::<eyre::Result<_>>()
            .unwrap();
        assert_eq!(images.len(), 5);
        for (i, image) in images.iter_mut().enumerate() {
            image.set_position((i as u64 + 1) * PAGE_SIZE as u64);
            image.set_origin(FileOrigin::Data);
        }
        disk.write_pages(images, FileOrigin::Data).unwrap();

        disk.set_length(0, FileOrigin::Log).unwrap();

        assert_eq!(
            std::fs::metadata(dir.path().join("scenario-log.db"))
                .unwrap()
                .len(),
            0
        );
        assert_eq!(disk.get_virtual_length(FileOrigin::Log), 0);

        let data = std::fs::read(dir.path().join("scenario.db")).unwrap();
        assert_eq!(data.len(), 6 * PAGE_SIZE);
        for i in 0..5usize {
            let page = &data[(i + 1) * PAGE_SIZE..(i + 2) * PAGE_SIZE];
            assert!(
                page.iter().all(|&b| b == i as u8 + 1),
                "data page {} bytes mismatch",
                i + 1
            );
        }

        // the next log write starts from offset 0 again
        let page = disk.new_page().unwrap();
        disk.write_async([page]).unwrap();
        disk.wait_queue().unwrap();
        assert_eq!(disk.get_virtual_length(FileOrigin::Log), PAGE_SIZE as u64);
    }
}

mod rollback_scenarios {
    use super::*;

    #[test]
    fn dirty_discard_frees_the_buffer_for_reuse() {
        let dir = tempdir().unwrap();
        let disk = open_at(&dir);

        let mut page = disk.new_page().unwrap();
        page.bytes_mut().fill(0xDD);
        let discarded_id = page.unique_id();
        disk.discard_dirty_pages([page]);

        // the very next allocation may reuse the same backing buffer,
        // writable again and zeroed
        let page = disk.new_page().unwrap();
        assert_eq!(page.unique_id(), discarded_id);
        assert!(page.bytes().iter().all(|&b| b == 0));
        disk.discard_dirty_pages([page]);
    }

    #[test]
    fn mixed_rollback_never_leaks_buffers() {
        let dir = tempdir().unwrap();
        let disk = open_at(&dir);

        let mut image = RawPage::new(PAGE_SIZE as u64, FileOrigin::Data);
        image.bytes_mut().fill(0x31);
        disk.write_pages([image], FileOrigin::Data).unwrap();

        let reader = disk.get_reader();
        let dirty = reader.new_page().unwrap();
        let clean = reader
            .read_writable_page(PAGE_SIZE as u64, FileOrigin::Data)
            .unwrap();

        disk.discard_dirty_pages([dirty]);
        disk.discard_clean_pages([clean]).unwrap();

        assert_eq!(disk.cache().pages_in_use(), 0);

        // the clean page was promoted, not dropped
        let page = reader.read_page(PAGE_SIZE as u64, FileOrigin::Data).unwrap();
        assert!(page.as_slice().iter().all(|&b| b == 0x31));
        page.release();
    }
}

mod invalid_state_scenarios {
    use super::*;

    #[test]
    fn mark_write_close_reopen_reads_the_flag() {
        let dir = tempdir().unwrap();
        {
            let disk = open_at(&dir);
            disk.mark_as_invalid_state().unwrap();
        }

        let bytes = std::fs::read(dir.path().join("scenario.db")).unwrap();
        assert_eq!(bytes[INVALID_STATE_OFFSET], 1);

        let disk = open_at(&dir);
        assert!(disk.is_invalid_state().unwrap());
    }
}
