//! Storage-core benchmarks for QuillDB
//!
//! Measures the two hot paths of the storage layer: cache hits on the
//! readable index, and the full asynchronous write pipeline (reserve log
//! position, promote, background write, durability wait).
//!
//! ```bash
//! cargo bench --bench page_cache
//! ```

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use std::sync::Arc;
use tempfile::tempdir;

use quilldb::{DiskService, EngineState, FileOrigin, MemoryCache, StorageSettings, PAGE_SIZE};

fn bench_cache_hits(c: &mut Criterion) {
    let mut group = c.benchmark_group("cache_get_readable");

    for pages in [16u64, 256].iter() {
        let cache = MemoryCache::new();
        for i in 0..*pages {
            let page = cache
                .get_readable_page(i * PAGE_SIZE as u64, FileOrigin::Data, |_, buf| {
                    buf.fill(i as u8);
                    Ok(())
                })
                .unwrap();
            page.release();
        }

        group.throughput(Throughput::Elements(*pages));
        group.bench_with_input(BenchmarkId::new("hit", pages), pages, |b, &pages| {
            b.iter(|| {
                for i in 0..pages {
                    let page = cache
                        .get_readable_page(i * PAGE_SIZE as u64, FileOrigin::Data, |_, _| {
                            unreachable!("warmed cache never misses")
                        })
                        .unwrap();
                    black_box(page.as_slice()[0]);
                    page.release();
                }
            });
        });
    }

    group.finish();
}

fn bench_new_page(c: &mut Criterion) {
    let cache = MemoryCache::new();

    c.bench_function("cache_new_page_discard", |b| {
        b.iter(|| {
            let page = cache.new_page();
            black_box(page.bytes()[0]);
            cache.discard_page(page);
        });
    });
}

fn bench_write_async(c: &mut Criterion) {
    let mut group = c.benchmark_group("write_async");
    group.sample_size(20);

    for batch in [8usize, 64].iter() {
        group.throughput(Throughput::Bytes((batch * PAGE_SIZE) as u64));
        group.bench_with_input(BenchmarkId::new("batch", batch), batch, |b, &batch| {
            b.iter_with_setup(
                || {
                    let dir = tempdir().unwrap();
                    let settings = StorageSettings::new(dir.path().join("bench.db"));
                    let disk =
                        DiskService::new(&settings, Arc::new(EngineState::new())).unwrap();
                    (dir, disk)
                },
                |(dir, disk)| {
                    let pages: Vec<_> = (0..batch)
                        .map(|i| {
                            let mut page = disk.new_page().unwrap();
                            page.bytes_mut().fill(i as u8);
                            page
                        })
                        .collect();
                    disk.write_async(pages).unwrap();
                    disk.wait_queue().unwrap();
                    (dir, disk)
                },
            );
        });
    }

    group.finish();
}

criterion_group!(benches, bench_cache_hits, bench_new_page, bench_write_async);
criterion_main!(benches);
