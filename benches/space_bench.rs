//! Benchmarks for the extent allocator, compression and the reclaim path.

use criterion::{black_box, criterion_group, criterion_main, BatchSize, Criterion};

use hybridswap::config::{CompressionConfig, Config};
use hybridswap::extent::ExtentSpace;
use hybridswap::store::Compressor;
use hybridswap::Engine;

fn bench_allocate_free(c: &mut Criterion) {
    let space = ExtentSpace::new(64 * 1024, 4);
    // Half full, so scans have to skip allocated words.
    for _ in 0..32 * 1024 {
        let e = space.allocate(1).unwrap();
        space.release_exclusive(e);
    }

    c.bench_function("extent_allocate_free_half_full", |b| {
        b.iter(|| {
            let e = space.allocate(2).unwrap();
            space.free(black_box(e));
        })
    });
}

fn bench_compression(c: &mut Criterion) {
    let compressor = Compressor::new(CompressionConfig::default(), 4096);
    let page: Vec<u8> = b"hybridswap ".iter().copied().cycle().take(4096).collect();

    c.bench_function("zstd_compress_4k_page", |b| {
        b.iter(|| black_box(compressor.compress(black_box(&page)).unwrap()))
    });
}

fn bench_reclaim_fault(c: &mut Criterion) {
    let mut config = Config::default();
    config.geometry.extent_count = 256;
    config.geometry.object_count = 4096;
    config.reclaim.min_reclaim_bytes = 0;
    let engine = Engine::with_mem_device(config).unwrap();
    let page: Vec<u8> = (0..4096u32).map(|i| (i / 64) as u8).collect();

    c.bench_function("reclaim_1k_pages_then_fault_one", |b| {
        b.iter_batched(
            || {
                for id in 0..1024 {
                    engine.store(1, id, &page).unwrap();
                }
            },
            |()| {
                engine.reclaim_in(1, true).unwrap();
                black_box(engine.load(512).unwrap());
            },
            BatchSize::PerIteration,
        )
    });
}

criterion_group!(
    benches,
    bench_allocate_free,
    bench_compression,
    bench_reclaim_fault,
);
criterion_main!(benches);
