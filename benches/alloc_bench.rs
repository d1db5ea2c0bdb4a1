use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use gc_spaces::utils::MB;
use gc_spaces::*;

fn alloc_free_cycle(space: &AllocSpace, size: usize, count: usize) {
    let mut objects = Vec::with_capacity(count);
    for _ in 0..count {
        let obj = space.alloc_with_growth(size);
        assert!(obj.is_non_null());
        objects.push(obj);
    }
    black_box(space.free_list(&objects));
}

fn bench_alloc(c: &mut Criterion) {
    init_logging(log::Level::Warn);
    let mut group = c.benchmark_group("alloc space");
    for size in [16usize, 128, 1024, 8192].iter() {
        let space = AllocSpace::create("bench", 4 * MB, 64 * MB, 64 * MB, None).unwrap();
        group.bench_with_input(
            BenchmarkId::new("alloc then free_list 1000", size),
            size,
            |b, size| b.iter(|| alloc_free_cycle(&space, *size, 1000)),
        );
        group.bench_with_input(BenchmarkId::new("alloc free pair", size), size, |b, size| {
            b.iter(|| {
                let obj = space.alloc_without_growth(*size);
                black_box(space.free(obj))
            })
        });
    }
    group.finish();
}

fn bench_bitmap(c: &mut Criterion) {
    let space = AllocSpace::create("bitmap bench", 16 * MB, 16 * MB, 16 * MB, None).unwrap();
    let mut objects = Vec::new();
    loop {
        let obj = space.alloc_without_growth(64);
        if obj.is_null() {
            break;
        }
        space.live_bitmap().set(obj);
        objects.push(obj);
    }
    c.bench_function("live bitmap walk", |b| {
        b.iter(|| black_box(space.live_bitmap().count()))
    });
}

criterion_group!(benches, bench_alloc, bench_bitmap);
criterion_main!(benches);
