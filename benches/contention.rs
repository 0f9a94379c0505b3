//! Slab alloc/free against the system allocator, in the shapes the
//! allocator is built for: fixed-size 64-byte churn, single-threaded and
//! across a pool of worker threads.

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion};
use std::ptr::NonNull;

const THREAD_COUNT: usize = 16;
const ALLOCATIONS_PER_THREAD: usize = 10_000;

fn churn_slab(n: usize) {
    let mut ptrs: Vec<NonNull<u8>> = Vec::with_capacity(n);
    for _ in 0..n {
        ptrs.push(slabcache::alloc().expect("out of memory"));
    }
    for p in ptrs {
        unsafe { slabcache::free(p) };
    }
}

fn churn_system(n: usize) {
    let mut boxes: Vec<Box<[u8; 64]>> = Vec::with_capacity(n);
    for _ in 0..n {
        boxes.push(Box::new([0u8; 64]));
    }
    drop(boxes);
}

fn bench_fill_drain(c: &mut Criterion) {
    let mut group = c.benchmark_group("fill_drain");
    for &n in &[1_000usize, 10_000] {
        group.bench_with_input(BenchmarkId::new("slab", n), &n, |b, &n| {
            b.iter(|| churn_slab(n));
        });
        group.bench_with_input(BenchmarkId::new("system", n), &n, |b, &n| {
            b.iter(|| churn_system(n));
        });
    }
    group.finish();
}

fn bench_paired(c: &mut Criterion) {
    // steady state: the pair never leaves the fastbin
    let mut group = c.benchmark_group("paired_alloc_free");
    group.bench_function("slab", |b| {
        b.iter(|| {
            let p = slabcache::alloc().expect("out of memory");
            criterion::black_box(p);
            unsafe { slabcache::free(p) };
        });
    });
    group.bench_function("system", |b| {
        b.iter(|| {
            let bx = Box::new([0u8; 64]);
            criterion::black_box(&bx);
            drop(bx);
        });
    });
    group.finish();
}

fn bench_contended(c: &mut Criterion) {
    let mut group = c.benchmark_group("contended_fill_drain");
    group.sample_size(10);
    group.bench_function(format!("slab_{}_threads", THREAD_COUNT), |b| {
        b.iter(|| {
            let handles: Vec<_> = (0..THREAD_COUNT)
                .map(|_| std::thread::spawn(|| churn_slab(ALLOCATIONS_PER_THREAD)))
                .collect();
            for h in handles {
                h.join().unwrap();
            }
        });
    });
    group.bench_function(format!("system_{}_threads", THREAD_COUNT), |b| {
        b.iter(|| {
            let handles: Vec<_> = (0..THREAD_COUNT)
                .map(|_| std::thread::spawn(|| churn_system(ALLOCATIONS_PER_THREAD)))
                .collect();
            for h in handles {
                h.join().unwrap();
            }
        });
    });
    group.finish();
}

criterion_group!(benches, bench_fill_drain, bench_paired, bench_contended);
criterion_main!(benches);
