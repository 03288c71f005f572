//! Criterion benchmarks for the expiring cache hot path.
//!
//! Insert churn past capacity, Zipf-like lookups, and a 70/30 read/write mix.

use std::hint::black_box;
use std::time::Duration;

use client_sync::ExpiringCache;
use criterion::{Criterion, criterion_group, criterion_main};

const CAP: usize = 1_000;
const OPS: usize = 100_000;
const TTL: Duration = Duration::from_secs(3600);

/// Deterministic sampler biased toward low keys.
const fn zipf_key(step: usize, n_unique: usize) -> usize {
    let h = step.wrapping_mul(2_654_435_761) >> 16;
    let rank = h % n_unique;
    (rank * rank) % n_unique
}

fn bench_insert_100k(c: &mut Criterion) {
    c.bench_function("expiring_insert_100k", |b| {
        b.iter(|| {
            let cache = ExpiringCache::new("bench", TTL, CAP);
            for i in 0..OPS {
                cache.put(black_box(i), i);
            }
            black_box(cache.len());
        });
    });
}

fn bench_get_zipf_100k(c: &mut Criterion) {
    c.bench_function("expiring_get_zipf_100k", |b| {
        let n_unique = 5_000;
        b.iter(|| {
            let cache = ExpiringCache::new("bench", TTL, CAP);
            for i in 0..n_unique {
                cache.put(i, i);
            }
            let mut hits = 0u64;
            for step in 0..OPS {
                let key = zipf_key(step, n_unique);
                if cache.get(&key).is_some() {
                    hits += 1;
                } else {
                    cache.put(key, key);
                }
            }
            black_box(hits);
        });
    });
}

fn bench_mixed_100k(c: &mut Criterion) {
    c.bench_function("expiring_mixed_100k", |b| {
        let n_unique = 5_000;
        b.iter(|| {
            let cache = ExpiringCache::new("bench", TTL, CAP);
            for i in 0..CAP {
                cache.put(i, i);
            }
            let mut hits = 0u64;
            for step in 0..OPS {
                let key = zipf_key(step, n_unique);
                if step % 10 < 7 {
                    if cache.get(&key).is_some() {
                        hits += 1;
                    }
                } else {
                    cache.put(key, key);
                }
            }
            black_box(hits);
        });
    });
}

fn bench_invalidate_churn(c: &mut Criterion) {
    c.bench_function("expiring_put_invalidate_100k", |b| {
        b.iter(|| {
            let cache = ExpiringCache::new("bench", TTL, CAP);
            for i in 0..OPS {
                cache.put(i % CAP, i);
                if i % 3 == 0 {
                    cache.invalidate(&(i % CAP));
                }
            }
            black_box(cache.metrics().invalidations);
        });
    });
}

criterion_group!(
    benches,
    bench_insert_100k,
    bench_get_zipf_100k,
    bench_mixed_100k,
    bench_invalidate_churn,
);
criterion_main!(benches);
