//! Benchmarks for bag insert, iteration, and insert/erase churn.
//!
//! Compares against a `Mutex<Vec>` baseline: the point of the chunked
//! layout is iteration within a small factor of a contiguous vector while
//! keeping insert/erase concurrent.

use std::sync::Mutex;

use criterion::{black_box, criterion_group, criterion_main, BatchSize, Criterion, Throughput};

use churn::Bag;

const N: u64 = 10_000;

fn bench_insert(c: &mut Criterion) {
    let mut group = c.benchmark_group("insert");
    group.throughput(Throughput::Elements(N));

    group.bench_function("churn/u64", |b| {
        b.iter_batched(
            Bag::<u64>::new,
            |bag| {
                for v in 0..N {
                    bag.insert(black_box(v));
                }
                bag
            },
            BatchSize::SmallInput,
        );
    });

    group.bench_function("mutex_vec/u64", |b| {
        b.iter_batched(
            || Mutex::new(Vec::new()),
            |vec| {
                for v in 0..N {
                    vec.lock().unwrap().push(black_box(v));
                }
                vec
            },
            BatchSize::SmallInput,
        );
    });

    group.finish();
}

fn bench_iterate(c: &mut Criterion) {
    let mut group = c.benchmark_group("iterate");
    group.throughput(Throughput::Elements(N));

    let bag: Bag<u64> = Bag::new();
    for v in 0..N {
        bag.insert(v);
    }
    group.bench_function("churn/u64", |b| {
        b.iter(|| {
            let mut sum = 0u64;
            bag.iterate(|item| sum += *item);
            black_box(sum)
        });
    });
    group.bench_function("churn_shared/u64", |b| {
        b.iter(|| {
            let mut sum = 0u64;
            bag.iterate_shared(|item| sum += *item);
            black_box(sum)
        });
    });

    let vec: Vec<u64> = (0..N).collect();
    group.bench_function("vec/u64", |b| {
        b.iter(|| black_box(vec.iter().sum::<u64>()));
    });

    group.finish();
}

fn bench_churn(c: &mut Criterion) {
    let mut group = c.benchmark_group("churn");

    // A warm container: insert lands in reclaimed slots, not fresh chunks.
    let bag: Bag<u64> = Bag::new();
    for v in 0..N {
        bag.insert(v);
    }
    group.bench_function("insert_erase/u64", |b| {
        b.iter(|| {
            let handle = bag.insert(black_box(1)).handle();
            bag.erase(&handle);
        });
    });
    group.bench_function("handle_lock/u64", |b| {
        let handle = bag.insert(7).handle();
        b.iter(|| *black_box(&handle).lock().unwrap());
    });

    group.finish();
}

criterion_group!(benches, bench_insert, bench_iterate, bench_churn);
criterion_main!(benches);
