use criterion::{black_box, criterion_group, criterion_main, Criterion};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use plotpress_core::kernels::line_point::{line_point_to_square, square_to_line_point};
use plotpress_core::kernels::radix::sort_keyed;
use plotpress_core::pipeline::distributor::{distribute_records, even_slices};

const BENCH_ENTRIES: usize = 1 << 16;

fn random_pairs(n: usize) -> Vec<(u64, u64)> {
    let mut rng = StdRng::seed_from_u64(0xBEEF);
    (0..n)
        .map(|_| (rng.gen::<u32>() as u64, rng.gen::<u32>() as u64))
        .collect()
}

fn bench_line_point(c: &mut Criterion) {
    let pairs = random_pairs(BENCH_ENTRIES);
    let lps: Vec<u64> = pairs
        .iter()
        .map(|&(x, y)| square_to_line_point(x, y))
        .collect();

    let mut group = c.benchmark_group("line_point");
    group.throughput(criterion::Throughput::Elements(BENCH_ENTRIES as u64));
    group.bench_function("forward", |b| {
        b.iter(|| {
            for &(x, y) in &pairs {
                black_box(square_to_line_point(black_box(x), black_box(y)));
            }
        })
    });
    group.bench_function("inverse", |b| {
        b.iter(|| {
            for &lp in &lps {
                black_box(line_point_to_square(black_box(lp)));
            }
        })
    });
    group.finish();
}

fn bench_radix(c: &mut Criterion) {
    let mut rng = StdRng::seed_from_u64(0xFACE);
    let keys: Vec<u64> = (0..BENCH_ENTRIES).map(|_| rng.gen::<u64>() >> 1).collect();
    let vals: Vec<u32> = (0..BENCH_ENTRIES as u32).collect();

    let mut group = c.benchmark_group("radix");
    group.throughput(criterion::Throughput::Elements(BENCH_ENTRIES as u64));
    group.bench_function("sort_keyed", |b| {
        b.iter(|| {
            let mut k = keys.clone();
            let mut v = vals.clone();
            sort_keyed(black_box(&mut k), black_box(&mut v));
        })
    });
    group.finish();
}

fn bench_distributor(c: &mut Criterion) {
    let mut rng = StdRng::seed_from_u64(0xD157);
    let records: Vec<u64> = (0..BENCH_ENTRIES).map(|_| rng.gen()).collect();

    let mut group = c.benchmark_group("distributor");
    group.throughput(criterion::Throughput::Elements(BENCH_ENTRIES as u64));
    for workers in [1usize, 4] {
        group.bench_function(format!("scatter_{}_workers", workers), |b| {
            b.iter(|| {
                let slices = even_slices(&records, workers);
                let mut out = vec![0u64; records.len()];
                black_box(distribute_records(
                    &slices,
                    64,
                    |r| (r >> 58) as usize,
                    &mut out,
                ));
            })
        });
    }
    group.finish();
}

criterion_group!(benches, bench_line_point, bench_radix, bench_distributor);
criterion_main!(benches);
