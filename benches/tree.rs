use adaptree::{Adaptree, Index, Record, TreeOptions};
use criterion::{black_box, criterion_group, criterion_main, Criterion};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

const N: u64 = 200_000;

fn records(n: u64) -> Vec<Record> {
    (1..=n).map(|k| Record::new(k * 7, k)).collect()
}

fn bulk_then_lookup(c: &mut Criterion) {
    let tree = Adaptree::with_records(&records(N), TreeOptions::default()).unwrap();
    let mut rng = StdRng::seed_from_u64(42);
    c.bench_function("lookup/bulk-loaded", |b| {
        b.iter(|| {
            let k = rng.gen_range(1..=N) * 7;
            black_box(tree.lookup(black_box(k)))
        })
    });
}

fn insert_heavy(c: &mut Criterion) {
    c.bench_function("insert/random", |b| {
        let tree = Adaptree::with_options(TreeOptions::default()).unwrap();
        let mut rng = StdRng::seed_from_u64(43);
        b.iter(|| {
            let k = rng.gen::<u64>() >> 1 | 1;
            black_box(tree.insert(black_box(k), 1))
        })
    });
}

fn mixed_workload(c: &mut Criterion) {
    let tree = Adaptree::with_records(&records(N), TreeOptions::default()).unwrap();
    let mut rng = StdRng::seed_from_u64(44);
    c.bench_function("mixed/90-10", |b| {
        b.iter(|| {
            let k = rng.gen_range(1..=N) * 7;
            if rng.gen_range(0..10) == 0 {
                black_box(tree.insert(k, 2));
            } else {
                black_box(tree.lookup(k));
            }
        })
    });
}

fn scan_short_ranges(c: &mut Criterion) {
    let tree = Adaptree::with_records(&records(N), TreeOptions::default()).unwrap();
    let mut rng = StdRng::seed_from_u64(45);
    c.bench_function("scan/len-100", |b| {
        b.iter(|| {
            let from = rng.gen_range(1..=N) * 7;
            black_box(tree.scan(black_box(from), 100).len())
        })
    });
}

criterion_group!(
    benches,
    bulk_then_lookup,
    insert_heavy,
    mixed_workload,
    scan_short_ranges
);
criterion_main!(benches);
