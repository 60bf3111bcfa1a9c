use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use nemb_core::counter::CounterAccumulator;

fn bulk_update_bench(c: &mut Criterion) {
    let mut group = c.benchmark_group("CounterAccumulator");

    for &n_counters in &[1usize, 4, 8, 16] {
        let mut acc = CounterAccumulator::new();
        let ids: Vec<_> = (0..n_counters).map(|i| acc.register(format!("c{i}"), 32, 1e-6, "uJ")).collect();

        group.bench_function(BenchmarkId::new("bulk_update", n_counters), |b| {
            let mut raw = 0u64;
            b.iter(|| {
                raw = raw.wrapping_add(1_000_000);
                let updates: Vec<_> = ids.iter().map(|&id| (id, raw & 0xFFFF_FFFF)).collect();
                acc.bulk_update(&updates);
                black_box(acc.get(ids[0]).accumulated_raw());
            })
        });
    }
}

criterion_group!(benches, bulk_update_bench);
criterion_main!(benches);
