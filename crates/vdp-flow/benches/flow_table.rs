//! Flow table benchmarks
//!
//! Key hashing and the two-tier lookup/claim paths under Criterion.

use criterion::{black_box, criterion_group, criterion_main, BatchSize, Criterion};

use vdp_flow::table::TableConfig;
use vdp_flow::{FlowKey, FlowTable};

fn table(flow_entries: usize, oflow_entries: usize) -> FlowTable {
    FlowTable::new(&TableConfig {
        flow_entries,
        oflow_entries,
    })
    .unwrap()
}

fn key(n: u32) -> FlowKey {
    FlowKey::new(0x0a000000 + n, 0x08080808, 12345, 443, 6, 1)
}

fn bench_key_hash(c: &mut Criterion) {
    let k = key(1);
    c.bench_function("flow_key_hash", |b| b.iter(|| black_box(k).hash()));
}

fn bench_lookup_hit(c: &mut Criterion) {
    let t = table(64 * 1024, 1024);
    for n in 0..1024 {
        t.find_free(&key(n)).unwrap();
    }

    let probe = key(512);
    c.bench_function("flow_lookup_hit", |b| {
        b.iter(|| t.find(black_box(&probe)))
    });
}

fn bench_lookup_miss(c: &mut Criterion) {
    let t = table(64 * 1024, 1024);
    for n in 0..1024 {
        t.find_free(&key(n)).unwrap();
    }

    let probe = key(1 << 20);
    c.bench_function("flow_lookup_miss", |b| {
        b.iter(|| t.find(black_box(&probe)))
    });
}

fn bench_claim(c: &mut Criterion) {
    c.bench_function("flow_claim", |b| {
        b.iter_batched(
            || table(1024, 64),
            |t| {
                t.find_free(black_box(&key(7)));
            },
            BatchSize::SmallInput,
        )
    });
}

criterion_group!(
    benches,
    bench_key_hash,
    bench_lookup_hit,
    bench_lookup_miss,
    bench_claim
);
criterion_main!(benches);
