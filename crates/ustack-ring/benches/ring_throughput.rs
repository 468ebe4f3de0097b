//! Ring produce/consume throughput

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use ustack_ring::{OwnedStridedRing, Ring, SlotRing};

const BATCH: u64 = 1024;

fn bench_ring<R: Ring>(ring: &R) {
    for i in 1..=BATCH {
        ring.produce(i).unwrap();
    }
    for _ in 0..BATCH {
        ring.consume().unwrap();
    }
}

fn ring_throughput(c: &mut Criterion) {
    let mut group = c.benchmark_group("ring_throughput");
    group.throughput(Throughput::Elements(BATCH));

    let slot = SlotRing::new(2048);
    group.bench_with_input(BenchmarkId::new("slot_ring", BATCH), &slot, |b, ring| {
        b.iter(|| bench_ring(ring))
    });

    let strided = OwnedStridedRing::new(2048);
    group.bench_with_input(BenchmarkId::new("strided_ring", BATCH), &strided, |b, ring| {
        b.iter(|| bench_ring(ring))
    });

    group.finish();
}

criterion_group!(benches, ring_throughput);
criterion_main!(benches);
