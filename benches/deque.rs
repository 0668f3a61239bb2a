//! Offer/poll throughput benchmarks for the persistent binary deque.
//!
//! Measures the append and drain paths of both segment backends across a
//! few payload sizes, with and without compression.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use pbdeque::{BufferHandle, DirectBufferAllocator, PersistentBinaryDeque};
use tempfile::tempdir;

fn bench_offer(c: &mut Criterion) {
    let mut group = c.benchmark_group("offer");

    for (mmap, backend) in [(false, "regular"), (true, "mmap")] {
        for payload_bytes in [256usize, 8 * 1024, 256 * 1024] {
            group.throughput(Throughput::Bytes(payload_bytes as u64));
            group.bench_with_input(
                BenchmarkId::new(backend, payload_bytes),
                &payload_bytes,
                |b, &payload_bytes| {
                    let dir = tempdir().unwrap();
                    let pbd = PersistentBinaryDeque::builder("bench", dir.path())
                        .memory_mapped(mmap)
                        .open()
                        .unwrap();
                    let record = BufferHandle::from(vec![0x5Au8; payload_bytes]);
                    b.iter(|| pbd.offer(black_box(&record)).unwrap());
                },
            );
        }
    }

    group.finish();
}

fn bench_offer_compressed(c: &mut Criterion) {
    let mut group = c.benchmark_group("offer_compressed");

    for payload_bytes in [8 * 1024usize, 256 * 1024] {
        group.throughput(Throughput::Bytes(payload_bytes as u64));
        group.bench_with_input(
            BenchmarkId::from_parameter(payload_bytes),
            &payload_bytes,
            |b, &payload_bytes| {
                let dir = tempdir().unwrap();
                let pbd = PersistentBinaryDeque::builder("bench", dir.path())
                    .memory_mapped(true)
                    .open()
                    .unwrap();
                let record = BufferHandle::direct_from(&vec![0x5Au8; payload_bytes]);
                b.iter(|| pbd.offer(black_box(&record)).unwrap());
            },
        );
    }

    group.finish();
}

fn bench_offer_poll_cycle(c: &mut Criterion) {
    let mut group = c.benchmark_group("offer_poll_cycle");

    for (mmap, backend) in [(false, "regular"), (true, "mmap")] {
        group.bench_function(backend, |b| {
            let dir = tempdir().unwrap();
            let pbd = PersistentBinaryDeque::builder("bench", dir.path())
                .memory_mapped(mmap)
                .open()
                .unwrap();
            let record = BufferHandle::from(vec![0x5Au8; 4 * 1024]);
            b.iter(|| {
                pbd.offer(&record).unwrap();
                let mut handle = pbd.poll(&DirectBufferAllocator).unwrap().unwrap();
                black_box(handle.bytes());
                handle.discard();
            });
        });
    }

    group.finish();
}

criterion_group!(
    benches,
    bench_offer,
    bench_offer_compressed,
    bench_offer_poll_cycle
);
criterion_main!(benches);
