//! Criterion benchmarks for the on-pool dictionaries.
//!
//! Run with:
//!   cargo bench --bench dict
//!
//! Pools live in a temp directory; every iteration batch gets a fresh
//! container so table growth is part of the measured insert path.

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use pmstore::{MemoryManager, NumDict, PPtr, SnapshotFlag, StringDict, MIN_POOL_SIZE};
use tempfile::TempDir;

fn pool(dir: &TempDir, name: &str) -> MemoryManager {
    MemoryManager::create(&dir.path().join(name), "bench", 16 * MIN_POOL_SIZE, 0o600)
        .expect("create bench pool")
}

fn bench_numdict(c: &mut Criterion) {
    let mut group = c.benchmark_group("numdict");

    for &n in &[100u32, 1_000, 10_000] {
        group.throughput(Throughput::Elements(n as u64));
        group.bench_with_input(BenchmarkId::new("insert", n), &n, |b, &n| {
            let dir = TempDir::new().unwrap();
            let mm = pool(&dir, "nd-insert.pool");
            b.iter(|| {
                let d = NumDict::create(&mm).unwrap();
                for i in 0..n {
                    d.set(i, PPtr::from_f64(i as f64), SnapshotFlag::Snapshot)
                        .unwrap();
                }
                d.deallocate().unwrap();
            })
        });

        group.throughput(Throughput::Elements(n as u64));
        group.bench_with_input(BenchmarkId::new("get", n), &n, |b, &n| {
            let dir = TempDir::new().unwrap();
            let mm = pool(&dir, "nd-get.pool");
            let d = NumDict::create(&mm).unwrap();
            for i in 0..n {
                d.set(i, PPtr::from_f64(i as f64), SnapshotFlag::Snapshot)
                    .unwrap();
            }
            b.iter(|| {
                for i in 0..n {
                    assert_eq!(d.get(i).unwrap(), PPtr::from_f64(i as f64));
                }
            })
        });
    }
    group.finish();
}

fn bench_string_dict(c: &mut Criterion) {
    let mut group = c.benchmark_group("string_dict");

    for &n in &[100u32, 1_000] {
        let keys: Vec<String> = (0..n).map(|i| format!("bench-key-{i:05}")).collect();

        group.throughput(Throughput::Elements(n as u64));
        group.bench_with_input(BenchmarkId::new("insert", n), &n, |b, _| {
            let dir = TempDir::new().unwrap();
            let mm = pool(&dir, "sd-insert.pool");
            b.iter(|| {
                let d = StringDict::create(&mm).unwrap();
                for (i, key) in keys.iter().enumerate() {
                    d.set(key, PPtr::from_f64(i as f64), SnapshotFlag::Snapshot)
                        .unwrap();
                }
                d.deallocate().unwrap();
            })
        });

        group.throughput(Throughput::Elements(n as u64));
        group.bench_with_input(BenchmarkId::new("get", n), &n, |b, _| {
            let dir = TempDir::new().unwrap();
            let mm = pool(&dir, "sd-get.pool");
            let d = StringDict::create(&mm).unwrap();
            for (i, key) in keys.iter().enumerate() {
                d.set(key, PPtr::from_f64(i as f64), SnapshotFlag::Snapshot)
                    .unwrap();
            }
            b.iter(|| {
                for (i, key) in keys.iter().enumerate() {
                    assert_eq!(d.get(key).unwrap(), PPtr::from_f64(i as f64));
                }
            })
        });
    }
    group.finish();
}

criterion_group!(benches, bench_numdict, bench_string_dict);
criterion_main!(benches);
