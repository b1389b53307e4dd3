use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use kv_store::config::Config;
use kv_store::store::Store;
use tempfile::tempdir;

fn put_throughput(c: &mut Criterion) {
    let mut group = c.benchmark_group("put");
    for value_size in [16usize, 256, 4096] {
        group.bench_with_input(
            BenchmarkId::from_parameter(value_size),
            &value_size,
            |b, &value_size| {
                let dir = tempdir().unwrap();
                let store = Store::open(Config::new(dir.path())).unwrap();
                let value = vec![0x42u8; value_size];
                let mut i: u64 = 0;
                b.iter(|| {
                    let key = format!("key-{}", i);
                    store.put(key.as_bytes(), black_box(&value)).unwrap();
                    i += 1;
                });
                store.close();
            },
        );
    }
    group.finish();
}

fn read_latency(c: &mut Criterion) {
    let dir = tempdir().unwrap();
    let store = Store::open(Config::new(dir.path())).unwrap();
    for i in 0..10_000u64 {
        store
            .put(format!("key-{}", i).as_bytes(), b"some-bench-value")
            .unwrap();
    }

    c.bench_function("read_hit", |b| {
        let mut i = 0u64;
        b.iter(|| {
            let key = format!("key-{}", i % 10_000);
            black_box(store.read(key.as_bytes()).unwrap());
            i += 1;
        });
    });

    store.close();
}

fn range_scan(c: &mut Criterion) {
    let dir = tempdir().unwrap();
    let store = Store::open(Config::new(dir.path())).unwrap();
    for i in 0..1_000u32 {
        store
            .put(format!("key-{:05}", i).as_bytes(), b"range-bench-value")
            .unwrap();
    }

    c.bench_function("range_100_keys", |b| {
        b.iter(|| {
            black_box(store.range(b"key-00100", b"key-00200").unwrap());
        });
    });

    store.close();
}

criterion_group!(benches, put_throughput, read_latency, range_scan);
criterion_main!(benches);
