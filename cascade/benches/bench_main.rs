use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};
use rand::Rng;

use cascade_rs::config::ShardConfig;
use cascade_rs::object::{VersionedObject, CURRENT_VERSION};
use cascade_rs::store::ShardStore;

fn generate_payload(size: usize) -> Vec<u8> {
    let mut rng = rand::thread_rng();
    (0..size).map(|_| rng.gen()).collect()
}

fn setup_store(dir: &tempdir::TempDir) -> ShardStore<String> {
    let mut config = ShardConfig::default();
    config.set_data_dir(dir.path().to_path_buf());
    // Bench the commit path, not the disk cache flush.
    config.inject_cmd("sync_on_append", "false").unwrap();
    ShardStore::open(&config).unwrap()
}

fn bench_ordered_put(c: &mut Criterion) {
    let mut group = c.benchmark_group("ordered_put");
    for size in [64usize, 1024, 16 * 1024] {
        group.throughput(Throughput::Bytes(size as u64));
        group.bench_function(format!("payload_{}", size), |b| {
            let dir = tempdir::TempDir::new("cascade-bench").unwrap();
            let store = setup_store(&dir);
            let payload = generate_payload(size);
            let mut i = 0u64;
            b.iter(|| {
                i += 1;
                let key = format!("bench/{}", i % 1024);
                store.put(VersionedObject::new(key, black_box(&payload))).unwrap()
            });
        });
    }
    group.finish();
}

fn bench_lockless_get(c: &mut Criterion) {
    c.bench_function("lockless_get", |b| {
        let dir = tempdir::TempDir::new("cascade-bench").unwrap();
        let store = setup_store(&dir);
        for i in 0..1024u64 {
            let key = format!("bench/{}", i);
            store.put(VersionedObject::new(key, &generate_payload(256))).unwrap();
        }
        let mut i = 0u64;
        b.iter(|| {
            i += 1;
            let key = format!("bench/{}", i % 1024);
            store.get(black_box(&key), CURRENT_VERSION, false, false).unwrap()
        });
    });
}

fn bench_historical_get(c: &mut Criterion) {
    c.bench_function("historical_get_exact", |b| {
        let dir = tempdir::TempDir::new("cascade-bench").unwrap();
        let store = setup_store(&dir);
        let mut versions = Vec::new();
        for i in 0..1024u64 {
            let key = format!("bench/{}", i);
            let (version, _) =
                store.put(VersionedObject::new(key, &generate_payload(256))).unwrap();
            versions.push((format!("bench/{}", i), version));
        }
        let mut i = 0usize;
        b.iter(|| {
            i += 1;
            let (key, version) = &versions[i % versions.len()];
            store.get(black_box(key), *version, false, true).unwrap()
        });
    });
}

criterion_group!(benches, bench_ordered_put, bench_lockless_get, bench_historical_get);
criterion_main!(benches);
