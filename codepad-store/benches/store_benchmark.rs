use criterion::{black_box, criterion_group, criterion_main, Criterion};
use codepad_core::Slug;
use codepad_store::{ContentStore, MemoryStore, RocksStore, StoreConfig};

const CLASSES: &str = "public interface IPerson { string Name { get; } string Greet(); }\n";

fn bench_rocks_save(c: &mut Criterion) {
    let dir = tempfile::tempdir().unwrap();
    let store = RocksStore::open(StoreConfig::for_testing(dir.path().join("db"))).unwrap();
    let slug = Slug::parse("bench").unwrap();
    let classes = CLASSES.repeat(50);

    c.bench_function("rocks_save_4KB", |b| {
        b.iter(|| {
            black_box(store.save(&slug, black_box("return 1+1;"), &classes).unwrap());
        })
    });
}

fn bench_rocks_get(c: &mut Criterion) {
    let dir = tempfile::tempdir().unwrap();
    let store = RocksStore::open(StoreConfig::for_testing(dir.path().join("db"))).unwrap();
    let slug = Slug::parse("bench").unwrap();
    let classes = CLASSES.repeat(50);
    for _ in 0..100 {
        store.save(&slug, "return 1+1;", &classes).unwrap();
    }

    c.bench_function("rocks_get_4KB", |b| {
        b.iter(|| {
            black_box(store.get(&slug, black_box(50)).unwrap());
        })
    });

    c.bench_function("rocks_latest_version", |b| {
        b.iter(|| {
            black_box(store.latest_version(&slug).unwrap());
        })
    });
}

fn bench_memory_save(c: &mut Criterion) {
    let store = MemoryStore::new();
    let slug = Slug::parse("bench").unwrap();

    c.bench_function("memory_save", |b| {
        b.iter(|| {
            black_box(store.save(&slug, "return 1+1;", CLASSES).unwrap());
        })
    });
}

criterion_group!(benches, bench_rocks_save, bench_rocks_get, bench_memory_save);
criterion_main!(benches);
