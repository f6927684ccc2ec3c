//! Transaction and commit benchmarks.

use criterion::{black_box, criterion_group, criterion_main, BatchSize, Criterion};
use std::sync::Arc;
use stratadb_core::{Database, DatabaseConfig, ObjectStore, StoreOptions, Value};

fn store() -> (Database, Arc<ObjectStore>) {
    let db = Database::open_in_memory_with_config(
        1,
        DatabaseConfig::default().transaction_timeout(None),
    )
    .unwrap();
    let store = db
        .create_object_store("bench", StoreOptions::default())
        .unwrap();
    db.connect().unwrap();
    (db, store)
}

fn bench_staged_puts(c: &mut Criterion) {
    let (_db, store) = store();
    c.bench_function("stage_100_puts", |b| {
        b.iter_batched(
            || store.transaction().unwrap(),
            |tx| {
                for i in 0..100 {
                    tx.put(&format!("key-{i:04}"), Value::int(i)).unwrap();
                }
                black_box(tx)
            },
            BatchSize::SmallInput,
        );
    });
}

fn bench_commit(c: &mut Criterion) {
    let (_db, store) = store();
    c.bench_function("commit_100_puts", |b| {
        b.iter_batched(
            || {
                let tx = store.transaction().unwrap();
                for i in 0..100 {
                    tx.put(&format!("key-{i:04}"), Value::int(i)).unwrap();
                }
                tx
            },
            |tx| {
                assert!(tx.commit().unwrap());
            },
            BatchSize::SmallInput,
        );
    });
}

fn bench_overlay_reads(c: &mut Criterion) {
    let (_db, store) = store();
    let seeder = store.transaction().unwrap();
    for i in 0..1000 {
        seeder.put(&format!("key-{i:04}"), Value::int(i)).unwrap();
    }
    assert!(seeder.commit().unwrap());

    let tx = store.transaction().unwrap();
    for i in (0..1000).step_by(3) {
        tx.put(&format!("key-{i:04}"), Value::int(-i)).unwrap();
    }
    for i in (1..1000).step_by(7) {
        tx.remove(&format!("key-{i:04}")).unwrap();
    }

    c.bench_function("overlay_get", |b| {
        b.iter(|| black_box(tx.get("key-0500").unwrap()));
    });
    c.bench_function("overlay_keys", |b| {
        b.iter(|| black_box(tx.keys(None).unwrap().len()));
    });
    c.bench_function("overlay_max_key", |b| {
        b.iter(|| black_box(tx.max_key(None).unwrap()));
    });
}

criterion_group!(benches, bench_staged_puts, bench_commit, bench_overlay_reads);
criterion_main!(benches);
