//! Performance benchmarks for paysync-engine

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use paysync_engine::{
    domain::{self, PAYMENT_REQUESTS, PAYMENT_REQUEST_ITEMS},
    DirtyTracker, LocalSnapshot, LocalStore, MemoryLocalStore, Record,
};
use serde_json::json;
use tokio::runtime::Runtime;

fn runtime() -> Runtime {
    tokio::runtime::Builder::new_current_thread()
        .build()
        .expect("benchmark runtime")
}

/// `total` clean records, every `dirty_every`-th one dirty.
fn populated_store(rt: &Runtime, total: usize, dirty_every: usize) -> MemoryLocalStore {
    let store = MemoryLocalStore::new();
    rt.block_on(async {
        for i in 0..total {
            let mut record = Record::new_local(
                format!("PR-{}", i),
                PAYMENT_REQUESTS,
                json!({"contractId": "C-1", "number": i, "subtotal": 100.0, "tax": 16.0, "total": 116.0}),
                1000,
            );
            if i % dirty_every != 0 {
                record.mark_synced(1000);
            }
            store.put(record).await.expect("put");
        }
    });
    store
}

fn bench_dirty_scan(c: &mut Criterion) {
    let mut group = c.benchmark_group("dirty_scan");
    let rt = runtime();
    let registry = domain::contract_registry().expect("registry");

    for size in [1_000, 10_000, 50_000] {
        let store = populated_store(&rt, size, 100);
        group.bench_with_input(BenchmarkId::new("scan", size), &size, |b, _| {
            let tracker = DirtyTracker::new(&store, &registry);
            b.iter(|| rt.block_on(async { black_box(tracker.scan().await.expect("scan")).total() }))
        });
        group.bench_with_input(BenchmarkId::new("dirty_count", size), &size, |b, _| {
            b.iter(|| rt.block_on(async { store.dirty_count(black_box(PAYMENT_REQUESTS)).await }))
        });
    }

    group.finish();
}

fn bench_corrector(c: &mut Criterion) {
    let mut group = c.benchmark_group("consistency_corrector");
    let corrector = domain::contract_corrector(0.05);

    group.bench_function("consistent_request", |b| {
        let record = Record::new_local(
            "tmp-1",
            PAYMENT_REQUESTS,
            json!({"contractId": "C-1", "number": 1, "subtotal": 100.0, "tax": 16.0, "total": 116.0}),
            1000,
        );
        b.iter(|| {
            let mut record = record.clone();
            corrector.correct(black_box(&mut record))
        })
    });

    group.bench_function("drifted_request", |b| {
        let record = Record::new_local(
            "tmp-1",
            PAYMENT_REQUESTS,
            json!({"contractId": "C-1", "number": 1, "subtotal": 100.0, "tax": 16.0, "total": 120.0}),
            1000,
        );
        b.iter(|| {
            let mut record = record.clone();
            corrector.correct(black_box(&mut record))
        })
    });

    group.bench_function("line_item", |b| {
        let record = Record::new_local(
            "tmp-2",
            PAYMENT_REQUEST_ITEMS,
            json!({"paymentRequestId": "tmp-1", "line": 1, "quantity": 3.5, "unitPrice": 12.25, "amount": 40.0}),
            1000,
        );
        b.iter(|| {
            let mut record = record.clone();
            corrector.correct(black_box(&mut record))
        })
    });

    group.finish();
}

fn bench_snapshot(c: &mut Criterion) {
    let mut group = c.benchmark_group("snapshot");
    let rt = runtime();

    for size in [100, 1_000, 10_000] {
        let store = populated_store(&rt, size, 10);
        let json = store.export_snapshot().to_json().expect("to_json");

        group.bench_with_input(BenchmarkId::new("export_to_json", size), &size, |b, _| {
            b.iter(|| store.export_snapshot().to_json())
        });
        group.bench_with_input(BenchmarkId::new("from_json", size), &size, |b, _| {
            b.iter(|| LocalSnapshot::from_json(black_box(&json)))
        });
    }

    group.finish();
}

criterion_group!(benches, bench_dirty_scan, bench_corrector, bench_snapshot);
criterion_main!(benches);
