use criterion::{black_box, criterion_group, criterion_main, BatchSize, Criterion};
use chrono::{Duration, TimeZone, Utc};
use tempfile::TempDir;
use thermo_ingest::telemetry::noop_event_listener;
use thermo_ingest::{
    DurableStore, InMemoryStore, IngestDispatcher, Reading, StorageConsumer, TableOptions,
    TableRef, TimeSeriesStore, Timestamp,
};

use std::sync::Arc;

const SENSORS: [&str; 4] = ["Ambient", "BottomTube", "TopTube", "Outflow"];

fn base() -> Timestamp {
    Utc.with_ymd_and_hms(2023, 1, 1, 0, 0, 0).unwrap()
}

/// One reading per minute with a slow sawtooth per sensor; every 500th carries an error.
fn generate_readings(count: usize) -> Vec<Reading> {
    (0..count)
        .map(|i| {
            let pairs = SENSORS
                .iter()
                .enumerate()
                .map(|(s, name)| (*name, 4.0 + s as f64 + (i % 97) as f64 * 0.125));
            let error = if i % 500 == 0 { "sensor timeout" } else { "" };
            Reading::from_pairs(pairs, base() + Duration::minutes(i as i64), error)
        })
        .collect()
}

fn open_durable(dir: &std::path::Path) -> DurableStore {
    DurableStore::open(
        dir,
        TableRef::default(),
        &TableOptions {
            partition_expiration: None,
        },
        noop_event_listener(),
    )
    .expect("open durable store")
}

fn bench_write(c: &mut Criterion) {
    let readings = generate_readings(2_000);

    #[derive(Debug)]
    struct Fixture {
        _dir: Option<TempDir>,
        store: Box<dyn TimeSeriesStore>,
    }

    let mut group = c.benchmark_group("write");
    group.sample_size(10);

    group.bench_function("write_2k_memory", |b| {
        b.iter_batched(
            || Fixture {
                _dir: None,
                store: Box::new(InMemoryStore::new()),
            },
            |fx| {
                for r in &readings {
                    fx.store.write(black_box(r)).unwrap();
                }
            },
            BatchSize::LargeInput,
        )
    });

    group.bench_function("write_2k_durable", |b| {
        b.iter_batched(
            || {
                let dir = TempDir::new().expect("tempdir");
                let store = Box::new(open_durable(dir.path()));
                Fixture {
                    _dir: Some(dir),
                    store,
                }
            },
            |fx| {
                for r in &readings {
                    fx.store.write(black_box(r)).unwrap();
                }
            },
            BatchSize::LargeInput,
        )
    });

    group.finish();
}

fn bench_read(c: &mut Criterion) {
    // ~3 months of minute data, so range reads can prune partitions.
    let readings = generate_readings(130_000);

    let memory = InMemoryStore::new();
    let dir = TempDir::new().expect("tempdir");
    let durable = open_durable(dir.path());
    for r in &readings {
        memory.write(r).unwrap();
        durable.write(r).unwrap();
    }
    let last_week = base() + Duration::minutes(130_000) - Duration::days(7);

    let mut group = c.benchmark_group("read");
    group.sample_size(10);
    for (name, store) in [
        ("memory", &memory as &dyn TimeSeriesStore),
        ("durable", &durable as &dyn TimeSeriesStore),
    ] {
        group.bench_function(format!("read_since_last_week_{}", name), |b| {
            b.iter(|| black_box(store.read_since(black_box(last_week)).unwrap()))
        });
        group.bench_function(format!("read_last_{}", name), |b| {
            b.iter(|| black_box(store.read_last().unwrap()))
        });
    }
    group.finish();
}

fn bench_dispatch(c: &mut Criterion) {
    let readings = generate_readings(1_000);
    let encoded: Vec<String> = readings
        .iter()
        .map(|r| {
            serde_json::json!({
                "name_to_temp": r.values(),
                "time": r.timestamp().format("%Y-%m-%d %H:%M:%S%.6f").to_string(),
                "error_msg": r.error_message(),
            })
            .to_string()
        })
        .collect();

    c.bench_function("dispatch_encoded_1k_memory", |b| {
        b.iter_batched(
            || {
                let store: Arc<dyn TimeSeriesStore> = Arc::new(InMemoryStore::new());
                IngestDispatcher::new(vec![Box::new(StorageConsumer::new(store))])
            },
            |dispatcher| {
                for m in &encoded {
                    dispatcher.dispatch_encoded(black_box(m.as_bytes())).unwrap();
                }
            },
            BatchSize::LargeInput,
        )
    });
}

criterion_group!(benches, bench_write, bench_read, bench_dispatch);
criterion_main!(benches);
