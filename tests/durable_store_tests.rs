//! Durable store: persistence across reopen, concurrent access, schema evolution races,
//! partition expiration and corruption detection.

use chrono::{Duration, TimeZone, Utc};
use std::fs;
use std::sync::{Arc, Barrier, Mutex};
use std::thread;
use thermo_ingest::schema::{FieldMode, FieldType, SchemaField};
use thermo_ingest::telemetry::{noop_event_listener, PipelineEvent, PipelineEventListener};
use thermo_ingest::{
    DurableStore, IngestError, Reading, TableOptions, TableRef, TimeSeriesStore, Timestamp,
};

#[derive(Debug, Default)]
struct Recorder(Mutex<Vec<PipelineEvent>>);

impl PipelineEventListener for Recorder {
    fn on_event(&self, event: PipelineEvent) {
        self.0.lock().unwrap().push(event);
    }
}

fn no_expiry() -> TableOptions {
    TableOptions {
        partition_expiration: None,
    }
}

fn open(dir: &std::path::Path) -> DurableStore {
    DurableStore::open(dir, TableRef::default(), &no_expiry(), noop_event_listener()).unwrap()
}

fn partition_file(dir: &std::path::Path, month: &str) -> std::path::PathBuf {
    dir.join("thermo/telemetry/sensors_db")
        .join(format!("p_{}.rows", month))
}

fn ts(secs: i64) -> Timestamp {
    Utc.with_ymd_and_hms(2023, 11, 4, 0, 0, 0).unwrap() + Duration::seconds(secs)
}

#[test]
fn data_survives_reopen() {
    let dir = tempfile::tempdir().unwrap();
    {
        let store =
            DurableStore::open(dir.path(), TableRef::default(), &no_expiry(), noop_event_listener())
                .unwrap();
        store
            .write(&Reading::from_pairs([("Ambient", 20.25)], ts(0), ""))
            .unwrap();
        store
            .write(&Reading::from_pairs([("Ambient", 19.5)], ts(60), "sensor reset"))
            .unwrap();
    }

    let store =
        DurableStore::open(dir.path(), TableRef::default(), &no_expiry(), noop_event_listener())
            .unwrap();
    let result = store.read_since(ts(0)).unwrap();
    assert_eq!(result.series("Ambient").unwrap().temperatures(), &[20.25, 19.5]);
    assert!(result.error_messages.contains("sensor reset"));
}

#[test]
fn subsecond_timestamps_round_trip_at_microsecond_precision() {
    let dir = tempfile::tempdir().unwrap();
    let store =
        DurableStore::open(dir.path(), TableRef::default(), &no_expiry(), noop_event_listener())
            .unwrap();
    let t = Utc.timestamp_opt(1_699_056_000, 523_456_789).unwrap();
    let r = Reading::from_pairs([("A", 1.0)], t, "");
    store.write(&r).unwrap();

    let last = store.read_last().unwrap();
    assert_eq!(last.series("A").unwrap().timestamps(), &[r.timestamp()]);
    assert_eq!(r.timestamp().timestamp_subsec_nanos(), 523_456_000);
}

#[test]
fn concurrent_writers_lose_nothing() {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(
        DurableStore::open(dir.path(), TableRef::default(), &no_expiry(), noop_event_listener())
            .unwrap(),
    );
    let handles: Vec<_> = (0..4)
        .map(|w| {
            let store = Arc::clone(&store);
            thread::spawn(move || {
                for i in 0..25 {
                    let name = format!("w{}", w);
                    store
                        .write(&Reading::from_pairs([(name, i as f64)], ts(i * 86_400 * 3), ""))
                        .unwrap();
                }
            })
        })
        .collect();
    for h in handles {
        h.join().unwrap();
    }

    let result = store.read_since(ts(0)).unwrap();
    assert_eq!(result.sensors.len(), 4);
    for s in &result.sensors {
        assert_eq!(s.len(), 25);
        assert!(s.timestamps().windows(2).all(|w| w[0] <= w[1]));
    }
}

#[test]
fn racing_schema_evolution_converges() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().to_path_buf();
    // Create once so every racer sees an existing table.
    drop(DurableStore::open(&path, TableRef::default(), &no_expiry(), noop_event_listener()).unwrap());

    let barrier = Arc::new(Barrier::new(4));
    let handles: Vec<_> = (0..4)
        .map(|_| {
            let path = path.clone();
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                let store =
                    DurableStore::open(&path, TableRef::default(), &no_expiry(), noop_event_listener())
                        .unwrap();
                barrier.wait();
                store
                    .ensure_schema(&[SchemaField::new(
                        "Humidity",
                        FieldType::Float,
                        FieldMode::Nullable,
                    )])
                    .unwrap();
            })
        })
        .collect();
    for h in handles {
        h.join().unwrap();
    }

    let store =
        DurableStore::open(&path, TableRef::default(), &no_expiry(), noop_event_listener()).unwrap();
    let names = store.schema().unwrap().field_names().join(",");
    assert_eq!(names, "Timestamp,ErrorMessage,Tubes,Humidity");
}

#[test]
fn open_emits_creation_events_once() {
    let dir = tempfile::tempdir().unwrap();
    let events = Arc::new(Recorder::default());
    drop(DurableStore::open(dir.path(), TableRef::default(), &no_expiry(), events.clone()).unwrap());
    drop(DurableStore::open(dir.path(), TableRef::default(), &no_expiry(), events.clone()).unwrap());

    let table = TableRef::default().qualified_name();
    let got = events.0.lock().unwrap().clone();
    assert_eq!(
        got,
        vec![
            PipelineEvent::TableCreated {
                table: table.clone()
            },
            PipelineEvent::SchemaFieldsAdded {
                table,
                fields: vec!["ErrorMessage".to_string(), "Tubes".to_string()],
            },
        ]
    );
}

#[test]
fn separate_tables_do_not_share_rows() {
    let dir = tempfile::tempdir().unwrap();
    let a = DurableStore::open(dir.path(), TableRef::default(), &no_expiry(), noop_event_listener())
        .unwrap();
    let b = DurableStore::open(
        dir.path(),
        TableRef {
            table: "other".to_string(),
            ..TableRef::default()
        },
        &no_expiry(),
        noop_event_listener(),
    )
    .unwrap();
    a.write(&Reading::from_pairs([("A", 1.0)], ts(0), "")).unwrap();
    assert!(b.read_since(ts(0)).unwrap().is_empty());
}

#[test]
fn old_partitions_expire() {
    let dir = tempfile::tempdir().unwrap();
    let events = Arc::new(Recorder::default());
    let old = Utc.with_ymd_and_hms(2015, 3, 10, 8, 0, 0).unwrap();
    let recent = Utc::now() - Duration::days(2);
    {
        let store =
            DurableStore::open(dir.path(), TableRef::default(), &no_expiry(), events.clone())
                .unwrap();
        store.write(&Reading::from_pairs([("A", 1.0)], old, "")).unwrap();
        store.write(&Reading::from_pairs([("A", 2.0)], recent, "")).unwrap();
        store
            .table()
            .set_partition_expiration(Some(Duration::days(365)))
            .unwrap();
        assert_eq!(
            store.read_since(old).unwrap().series("A").unwrap().temperatures(),
            &[2.0]
        );
        assert!(matches!(
            store.write(&Reading::from_pairs([("A", 3.0)], old, "")),
            Err(IngestError::Rejected(_))
        ));
    }

    // Reopening sweeps the expired partition away.
    let store =
        DurableStore::open(dir.path(), TableRef::default(), &no_expiry(), events.clone()).unwrap();
    assert_eq!(store.table().partitions().unwrap().len(), 1);
    assert!(events
        .0
        .lock()
        .unwrap()
        .iter()
        .any(|e| matches!(e, PipelineEvent::PartitionsExpired { partitions, .. } if partitions == &vec!["201503".to_string()])));
}

#[test]
fn default_expiration_rejects_ancient_readings() {
    let dir = tempfile::tempdir().unwrap();
    let store = DurableStore::open(
        dir.path(),
        TableRef::default(),
        &TableOptions::default(),
        noop_event_listener(),
    )
    .unwrap();
    let ancient = Utc.with_ymd_and_hms(2001, 1, 1, 0, 0, 0).unwrap();
    assert!(matches!(
        store.write(&Reading::from_pairs([("A", 1.0)], ancient, "")),
        Err(IngestError::Rejected(_))
    ));
    store
        .write(&Reading::from_pairs([("A", 1.0)], Utc::now(), ""))
        .unwrap();
}

#[test]
fn flipped_byte_is_reported_as_corruption() {
    let dir = tempfile::tempdir().unwrap();
    let store =
        DurableStore::open(dir.path(), TableRef::default(), &no_expiry(), noop_event_listener())
            .unwrap();
    store.write(&Reading::from_pairs([("A", 1.0)], ts(0), "")).unwrap();

    let file = partition_file(dir.path(), "202311");
    let mut bytes = fs::read(&file).unwrap();
    let mid = bytes.len() - 3;
    bytes[mid] ^= 0x55;
    fs::write(&file, &bytes).unwrap();

    match store.read_since(ts(0)) {
        Err(IngestError::Corruption { partition, .. }) => {
            assert_eq!(partition.as_deref(), Some("202311"))
        }
        other => panic!("expected corruption, got {:?}", other),
    }

    // A restarted writer must not acknowledge rows it could never read back.
    drop(store);
    let store = open(dir.path());
    assert!(matches!(
        store.write(&Reading::from_pairs([("A", 2.0)], ts(1), "")),
        Err(IngestError::Rejected(_))
    ));
    assert_eq!(fs::read(&file).unwrap(), bytes);
}

#[test]
fn torn_tail_is_reported_as_corruption() {
    let dir = tempfile::tempdir().unwrap();
    let store =
        DurableStore::open(dir.path(), TableRef::default(), &no_expiry(), noop_event_listener())
            .unwrap();
    store.write(&Reading::from_pairs([("A", 1.0)], ts(0), "")).unwrap();
    store.write(&Reading::from_pairs([("A", 2.0)], ts(1), "")).unwrap();

    let file = partition_file(dir.path(), "202311");
    let bytes = fs::read(&file).unwrap();
    fs::write(&file, &bytes[..bytes.len() - 5]).unwrap();

    assert!(matches!(
        store.read_since(ts(0)),
        Err(IngestError::Corruption { .. })
    ));

    // The next write cuts the unfinished frame and lands where scans can see it.
    store.write(&Reading::from_pairs([("A", 3.0)], ts(2), "")).unwrap();
    let result = store.read_since(ts(0)).unwrap();
    assert_eq!(result.series("A").unwrap().temperatures(), &[1.0, 3.0]);
}

#[test]
fn two_instances_writing_one_month_keep_every_row() {
    let dir = tempfile::tempdir().unwrap();
    let stores = [Arc::new(open(dir.path())), Arc::new(open(dir.path()))];
    let per_writer = 150;
    let start = Arc::new(Barrier::new(stores.len()));

    let handles: Vec<_> = stores
        .iter()
        .enumerate()
        .map(|(w, store)| {
            let store = Arc::clone(store);
            let start = Arc::clone(&start);
            thread::spawn(move || {
                start.wait();
                for i in 0..per_writer {
                    let t = ts(i * 2 + w as i64);
                    store
                        .write(&Reading::from_pairs([("Ambient", w as f64)], t, ""))
                        .unwrap();
                }
            })
        })
        .collect();
    for h in handles {
        h.join().unwrap();
    }

    let header = fs::read(partition_file(dir.path(), "202311")).unwrap();
    assert_eq!(&header[..8], b"THMPRT01");
    for store in &stores {
        let ambient = store.read_since(ts(0)).unwrap();
        let series = ambient.series("Ambient").unwrap();
        assert_eq!(series.len(), 2 * per_writer as usize);
        assert_eq!(series.temperatures().iter().filter(|v| **v == 1.0).count(), per_writer as usize);
    }
}

#[test]
fn retention_in_one_instance_keeps_rows_acknowledged_by_another() {
    let dir = tempfile::tempdir().unwrap();
    let writer = open(dir.path());
    let cleaner = open(dir.path());
    let base = Utc.with_ymd_and_hms(2024, 3, 1, 0, 0, 0).unwrap();
    let cutoff = base + Duration::hours(1);
    let acknowledged = 400;

    thread::scope(|s| {
        s.spawn(|| {
            for i in 0..acknowledged {
                let t = cutoff + Duration::seconds(i);
                writer
                    .write(&Reading::from_pairs([("Ambient", i as f64)], t, ""))
                    .unwrap();
            }
        });
        s.spawn(|| {
            for _ in 0..40 {
                cleaner
                    .write(&Reading::from_pairs([("Stale", 0.0)], base, ""))
                    .unwrap();
                cleaner.delete_before(cutoff).unwrap();
            }
        });
    });

    let result = open(dir.path()).read_since(base).unwrap();
    assert!(result.series("Stale").is_none());
    let ambient = result.series("Ambient").unwrap();
    assert_eq!(ambient.len(), acknowledged as usize);
    assert_eq!(
        ambient.temperatures(),
        (0..acknowledged).map(|i| i as f64).collect::<Vec<_>>().as_slice()
    );
}
