use crate::error::IngestError;
use crate::schema::{base_fields, reading_fields, SchemaField, TableSchema};
use crate::store::TimeSeriesStore;
use crate::types::{QueryResult, Reading, Timestamp};
use std::sync::RwLock;

/// Ephemeral store keeping readings in timestamp order.
///
/// Readings are expected to arrive in non-decreasing timestamp order; a late reading is
/// inserted after every stored reading with a timestamp `<=` its own, so ties keep arrival
/// order. Range starts are found by binary search and retention is a prefix trim.
#[derive(Debug)]
pub struct InMemoryStore {
    readings: RwLock<Vec<Reading>>,
    schema: RwLock<TableSchema>,
}

impl Default for InMemoryStore {
    fn default() -> Self {
        let (schema, _) = TableSchema::new(base_fields()).with_missing_fields(&reading_fields());
        Self {
            readings: RwLock::new(Vec::new()),
            schema: RwLock::new(schema),
        }
    }
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored records.
    pub fn len(&self) -> Result<usize, IngestError> {
        Ok(self.readings.read()?.len())
    }

    pub fn is_empty(&self) -> Result<bool, IngestError> {
        Ok(self.len()? == 0)
    }

    /// Copy of every stored record, oldest first.
    pub fn records(&self) -> Result<Vec<Reading>, IngestError> {
        Ok(self.readings.read()?.clone())
    }
}

impl TimeSeriesStore for InMemoryStore {
    fn write(&self, reading: &Reading) -> Result<(), IngestError> {
        let mut guard = self.readings.write()?;
        let ts = reading.timestamp();
        match guard.last() {
            Some(last) if last.timestamp() > ts => {
                let idx = guard.partition_point(|r| r.timestamp() <= ts);
                guard.insert(idx, reading.clone());
            }
            _ => guard.push(reading.clone()),
        }
        Ok(())
    }

    fn read_since(&self, cutoff: Timestamp) -> Result<QueryResult, IngestError> {
        let guard = self.readings.read()?;
        let start = guard.partition_point(|r| r.timestamp() < cutoff);
        Ok(guard[start..].iter().collect())
    }

    fn read_last(&self) -> Result<QueryResult, IngestError> {
        let guard = self.readings.read()?;
        let Some(last) = guard.last() else {
            return Ok(QueryResult::default());
        };
        let latest = last.timestamp();
        let start = guard.partition_point(|r| r.timestamp() < latest);
        Ok(guard[start..].iter().collect())
    }

    fn delete_before(&self, cutoff: Timestamp) -> Result<usize, IngestError> {
        let mut guard = self.readings.write()?;
        let end = guard.partition_point(|r| r.timestamp() < cutoff);
        guard.drain(..end);
        Ok(end)
    }

    fn ensure_schema(&self, desired: &[SchemaField]) -> Result<Vec<String>, IngestError> {
        let mut guard = self.schema.write()?;
        let (merged, added) = guard.with_missing_fields(desired);
        if !added.is_empty() {
            *guard = merged;
        }
        Ok(added)
    }

    fn schema(&self) -> Result<TableSchema, IngestError> {
        Ok(self.schema.read()?.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{FieldMode, FieldType};
    use crate::types::SensorSeries;
    use chrono::{Duration, TimeZone, Utc};
    use std::sync::Arc;
    use std::thread;

    fn ts(secs: i64) -> Timestamp {
        Utc.timestamp_opt(1_320_364_800 + secs, 0).unwrap()
    }

    #[test]
    fn out_of_order_write_is_placed_by_timestamp() {
        let store = InMemoryStore::new();
        store.write(&Reading::from_pairs([("A", 1.0)], ts(10), "")).unwrap();
        store.write(&Reading::from_pairs([("A", 3.0)], ts(30), "")).unwrap();
        store.write(&Reading::from_pairs([("A", 2.0)], ts(20), "")).unwrap();

        let result = store.read_since(ts(0)).unwrap();
        assert_eq!(
            result.series("A").unwrap(),
            &SensorSeries::from_points("A", [(1.0, ts(10)), (2.0, ts(20)), (3.0, ts(30))])
        );
    }

    #[test]
    fn delete_before_trims_prefix_and_reports_count() {
        let store = InMemoryStore::new();
        for i in 0..5 {
            store
                .write(&Reading::from_pairs([("A", i as f64)], ts(i * 10), ""))
                .unwrap();
        }
        assert_eq!(store.delete_before(ts(20)).unwrap(), 2);
        assert_eq!(store.delete_before(ts(20)).unwrap(), 0);
        assert_eq!(store.delete_before(ts(5)).unwrap(), 0);
        assert_eq!(store.len().unwrap(), 3);
        assert_eq!(store.records().unwrap()[0].timestamp(), ts(20));
    }

    #[test]
    fn read_last_returns_every_record_at_latest_instant() {
        let store = InMemoryStore::new();
        assert!(store.read_last().unwrap().is_empty());

        store.write(&Reading::from_pairs([("A", 1.0)], ts(0), "")).unwrap();
        store.write(&Reading::from_pairs([("A", 2.0)], ts(60), "")).unwrap();
        store.write(&Reading::from_pairs([("B", 3.0)], ts(60), "late")).unwrap();

        let last = store.read_last().unwrap();
        assert_eq!(last.sensors.len(), 2);
        assert_eq!(last.series("A").unwrap(), &SensorSeries::from_points("A", [(2.0, ts(60))]));
        assert_eq!(last.series("B").unwrap(), &SensorSeries::from_points("B", [(3.0, ts(60))]));
        assert!(last.error_messages.contains("late"));
    }

    #[test]
    fn ensure_schema_is_additive() {
        let store = InMemoryStore::new();
        let before = store.schema().unwrap();
        assert!(store.ensure_schema(&reading_fields()).unwrap().is_empty());
        assert_eq!(store.schema().unwrap(), before);

        let humidity = SchemaField::new("Humidity", FieldType::Float, FieldMode::Nullable);
        assert_eq!(store.ensure_schema(&[humidity.clone()]).unwrap(), vec!["Humidity"]);
        assert!(store.ensure_schema(&[humidity]).unwrap().is_empty());
        assert_eq!(store.schema().unwrap().fields().len(), before.fields().len() + 1);
    }

    #[test]
    fn read_for_period_uses_wall_clock() {
        let store = InMemoryStore::new();
        let now = Utc::now();
        store
            .write(&Reading::from_pairs([("A", 1.0)], now - Duration::hours(30), ""))
            .unwrap();
        store
            .write(&Reading::from_pairs([("A", 2.0)], now - Duration::hours(1), ""))
            .unwrap();

        let day = store.read_for_period(Duration::hours(24)).unwrap();
        assert_eq!(day.series("A").unwrap().temperatures(), &[2.0]);

        assert_eq!(store.delete(Duration::hours(24)).unwrap(), 1);
        assert_eq!(store.len().unwrap(), 1);
    }

    #[test]
    fn periods_beyond_calendar_range_are_clamped() {
        let store = InMemoryStore::new();
        store.write(&Reading::from_pairs([("A", 1.0)], ts(0), "")).unwrap();

        let all = store.read_for_period(Duration::MAX).unwrap();
        assert_eq!(all.series("A").unwrap().temperatures(), &[1.0]);

        let ancient = Duration::try_days(200_000_000).unwrap();
        assert_eq!(store.delete(ancient).unwrap(), 0);
        assert_eq!(store.delete(Duration::MAX).unwrap(), 0);
        assert_eq!(store.len().unwrap(), 1);
    }

    #[test]
    fn concurrent_writes_are_all_stored() {
        let store = Arc::new(InMemoryStore::new());
        let handles: Vec<_> = (0..4)
            .map(|t| {
                let store = Arc::clone(&store);
                thread::spawn(move || {
                    for i in 0..50 {
                        let r = Reading::from_pairs([(format!("s{}", t), i as f64)], ts(i), "");
                        store.write(&r).unwrap();
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(store.len().unwrap(), 200);
        let all = store.read_since(ts(0)).unwrap();
        for s in &all.sensors {
            assert_eq!(s.len(), 50);
            assert!(s.timestamps().windows(2).all(|w| w[0] <= w[1]));
        }
    }
}
