use crate::error::IngestError;
use crate::schema::{SchemaField, TableSchema};
use crate::types::{QueryResult, Reading, Timestamp};
use chrono::{DateTime, Duration, Utc};

/// Storage for readings, pivoted into per-sensor series on read.
///
/// Implementations must accept concurrent `write` calls; each write is a single-record append
/// and no read-modify-write happens in this layer. Writes are at-least-once: writing the same
/// reading twice stores two records.
pub trait TimeSeriesStore: Send + Sync + std::fmt::Debug {
    /// Appends one record.
    fn write(&self, reading: &Reading) -> Result<(), IngestError>;

    /// All records with `timestamp >= cutoff`, pivoted per sensor in ascending time order,
    /// together with the distinct non-empty error messages among them.
    fn read_since(&self, cutoff: Timestamp) -> Result<QueryResult, IngestError>;

    /// Records from the last `period`; a period reaching before the earliest representable
    /// instant reads everything.
    fn read_for_period(&self, period: Duration) -> Result<QueryResult, IngestError> {
        self.read_since(cutoff_before_now(period))
    }

    /// Records carrying the most recent timestamp in storage (several if more than one record
    /// shares that instant).
    fn read_last(&self) -> Result<QueryResult, IngestError>;

    /// Removes every record with `timestamp < cutoff` and returns how many were removed.
    /// Repeating a call with the same or an earlier cutoff removes nothing.
    fn delete_before(&self, cutoff: Timestamp) -> Result<usize, IngestError>;

    /// Removes records older than `older_than`; an age reaching before the earliest
    /// representable instant removes nothing.
    fn delete(&self, older_than: Duration) -> Result<usize, IngestError> {
        self.delete_before(cutoff_before_now(older_than))
    }

    /// Adds every field of `desired` that is absent (by name) from the current schema and
    /// returns the added names. Never removes or reorders fields; a no-op when nothing is
    /// missing.
    fn ensure_schema(&self, desired: &[SchemaField]) -> Result<Vec<String>, IngestError>;

    /// Current schema of the underlying table.
    fn schema(&self) -> Result<TableSchema, IngestError>;
}

fn cutoff_before_now(age: Duration) -> Timestamp {
    Utc::now()
        .checked_sub_signed(age)
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}
