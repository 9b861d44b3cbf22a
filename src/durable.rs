use crate::config::TableOptions;
use crate::error::IngestError;
use crate::schema::{
    base_fields, reading_fields, FieldValue, Row, SchemaField, TableSchema, COL_ERROR_MESSAGE,
    COL_TEMPERATURE, COL_TIMESTAMP, COL_TUBES, COL_TUBE_NAME,
};
use crate::store::TimeSeriesStore;
use crate::table::{micros_to_timestamp, Dataset, PartitionedTable, TableSpec};
use crate::telemetry::{pipeline_metrics, PipelineEventListener};
use crate::types::{QueryResult, Reading, SensorValues, SeriesBuilder, Timestamp};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;

/// Where the readings table lives: `<data_dir>/<project>/<dataset>/<table>`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TableRef {
    pub project: String,
    pub dataset: String,
    pub table: String,
    /// Recorded on the dataset at creation; later opens must agree.
    pub location: String,
}

impl Default for TableRef {
    fn default() -> Self {
        Self {
            project: "thermo".to_string(),
            dataset: "telemetry".to_string(),
            table: "sensors_db".to_string(),
            location: "europe-west2".to_string(),
        }
    }
}

impl TableRef {
    /// `project.dataset.table`
    pub fn qualified_name(&self) -> String {
        format!("{}.{}.{}", self.project, self.dataset, self.table)
    }
}

/// Durable [`TimeSeriesStore`] over a month-partitioned table.
///
/// One reading is one wide row: `Timestamp`, optional `ErrorMessage`, and a repeated `Tubes`
/// record of `{TubeName, Temperature}` pairs. Reads scan rows in timestamp order and pivot
/// them into per-sensor series here, outside the table engine.
#[derive(Debug)]
pub struct DurableStore {
    table_ref: TableRef,
    dataset: Dataset,
    table: PartitionedTable,
}

impl DurableStore {
    /// Opens (creating if needed) the dataset and table, then makes sure the reading fields are
    /// in the schema. Any failure here is fatal for the caller.
    pub fn open<P: AsRef<Path>>(
        data_dir: P,
        table_ref: TableRef,
        options: &TableOptions,
        events: Arc<dyn PipelineEventListener>,
    ) -> Result<Self, IngestError> {
        let dataset_dir = data_dir
            .as_ref()
            .join(&table_ref.project)
            .join(&table_ref.dataset);
        let dataset = Dataset::create(dataset_dir, &table_ref.location)?;

        let spec = TableSpec {
            schema: TableSchema::new(base_fields()),
            partition_field: COL_TIMESTAMP.to_string(),
            clustering: vec![COL_TIMESTAMP.to_string()],
            partition_expiration: options.partition_expiration,
        };
        let table = PartitionedTable::create(
            dataset.table_dir(&table_ref.table),
            table_ref.qualified_name(),
            spec,
            events,
        )?;

        let store = Self {
            table_ref,
            dataset,
            table,
        };
        store.ensure_schema(&reading_fields()).map_err(|e| match e {
            IngestError::Schema(_) => e,
            other => IngestError::Schema(other.to_string()),
        })?;
        store.table.expire_partitions(Utc::now())?;
        Ok(store)
    }

    pub fn table_ref(&self) -> &TableRef {
        &self.table_ref
    }

    pub fn location(&self) -> &str {
        self.dataset.location()
    }

    /// The underlying table engine.
    pub fn table(&self) -> &PartitionedTable {
        &self.table
    }

    fn pivot(rows: Vec<Row>) -> Result<QueryResult, IngestError> {
        let mut builder = SeriesBuilder::new();
        for row in &rows {
            builder.push_reading(&row_to_reading(row)?);
        }
        Ok(builder.finish())
    }
}

impl TimeSeriesStore for DurableStore {
    fn write(&self, reading: &Reading) -> Result<(), IngestError> {
        self.table.insert(&reading_to_row(reading))
    }

    fn read_since(&self, cutoff: Timestamp) -> Result<QueryResult, IngestError> {
        Self::pivot(self.table.scan_since(cutoff)?)
    }

    fn read_last(&self) -> Result<QueryResult, IngestError> {
        Self::pivot(self.table.scan_latest()?)
    }

    fn delete_before(&self, cutoff: Timestamp) -> Result<usize, IngestError> {
        self.table.expire_partitions(Utc::now())?;
        let removed = self.table.delete_where_before(cutoff)?;
        pipeline_metrics::record_deleted(removed as u64);
        Ok(removed)
    }

    fn ensure_schema(&self, desired: &[SchemaField]) -> Result<Vec<String>, IngestError> {
        self.table.update_schema(desired)
    }

    fn schema(&self) -> Result<TableSchema, IngestError> {
        self.table.schema()
    }
}

/// Maps a reading to its wide row. An empty error message is left out of the row.
pub fn reading_to_row(reading: &Reading) -> Row {
    let tubes = reading
        .values()
        .iter()
        .map(|(name, &temperature)| {
            let mut tube = Row::new();
            tube.insert(COL_TUBE_NAME.to_string(), FieldValue::String(name.clone()));
            tube.insert(COL_TEMPERATURE.to_string(), FieldValue::Float(temperature));
            FieldValue::Record(tube)
        })
        .collect();

    let mut row = Row::new();
    row.insert(
        COL_TIMESTAMP.to_string(),
        FieldValue::Timestamp(reading.timestamp().timestamp_micros()),
    );
    row.insert(COL_TUBES.to_string(), FieldValue::Repeated(tubes));
    if reading.has_error() {
        row.insert(
            COL_ERROR_MESSAGE.to_string(),
            FieldValue::String(reading.error_message().to_string()),
        );
    }
    row
}

/// Inverse of [`reading_to_row`]; a missing or null `ErrorMessage` reads back as `""`.
pub fn row_to_reading(row: &Row) -> Result<Reading, IngestError> {
    let bad = |details: String| IngestError::Corruption {
        details,
        partition: None,
        offset: None,
    };

    let timestamp = match row.get(COL_TIMESTAMP) {
        Some(FieldValue::Timestamp(us)) => micros_to_timestamp(*us)
            .ok_or_else(|| bad(format!("{} out of range: {}", COL_TIMESTAMP, us)))?,
        other => return Err(bad(format!("stored row has {} = {:?}", COL_TIMESTAMP, other))),
    };

    let error_message = match row.get(COL_ERROR_MESSAGE) {
        Some(FieldValue::String(s)) => s.clone(),
        None | Some(FieldValue::Null) => String::new(),
        Some(other) => {
            return Err(bad(format!(
                "stored row has {} = {:?}",
                COL_ERROR_MESSAGE, other
            )))
        }
    };

    let mut values = SensorValues::new();
    match row.get(COL_TUBES) {
        None | Some(FieldValue::Null) => {}
        Some(FieldValue::Repeated(items)) => {
            for item in items {
                let FieldValue::Record(tube) = item else {
                    return Err(bad(format!("{} item is not a record: {:?}", COL_TUBES, item)));
                };
                match (tube.get(COL_TUBE_NAME), tube.get(COL_TEMPERATURE)) {
                    (Some(FieldValue::String(name)), Some(FieldValue::Float(t))) => {
                        values.insert(name.clone(), *t);
                    }
                    _ => return Err(bad(format!("malformed {} item: {:?}", COL_TUBES, tube))),
                }
            }
        }
        Some(other) => return Err(bad(format!("stored row has {} = {:?}", COL_TUBES, other))),
    }

    Ok(Reading::new(values, timestamp, error_message))
}
