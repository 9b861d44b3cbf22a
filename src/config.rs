use crate::alerting::{Notifier, ThresholdAlertConsumer};
use crate::consumer::{Consumer, StorageConsumer};
use crate::dispatcher::IngestDispatcher;
use crate::durable::{DurableStore, TableRef};
use crate::error::IngestError;
use crate::store::TimeSeriesStore;
use crate::telemetry::{noop_event_listener, PipelineEventListener};
use crate::types::Timestamp;
use chrono::Duration;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

/// Default partition expiration of the readings table: three and a half years.
pub const DEFAULT_PARTITION_EXPIRATION_DAYS: i64 = 365 * 3 + 365 / 2;

pub const SENSOR_AMBIENT: &str = "Ambient";
pub const SENSOR_BOTTOM_TUBE: &str = "BottomTube";

/// Table-level storage options applied when the table is created.
#[derive(Debug, Clone, PartialEq)]
pub struct TableOptions {
    /// Partitions older than this (by upper bound) are dropped by the table itself,
    /// independently of any explicit retention job.
    pub partition_expiration: Option<Duration>,
}

impl Default for TableOptions {
    fn default() -> Self {
        Self {
            partition_expiration: Some(Duration::days(DEFAULT_PARTITION_EXPIRATION_DAYS)),
        }
    }
}

/// Configuration of the ingestion pipeline.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Root directory of the durable store.
    pub data_dir: PathBuf,
    /// Location of the readings table.
    pub table: TableRef,
    pub table_options: TableOptions,
    /// Sensor name to minimum acceptable temperature.
    pub thresholds: BTreeMap<String, f64>,
    /// Minimum spacing between two threshold alerts. `None` alerts on every breach.
    pub alert_cooldown: Option<Duration>,
    /// Records older than this are deleted by the retention job. `None` disables it.
    pub retention: Option<Duration>,
    /// Structured event hook for observability (no-op by default).
    pub event_listener: Arc<dyn PipelineEventListener>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        PipelineConfig {
            data_dir: PathBuf::from("./data"),
            table: TableRef::default(),
            table_options: TableOptions::default(),
            thresholds: default_thresholds(),
            alert_cooldown: None,
            retention: None,
            event_listener: noop_event_listener(),
        }
    }
}

pub fn default_thresholds() -> BTreeMap<String, f64> {
    BTreeMap::from([
        (SENSOR_AMBIENT.to_string(), 6.0),
        (SENSOR_BOTTOM_TUBE.to_string(), 12.0),
    ])
}

impl PipelineConfig {
    /// Opens the durable store described by this configuration.
    pub fn open_store(&self) -> Result<DurableStore, IngestError> {
        DurableStore::open(
            &self.data_dir,
            self.table.clone(),
            &self.table_options,
            self.event_listener.clone(),
        )
    }

    /// Threshold alert consumer for these thresholds and cooldown.
    ///
    /// `last_notified` restores the cooldown state of a previous run; it is ignored without a
    /// cooldown.
    pub fn alert_consumer(
        &self,
        notifier: Arc<dyn Notifier>,
        last_notified: Option<Timestamp>,
    ) -> ThresholdAlertConsumer {
        let alerting = ThresholdAlertConsumer::new(self.thresholds.clone(), notifier)
            .with_events(self.event_listener.clone());
        match self.alert_cooldown {
            Some(cooldown) => alerting.with_cooldown(cooldown, last_notified),
            None => alerting,
        }
    }

    /// Wires the standard consumer chain: storage first, then threshold alerting.
    pub fn build_dispatcher(
        &self,
        store: Arc<dyn TimeSeriesStore>,
        alerting: Arc<ThresholdAlertConsumer>,
    ) -> IngestDispatcher {
        let consumers: Vec<Box<dyn Consumer>> = vec![
            Box::new(StorageConsumer::new(store).with_events(self.event_listener.clone())),
            Box::new(alerting),
        ];
        IngestDispatcher::with_events(consumers, self.event_listener.clone())
    }
}
