use crate::types::{SensorValues, Timestamp};
use std::sync::Arc;

/// Structured, in-process event hook for observability.
///
/// The library never prints. Callers provide an implementation that forwards these events to
/// `tracing` (see [`TracingEventListener`]), metrics, or a test recorder.
pub trait PipelineEventListener: std::fmt::Debug + Send + Sync + 'static {
    fn on_event(&self, event: PipelineEvent);
}

/// Structured events emitted by the pipeline and the stores.
#[derive(Debug, Clone, PartialEq)]
pub enum PipelineEvent {
    ReadingDispatched {
        timestamp: Timestamp,
        consumers: usize,
        failures: usize,
    },
    ConsumerFailed {
        consumer: String,
        timestamp: Timestamp,
        error: String,
    },
    DecodeFailed {
        error: String,
        payload_len: usize,
    },

    RecordWritten {
        timestamp: Timestamp,
        values: SensorValues,
        error_message: String,
    },
    RecordWriteFailed {
        timestamp: Timestamp,
        values: SensorValues,
        error_message: String,
        error: String,
    },

    AlertSent {
        timestamp: Timestamp,
        message: String,
    },
    AlertSuppressed {
        timestamp: Timestamp,
        last_sent: Timestamp,
    },
    AlertFailed {
        timestamp: Timestamp,
        error: String,
    },

    TableCreated {
        table: String,
    },
    SchemaFieldsAdded {
        table: String,
        fields: Vec<String>,
    },
    RetentionApplied {
        table: String,
        delete_before: Timestamp,
        removed: usize,
    },
    PartitionsExpired {
        table: String,
        partitions: Vec<String>,
    },
    /// An unfinished trailing write was cut off a partition file before appending.
    PartitionRepaired {
        table: String,
        partition: String,
        truncated_bytes: u64,
    },
}

#[derive(Debug)]
pub struct NoopEventListener;

impl PipelineEventListener for NoopEventListener {
    #[inline]
    fn on_event(&self, _event: PipelineEvent) {}
}

pub fn noop_event_listener() -> Arc<dyn PipelineEventListener> {
    Arc::new(NoopEventListener)
}

/// Forwards every event to `tracing` with structured fields.
#[derive(Debug, Default)]
pub struct TracingEventListener;

impl PipelineEventListener for TracingEventListener {
    fn on_event(&self, event: PipelineEvent) {
        match event {
            PipelineEvent::ReadingDispatched {
                timestamp,
                consumers,
                failures,
            } => {
                if failures == 0 {
                    tracing::debug!(%timestamp, consumers, "reading dispatched");
                } else {
                    tracing::warn!(%timestamp, consumers, failures, "reading dispatched with failures");
                }
            }
            PipelineEvent::ConsumerFailed {
                consumer,
                timestamp,
                error,
            } => tracing::error!(%consumer, %timestamp, %error, "consumer failed"),
            PipelineEvent::DecodeFailed { error, payload_len } => {
                tracing::warn!(%error, payload_len, "dropping undecodable message")
            }
            PipelineEvent::RecordWritten {
                timestamp,
                values,
                error_message,
            } => tracing::info!(%timestamp, ?values, %error_message, "record written"),
            PipelineEvent::RecordWriteFailed {
                timestamp,
                values,
                error_message,
                error,
            } => tracing::error!(%timestamp, ?values, %error_message, %error, "record write failed"),
            PipelineEvent::AlertSent { timestamp, message } => {
                tracing::info!(%timestamp, %message, "threshold alert sent")
            }
            PipelineEvent::AlertSuppressed {
                timestamp,
                last_sent,
            } => tracing::debug!(%timestamp, %last_sent, "threshold alert suppressed by cooldown"),
            PipelineEvent::AlertFailed { timestamp, error } => {
                tracing::warn!(%timestamp, %error, "threshold alert not delivered")
            }
            PipelineEvent::TableCreated { table } => tracing::info!(%table, "table created"),
            PipelineEvent::SchemaFieldsAdded { table, fields } => {
                tracing::info!(%table, ?fields, "schema fields added")
            }
            PipelineEvent::RetentionApplied {
                table,
                delete_before,
                removed,
            } => tracing::info!(%table, %delete_before, removed, "retention applied"),
            PipelineEvent::PartitionsExpired { table, partitions } => {
                tracing::info!(%table, ?partitions, "partitions expired")
            }
            PipelineEvent::PartitionRepaired {
                table,
                partition,
                truncated_bytes,
            } => tracing::warn!(%table, %partition, truncated_bytes, "truncated torn partition tail"),
        }
    }
}

/// Metrics instrumentation through the `metrics` facade.
///
/// Emitting is a no-op until a recorder is installed. With the `prometheus` feature,
/// [`pipeline_metrics::InProcessPrometheus`] installs one and renders the text exposition
/// format in-process (no HTTP server).
pub mod pipeline_metrics {
    use ::metrics::{describe_counter, describe_histogram, Unit};
    use std::time::Duration;

    #[cfg(feature = "prometheus")]
    use metrics_exporter_prometheus::{BuildError, PrometheusBuilder, PrometheusHandle};
    #[cfg(feature = "prometheus")]
    use std::sync::atomic::{AtomicBool, Ordering};
    #[cfg(feature = "prometheus")]
    use std::sync::{Arc, Mutex};
    #[cfg(feature = "prometheus")]
    use std::thread::JoinHandle;

    // Counters are exposed as `<name>_total` by the Prometheus exporter.
    pub const READINGS_DISPATCHED: &str = "thermo_readings_dispatched";
    pub const CONSUMER_FAILURES: &str = "thermo_consumer_failures";
    pub const DECODE_FAILURES: &str = "thermo_decode_failures";
    pub const RECORDS_WRITTEN: &str = "thermo_records_written";
    pub const WRITE_DURATION_SECONDS: &str = "thermo_write_duration_seconds";
    pub const ALERTS_SENT: &str = "thermo_alerts_sent";
    pub const RECORDS_DELETED: &str = "thermo_records_deleted";

    /// Handle to the in-process Prometheus recorder/scrape renderer.
    #[cfg(feature = "prometheus")]
    #[derive(Debug)]
    pub struct InProcessPrometheus {
        handle: PrometheusHandle,
        stop: Arc<AtomicBool>,
        upkeep_thread: Mutex<Option<JoinHandle<()>>>,
    }

    #[cfg(feature = "prometheus")]
    impl InProcessPrometheus {
        /// Installs a global Prometheus recorder (once per process) and starts an upkeep
        /// thread calling `run_upkeep()` every `upkeep_interval`.
        pub fn install(upkeep_interval: Duration) -> Result<Self, MetricsInitError> {
            describe_all();

            let handle = PrometheusBuilder::new()
                .install_recorder()
                .map_err(MetricsInitError::from_build_error)?;

            let stop = Arc::new(AtomicBool::new(false));
            let stop_clone = stop.clone();
            let handle_clone = handle.clone();
            let upkeep_thread = std::thread::Builder::new()
                .name("thermo-metrics-upkeep".to_string())
                .spawn(move || {
                    while !stop_clone.load(Ordering::Relaxed) {
                        std::thread::sleep(upkeep_interval);
                        handle_clone.run_upkeep();
                    }
                })
                .map_err(|e| MetricsInitError::ThreadSpawn(e.to_string()))?;

            Ok(Self {
                handle,
                stop,
                upkeep_thread: Mutex::new(Some(upkeep_thread)),
            })
        }

        /// Renders current metrics in the Prometheus text exposition format.
        pub fn render(&self) -> String {
            self.handle.render()
        }
    }

    #[cfg(feature = "prometheus")]
    impl Drop for InProcessPrometheus {
        fn drop(&mut self) {
            self.stop.store(true, Ordering::Relaxed);
            if let Ok(mut guard) = self.upkeep_thread.lock() {
                if let Some(t) = guard.take() {
                    let _ = t.join();
                }
            }
        }
    }

    #[cfg(feature = "prometheus")]
    #[derive(Debug, thiserror::Error)]
    pub enum MetricsInitError {
        #[error("metrics recorder already installed")]
        AlreadyInstalled,
        #[error("failed to install prometheus recorder: {0}")]
        Install(String),
        #[error("failed to spawn upkeep thread: {0}")]
        ThreadSpawn(String),
    }

    #[cfg(feature = "prometheus")]
    impl MetricsInitError {
        fn from_build_error(e: BuildError) -> Self {
            match e {
                BuildError::FailedToSetGlobalRecorder(_) => MetricsInitError::AlreadyInstalled,
                other => MetricsInitError::Install(other.to_string()),
            }
        }
    }

    #[inline]
    pub fn record_dispatch(failures: u64) {
        ::metrics::counter!(READINGS_DISPATCHED).increment(1);
        if failures > 0 {
            ::metrics::counter!(CONSUMER_FAILURES).increment(failures);
        }
    }

    #[inline]
    pub fn record_decode_failure() {
        ::metrics::counter!(DECODE_FAILURES).increment(1);
    }

    #[inline]
    pub fn record_write(duration: Duration) {
        ::metrics::counter!(RECORDS_WRITTEN).increment(1);
        ::metrics::histogram!(WRITE_DURATION_SECONDS).record(duration.as_secs_f64());
    }

    #[inline]
    pub fn record_alert_sent() {
        ::metrics::counter!(ALERTS_SENT).increment(1);
    }

    #[inline]
    pub fn record_deleted(records: u64) {
        if records > 0 {
            ::metrics::counter!(RECORDS_DELETED).increment(records);
        }
    }

    /// Registers descriptions with the installed recorder.
    pub fn describe_all() {
        describe_counter!(
            READINGS_DISPATCHED,
            Unit::Count,
            "Readings handed to IngestDispatcher::dispatch."
        );
        describe_counter!(
            CONSUMER_FAILURES,
            Unit::Count,
            "Consumer invocations that returned an error."
        );
        describe_counter!(
            DECODE_FAILURES,
            Unit::Count,
            "Inbound messages dropped because they could not be decoded."
        );
        describe_counter!(
            RECORDS_WRITTEN,
            Unit::Count,
            "Records appended through StorageConsumer."
        );
        describe_counter!(ALERTS_SENT, Unit::Count, "Threshold alerts delivered.");
        describe_counter!(
            RECORDS_DELETED,
            Unit::Count,
            "Records removed by retention (delete_before)."
        );
        describe_histogram!(
            WRITE_DURATION_SECONDS,
            Unit::Seconds,
            "Time spent in TimeSeriesStore::write per record."
        );
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    #[test]
    fn tracing_listener_handles_every_event_without_subscriber() {
        let l = TracingEventListener;
        let now = Utc::now();
        for event in [
            PipelineEvent::ReadingDispatched { timestamp: now, consumers: 2, failures: 1 },
            PipelineEvent::DecodeFailed { error: "bad".into(), payload_len: 3 },
            PipelineEvent::AlertSuppressed { timestamp: now, last_sent: now },
            PipelineEvent::PartitionsExpired { table: "t".into(), partitions: vec!["200001".into()] },
            PipelineEvent::PartitionRepaired {
                table: "t".into(),
                partition: "200001".into(),
                truncated_bytes: 5,
            },
        ] {
            l.on_event(event);
        }
        noop_event_listener().on_event(PipelineEvent::TableCreated { table: "t".into() });
    }

    #[test]
    fn metrics_are_noops_without_recorder() {
        pipeline_metrics::record_dispatch(1);
        pipeline_metrics::record_write(std::time::Duration::from_millis(1));
        pipeline_metrics::record_deleted(0);
    }
}
