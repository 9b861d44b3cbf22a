use crate::error::IngestError;
use crate::store::TimeSeriesStore;
use crate::telemetry::{noop_event_listener, pipeline_metrics, PipelineEvent, PipelineEventListener};
use crate::types::Reading;
use std::sync::Arc;
use std::time::Instant;

/// Something that reacts to every ingested reading.
///
/// Consumers are called synchronously, one reading at a time, and must not mutate the reading.
pub trait Consumer: Send + Sync + std::fmt::Debug {
    fn consume(&self, reading: &Reading) -> Result<(), IngestError>;

    /// Short label used in logs and dispatch failures.
    fn name(&self) -> &str;
}

impl<C: Consumer + ?Sized> Consumer for Arc<C> {
    fn consume(&self, reading: &Reading) -> Result<(), IngestError> {
        (**self).consume(reading)
    }

    fn name(&self) -> &str {
        (**self).name()
    }
}

/// Persists every reading to a [`TimeSeriesStore`].
#[derive(Debug)]
pub struct StorageConsumer {
    store: Arc<dyn TimeSeriesStore>,
    events: Arc<dyn PipelineEventListener>,
}

impl StorageConsumer {
    pub fn new(store: Arc<dyn TimeSeriesStore>) -> Self {
        Self {
            store,
            events: noop_event_listener(),
        }
    }

    pub fn with_events(mut self, events: Arc<dyn PipelineEventListener>) -> Self {
        self.events = events;
        self
    }

    pub fn store(&self) -> &Arc<dyn TimeSeriesStore> {
        &self.store
    }
}

impl Consumer for StorageConsumer {
    fn consume(&self, reading: &Reading) -> Result<(), IngestError> {
        let started = Instant::now();
        match self.store.write(reading) {
            Ok(()) => {
                pipeline_metrics::record_write(started.elapsed());
                self.events.on_event(PipelineEvent::RecordWritten {
                    timestamp: reading.timestamp(),
                    values: reading.values().clone(),
                    error_message: reading.error_message().to_string(),
                });
                Ok(())
            }
            Err(e) => {
                self.events.on_event(PipelineEvent::RecordWriteFailed {
                    timestamp: reading.timestamp(),
                    values: reading.values().clone(),
                    error_message: reading.error_message().to_string(),
                    error: e.to_string(),
                });
                Err(e)
            }
        }
    }

    fn name(&self) -> &str {
        "storage"
    }
}
