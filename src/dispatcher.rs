use crate::consumer::Consumer;
use crate::error::IngestError;
use crate::telemetry::{noop_event_listener, pipeline_metrics, PipelineEvent, PipelineEventListener};
use crate::types::Reading;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;

/// One consumer that failed while a reading was dispatched.
#[derive(Debug)]
pub struct ConsumerFailure {
    /// Position of the consumer in registration order.
    pub index: usize,
    pub consumer: String,
    pub error: IngestError,
}

impl fmt::Display for ConsumerFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{} {}: {}", self.index, self.consumer, self.error)
    }
}

/// Every consumer failure of one dispatch. Consumers after a failing one still ran.
#[derive(Error, Debug)]
#[error("{} consumer(s) failed: {}", .failures.len(), join_failures(.failures))]
pub struct DispatchError {
    pub failures: Vec<ConsumerFailure>,
}

fn join_failures(failures: &[ConsumerFailure]) -> String {
    failures
        .iter()
        .map(|f| f.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}

/// Failure to handle one raw message.
#[derive(Error, Debug)]
pub enum MessageError {
    /// The message did not decode; no consumer was called.
    #[error(transparent)]
    Decode(IngestError),
    #[error(transparent)]
    Dispatch(#[from] DispatchError),
}

/// Fans one reading out to a fixed, ordered list of consumers.
///
/// Each consumer is called exactly once per reading, in registration order, on the calling
/// thread. A failing consumer is logged and recorded; the remaining consumers are still called.
#[derive(Debug)]
pub struct IngestDispatcher {
    consumers: Vec<Box<dyn Consumer>>,
    events: Arc<dyn PipelineEventListener>,
}

impl IngestDispatcher {
    pub fn new(consumers: Vec<Box<dyn Consumer>>) -> Self {
        Self::with_events(consumers, noop_event_listener())
    }

    pub fn with_events(
        consumers: Vec<Box<dyn Consumer>>,
        events: Arc<dyn PipelineEventListener>,
    ) -> Self {
        Self { consumers, events }
    }

    pub fn consumers(&self) -> &[Box<dyn Consumer>] {
        &self.consumers
    }

    pub fn dispatch(&self, reading: &Reading) -> Result<(), DispatchError> {
        let mut failures = Vec::new();
        for (index, consumer) in self.consumers.iter().enumerate() {
            if let Err(error) = consumer.consume(reading) {
                self.events.on_event(PipelineEvent::ConsumerFailed {
                    consumer: consumer.name().to_string(),
                    timestamp: reading.timestamp(),
                    error: error.to_string(),
                });
                failures.push(ConsumerFailure {
                    index,
                    consumer: consumer.name().to_string(),
                    error,
                });
            }
        }

        pipeline_metrics::record_dispatch(failures.len() as u64);
        self.events.on_event(PipelineEvent::ReadingDispatched {
            timestamp: reading.timestamp(),
            consumers: self.consumers.len(),
            failures: failures.len(),
        });

        if failures.is_empty() {
            Ok(())
        } else {
            Err(DispatchError { failures })
        }
    }

    /// Decodes one raw message and dispatches it.
    ///
    /// A message that does not decode is dropped: no consumer is called and the decode error is
    /// returned for the caller to log. It is never retried here.
    pub fn dispatch_encoded(&self, payload: &[u8]) -> Result<(), MessageError> {
        let reading = match Reading::from_json_slice(payload) {
            Ok(r) => r,
            Err(e) => {
                pipeline_metrics::record_decode_failure();
                self.events.on_event(PipelineEvent::DecodeFailed {
                    error: e.to_string(),
                    payload_len: payload.len(),
                });
                return Err(MessageError::Decode(e));
            }
        };
        Ok(self.dispatch(&reading)?)
    }
}
