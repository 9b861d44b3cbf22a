#![doc = include_str!("../README.md")]
// Declare modules
pub mod alerting;
pub mod config;
pub mod consumer;
pub mod decode;
pub mod dispatcher;
pub mod durable;
pub mod error;
pub mod memory;
pub mod schema;
pub mod store;
pub mod table;
pub mod telemetry;
pub mod types;

/// Alert notification capability and the threshold alert consumer.
pub use crate::alerting::{Notifier, NotifyError, StdoutNotifier, ThresholdAlertConsumer};
/// Pipeline configuration and table options.
pub use crate::config::{PipelineConfig, TableOptions};
/// Consumer capability and the storage consumer.
pub use crate::consumer::{Consumer, StorageConsumer};
/// Fan-out dispatcher and its failure types.
pub use crate::dispatcher::{ConsumerFailure, DispatchError, IngestDispatcher, MessageError};
/// Durable, month-partitioned store.
pub use crate::durable::{DurableStore, TableRef};
/// Error type for ingestion and storage operations.
pub use crate::error::IngestError;
/// In-memory store.
pub use crate::memory::InMemoryStore;
/// Storage abstraction shared by both backends.
pub use crate::store::TimeSeriesStore;
/// Structured event hook for observability.
pub use crate::telemetry::{PipelineEvent, PipelineEventListener, TracingEventListener};
/// Reading and query result types.
pub use crate::types::{QueryResult, Reading, SensorSeries, Timestamp};
