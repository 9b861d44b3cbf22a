use thiserror::Error;

/// Error type for ingestion, storage, and schema operations.
#[derive(Error, Debug)]
pub enum IngestError {
    #[error("I/O Error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization Error: {0}")]
    Serialization(String),

    #[error("Lock acquisition failed: {0}")]
    LockError(String),

    #[error("Corruption detected: {details}")]
    Corruption {
        details: String,
        partition: Option<String>,
        offset: Option<u64>,
    },

    /// The table schema could not be read, merged, or persisted.
    #[error("Schema Error: {0}")]
    Schema(String),

    /// The store refused a record (schema violation, expired partition).
    #[error("Record rejected: {0}")]
    Rejected(String),

    /// An inbound message could not be turned into a `Reading`.
    #[error("Decode Error: {0}")]
    Decode(String),

    #[error("Configuration Error: {0}")]
    ConfigError(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

// Implement conversion from lock poison errors for convenience
impl<T> From<std::sync::PoisonError<T>> for IngestError {
    fn from(err: std::sync::PoisonError<T>) -> Self {
        IngestError::LockError(format!("Mutex/RwLock poisoned: {}", err))
    }
}

impl From<bincode::Error> for IngestError {
    fn from(err: bincode::Error) -> Self {
        IngestError::Serialization(err.to_string())
    }
}
