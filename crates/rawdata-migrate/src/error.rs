//! Error types for the migration pipeline.

use thiserror::Error;

/// Result type alias using the crate's error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur during a migration.
///
/// Every variant is fatal for the current `prepare`/`produce` run: a file is
/// either fully migrated or the run fails and must be retried from scratch.
#[derive(Error, Debug)]
pub enum Error {
    /// Key, manifest or cipher error.
    #[error(transparent)]
    Core(#[from] rawdata_core::Error),

    /// I/O error (file not found, read failure).
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Source file has an unexpected shape.
    #[error("Malformed source: {0}")]
    MalformedSource(String),

    /// The key store rejected a read or write.
    #[error("Storage failure: {0}")]
    Storage(#[from] rocksdb::Error),

    /// Release-order invariant broken (duplicate or unknown position).
    #[error("Ordering violation: {0}")]
    OrderingViolation(String),

    /// Outstanding-work queue rejected a handle even after a full drain.
    #[error("Out of capacity: unable to queue work (capacity {capacity})")]
    CapacityExceeded { capacity: usize },

    /// A worker task failed while processing a position.
    #[error("Worker failed at position {position}: {source}")]
    WorkerFailed {
        position: String,
        #[source]
        source: Box<Error>,
    },

    /// A worker task panicked or its pool shut down before it reported back.
    #[error("Worker lost: {0}")]
    WorkerLost(String),

    /// The pipeline refuses work after a failure or after close.
    #[error("Pipeline aborted: {0}")]
    Aborted(String),

    /// The log client rejected a publish.
    #[error("Publish error: {0}")]
    Publish(String),

    /// Configuration error.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Serialization error.
    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Self::Serialization(e.to_string())
    }
}

impl From<csv::Error> for Error {
    fn from(e: csv::Error) -> Self {
        if e.is_io_error() {
            match e.into_kind() {
                csv::ErrorKind::Io(io) => Self::Io(io),
                other => Self::MalformedSource(format!("{other:?}")),
            }
        } else {
            Self::MalformedSource(e.to_string())
        }
    }
}
