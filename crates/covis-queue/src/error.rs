//! Error types for the task queue.

use std::error::Error as StdError;

use covis_core::CoreError;
use thiserror::Error;

/// Result alias for queue operations.
pub type QueueResult<T> = Result<T, QueueError>;

/// Failures raised by brokers, result backends, and the dispatcher.
#[derive(Debug, Error)]
pub enum QueueError {
    /// Broker or result backend storage failed.
    #[error("queue backend operation failed")]
    Backend {
        /// Operation that failed.
        operation: &'static str,
        /// Underlying failure.
        #[source]
        source: Box<dyn StdError + Send + Sync + 'static>,
    },
    /// Message or result could not be (de)serialised.
    #[error("queue payload serialization failed")]
    Serialization {
        /// Underlying serde failure.
        #[source]
        source: serde_json::Error,
    },
    /// No handler is registered for the task.
    #[error("unregistered task")]
    UnknownTask {
        /// Task name.
        task: String,
    },
    /// A routing pattern is not a valid glob.
    #[error("invalid routing pattern")]
    InvalidRoute {
        /// Offending pattern.
        pattern: String,
        /// Underlying glob failure.
        #[source]
        source: globset::Error,
    },
    /// Broker URL scheme is not supported by this build.
    #[error("unsupported queue backend")]
    UnsupportedBackend {
        /// Offending URL.
        url: String,
    },
    /// A worker slot task could not be joined.
    #[error("worker slot terminated abnormally")]
    Join {
        /// Underlying join error.
        #[source]
        source: tokio::task::JoinError,
    },
}

impl QueueError {
    /// Wrap a backend failure.
    pub fn backend(
        operation: &'static str,
        source: impl Into<Box<dyn StdError + Send + Sync + 'static>>,
    ) -> Self {
        Self::Backend {
            operation,
            source: source.into(),
        }
    }
}

impl From<serde_json::Error> for QueueError {
    fn from(source: serde_json::Error) -> Self {
        Self::Serialization { source }
    }
}

impl From<QueueError> for CoreError {
    fn from(error: QueueError) -> Self {
        match error {
            QueueError::Backend { .. } => Self::transient("queue", error),
            other => Self::collaborator("queue", other),
        }
    }
}
