//! Error types for storage backends.

use std::io;
use std::path::PathBuf;

use covis_core::CoreError;
use thiserror::Error;

/// Result alias for storage operations.
pub type StorageResult<T> = Result<T, StorageError>;

/// Failures raised by filesystem and S3 storage backends.
#[derive(Debug, Error)]
pub enum StorageError {
    /// Local filesystem failure.
    #[error("storage io failure")]
    Io {
        /// Operation that failed.
        operation: &'static str,
        /// Path involved.
        path: PathBuf,
        /// Underlying IO error.
        #[source]
        source: io::Error,
    },
    /// Request could not be sent or its body could not be read.
    #[error("storage request failed")]
    Http {
        /// Operation that failed.
        operation: &'static str,
        /// Target URL.
        url: String,
        /// Underlying client error.
        #[source]
        source: reqwest::Error,
    },
    /// Server answered with an unexpected status.
    #[error("storage request rejected")]
    Status {
        /// Operation that failed.
        operation: &'static str,
        /// Target URL.
        url: String,
        /// HTTP status code.
        status: u16,
    },
    /// Object or archive does not exist.
    #[error("storage object not found")]
    NotFound {
        /// Object location.
        location: String,
    },
    /// Endpoint URL could not be parsed or joined.
    #[error("invalid storage url")]
    InvalidUrl {
        /// Offending value.
        value: String,
        /// Underlying parse failure.
        #[source]
        source: url::ParseError,
    },
    /// Endpoint scheme is neither `file` nor `http(s)`.
    #[error("unsupported storage scheme")]
    UnsupportedScheme {
        /// Offending scheme.
        scheme: String,
    },
    /// Request could not be signed.
    #[error("failed to sign storage request")]
    Signing,
    /// HTTP client could not be constructed.
    #[error("failed to build http client")]
    Client {
        /// Underlying client error.
        #[source]
        source: reqwest::Error,
    },
}

impl StorageError {
    pub(crate) fn io(operation: &'static str, path: impl Into<PathBuf>, source: io::Error) -> Self {
        Self::Io {
            operation,
            path: path.into(),
            source,
        }
    }

    /// Whether retrying the same request may succeed.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Http { source, .. } => {
                source.is_timeout() || source.is_connect() || source.is_body()
            }
            Self::Status { status, .. } => *status >= 500 || *status == 429,
            _ => false,
        }
    }
}

impl From<StorageError> for CoreError {
    fn from(error: StorageError) -> Self {
        if error.is_transient() {
            Self::transient("storage", error)
        } else {
            Self::collaborator("storage", error)
        }
    }
}
