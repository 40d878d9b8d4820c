//! Error taxonomy shared by the relocation and dispatch subsystem.
//!
//! # Design
//! - Constant messages; the offending host, run, path, or key travels as a field.
//! - `is_transient` is the single switch the worker consults before redelivering.

use std::error::Error;
use std::path::PathBuf;

use thiserror::Error;

/// Primary error type for location resolution and dispatch planning.
#[derive(Debug, Error)]
pub enum CoreError {
    /// Host name is not a member of the known host set.
    #[error("unknown host")]
    UnknownHost {
        /// Host name supplied by the caller.
        host: String,
    },
    /// Catalog did not contain the requested run.
    #[error("run not found")]
    RunNotFound {
        /// Basename that was looked up.
        basename: String,
    },
    /// None of the run's replicas can be used.
    #[error("no available replica")]
    NoAvailableReplica {
        /// Run whose replicas were considered.
        basename: String,
    },
    /// Extraction did not yield a dataset root.
    #[error("malformed archive")]
    MalformedArchive {
        /// Archive or extraction directory that was inspected.
        path: PathBuf,
    },
    /// Required configuration value was not provided.
    #[error("configuration missing")]
    Configuration {
        /// Configuration key that was required.
        key: String,
    },
    /// Network or storage hiccup that is safe to retry.
    #[error("transient io failure")]
    TransientIo {
        /// Operation that failed.
        operation: &'static str,
        /// Underlying failure.
        #[source]
        source: Box<dyn Error + Send + Sync>,
    },
    /// Collaborator failed in a way that retrying will not fix.
    #[error("collaborator operation failed")]
    Collaborator {
        /// Operation that failed.
        operation: &'static str,
        /// Underlying failure.
        #[source]
        source: Box<dyn Error + Send + Sync>,
    },
}

/// Convenience alias for core results.
pub type CoreResult<T> = Result<T, CoreError>;

impl CoreError {
    /// Wrap a retryable failure.
    pub fn transient(
        operation: &'static str,
        source: impl Into<Box<dyn Error + Send + Sync>>,
    ) -> Self {
        Self::TransientIo {
            operation,
            source: source.into(),
        }
    }

    /// Wrap a non-retryable collaborator failure.
    pub fn collaborator(
        operation: &'static str,
        source: impl Into<Box<dyn Error + Send + Sync>>,
    ) -> Self {
        Self::Collaborator {
            operation,
            source: source.into(),
        }
    }

    /// Whether broker-level redelivery may resolve the failure.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(self, Self::TransientIo { .. })
    }

    /// Stable machine-readable discriminator used in logs and task results.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::UnknownHost { .. } => "unknown_host",
            Self::RunNotFound { .. } => "run_not_found",
            Self::NoAvailableReplica { .. } => "no_available_replica",
            Self::MalformedArchive { .. } => "malformed_archive",
            Self::Configuration { .. } => "configuration",
            Self::TransientIo { .. } => "transient_io",
            Self::Collaborator { .. } => "collaborator",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;

    #[test]
    fn only_transient_io_is_retryable() {
        let transient = CoreError::transient("fetch", io::Error::other("reset"));
        assert!(transient.is_transient());
        assert!(transient.source().is_some());

        let fatal = CoreError::collaborator("fetch", io::Error::other("denied"));
        assert!(!fatal.is_transient());

        let missing = CoreError::RunNotFound {
            basename: "APLUWCOVISMBSONAR001_20190101T000000.000Z".into(),
        };
        assert!(!missing.is_transient());
        assert_eq!(missing.kind(), "run_not_found");
        assert_eq!(missing.to_string(), "run not found");
    }
}
