//! # Design
//!
//! - Centralize application-level errors for bootstrap, dispatch, and task wiring.
//! - Keep error messages constant while carrying context fields for debugging.
//! - Preserve source errors without re-logging at call sites.

use std::error::Error;
use std::io;
use std::path::PathBuf;

use thiserror::Error;

/// Result alias for application operations.
pub type AppResult<T> = Result<T, AppError>;

/// Application-level error type.
#[derive(Debug, Error)]
pub enum AppError {
    /// Configuration operations failed.
    #[error("configuration operation failed")]
    Config {
        /// Operation identifier.
        operation: &'static str,
        /// Source configuration error.
        source: covis_config::ConfigError,
    },
    /// Catalog or queue persistence failed.
    #[error("database operation failed")]
    Data {
        /// Operation identifier.
        operation: &'static str,
        /// Source data error.
        source: covis_data::DataError,
    },
    /// Queue operations failed.
    #[error("queue operation failed")]
    Queue {
        /// Operation identifier.
        operation: &'static str,
        /// Source queue error.
        source: covis_queue::QueueError,
    },
    /// Storage adapter construction failed.
    #[error("storage operation failed")]
    Storage {
        /// Operation identifier.
        operation: &'static str,
        /// Source storage error.
        source: covis_storage::StorageError,
    },
    /// Planning or collaborator operations failed.
    #[error("relocation operation failed")]
    Core {
        /// Operation identifier.
        operation: &'static str,
        /// Source core error.
        source: covis_core::CoreError,
    },
    /// Telemetry operations failed.
    #[error("telemetry operation failed")]
    Telemetry {
        /// Operation identifier.
        operation: &'static str,
        /// Source telemetry error.
        source: Box<dyn Error + Send + Sync>,
    },
    /// IO operations failed.
    #[error("io operation failed")]
    Io {
        /// Operation identifier.
        operation: &'static str,
        /// Optional path involved in the failure.
        path: Option<PathBuf>,
        /// Source IO error.
        source: io::Error,
    },
}

impl AppError {
    pub(crate) const fn config(operation: &'static str, source: covis_config::ConfigError) -> Self {
        Self::Config { operation, source }
    }

    pub(crate) const fn data(operation: &'static str, source: covis_data::DataError) -> Self {
        Self::Data { operation, source }
    }

    pub(crate) const fn queue(operation: &'static str, source: covis_queue::QueueError) -> Self {
        Self::Queue { operation, source }
    }

    pub(crate) const fn storage(
        operation: &'static str,
        source: covis_storage::StorageError,
    ) -> Self {
        Self::Storage { operation, source }
    }

    pub(crate) const fn core(operation: &'static str, source: covis_core::CoreError) -> Self {
        Self::Core { operation, source }
    }

    pub(crate) fn telemetry(operation: &'static str, source: anyhow::Error) -> Self {
        Self::Telemetry {
            operation,
            source: source.into(),
        }
    }

    /// Whether the failure was rejected before any broker or catalog work,
    /// such as an unknown host name.
    #[must_use]
    pub const fn is_validation(&self) -> bool {
        matches!(
            self,
            Self::Config { .. }
                | Self::Queue {
                    source: covis_queue::QueueError::UnsupportedBackend { .. },
                    ..
                }
                | Self::Storage {
                    source: covis_storage::StorageError::InvalidUrl { .. }
                        | covis_storage::StorageError::UnsupportedScheme { .. },
                    ..
                }
                | Self::Core {
                    source: covis_core::CoreError::UnknownHost { .. }
                        | covis_core::CoreError::Configuration { .. },
                    ..
                }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn app_error_helpers_build_variants() {
        let config = AppError::config(
            "settings.load",
            covis_config::ConfigError::Missing {
                key: "COVIS_NAS_URL".to_string(),
            },
        );
        assert!(matches!(config, AppError::Config { .. }));
        assert!(config.is_validation());
        assert!(config.source().is_some());

        let queue = AppError::queue(
            "dispatcher.submit",
            covis_queue::QueueError::UnknownTask {
                task: "relocation.relocate".to_string(),
            },
        );
        assert_eq!(queue.to_string(), "queue operation failed");
        assert!(!queue.is_validation());

        let telemetry = AppError::telemetry("telemetry.init", anyhow::anyhow!("already set"));
        assert!(telemetry.source().is_some());
    }

    #[test]
    fn unknown_host_is_a_validation_failure() {
        let unknown = AppError::core(
            "router.new",
            covis_core::CoreError::UnknownHost {
                host: "not-a-host".to_string(),
            },
        );
        assert!(unknown.is_validation());

        let missing = AppError::core(
            "dispatch.stream",
            covis_core::CoreError::RunNotFound {
                basename: "B".to_string(),
            },
        );
        assert!(!missing.is_validation());
    }
}
