//! Error types for configuration loading.

use std::path::PathBuf;

use thiserror::Error;

/// Primary error type for configuration operations.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Required key was absent or blank.
    #[error("configuration value missing")]
    Missing {
        /// Key that was required.
        key: String,
    },
    /// Key contained a value that could not be used.
    #[error("invalid configuration field")]
    InvalidField {
        /// Key that failed validation.
        field: String,
        /// Offending value when it is safe to echo.
        value: Option<String>,
        /// Machine-readable reason for the failure.
        reason: &'static str,
    },
    /// Environment file existed but could not be parsed.
    #[error("failed to read environment file")]
    EnvFile {
        /// File that was read.
        path: PathBuf,
        /// Underlying parse failure.
        #[source]
        source: dotenvy::Error,
    },
}

/// Convenience alias for configuration results.
pub type ConfigResult<T> = Result<T, ConfigError>;

impl ConfigError {
    pub(crate) fn invalid(field: &str, value: &str, reason: &'static str) -> Self {
        Self::InvalidField {
            field: field.to_string(),
            value: Some(value.to_string()),
            reason,
        }
    }
}

impl From<ConfigError> for covis_core::CoreError {
    fn from(error: ConfigError) -> Self {
        match error {
            ConfigError::Missing { key } => Self::Configuration { key },
            other => Self::collaborator("config.load", other),
        }
    }
}
