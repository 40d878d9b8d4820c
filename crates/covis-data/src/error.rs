//! Error types for the data access layer.

use std::error::Error;
use std::fmt::{self, Display, Formatter};

use covis_core::CoreError;
use covis_queue::QueueError;

/// Result alias for data layer operations.
pub type Result<T> = std::result::Result<T, DataError>;

/// Errors raised by the data access layer.
#[derive(Debug)]
pub enum DataError {
    /// Could not connect to the database.
    ConnectFailed {
        /// Underlying SQL error.
        source: sqlx::Error,
    },
    /// Migration execution failed.
    MigrationFailed {
        /// Underlying migration error.
        source: sqlx::migrate::MigrateError,
    },
    /// A database operation failed.
    QueryFailed {
        /// Operation identifier.
        operation: &'static str,
        /// Underlying SQL error.
        source: sqlx::Error,
    },
    /// A location was appended to a run that is not catalogued.
    UnknownRun {
        /// Run basename.
        basename: String,
    },
}

impl DataError {
    pub(crate) const fn query(operation: &'static str, source: sqlx::Error) -> Self {
        Self::QueryFailed { operation, source }
    }

    /// Whether the failure is a connectivity problem worth retrying.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        match self {
            Self::ConnectFailed { .. } => true,
            Self::QueryFailed { source, .. } => matches!(
                source,
                sqlx::Error::Io(_) | sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed
            ),
            _ => false,
        }
    }
}

impl Display for DataError {
    fn fmt(&self, formatter: &mut Formatter<'_>) -> fmt::Result {
        match self {
            Self::ConnectFailed { .. } => formatter.write_str("database connection failed"),
            Self::MigrationFailed { .. } => formatter.write_str("migration failed"),
            Self::QueryFailed { .. } => formatter.write_str("database operation failed"),
            Self::UnknownRun { .. } => formatter.write_str("run is not catalogued"),
        }
    }
}

impl Error for DataError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::ConnectFailed { source } | Self::QueryFailed { source, .. } => Some(source),
            Self::MigrationFailed { source } => Some(source),
            Self::UnknownRun { .. } => None,
        }
    }
}

impl From<DataError> for CoreError {
    fn from(error: DataError) -> Self {
        match error {
            DataError::UnknownRun { basename } => Self::RunNotFound { basename },
            other if other.is_transient() => Self::transient("catalog", other),
            other => Self::collaborator("catalog", other),
        }
    }
}

impl From<DataError> for QueueError {
    fn from(error: DataError) -> Self {
        Self::backend("postgres", error)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn data_error_display_and_source() {
        let migration = DataError::MigrationFailed {
            source: sqlx::migrate::MigrateError::VersionMissing(1),
        };
        assert_eq!(migration.to_string(), "migration failed");
        assert!(migration.source().is_some());

        let query = DataError::query("fetch", sqlx::Error::RowNotFound);
        assert_eq!(query.to_string(), "database operation failed");
        assert!(query.source().is_some());
        assert!(!query.is_transient());
    }

    #[test]
    fn pool_timeouts_are_transient_in_core_taxonomy() {
        let core: CoreError = DataError::query("reserve", sqlx::Error::PoolTimedOut).into();
        assert!(core.is_transient());

        let missing: CoreError = DataError::UnknownRun {
            basename: "B".into(),
        }
        .into();
        assert!(matches!(missing, CoreError::RunNotFound { .. }));
    }
}
