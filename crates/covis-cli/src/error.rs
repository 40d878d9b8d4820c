//! CLI error type separating operator mistakes from operational failures.

use std::fmt::{self, Display, Formatter};

use covis_app::AppError;
use covis_core::CoreError;

/// CLI-level error type to distinguish validation from operational failures.
#[derive(Debug)]
pub(crate) enum CliError {
    Validation(String),
    Failure(anyhow::Error),
}

/// Convenience alias for functions returning a `CliError`.
pub(crate) type CliResult<T> = Result<T, CliError>;

impl CliError {
    pub(crate) fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    pub(crate) fn failure(error: impl Into<anyhow::Error>) -> Self {
        Self::Failure(error.into())
    }

    pub(crate) const fn exit_code(&self) -> i32 {
        match self {
            Self::Validation(_) => 2,
            Self::Failure(_) => 3,
        }
    }

    pub(crate) fn display_message(&self) -> String {
        match self {
            Self::Validation(message) => message.clone(),
            Self::Failure(error) => format!("{error:#}"),
        }
    }
}

impl Display for CliError {
    fn fmt(&self, formatter: &mut Formatter<'_>) -> fmt::Result {
        formatter.write_str("cli error")
    }
}

impl std::error::Error for CliError {}

impl From<AppError> for CliError {
    fn from(err: AppError) -> Self {
        if !err.is_validation() {
            return Self::failure(err);
        }
        if let AppError::Core { source, .. } = &err {
            return Self::validation(core_message(source));
        }
        Self::validation(format!("{:#}", anyhow::Error::new(err)))
    }
}

/// Operator-facing wording for a core error, naming the offending value.
pub(crate) fn core_message(err: &CoreError) -> String {
    match err {
        CoreError::UnknownHost { host } => format!("unknown host '{host}'"),
        CoreError::RunNotFound { basename } => format!("run '{basename}' not found"),
        CoreError::NoAvailableReplica { basename } => {
            format!("no reachable replica for run '{basename}'")
        }
        CoreError::MalformedArchive { path } => {
            format!("malformed archive at {}", path.display())
        }
        CoreError::Configuration { key } => format!("configuration value {key} is required"),
        CoreError::TransientIo { operation, source }
        | CoreError::Collaborator { operation, source } => format!("{operation}: {source}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use covis_config::ConfigError;

    #[test]
    fn validation_errors_exit_with_two() {
        let err = CliError::from(AppError::Core {
            operation: "router.new",
            source: CoreError::UnknownHost {
                host: "not-a-host".to_string(),
            },
        });
        assert_eq!(err.exit_code(), 2);
        assert_eq!(err.display_message(), "unknown host 'not-a-host'");

        let err = CliError::from(AppError::Config {
            operation: "settings.load",
            source: ConfigError::Missing {
                key: "COVIS_DATABASE_URL".to_string(),
            },
        });
        assert_eq!(err.exit_code(), 2);
    }

    #[test]
    fn operational_errors_exit_with_three() {
        let err = CliError::from(AppError::Core {
            operation: "catalog.stream",
            source: CoreError::transient("catalog.stream", "connection reset"),
        });
        assert_eq!(err.exit_code(), 3);
        assert!(err.display_message().contains("connection reset"));
    }
}
