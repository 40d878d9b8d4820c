//! # Design
//!
//! - Constant-message errors; the archive, entry, or path travels as a field.
//! - Conversion into `CoreError` keeps archive shape problems distinct from
//!   collaborator failures so the worker can decide on redelivery.

use std::io;
use std::path::PathBuf;

use covis_core::CoreError;
use thiserror::Error;

/// Result type for archive and input operations.
pub type FsOpsResult<T> = Result<T, FsOpsError>;

/// Errors produced while extracting, packing, or resolving inputs.
#[derive(Debug, Error)]
pub enum FsOpsError {
    /// IO failure while touching the filesystem.
    #[error("fsops io failure")]
    Io {
        /// Operation that triggered the failure.
        operation: &'static str,
        /// Path involved.
        path: PathBuf,
        /// Underlying IO error.
        #[source]
        source: io::Error,
    },
    /// Directory traversal failure.
    #[error("fsops walkdir failure")]
    Walkdir {
        /// Operation that triggered the failure.
        operation: &'static str,
        /// Path involved.
        path: PathBuf,
        /// Underlying walkdir error.
        #[source]
        source: walkdir::Error,
    },
    /// Zip decoding failure.
    #[error("fsops zip failure")]
    Zip {
        /// Operation that triggered the failure.
        operation: &'static str,
        /// Archive being read.
        path: PathBuf,
        /// Underlying zip error.
        #[source]
        source: zip::result::ZipError,
    },
    /// 7z decoding failure.
    #[error("fsops 7z failure")]
    SevenZip {
        /// Operation that triggered the failure.
        operation: &'static str,
        /// Archive being read.
        path: PathBuf,
        /// Underlying 7z error.
        #[source]
        source: sevenz_rust::Error,
    },
    /// Archive container is recognised but cannot be unpacked.
    #[error("unsupported archive format")]
    UnsupportedFormat {
        /// Archive that was inspected.
        path: PathBuf,
        /// Detected format tag.
        format: &'static str,
    },
    /// Archive entry would escape the extraction directory.
    #[error("unsafe archive entry")]
    UnsafeEntry {
        /// Archive being read.
        path: PathBuf,
        /// Entry name as stored in the archive.
        entry: String,
    },
    /// Extraction produced no dataset directory.
    #[error("malformed archive")]
    MalformedArchive {
        /// Extraction directory that was searched.
        path: PathBuf,
    },
    /// Blocking worker thread failed.
    #[error("fsops blocking task failed")]
    Join {
        /// Operation that was running.
        operation: &'static str,
        /// Underlying join error.
        #[source]
        source: tokio::task::JoinError,
    },
    /// Collaborator lookup failed while resolving an input.
    #[error(transparent)]
    Core(#[from] CoreError),
}

impl FsOpsError {
    pub(crate) fn io(operation: &'static str, path: impl Into<PathBuf>, source: io::Error) -> Self {
        Self::Io {
            operation,
            path: path.into(),
            source,
        }
    }
}

impl From<FsOpsError> for CoreError {
    fn from(error: FsOpsError) -> Self {
        match error {
            FsOpsError::Core(inner) => inner,
            FsOpsError::MalformedArchive { path } | FsOpsError::UnsupportedFormat { path, .. } => {
                Self::MalformedArchive { path }
            }
            FsOpsError::Zip { path, .. }
            | FsOpsError::SevenZip { path, .. }
            | FsOpsError::UnsafeEntry { path, .. } => {
                Self::MalformedArchive { path }
            }
            other => Self::collaborator("fsops", other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn archive_shape_errors_map_to_malformed_archive() {
        let err: CoreError = FsOpsError::UnsafeEntry {
            path: PathBuf::from("run.tar"),
            entry: "../etc/passwd".into(),
        }
        .into();
        assert!(matches!(err, CoreError::MalformedArchive { .. }));

        let err: CoreError = FsOpsError::Core(CoreError::RunNotFound {
            basename: "missing".into(),
        })
        .into();
        assert!(matches!(err, CoreError::RunNotFound { .. }));

        let err: CoreError =
            FsOpsError::io("extract", "/tmp/x", io::Error::other("disk full")).into();
        assert!(!err.is_transient());
    }
}
