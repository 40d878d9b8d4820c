//! Materialise an [`InputReference`] into an extracted dataset directory.
//!
//! # Design
//! - Downloads land directly in the caller's work directory; extraction always
//!   targets `work_dir/unpacked` so archives never confuse root discovery.
//! - The work directory belongs to the caller, usually a `TempDir`, and is never
//!   removed here.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use covis_core::{
    Catalog, CoreError, InputReference, LocationResolver, ObjectStore, ReplicaStore, Run,
};
use tracing::{info, instrument};

use crate::archive::extract_blocking;
use crate::error::{FsOpsError, FsOpsResult};

const UNPACK_DIR: &str = "unpacked";

/// Dataset extracted for processing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedInput {
    /// Dataset root inside the caller's work directory.
    pub root: PathBuf,
    /// Local copy of the archive that was extracted.
    pub archive: PathBuf,
    /// Catalog record, for catalog inputs.
    pub run: Option<Run>,
}

impl ResolvedInput {
    /// Name used for output keys: the run basename when known, otherwise the
    /// dataset directory name.
    #[must_use]
    pub fn basename(&self) -> String {
        self.run.as_ref().map_or_else(
            || {
                self.root
                    .file_name()
                    .map(|name| name.to_string_lossy().into_owned())
                    .unwrap_or_default()
            },
            |run| run.basename.clone(),
        )
    }
}

/// Resolves input references against the catalog, object store, and replica hosts.
#[derive(Clone)]
pub struct InputResolver {
    catalog: Arc<dyn Catalog>,
    replicas: Arc<dyn ReplicaStore>,
    object_store: Option<Arc<dyn ObjectStore>>,
    locations: LocationResolver,
}

impl std::fmt::Debug for InputResolver {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter
            .debug_struct("InputResolver")
            .field("object_store", &self.object_store.is_some())
            .field("locations", &self.locations)
            .finish_non_exhaustive()
    }
}

impl InputResolver {
    /// Construct a resolver. `object_store` is `None` when no raw-data store is configured.
    #[must_use]
    pub fn new(
        catalog: Arc<dyn Catalog>,
        replicas: Arc<dyn ReplicaStore>,
        object_store: Option<Arc<dyn ObjectStore>>,
        locations: LocationResolver,
    ) -> Self {
        Self {
            catalog,
            replicas,
            object_store,
            locations,
        }
    }

    /// Materialise `reference` below `work_dir`.
    ///
    /// # Errors
    ///
    /// - [`CoreError::Configuration`] for object-store inputs without a store.
    /// - [`CoreError::RunNotFound`] / [`CoreError::NoAvailableReplica`] for catalog inputs.
    /// - Archive errors from extraction.
    #[instrument(
        name = "input.resolve",
        skip(self, reference, work_dir),
        fields(input = %reference)
    )]
    pub async fn resolve(
        &self,
        reference: &InputReference,
        work_dir: &Path,
    ) -> FsOpsResult<ResolvedInput> {
        let (archive, run) = match reference {
            InputReference::Local { path } => (absolute(path)?, None),
            InputReference::ObjectStore { bucket, key } => {
                (self.download(bucket, key, work_dir).await?, None)
            }
            InputReference::Catalog { basename } => {
                let (archive, run) = self.fetch_replica(basename, work_dir).await?;
                (archive, Some(run))
            }
        };

        let root = extract_blocking(archive.clone(), work_dir.join(UNPACK_DIR)).await?;
        info!(root = %root.display(), "input resolved");
        Ok(ResolvedInput { root, archive, run })
    }

    async fn download(&self, bucket: &str, key: &str, work_dir: &Path) -> FsOpsResult<PathBuf> {
        let store = self
            .object_store
            .as_ref()
            .ok_or_else(|| CoreError::Configuration {
                key: "RAW_S3_HOST".to_string(),
            })?;
        let file_name = key
            .rsplit('/')
            .find(|segment| !segment.is_empty())
            .unwrap_or(key);
        let dest = work_dir.join(file_name);
        store.get(bucket, key, &dest).await?;
        info!(bucket, key, dest = %dest.display(), "downloaded object-store input");
        Ok(dest)
    }

    async fn fetch_replica(
        &self,
        basename: &str,
        work_dir: &Path,
    ) -> FsOpsResult<(PathBuf, Run)> {
        let run = self
            .catalog
            .find_run_by_basename(basename)
            .await?
            .ok_or_else(|| CoreError::RunNotFound {
                basename: basename.to_string(),
            })?;
        let location = self.locations.best_replica(&run.raw).ok_or_else(|| {
            CoreError::NoAvailableReplica {
                basename: basename.to_string(),
            }
        })?;
        info!(basename, host = %location.host, path = %location.path, "fetching replica");
        let archive = self.replicas.fetch(location, work_dir).await?;
        Ok((archive, run))
    }
}

fn absolute(path: &Path) -> FsOpsResult<PathBuf> {
    std::path::absolute(path).map_err(|source| FsOpsError::io("input.absolute", path, source))
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Result;
    use chrono::{TimeZone, Utc};
    use covis_core::{ArchiveFormat, RawLocation};
    use covis_test_support::fixtures::write_tar_gz;
    use covis_test_support::{MemoryCatalog, MemoryObjectStore, MemoryReplicaStore};

    type TestResult<T> = Result<T>;

    const FILES: &[(&str, &[u8])] = &[("dataset/", b""), ("dataset/ping.bin", b"ping")];

    fn resolver(
        catalog: MemoryCatalog,
        replicas: MemoryReplicaStore,
        store: Option<MemoryObjectStore>,
        locations: LocationResolver,
    ) -> InputResolver {
        InputResolver::new(
            Arc::new(catalog),
            Arc::new(replicas),
            store.map(|store| Arc::new(store) as Arc<dyn ObjectStore>),
            locations,
        )
    }

    #[tokio::test]
    async fn local_archive_is_extracted_under_unpacked() -> TestResult<()> {
        let scratch = tempfile::tempdir()?;
        let archive = scratch.path().join("run.tar.gz");
        write_tar_gz(&archive, FILES)?;
        let work = tempfile::tempdir()?;

        let resolved = resolver(
            MemoryCatalog::new(),
            MemoryReplicaStore::new(),
            None,
            LocationResolver::new(),
        )
        .resolve(&InputReference::Local { path: archive }, work.path())
        .await?;
        assert!(resolved.root.ends_with("dataset"));
        assert!(resolved.root.starts_with(work.path().join("unpacked")));
        assert_eq!(resolved.basename(), "dataset");
        Ok(())
    }

    #[tokio::test]
    async fn object_store_input_requires_configuration() -> TestResult<()> {
        let work = tempfile::tempdir()?;
        let result = resolver(
            MemoryCatalog::new(),
            MemoryReplicaStore::new(),
            None,
            LocationResolver::new(),
        )
        .resolve(
            &InputReference::ObjectStore {
                bucket: "raw".into(),
                key: "run.tar.gz".into(),
            },
            work.path(),
        )
        .await;
        assert!(matches!(
            result,
            Err(FsOpsError::Core(CoreError::Configuration { .. }))
        ));
        Ok(())
    }

    #[tokio::test]
    async fn object_store_input_is_downloaded_then_extracted() -> TestResult<()> {
        let scratch = tempfile::tempdir()?;
        let archive = scratch.path().join("run.tar.gz");
        write_tar_gz(&archive, FILES)?;
        let store = MemoryObjectStore::new();
        store.insert_file("raw", "2019/01/run.tar.gz", &archive)?;
        let work = tempfile::tempdir()?;

        let resolved = resolver(
            MemoryCatalog::new(),
            MemoryReplicaStore::new(),
            Some(store),
            LocationResolver::new(),
        )
        .resolve(
            &InputReference::ObjectStore {
                bucket: "raw".into(),
                key: "2019/01/run.tar.gz".into(),
            },
            work.path(),
        )
        .await?;
        assert_eq!(resolved.archive, work.path().join("run.tar.gz"));
        assert!(resolved.root.join("ping.bin").is_file());
        Ok(())
    }

    #[tokio::test]
    async fn catalog_input_uses_best_reachable_replica() -> TestResult<()> {
        let scratch = tempfile::tempdir()?;
        let archive = scratch.path().join("run.tar.gz");
        write_tar_gz(&archive, FILES)?;

        let datetime = Utc.with_ymd_and_hms(2019, 1, 1, 0, 0, 0).unwrap();
        let mut run = Run::new("run-b", datetime);
        run.push_location(RawLocation::new("OLD", "gone.tar.gz", ArchiveFormat::TarGz));
        run.push_location(RawLocation::new("DMAS", "b.tar.gz", ArchiveFormat::TarGz));
        let catalog = MemoryCatalog::with_runs([run]);
        let replicas = MemoryReplicaStore::new();
        replicas.insert_file("DMAS", "b.tar.gz", &archive)?;
        let mut locations = LocationResolver::new();
        locations.mark_unreachable("OLD");

        let work = tempfile::tempdir()?;
        let resolved = resolver(catalog, replicas, None, locations)
            .resolve(
                &InputReference::Catalog {
                    basename: "run-b".into(),
                },
                work.path(),
            )
            .await?;
        assert_eq!(resolved.basename(), "run-b");
        assert!(resolved.root.ends_with("dataset"));
        Ok(())
    }

    #[tokio::test]
    async fn catalog_input_reports_missing_run_and_replica() -> TestResult<()> {
        let work = tempfile::tempdir()?;
        let datetime = Utc.with_ymd_and_hms(2019, 1, 1, 0, 0, 0).unwrap();
        let catalog = MemoryCatalog::with_runs([Run::new("empty", datetime)]);
        let resolver = resolver(
            catalog,
            MemoryReplicaStore::new(),
            None,
            LocationResolver::new(),
        );

        let missing = resolver
            .resolve(
                &InputReference::Catalog {
                    basename: "absent".into(),
                },
                work.path(),
            )
            .await;
        assert!(matches!(
            missing,
            Err(FsOpsError::Core(CoreError::RunNotFound { .. }))
        ));

        let no_replica = resolver
            .resolve(
                &InputReference::Catalog {
                    basename: "empty".into(),
                },
                work.path(),
            )
            .await;
        assert!(matches!(
            no_replica,
            Err(FsOpsError::Core(CoreError::NoAvailableReplica { .. }))
        ));
        Ok(())
    }
}
