//! `relocation.relocate`: copy a run onto a destination host as `tar.gz`.
//!
//! # Design
//! - The catalog is re-read on every delivery; a run already on the destination
//!   returns [`RelocationOutcome::AlreadyPresent`] without touching any store.
//! - The chosen replica is extracted and repacked, so every relocated copy has
//!   the same archive format regardless of its source.
//! - The destination key is derived from the run date and basename, and the
//!   catalog append ignores duplicates, so a redelivered task converges.

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use covis_core::{
    ArchiveFormat, Catalog, CoreError, HostRegistry, JobArgs, LocationResolver, RawLocation,
    ReplicaStore, Run,
};
use covis_fsops::{extract_blocking, pack_blocking};
use covis_queue::{TaskContext, TaskError, TaskHandler};
use serde::Serialize;
use serde_json::Value;
use tracing::{info, instrument};

use crate::tasks::{date_path, decode, scratch_dir};

/// Result reported by a relocation task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum RelocationOutcome {
    /// The destination already held a copy; nothing was done.
    AlreadyPresent {
        /// Run basename.
        basename: String,
        /// Destination host.
        host: String,
    },
    /// A replica was copied onto the destination.
    Relocated {
        /// Run basename.
        basename: String,
        /// Host the replica was read from.
        source: String,
        /// Destination host.
        host: String,
        /// Key written on the destination.
        path: String,
        /// Whether the catalog gained a new location.
        recorded: bool,
    },
}

/// Handler for relocation tasks.
#[derive(Clone)]
pub struct RelocateHandler {
    hosts: HostRegistry,
    catalog: Arc<dyn Catalog>,
    replicas: Arc<dyn ReplicaStore>,
    locations: LocationResolver,
    work_dir: Option<PathBuf>,
}

impl std::fmt::Debug for RelocateHandler {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter
            .debug_struct("RelocateHandler")
            .field("hosts", &self.hosts)
            .field("locations", &self.locations)
            .field("work_dir", &self.work_dir)
            .finish_non_exhaustive()
    }
}

impl RelocateHandler {
    /// Handler over explicit collaborators.
    #[must_use]
    pub fn new(
        hosts: HostRegistry,
        catalog: Arc<dyn Catalog>,
        replicas: Arc<dyn ReplicaStore>,
        locations: LocationResolver,
    ) -> Self {
        Self {
            hosts,
            catalog,
            replicas,
            locations,
            work_dir: None,
        }
    }

    /// Create scratch directories below `dir` instead of the system temp dir.
    #[must_use]
    pub fn with_work_dir(mut self, dir: Option<PathBuf>) -> Self {
        self.work_dir = dir;
        self
    }

    /// Relocate `basename` onto `destination`.
    ///
    /// # Errors
    ///
    /// - [`CoreError::UnknownHost`] when `destination` is not registered.
    /// - [`CoreError::RunNotFound`] / [`CoreError::NoAvailableReplica`].
    /// - Archive and storage failures while copying.
    #[instrument(name = "task.relocate", skip(self))]
    pub async fn relocate(
        &self,
        basename: &str,
        destination: &str,
    ) -> Result<RelocationOutcome, CoreError> {
        let destination = self.hosts.resolve(destination)?;
        let run = self
            .catalog
            .find_run_by_basename(basename)
            .await?
            .ok_or_else(|| CoreError::RunNotFound {
                basename: basename.to_string(),
            })?;

        if !self.locations.needs_relocation(&run.raw, destination.name()) {
            info!(basename, host = destination.name(), "run already on destination");
            return Ok(RelocationOutcome::AlreadyPresent {
                basename: run.basename,
                host: destination.name().to_string(),
            });
        }

        let source = self
            .locations
            .best_replica_excluding(&run.raw, destination.name())
            .cloned()
            .ok_or_else(|| CoreError::NoAvailableReplica {
                basename: basename.to_string(),
            })?;
        info!(
            basename,
            source = %source.host,
            path = %source.path,
            host = destination.name(),
            "relocating run"
        );

        let scratch = scratch_dir(self.work_dir.as_deref())?;
        let archive = self.replicas.fetch(&source, scratch.path()).await?;
        let root = extract_blocking(archive, scratch.path().join("unpacked")).await?;
        let packed = scratch.path().join("packed").join(format!("{basename}.tar.gz"));
        pack_blocking(root, packed.clone()).await?;

        let key = relocated_key(&run);
        let path = self.replicas.store(&destination, &key, &packed).await?;
        let recorded = self
            .catalog
            .add_location(
                basename,
                RawLocation::new(destination.name(), path.clone(), ArchiveFormat::TarGz),
            )
            .await?;
        info!(basename, host = destination.name(), path = %path, recorded, "run relocated");

        Ok(RelocationOutcome::Relocated {
            basename: run.basename,
            source: source.host,
            host: destination.name().to_string(),
            path,
            recorded,
        })
    }
}

#[async_trait]
impl TaskHandler for RelocateHandler {
    async fn run(&self, context: &TaskContext, args: &[Value]) -> Result<Value, TaskError> {
        let JobArgs::Relocate {
            basename,
            destination,
        } = decode(context, args)?
        else {
            return Err(TaskError::Fatal(format!(
                "{} received non-relocation arguments",
                context.task
            )));
        };
        let outcome = self.relocate(&basename, &destination).await?;
        serde_json::to_value(outcome).map_err(|err| TaskError::Fatal(err.to_string()))
    }
}

/// Destination key for a relocated run: `YYYY/MM/DD/<basename>.tar.gz`.
fn relocated_key(run: &Run) -> String {
    format!("{}/{}.tar.gz", date_path(run.datetime), run.basename)
}
