//! Collaborator traits implemented by storage, catalog, and runtime adapters.

use std::path::{Path, PathBuf};
use std::pin::Pin;

use async_trait::async_trait;
use serde_json::Value;
use tokio_stream::Stream;

use crate::error::CoreResult;
use crate::hosts::Host;
use crate::model::{RawLocation, Run};

/// Cursor over catalog runs.
pub type RunStream = Pin<Box<dyn Stream<Item = CoreResult<Run>> + Send>>;

/// Run metadata store.
#[async_trait]
pub trait Catalog: Send + Sync {
    /// Stream every run that has no replica on `exclude_host`.
    async fn runs_needing_relocation(&self, exclude_host: &str) -> CoreResult<RunStream>;

    /// Uniform random sample of at most `count` runs with no replica on `exclude_host`.
    async fn sample_runs_needing_relocation(
        &self,
        exclude_host: &str,
        count: usize,
    ) -> CoreResult<Vec<Run>>;

    /// Look up a single run.
    async fn find_run_by_basename(&self, basename: &str) -> CoreResult<Option<Run>>;

    /// Record a new replica. Returns `false` when the `(host, path)` pair was
    /// already present.
    async fn add_location(&self, basename: &str, location: RawLocation) -> CoreResult<bool>;

    /// Every run, ordered by acquisition time.
    async fn list_runs(&self) -> CoreResult<Vec<Run>>;
}

/// Bucketed blob storage for raw inputs and processing outputs.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Download `bucket/key` to `dest`.
    async fn get(&self, bucket: &str, key: &str, dest: &Path) -> CoreResult<()>;

    /// Upload `src` to `bucket/key`.
    async fn put(&self, bucket: &str, key: &str, src: &Path) -> CoreResult<()>;

    /// Whether `bucket` exists.
    async fn bucket_exists(&self, bucket: &str) -> CoreResult<bool>;

    /// Create `bucket`.
    async fn make_bucket(&self, bucket: &str) -> CoreResult<()>;
}

/// Access to run archives on replica hosts.
#[async_trait]
pub trait ReplicaStore: Send + Sync {
    /// Copy the archive behind `location` into `dest_dir`, returning the local file.
    async fn fetch(&self, location: &RawLocation, dest_dir: &Path) -> CoreResult<PathBuf>;

    /// Store `src` on `host` under `key`, returning the path to record in the catalog.
    async fn store(&self, host: &Host, key: &str, src: &Path) -> CoreResult<String>;
}

/// External program that turns a dataset root into derived products.
#[async_trait]
pub trait ProcessingRuntime: Send + Sync {
    /// Version and provenance details written next to the outputs.
    fn metadata(&self) -> Value;

    /// Process `input_dir`, writing products into `output_dir`.
    async fn process(&self, input_dir: &Path, output_dir: &Path) -> CoreResult<()>;
}
