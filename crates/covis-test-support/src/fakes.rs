//! In-memory collaborators for unit and integration tests.
//!
//! Every fake is cheaply cloneable and shares its state between clones, so a
//! test can hand one clone to the code under test and inspect the other.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use covis_core::{
    Catalog, CoreError, CoreResult, Host, ObjectStore, ProcessingRuntime, RawLocation,
    ReplicaStore, Run, RunStream, needs_relocation,
};
use rand::seq::SliceRandom;
use serde_json::{Value, json};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Catalog backed by a vector of runs in insertion order.
#[derive(Debug, Clone, Default)]
pub struct MemoryCatalog {
    runs: Arc<Mutex<Vec<Run>>>,
    queries: Arc<AtomicUsize>,
}

impl MemoryCatalog {
    /// Empty catalog.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Catalog seeded with `runs`.
    #[must_use]
    pub fn with_runs(runs: impl IntoIterator<Item = Run>) -> Self {
        let catalog = Self::new();
        lock(&catalog.runs).extend(runs);
        catalog
    }

    /// Snapshot of a run.
    #[must_use]
    pub fn run(&self, basename: &str) -> Option<Run> {
        lock(&self.runs)
            .iter()
            .find(|run| run.basename == basename)
            .cloned()
    }

    /// Number of catalog calls made so far.
    #[must_use]
    pub fn query_count(&self) -> usize {
        self.queries.load(Ordering::SeqCst)
    }

    fn touch(&self) {
        self.queries.fetch_add(1, Ordering::SeqCst);
    }

    fn needing(&self, exclude_host: &str) -> Vec<Run> {
        lock(&self.runs)
            .iter()
            .filter(|run| needs_relocation(&run.raw, exclude_host))
            .cloned()
            .collect()
    }
}

#[async_trait]
impl Catalog for MemoryCatalog {
    async fn runs_needing_relocation(&self, exclude_host: &str) -> CoreResult<RunStream> {
        self.touch();
        let runs = self.needing(exclude_host);
        Ok(Box::pin(tokio_stream::iter(
            runs.into_iter().map(Ok::<Run, CoreError>),
        )))
    }

    async fn sample_runs_needing_relocation(
        &self,
        exclude_host: &str,
        count: usize,
    ) -> CoreResult<Vec<Run>> {
        self.touch();
        let mut runs = self.needing(exclude_host);
        runs.shuffle(&mut rand::rng());
        runs.truncate(count);
        Ok(runs)
    }

    async fn find_run_by_basename(&self, basename: &str) -> CoreResult<Option<Run>> {
        self.touch();
        Ok(self.run(basename))
    }

    async fn add_location(&self, basename: &str, location: RawLocation) -> CoreResult<bool> {
        self.touch();
        let mut runs = lock(&self.runs);
        let run = runs
            .iter_mut()
            .find(|run| run.basename == basename)
            .ok_or_else(|| CoreError::RunNotFound {
                basename: basename.to_string(),
            })?;
        Ok(run.push_location(location))
    }

    async fn list_runs(&self) -> CoreResult<Vec<Run>> {
        self.touch();
        let mut runs = lock(&self.runs).clone();
        runs.sort_by_key(|run| run.datetime);
        Ok(runs)
    }
}

/// Object store holding blobs keyed by `(bucket, key)`.
#[derive(Debug, Clone, Default)]
pub struct MemoryObjectStore {
    objects: Arc<Mutex<HashMap<(String, String), Vec<u8>>>>,
    buckets: Arc<Mutex<HashSet<String>>>,
}

impl MemoryObjectStore {
    /// Empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed an object from a local file, creating the bucket.
    ///
    /// # Errors
    ///
    /// Returns an error when `src` cannot be read.
    pub fn insert_file(&self, bucket: &str, key: &str, src: &Path) -> std::io::Result<()> {
        let bytes = std::fs::read(src)?;
        lock(&self.buckets).insert(bucket.to_string());
        lock(&self.objects).insert((bucket.to_string(), key.to_string()), bytes);
        Ok(())
    }

    /// Sorted keys stored in `bucket`.
    #[must_use]
    pub fn keys(&self, bucket: &str) -> Vec<String> {
        let mut keys: Vec<String> = lock(&self.objects)
            .keys()
            .filter(|(stored, _)| stored == bucket)
            .map(|(_, key)| key.clone())
            .collect();
        keys.sort();
        keys
    }

    /// Contents of `bucket/key`.
    #[must_use]
    pub fn object(&self, bucket: &str, key: &str) -> Option<Vec<u8>> {
        lock(&self.objects)
            .get(&(bucket.to_string(), key.to_string()))
            .cloned()
    }
}

#[async_trait]
impl ObjectStore for MemoryObjectStore {
    async fn get(&self, bucket: &str, key: &str, dest: &Path) -> CoreResult<()> {
        let bytes = self
            .object(bucket, key)
            .ok_or_else(|| CoreError::collaborator("object_store.get", "object not found"))?;
        tokio::fs::write(dest, bytes)
            .await
            .map_err(|err| CoreError::collaborator("object_store.get", err))
    }

    async fn put(&self, bucket: &str, key: &str, src: &Path) -> CoreResult<()> {
        if !lock(&self.buckets).contains(bucket) {
            return Err(CoreError::collaborator("object_store.put", "bucket missing"));
        }
        let bytes = tokio::fs::read(src)
            .await
            .map_err(|err| CoreError::collaborator("object_store.put", err))?;
        lock(&self.objects).insert((bucket.to_string(), key.to_string()), bytes);
        Ok(())
    }

    async fn bucket_exists(&self, bucket: &str) -> CoreResult<bool> {
        Ok(lock(&self.buckets).contains(bucket))
    }

    async fn make_bucket(&self, bucket: &str) -> CoreResult<()> {
        lock(&self.buckets).insert(bucket.to_string());
        Ok(())
    }
}

/// Replica hosts holding archives keyed by `(host, path)`.
#[derive(Debug, Clone, Default)]
pub struct MemoryReplicaStore {
    archives: Arc<Mutex<HashMap<(String, String), Vec<u8>>>>,
    transient_failures: Arc<AtomicUsize>,
    fetches: Arc<AtomicUsize>,
    stores: Arc<AtomicUsize>,
}

impl MemoryReplicaStore {
    /// Empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed an archive from a local file.
    ///
    /// # Errors
    ///
    /// Returns an error when `src` cannot be read.
    pub fn insert_file(&self, host: &str, path: &str, src: &Path) -> std::io::Result<()> {
        let bytes = std::fs::read(src)?;
        lock(&self.archives).insert((host.to_string(), path.to_string()), bytes);
        Ok(())
    }

    /// Make the next `count` fetches fail with a transient error.
    pub fn fail_next_fetches(&self, count: usize) {
        self.transient_failures.store(count, Ordering::SeqCst);
    }

    /// Whether `host` holds `path`.
    #[must_use]
    pub fn contains(&self, host: &str, path: &str) -> bool {
        lock(&self.archives).contains_key(&(host.to_string(), path.to_string()))
    }

    /// Archive bytes stored at `(host, path)`.
    #[must_use]
    pub fn archive(&self, host: &str, path: &str) -> Option<Vec<u8>> {
        lock(&self.archives)
            .get(&(host.to_string(), path.to_string()))
            .cloned()
    }

    /// Paths stored on `host`, sorted.
    #[must_use]
    pub fn paths(&self, host: &str) -> Vec<String> {
        let mut paths: Vec<String> = lock(&self.archives)
            .keys()
            .filter(|(stored, _)| stored == host)
            .map(|(_, path)| path.clone())
            .collect();
        paths.sort();
        paths
    }

    /// Number of fetch calls.
    #[must_use]
    pub fn fetch_count(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }

    /// Number of store calls.
    #[must_use]
    pub fn store_count(&self) -> usize {
        self.stores.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ReplicaStore for MemoryReplicaStore {
    async fn fetch(&self, location: &RawLocation, dest_dir: &Path) -> CoreResult<PathBuf> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        let pending = self.transient_failures.load(Ordering::SeqCst);
        if pending > 0 {
            self.transient_failures.store(pending - 1, Ordering::SeqCst);
            return Err(CoreError::transient("replica.fetch", "connection reset"));
        }
        let bytes = lock(&self.archives)
            .get(&(location.host.clone(), location.path.clone()))
            .cloned()
            .ok_or_else(|| CoreError::collaborator("replica.fetch", "archive not found"))?;
        let file_name = Path::new(&location.path)
            .file_name()
            .map_or_else(|| PathBuf::from("archive"), PathBuf::from);
        let dest = dest_dir.join(file_name);
        tokio::fs::write(&dest, bytes)
            .await
            .map_err(|err| CoreError::collaborator("replica.fetch", err))?;
        Ok(dest)
    }

    async fn store(&self, host: &Host, key: &str, src: &Path) -> CoreResult<String> {
        self.stores.fetch_add(1, Ordering::SeqCst);
        let bytes = tokio::fs::read(src)
            .await
            .map_err(|err| CoreError::collaborator("replica.store", err))?;
        lock(&self.archives).insert((host.name().to_string(), key.to_string()), bytes);
        Ok(key.to_string())
    }
}

/// Processing runtime that lists its input into `summary.txt`.
#[derive(Debug, Clone, Default)]
pub struct FakeRuntime {
    calls: Arc<Mutex<Vec<PathBuf>>>,
    order: Arc<Mutex<Vec<&'static str>>>,
    fail: bool,
}

impl FakeRuntime {
    /// Runtime that succeeds.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Runtime whose every call fails.
    #[must_use]
    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Self::default()
        }
    }

    /// Input directories processed so far.
    #[must_use]
    pub fn calls(&self) -> Vec<PathBuf> {
        lock(&self.calls).clone()
    }

    /// Trait methods in the order they were called.
    #[must_use]
    pub fn call_order(&self) -> Vec<&'static str> {
        lock(&self.order).clone()
    }
}

#[async_trait]
impl ProcessingRuntime for FakeRuntime {
    fn metadata(&self) -> Value {
        lock(&self.order).push("metadata");
        json!({ "runtime": "fake", "version": "0.0.0" })
    }

    async fn process(&self, input_dir: &Path, output_dir: &Path) -> CoreResult<()> {
        lock(&self.order).push("process");
        lock(&self.calls).push(input_dir.to_path_buf());
        if self.fail {
            return Err(CoreError::collaborator("runtime.process", "fake runtime failure"));
        }
        let mut listing = Vec::new();
        let mut entries = tokio::fs::read_dir(input_dir)
            .await
            .map_err(|err| CoreError::collaborator("runtime.process", err))?;
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|err| CoreError::collaborator("runtime.process", err))?
        {
            listing.push(entry.file_name().to_string_lossy().into_owned());
        }
        listing.sort();
        tokio::fs::create_dir_all(output_dir)
            .await
            .map_err(|err| CoreError::collaborator("runtime.process", err))?;
        tokio::fs::write(output_dir.join("summary.txt"), listing.join("\n"))
            .await
            .map_err(|err| CoreError::collaborator("runtime.process", err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixtures::sample_run;
    use tokio_stream::StreamExt;

    #[tokio::test]
    async fn catalog_filters_runs_already_on_destination() -> CoreResult<()> {
        let catalog = MemoryCatalog::with_runs([
            sample_run("A", &["COVIS-NAS"]),
            sample_run("B", &["DMAS"]),
        ]);
        let mut stream = catalog.runs_needing_relocation("COVIS-NAS").await?;
        let mut names = Vec::new();
        while let Some(run) = stream.next().await {
            names.push(run?.basename);
        }
        assert_eq!(names, vec!["B"]);
        assert_eq!(catalog.query_count(), 1);
        Ok(())
    }

    #[tokio::test]
    async fn add_location_ignores_duplicates() -> CoreResult<()> {
        let catalog = MemoryCatalog::with_runs([sample_run("B", &["DMAS"])]);
        let location = RawLocation::new("COVIS-NAS", "2019/01/01/B.tar.gz", Default::default());
        assert!(catalog.add_location("B", location.clone()).await?);
        assert!(!catalog.add_location("B", location).await?);
        assert_eq!(catalog.run("B").map(|run| run.raw.len()), Some(2));
        Ok(())
    }
}
