//! `postprocess.process`: materialise an input, run the processing runtime,
//! and publish its outputs.
//!
//! # Design
//! - Inputs and outputs live in a fresh scratch directory per delivery; the
//!   catalog is never mutated, so repeating the task only rewrites the same keys.
//! - `metadata.json` from the runtime is written beside the outputs before
//!   anything is published.
//! - Object-store keys are `<prefix>/<YYYY>/<MM>/<DD>/<basename>/<file>` when
//!   the run date is known and `<prefix>/<basename>/<file>` otherwise.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use covis_core::{
    CoreError, CoreResult, InputReference, JobArgs, ObjectStore, OutputTarget, ProcessingRuntime,
};
use covis_fsops::{InputResolver, ResolvedInput};
use covis_queue::{TaskContext, TaskError, TaskHandler};
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, info, instrument};
use walkdir::WalkDir;

use crate::tasks::{date_path, decode, scratch_dir};

const METADATA_FILE: &str = "metadata.json";
const OUTPUT_STORE_KEY: &str = "OUTPUT_S3_HOST";

/// Result reported by a processing task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProcessOutcome {
    /// Basename the outputs were published under.
    pub basename: String,
    /// Published files: object keys, or paths for local output.
    pub outputs: Vec<String>,
}

/// Handler for processing tasks.
#[derive(Clone)]
pub struct ProcessHandler {
    inputs: InputResolver,
    runtime: Arc<dyn ProcessingRuntime>,
    output_store: Option<Arc<dyn ObjectStore>>,
    work_dir: Option<PathBuf>,
}

impl std::fmt::Debug for ProcessHandler {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter
            .debug_struct("ProcessHandler")
            .field("inputs", &self.inputs)
            .field("output_store", &self.output_store.is_some())
            .field("work_dir", &self.work_dir)
            .finish_non_exhaustive()
    }
}

impl ProcessHandler {
    /// Handler over explicit collaborators. `output_store` is `None` when no
    /// output object store is configured.
    #[must_use]
    pub fn new(
        inputs: InputResolver,
        runtime: Arc<dyn ProcessingRuntime>,
        output_store: Option<Arc<dyn ObjectStore>>,
    ) -> Self {
        Self {
            inputs,
            runtime,
            output_store,
            work_dir: None,
        }
    }

    /// Create scratch directories below `dir` instead of the system temp dir.
    #[must_use]
    pub fn with_work_dir(mut self, dir: Option<PathBuf>) -> Self {
        self.work_dir = dir;
        self
    }

    /// Process `input` and publish the results to `output`.
    ///
    /// # Errors
    ///
    /// Returns input resolution, runtime, and publication failures; an
    /// object-store target without a configured store is a configuration error.
    #[instrument(
        name = "task.process",
        skip(self, input, output),
        fields(input = %input, output = %output)
    )]
    pub async fn process(
        &self,
        input: &InputReference,
        output: &OutputTarget,
    ) -> CoreResult<ProcessOutcome> {
        let output_store = match output {
            OutputTarget::ObjectStore { .. } => Some(self.output_store.as_ref().ok_or_else(
                || CoreError::Configuration {
                    key: OUTPUT_STORE_KEY.to_string(),
                },
            )?),
            OutputTarget::Local { .. } => None,
        };

        let scratch = scratch_dir(self.work_dir.as_deref())?;
        let resolved = self.inputs.resolve(input, scratch.path()).await?;
        let out_dir = scratch.path().join("output");
        tokio::fs::create_dir_all(&out_dir)
            .await
            .map_err(|err| CoreError::collaborator("process.output_dir", err))?;

        write_metadata(&out_dir, &self.runtime.metadata()).await?;
        self.runtime.process(&resolved.root, &out_dir).await?;
        let files = output_files(&out_dir)?;
        let basename = resolved.basename();
        info!(basename = %basename, files = files.len(), "processing finished");

        let outputs = match (output, output_store) {
            (OutputTarget::ObjectStore { bucket, prefix }, Some(store)) => {
                upload(store.as_ref(), bucket, prefix, &resolved, &out_dir, &files).await?
            }
            (OutputTarget::Local { path }, _) => copy_local(&out_dir, path, &files).await?,
            (OutputTarget::ObjectStore { .. }, None) => {
                return Err(CoreError::Configuration {
                    key: OUTPUT_STORE_KEY.to_string(),
                });
            }
        };
        Ok(ProcessOutcome { basename, outputs })
    }
}

#[async_trait]
impl TaskHandler for ProcessHandler {
    async fn run(&self, context: &TaskContext, args: &[Value]) -> Result<Value, TaskError> {
        let JobArgs::Process { input, output } = decode(context, args)? else {
            return Err(TaskError::Fatal(format!(
                "{} received non-processing arguments",
                context.task
            )));
        };
        let outcome = self.process(&input, &output).await?;
        serde_json::to_value(outcome).map_err(|err| TaskError::Fatal(err.to_string()))
    }
}

/// Object key for one output file.
#[must_use]
pub fn output_key(prefix: &str, resolved: &ResolvedInput, file: &str) -> String {
    let basename = resolved.basename();
    let mut segments: Vec<String> = Vec::new();
    let prefix = prefix.trim_matches('/');
    if !prefix.is_empty() {
        segments.push(prefix.to_string());
    }
    if let Some(run) = &resolved.run {
        segments.push(date_path(run.datetime));
    }
    segments.push(basename);
    segments.push(file.to_string());
    segments.join("/")
}

async fn write_metadata(out_dir: &Path, metadata: &Value) -> CoreResult<()> {
    let bytes = serde_json::to_vec_pretty(metadata)
        .map_err(|err| CoreError::collaborator("process.metadata", err))?;
    tokio::fs::write(out_dir.join(METADATA_FILE), bytes)
        .await
        .map_err(|err| CoreError::collaborator("process.metadata", err))
}

/// Files below `out_dir` as sorted `/`-separated relative paths.
fn output_files(out_dir: &Path) -> CoreResult<Vec<String>> {
    let mut files = Vec::new();
    for entry in WalkDir::new(out_dir).sort_by_file_name() {
        let entry = entry.map_err(|err| CoreError::collaborator("process.walk", err))?;
        if !entry.file_type().is_file() {
            continue;
        }
        let relative = entry
            .path()
            .strip_prefix(out_dir)
            .map_err(|err| CoreError::collaborator("process.walk", err))?;
        let segments: Vec<String> = relative
            .components()
            .map(|part| part.as_os_str().to_string_lossy().into_owned())
            .collect();
        files.push(segments.join("/"));
    }
    Ok(files)
}

async fn upload(
    store: &dyn ObjectStore,
    bucket: &str,
    prefix: &str,
    resolved: &ResolvedInput,
    out_dir: &Path,
    files: &[String],
) -> CoreResult<Vec<String>> {
    if !store.bucket_exists(bucket).await? {
        info!(bucket, "creating output bucket");
        store.make_bucket(bucket).await?;
    }
    let mut keys = Vec::with_capacity(files.len());
    for file in files {
        let key = output_key(prefix, resolved, file);
        store.put(bucket, &key, &out_dir.join(file)).await?;
        debug!(bucket, key = %key, "uploaded output");
        keys.push(key);
    }
    info!(bucket, uploaded = keys.len(), "outputs uploaded");
    Ok(keys)
}

async fn copy_local(out_dir: &Path, target: &Path, files: &[String]) -> CoreResult<Vec<String>> {
    let mut written = Vec::with_capacity(files.len());
    for file in files {
        let dest = target.join(file);
        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|err| CoreError::collaborator("process.copy", err))?;
        }
        tokio::fs::copy(out_dir.join(file), &dest)
            .await
            .map_err(|err| CoreError::collaborator("process.copy", err))?;
        written.push(dest.display().to_string());
    }
    info!(target = %target.display(), copied = written.len(), "outputs copied");
    Ok(written)
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Result;
    use covis_core::{ArchiveFormat, LocationResolver, RawLocation, Run};
    use covis_test_support::fixtures::{day, write_tar_gz};
    use covis_test_support::{FakeRuntime, MemoryCatalog, MemoryObjectStore, MemoryReplicaStore};

    type TestResult<T> = Result<T>;

    const FILES: &[(&str, &[u8])] = &[("dataset/", b""), ("dataset/ping.bin", b"ping")];

    struct Fixture {
        handler: ProcessHandler,
        runtime: FakeRuntime,
        raw: MemoryObjectStore,
        output: MemoryObjectStore,
        _archives: tempfile::TempDir,
    }

    fn fixture(runtime: FakeRuntime) -> TestResult<Fixture> {
        let archives = tempfile::tempdir()?;
        let archive = archives.path().join("B.tar.gz");
        write_tar_gz(&archive, FILES)?;

        let mut run = Run::new("B", day(2019, 1, 1));
        run.push_location(RawLocation::new("DMAS", "B.tar.gz", ArchiveFormat::TarGz));
        let replicas = MemoryReplicaStore::new();
        replicas.insert_file("DMAS", "B.tar.gz", &archive)?;
        let raw = MemoryObjectStore::new();
        raw.insert_file("raw", "2019/B.tar.gz", &archive)?;
        let output = MemoryObjectStore::new();

        let inputs = InputResolver::new(
            Arc::new(MemoryCatalog::with_runs([run])),
            Arc::new(replicas),
            Some(Arc::new(raw.clone())),
            LocationResolver::new(),
        );
        let handler = ProcessHandler::new(
            inputs,
            Arc::new(runtime.clone()),
            Some(Arc::new(output.clone())),
        );
        Ok(Fixture {
            handler,
            runtime,
            raw,
            output,
            _archives: archives,
        })
    }

    #[tokio::test]
    async fn catalog_inputs_upload_under_dated_keys() -> TestResult<()> {
        let fixture = fixture(FakeRuntime::new())?;
        let outcome = fixture
            .handler
            .process(&"db://B".parse()?, &"s3://products/covis".parse()?)
            .await?;

        assert_eq!(outcome.basename, "B");
        let keys = fixture.output.keys("products");
        assert!(keys.contains(&"covis/2019/01/01/B/metadata.json".to_string()));
        assert_eq!(keys, outcome.outputs);
        assert!(keys.iter().all(|key| key.starts_with("covis/2019/01/01/B/")));

        let metadata = fixture
            .output
            .object("products", "covis/2019/01/01/B/metadata.json")
            .ok_or_else(|| anyhow::anyhow!("metadata uploaded"))?;
        let metadata: Value = serde_json::from_slice(&metadata)?;
        assert_eq!(metadata["runtime"], "fake");

        let calls = fixture.runtime.calls();
        assert_eq!(calls.len(), 1);
        assert!(calls[0].ends_with("dataset"));
        assert!(!calls[0].exists());
        Ok(())
    }

    #[tokio::test]
    async fn object_store_inputs_use_the_dataset_name_without_date() -> TestResult<()> {
        let fixture = fixture(FakeRuntime::new())?;
        assert_eq!(fixture.raw.keys("raw"), vec!["2019/B.tar.gz"]);
        let outcome = fixture
            .handler
            .process(&"s3://raw/2019/B.tar.gz".parse()?, &"s3://products".parse()?)
            .await?;
        assert_eq!(outcome.basename, "dataset");
        assert!(
            outcome
                .outputs
                .contains(&"dataset/metadata.json".to_string())
        );
        Ok(())
    }

    #[tokio::test]
    async fn local_outputs_are_copied_into_the_target() -> TestResult<()> {
        let fixture = fixture(FakeRuntime::new())?;
        let target = tempfile::tempdir()?;
        let output = OutputTarget::Local {
            path: target.path().join("out"),
        };
        let outcome = fixture.handler.process(&"db://B".parse()?, &output).await?;
        assert!(!outcome.outputs.is_empty());
        assert!(target.path().join("out").join(METADATA_FILE).is_file());
        assert!(fixture.output.keys("products").is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn object_store_output_without_store_is_a_configuration_error() -> TestResult<()> {
        let fixture = fixture(FakeRuntime::new())?;
        let handler = ProcessHandler {
            output_store: None,
            ..fixture.handler
        };
        let err = handler
            .process(&"db://B".parse()?, &"s3://products".parse()?)
            .await
            .err();
        assert!(matches!(
            err,
            Some(CoreError::Configuration { ref key }) if key == "OUTPUT_S3_HOST"
        ));
        assert!(fixture.runtime.calls().is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn metadata_is_taken_before_the_runtime_runs() -> TestResult<()> {
        let fixture = fixture(FakeRuntime::new())?;
        let outcome = fixture
            .handler
            .process(&"db://B".parse()?, &"s3://products".parse()?)
            .await?;
        assert_eq!(fixture.runtime.call_order(), vec!["metadata", "process"]);
        assert!(outcome.outputs.iter().any(|key| key.ends_with(METADATA_FILE)));
        Ok(())
    }

    #[tokio::test]
    async fn runtime_failures_are_fatal_task_errors() -> TestResult<()> {
        let fixture = fixture(FakeRuntime::failing())?;
        let context = TaskContext {
            task_id: uuid::Uuid::new_v4(),
            task: "postprocess.process".to_string(),
            delivery: 1,
        };
        let err = fixture
            .handler
            .run(&context, &[Value::from("db://B"), Value::from("s3://products")])
            .await
            .err();
        assert!(matches!(err, Some(TaskError::Fatal(_))));
        assert!(fixture.output.keys("products").is_empty());
        Ok(())
    }
}
