//! Handlers for the two registered task types.
//!
//! # Design
//! - Handlers decode positional wire arguments back into a [`Job`] and reject
//!   anything that does not match their task type.
//! - Every handler works inside its own `TempDir`, dropped on every exit path.
//! - Collaborator errors become [`TaskError`]s through `CoreError`, which keeps
//!   transient failures eligible for redelivery.

pub mod process;
pub mod relocate;

use std::path::Path;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use covis_core::{CoreError, CoreResult, Job, JobArgs, TaskKind};
use covis_queue::{TaskContext, TaskError, TaskRegistry};
use serde_json::Value;
use tempfile::TempDir;

pub use process::{ProcessHandler, ProcessOutcome};
pub use relocate::{RelocateHandler, RelocationOutcome};

/// Registry with the relocation handler and, when a runtime is available, the
/// processing handler.
#[must_use]
pub fn task_registry(relocate: RelocateHandler, process: Option<ProcessHandler>) -> TaskRegistry {
    let mut registry =
        TaskRegistry::new().with(TaskKind::Relocate.task_name(), Arc::new(relocate));
    if let Some(process) = process {
        registry.register(TaskKind::Process.task_name(), Arc::new(process));
    }
    registry
}

pub(crate) fn decode(context: &TaskContext, args: &[Value]) -> Result<JobArgs, TaskError> {
    Ok(Job::from_positional(&context.task, args)?.args)
}

pub(crate) fn scratch_dir(work_dir: Option<&Path>) -> CoreResult<TempDir> {
    let builder = {
        let mut builder = tempfile::Builder::new();
        builder.prefix("covis-");
        builder
    };
    match work_dir {
        Some(dir) => builder.tempdir_in(dir),
        None => builder.tempdir(),
    }
    .map_err(|err| CoreError::collaborator("task.tempdir", err))
}

/// `YYYY/MM/DD` path segment for a run recorded at `datetime`.
pub(crate) fn date_path(datetime: DateTime<Utc>) -> String {
    datetime.format("%Y/%m/%d").to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use covis_test_support::fixtures::day;

    #[test]
    fn date_path_is_zero_padded() {
        assert_eq!(date_path(day(2019, 1, 1)), "2019/01/01");
        assert_eq!(date_path(day(2021, 11, 23)), "2021/11/23");
    }

    #[test]
    fn mismatched_arguments_are_fatal() {
        let context = TaskContext {
            task_id: uuid::Uuid::new_v4(),
            task: TaskKind::Relocate.task_name().to_string(),
            delivery: 1,
        };
        let err = decode(&context, &[Value::from("B")]).err();
        assert!(matches!(err, Some(TaskError::Fatal(_))));
    }
}
