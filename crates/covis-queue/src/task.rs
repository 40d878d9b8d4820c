//! Task handlers and the name-keyed registry.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use covis_core::CoreError;
use serde_json::Value;
use thiserror::Error;
use uuid::Uuid;

/// Handler failure, classified for the redelivery policy.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TaskError {
    /// Retrying may succeed; the message is requeued while deliveries remain.
    #[error("transient task failure: {0}")]
    Transient(String),
    /// Retrying cannot succeed; the failure is recorded immediately.
    #[error("task failed: {0}")]
    Fatal(String),
}

impl TaskError {
    /// Whether the failure is eligible for redelivery.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_))
    }

    /// Failure description without the classification prefix.
    #[must_use]
    pub fn message(&self) -> &str {
        match self {
            Self::Transient(message) | Self::Fatal(message) => message,
        }
    }
}

impl From<CoreError> for TaskError {
    fn from(error: CoreError) -> Self {
        let message = error_chain(&error);
        if error.is_transient() {
            Self::Transient(message)
        } else {
            Self::Fatal(message)
        }
    }
}

fn error_chain(error: &(dyn std::error::Error + 'static)) -> String {
    let mut message = error.to_string();
    let mut source = error.source();
    while let Some(cause) = source {
        message.push_str(": ");
        message.push_str(&cause.to_string());
        source = cause.source();
    }
    message
}

/// Execution details passed to a handler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskContext {
    /// Task identifier.
    pub task_id: Uuid,
    /// Registered task name.
    pub task: String,
    /// Delivery attempt, starting at 1.
    pub delivery: u32,
}

/// Executes one registered task type.
#[async_trait]
pub trait TaskHandler: Send + Sync {
    /// Run the task with its positional arguments.
    async fn run(&self, context: &TaskContext, args: &[Value]) -> Result<Value, TaskError>;
}

/// Task name to handler table.
#[derive(Clone, Default)]
pub struct TaskRegistry {
    handlers: BTreeMap<String, Arc<dyn TaskHandler>>,
}

impl std::fmt::Debug for TaskRegistry {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter
            .debug_struct("TaskRegistry")
            .field("tasks", &self.handlers.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl TaskRegistry {
    /// Empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` under `task`, replacing any previous handler.
    #[must_use]
    pub fn with(mut self, task: impl Into<String>, handler: Arc<dyn TaskHandler>) -> Self {
        self.register(task, handler);
        self
    }

    /// Register `handler` under `task`, replacing any previous handler.
    pub fn register(&mut self, task: impl Into<String>, handler: Arc<dyn TaskHandler>) {
        self.handlers.insert(task.into(), handler);
    }

    /// Handler for `task`.
    #[must_use]
    pub fn get(&self, task: &str) -> Option<Arc<dyn TaskHandler>> {
        self.handlers.get(task).cloned()
    }

    /// Registered task names in sorted order.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.handlers.keys().map(String::as_str)
    }
}
