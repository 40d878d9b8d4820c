//! Wire types exchanged with brokers and result backends.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Durable task message.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TaskMessage {
    /// Task identifier.
    pub id: Uuid,
    /// Registered task name.
    pub task: String,
    /// Positional arguments.
    pub args: Vec<Value>,
    /// Queue the message was routed to.
    pub queue: String,
    /// Publication time.
    pub sent_at: DateTime<Utc>,
}

impl TaskMessage {
    /// New message with a fresh identifier.
    #[must_use]
    pub fn new(task: impl Into<String>, args: Vec<Value>, queue: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            task: task.into(),
            args,
            queue: queue.into(),
            sent_at: Utc::now(),
        }
    }
}

/// A reserved message plus its lease.
#[derive(Debug, Clone, PartialEq)]
pub struct Delivery {
    /// The message.
    pub message: TaskMessage,
    /// Number of times the message has been reserved, including this one.
    pub delivery_count: u32,
    /// Lease token; acks and renewals with a stale token are ignored.
    pub lease: Uuid,
    /// Consumer holding the lease.
    pub consumer: String,
}

/// Terminal task status.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// The handler returned successfully.
    Succeeded,
    /// The handler failed and the message will not be redelivered.
    Failed,
}

impl TaskStatus {
    /// Stable lowercase tag.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
        }
    }
}

/// Result of a single task execution.
#[derive(Debug, Clone, PartialEq)]
pub enum TaskOutcome {
    /// Handler output.
    Succeeded(Value),
    /// Final failure description.
    Failed(String),
}

impl TaskOutcome {
    /// Status recorded for this outcome.
    #[must_use]
    pub const fn status(&self) -> TaskStatus {
        match self {
            Self::Succeeded(_) => TaskStatus::Succeeded,
            Self::Failed(_) => TaskStatus::Failed,
        }
    }
}

/// Stored task result.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TaskResult {
    /// Task identifier.
    pub id: Uuid,
    /// Registered task name.
    pub task: String,
    /// Terminal status.
    pub status: TaskStatus,
    /// Handler output on success.
    pub output: Option<Value>,
    /// Failure description.
    pub error: Option<String>,
    /// Completion time.
    pub finished_at: DateTime<Utc>,
}

impl TaskResult {
    /// Record `outcome` for `message`, finished now.
    #[must_use]
    pub fn from_outcome(message: &TaskMessage, outcome: &TaskOutcome) -> Self {
        let (output, error) = match outcome {
            TaskOutcome::Succeeded(value) => (Some(value.clone()), None),
            TaskOutcome::Failed(message) => (None, Some(message.clone())),
        };
        Self {
            id: message.id,
            task: message.task.clone(),
            status: outcome.status(),
            output,
            error,
            finished_at: Utc::now(),
        }
    }
}

/// Handle returned when a task is published.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskHandle {
    /// Task identifier.
    pub id: Uuid,
    /// Registered task name.
    pub task: String,
    /// Queue the message was routed to.
    pub queue: String,
}
