//! Structured log sink for task lifecycle events.
//!
//! # Design
//! - One background task per process drains the bus from the moment it is
//!   spawned; earlier events are not replayed.
//! - Failures and retries log at warn, everything else at info.
//! - The task ends when every publisher is gone and yields how many events it logged.

use covis_events::{Event, EventBus, EventEnvelope};
use tokio::task::JoinHandle;
use tracing::{info, warn};

/// Spawn a task that logs every event published on `bus`.
pub fn spawn_event_log(bus: &EventBus) -> JoinHandle<u64> {
    let mut stream = bus.subscribe(None);
    tokio::spawn(async move {
        let mut logged = 0;
        while let Some(envelope) = stream.next().await {
            log_event(&envelope);
            logged += 1;
        }
        logged
    })
}

fn log_event(envelope: &EventEnvelope) {
    let event_id = envelope.id;
    let kind = envelope.event.kind();
    let task_id = envelope.event.task_id();
    match &envelope.event {
        Event::TaskSent { task, queue, .. } => {
            info!(event_id, kind, %task_id, task = %task, queue = %queue, "task event");
        }
        Event::TaskStarted { task, delivery, .. } => {
            info!(event_id, kind, %task_id, task = %task, delivery, "task event");
        }
        Event::TaskSucceeded { task, .. } => {
            info!(event_id, kind, %task_id, task = %task, "task event");
        }
        Event::TaskFailed { task, message, .. } => {
            warn!(event_id, kind, %task_id, task = %task, error = %message, "task event");
        }
        Event::TaskRetried {
            task,
            delivery,
            message,
            ..
        } => {
            warn!(
                event_id,
                kind,
                %task_id,
                task = %task,
                delivery,
                error = %message,
                "task event"
            );
        }
    }
}
