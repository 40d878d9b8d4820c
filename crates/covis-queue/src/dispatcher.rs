//! Publishing and in-process execution of tasks.

use std::sync::Arc;

use covis_core::Job;
use covis_events::{Event, EventBus};
use covis_telemetry::Metrics;
use serde_json::Value;
use tracing::{info, warn};
use uuid::Uuid;

use crate::broker::Broker;
use crate::config::QueueConfig;
use crate::error::{QueueError, QueueResult};
use crate::message::{TaskHandle, TaskMessage, TaskOutcome, TaskResult};
use crate::results::ResultBackend;
use crate::task::{TaskContext, TaskError, TaskRegistry};

/// Routes jobs onto the broker, or runs them in-process.
#[derive(Clone)]
pub struct TaskDispatcher {
    config: Arc<QueueConfig>,
    broker: Arc<dyn Broker>,
    results: Arc<dyn ResultBackend>,
    registry: Arc<TaskRegistry>,
    events: EventBus,
    metrics: Option<Metrics>,
}

impl std::fmt::Debug for TaskDispatcher {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter
            .debug_struct("TaskDispatcher")
            .field("config", &self.config)
            .field("registry", &self.registry)
            .finish_non_exhaustive()
    }
}

impl TaskDispatcher {
    /// Dispatcher over explicit collaborators.
    #[must_use]
    pub fn new(
        config: QueueConfig,
        broker: Arc<dyn Broker>,
        results: Arc<dyn ResultBackend>,
        registry: TaskRegistry,
    ) -> Self {
        Self {
            config: Arc::new(config),
            broker,
            results,
            registry: Arc::new(registry),
            events: EventBus::new(),
            metrics: None,
        }
    }

    /// Publish task events on `events`.
    #[must_use]
    pub fn with_events(mut self, events: EventBus) -> Self {
        self.events = events;
        self
    }

    /// Record counters in `metrics`.
    #[must_use]
    pub fn with_metrics(mut self, metrics: Metrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Queue configuration.
    #[must_use]
    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    /// Event bus receiving task events.
    #[must_use]
    pub const fn events(&self) -> &EventBus {
        &self.events
    }

    pub(crate) fn broker(&self) -> &Arc<dyn Broker> {
        &self.broker
    }

    pub(crate) const fn metrics(&self) -> Option<&Metrics> {
        self.metrics.as_ref()
    }

    /// Publish `job` to the queue its task name routes to.
    ///
    /// # Errors
    ///
    /// Returns an error when the broker rejects the message.
    pub async fn submit(&self, job: &Job) -> QueueResult<TaskHandle> {
        self.send(job.kind.task_name(), job.positional_args()).await
    }

    /// Publish a task by name with raw positional arguments.
    ///
    /// # Errors
    ///
    /// Returns an error when the broker rejects the message.
    pub async fn send(&self, task: &str, args: Vec<Value>) -> QueueResult<TaskHandle> {
        let queue = self.config.routes.queue_for(task).to_string();
        let message = TaskMessage::new(task, args, queue.clone());
        self.broker.publish(&message).await?;

        if let Some(metrics) = &self.metrics {
            metrics.inc_task_submitted(task, &queue);
        }
        if self.config.send_sent_event {
            self.events.publish(Event::TaskSent {
                task_id: message.id,
                task: task.to_string(),
                queue: queue.clone(),
            });
        }
        info!(task_id = %message.id, task, queue = %queue, "task submitted");
        Ok(TaskHandle {
            id: message.id,
            task: task.to_string(),
            queue,
        })
    }

    /// Run `job` in this process, bypassing the broker, and record its result.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::UnknownTask`] when no handler is registered, or a
    /// backend error when the result cannot be stored.
    pub async fn submit_local(&self, job: &Job) -> QueueResult<TaskOutcome> {
        let task = job.kind.task_name();
        if self.registry.get(task).is_none() {
            return Err(QueueError::UnknownTask {
                task: task.to_string(),
            });
        }
        let queue = self.config.routes.queue_for(task).to_string();
        let message = TaskMessage::new(task, job.positional_args(), queue.clone());
        if let Some(metrics) = &self.metrics {
            metrics.inc_task_submitted(task, &queue);
        }
        info!(task_id = %message.id, task, "running task locally");

        let outcome = match self.execute(&message, 1).await {
            Ok(output) => TaskOutcome::Succeeded(output),
            Err(err) => TaskOutcome::Failed(err.message().to_string()),
        };
        self.finish(&message, &outcome).await?;
        Ok(outcome)
    }

    /// Stored result for `id`, if still retained.
    ///
    /// # Errors
    ///
    /// Returns a backend error when the lookup fails.
    pub async fn result(&self, id: Uuid) -> QueueResult<Option<TaskResult>> {
        self.results.fetch(id).await
    }

    /// Drop results older than the retention window.
    ///
    /// # Errors
    ///
    /// Returns a backend error when the purge fails.
    pub async fn purge_results(&self) -> QueueResult<usize> {
        let removed = self.results.purge_expired().await?;
        if removed > 0 {
            info!(removed, "purged expired task results");
        }
        Ok(removed)
    }

    pub(crate) async fn execute(
        &self,
        message: &TaskMessage,
        delivery: u32,
    ) -> Result<Value, TaskError> {
        let Some(handler) = self.registry.get(&message.task) else {
            return Err(TaskError::Fatal(format!(
                "no handler registered for {}",
                message.task
            )));
        };
        let context = TaskContext {
            task_id: message.id,
            task: message.task.clone(),
            delivery,
        };
        if self.config.worker_send_task_events {
            self.events.publish(Event::TaskStarted {
                task_id: message.id,
                task: message.task.clone(),
                delivery,
            });
        }
        handler.run(&context, &message.args).await
    }

    /// Store the terminal result and emit the matching event.
    pub(crate) async fn finish(
        &self,
        message: &TaskMessage,
        outcome: &TaskOutcome,
    ) -> QueueResult<()> {
        let result = TaskResult::from_outcome(message, outcome);
        self.results.store(&result).await?;
        if let Some(metrics) = &self.metrics {
            metrics.inc_task_outcome(&message.task, result.status.as_str());
        }
        match outcome {
            TaskOutcome::Succeeded(_) => {
                info!(task_id = %message.id, task = %message.task, "task succeeded");
                if self.config.worker_send_task_events {
                    self.events.publish(Event::TaskSucceeded {
                        task_id: message.id,
                        task: message.task.clone(),
                    });
                }
            }
            TaskOutcome::Failed(error) => {
                warn!(task_id = %message.id, task = %message.task, error = %error, "task failed");
                if self.config.worker_send_task_events {
                    self.events.publish(Event::TaskFailed {
                        task_id: message.id,
                        task: message.task.clone(),
                        message: error.clone(),
                    });
                }
            }
        }
        Ok(())
    }

    /// Record a requeue after a transient failure.
    pub(crate) fn retried(&self, message: &TaskMessage, delivery: u32, error: &str) {
        warn!(
            task_id = %message.id,
            task = %message.task,
            delivery,
            error,
            "transient failure, task requeued"
        );
        if let Some(metrics) = &self.metrics {
            metrics.inc_redelivery();
        }
        if self.config.worker_send_task_events {
            self.events.publish(Event::TaskRetried {
                task_id: message.id,
                task: message.task.clone(),
                delivery,
                message: error.to_string(),
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::MemoryBroker;
    use crate::results::MemoryResultBackend;
    use crate::task::TaskHandler;
    use anyhow::Context;
    use async_trait::async_trait;
    use serde_json::json;
    use std::time::Duration;

    type TestResult<T> = anyhow::Result<T>;

    struct Echo;

    #[async_trait]
    impl TaskHandler for Echo {
        async fn run(&self, _context: &TaskContext, args: &[Value]) -> Result<Value, TaskError> {
            Ok(Value::Array(args.to_vec()))
        }
    }

    fn dispatcher(broker: Arc<MemoryBroker>, results: Arc<MemoryResultBackend>) -> TaskDispatcher {
        TaskDispatcher::new(
            QueueConfig::default(),
            broker,
            results,
            TaskRegistry::new().with("relocation.relocate", Arc::new(Echo)),
        )
    }

    #[tokio::test]
    async fn submit_routes_and_emits_sent_event() -> TestResult<()> {
        let broker = Arc::new(MemoryBroker::new());
        let results = Arc::new(MemoryResultBackend::new(Duration::from_secs(60)));
        let metrics = Metrics::new()?;
        let dispatcher = dispatcher(broker.clone(), results).with_metrics(metrics.clone());

        let handle = dispatcher.submit(&Job::relocate("B", "COVIS-NAS")).await?;
        assert_eq!(handle.queue, "relocate");
        assert_eq!(handle.task, "relocation.relocate");
        assert_eq!(broker.pending("relocate"), 1);

        let sent = broker.messages().pop().context("message published")?;
        assert_eq!(sent.args, vec![json!("B"), json!("COVIS-NAS")]);

        let events = dispatcher.events().recent();
        assert!(matches!(
            events.first().map(|envelope| &envelope.event),
            Some(Event::TaskSent { task_id, .. }) if *task_id == handle.id
        ));
        assert_eq!(metrics.snapshot().tasks_submitted_total, 1);
        Ok(())
    }

    #[tokio::test]
    async fn submit_local_bypasses_broker_and_stores_result() -> TestResult<()> {
        let broker = Arc::new(MemoryBroker::new());
        let results = Arc::new(MemoryResultBackend::new(Duration::from_secs(60)));
        let dispatcher = dispatcher(broker.clone(), results.clone());

        let outcome = dispatcher
            .submit_local(&Job::relocate("B", "COVIS-NAS"))
            .await?;
        assert_eq!(outcome, TaskOutcome::Succeeded(json!(["B", "COVIS-NAS"])));
        assert_eq!(broker.outstanding(), 0);
        assert_eq!(results.all().len(), 1);
        Ok(())
    }

    #[tokio::test]
    async fn submit_local_requires_registered_handler() -> TestResult<()> {
        let dispatcher = dispatcher(
            Arc::new(MemoryBroker::new()),
            Arc::new(MemoryResultBackend::new(Duration::from_secs(60))),
        );
        let job = Job::process("db://B".parse()?, "/tmp/out".parse()?);
        let err = dispatcher.submit_local(&job).await.err();
        assert!(matches!(err, Some(QueueError::UnknownTask { .. })));
        Ok(())
    }

    #[tokio::test]
    async fn purge_drops_results_outside_retention() -> TestResult<()> {
        let broker = Arc::new(MemoryBroker::new());
        let results = Arc::new(MemoryResultBackend::new(Duration::ZERO));
        let dispatcher = dispatcher(broker, results.clone());

        dispatcher
            .submit_local(&Job::relocate("B", "COVIS-NAS"))
            .await?;
        assert_eq!(results.all().len(), 1);
        assert_eq!(dispatcher.purge_results().await?, 1);
        assert!(results.all().is_empty());
        Ok(())
    }
}
