//! Worker pool consuming reserved messages with late acknowledgement.
//!
//! # Design
//! - `worker_concurrency` slots each hold up to `prefetch_multiplier`
//!   reservations and run one task at a time to completion.
//! - A heartbeat renews every held lease at half the lease length; leases it
//!   fails to renew are dropped from the held set.
//! - Handlers run on their own task so a panic is observed as a lost worker
//!   and the message is requeued immediately, up to `max_deliveries`.
//! - A message reserved more than `max_deliveries` times, whether through
//!   lease expiry or panics, is stored as failed and acknowledged unrun.
//! - Shutdown is cooperative: slots finish the task in hand, requeue anything
//!   still prefetched, then exit.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::dispatcher::TaskDispatcher;
use crate::error::{QueueError, QueueResult};
use crate::message::{Delivery, TaskOutcome};

type HeldLeases = Arc<Mutex<HashMap<Uuid, Delivery>>>;

/// Consumer of one or more queues.
#[derive(Debug, Clone)]
pub struct Worker {
    dispatcher: TaskDispatcher,
    queues: Vec<String>,
    name: String,
}

impl Worker {
    /// Worker consuming every queue in the dispatcher's routing table.
    #[must_use]
    pub fn new(dispatcher: TaskDispatcher, name: impl Into<String>) -> Self {
        let queues = dispatcher.config().routes.queues();
        Self {
            dispatcher,
            queues,
            name: name.into(),
        }
    }

    /// Restrict consumption to `queues`.
    #[must_use]
    pub fn with_queues<I, S>(mut self, queues: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.queues = queues.into_iter().map(Into::into).collect();
        self
    }

    /// Queues this worker consumes.
    #[must_use]
    pub fn queues(&self) -> &[String] {
        &self.queues
    }

    /// Run slots until `shutdown` turns `true` or its sender is dropped.
    ///
    /// # Errors
    ///
    /// Returns the first broker or result-backend error raised by a slot.
    pub async fn run(self, shutdown: watch::Receiver<bool>) -> QueueResult<()> {
        let config = self.dispatcher.config();
        let concurrency = config.worker_concurrency.max(1);
        info!(
            worker = %self.name,
            queues = ?self.queues,
            concurrency,
            prefetch = config.prefetch_multiplier.max(1),
            "worker started"
        );

        let held: HeldLeases = Arc::new(Mutex::new(HashMap::new()));
        let heartbeat = spawn_heartbeat(
            self.dispatcher.clone(),
            Arc::clone(&held),
            shutdown.clone(),
        );

        let slots: Vec<JoinHandle<QueueResult<()>>> = (0..concurrency)
            .map(|index| {
                let slot = Slot {
                    dispatcher: self.dispatcher.clone(),
                    queues: self.queues.clone(),
                    consumer: format!("{}-{index}", self.name),
                    held: Arc::clone(&held),
                    buffer: VecDeque::new(),
                    next_queue: index,
                };
                tokio::spawn(slot.run(shutdown.clone()))
            })
            .collect();

        let mut first_error = None;
        for slot in slots {
            let outcome = slot
                .await
                .map_err(|source| QueueError::Join { source })
                .and_then(|result| result);
            if let Err(err) = outcome {
                error!(worker = %self.name, error = %err, "worker slot failed");
                first_error.get_or_insert(err);
            }
        }
        heartbeat.abort();
        info!(worker = %self.name, "worker stopped");
        first_error.map_or(Ok(()), Err)
    }
}

fn spawn_heartbeat(
    dispatcher: TaskDispatcher,
    held: HeldLeases,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let lease = dispatcher.config().broker_heartbeat;
        let mut ticker = tokio::time::interval(dispatcher.config().heartbeat_interval());
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
            let deliveries: Vec<Delivery> = held
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .values()
                .cloned()
                .collect();
            for delivery in deliveries {
                match dispatcher.broker().extend(&delivery, lease).await {
                    Ok(true) => {}
                    Ok(false) => {
                        warn!(task_id = %delivery.message.id, "lease lost before renewal");
                        held.lock()
                            .unwrap_or_else(PoisonError::into_inner)
                            .remove(&delivery.message.id);
                    }
                    Err(err) => {
                        warn!(task_id = %delivery.message.id, error = %err, "lease renewal failed");
                    }
                }
            }
        }
    })
}

struct Slot {
    dispatcher: TaskDispatcher,
    queues: Vec<String>,
    consumer: String,
    held: HeldLeases,
    buffer: VecDeque<Delivery>,
    next_queue: usize,
}

impl Slot {
    async fn run(mut self, mut shutdown: watch::Receiver<bool>) -> QueueResult<()> {
        let poll = self.dispatcher.config().poll_interval;
        loop {
            if *shutdown.borrow() {
                break;
            }
            self.refill().await?;
            if let Some(delivery) = self.buffer.pop_front() {
                self.process(delivery).await?;
                continue;
            }
            tokio::select! {
                () = tokio::time::sleep(poll) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }
        self.release().await
    }

    async fn refill(&mut self) -> QueueResult<()> {
        let config = self.dispatcher.config();
        let capacity = config.prefetch_multiplier.max(1);
        let lease = config.broker_heartbeat;
        let mut idle_queues = 0;
        while self.buffer.len() < capacity && idle_queues < self.queues.len() {
            let queue = &self.queues[self.next_queue % self.queues.len()];
            self.next_queue = self.next_queue.wrapping_add(1);
            match self
                .dispatcher
                .broker()
                .reserve(queue, &self.consumer, lease)
                .await?
            {
                Some(delivery) => {
                    debug!(
                        task_id = %delivery.message.id,
                        queue = %queue,
                        delivery = delivery.delivery_count,
                        "reserved message"
                    );
                    self.hold(&delivery);
                    self.buffer.push_back(delivery);
                    idle_queues = 0;
                }
                None => idle_queues += 1,
            }
        }
        Ok(())
    }

    async fn process(&self, delivery: Delivery) -> QueueResult<()> {
        let config = self.dispatcher.config();
        let broker = self.dispatcher.broker();
        let message = delivery.message.clone();

        if delivery.delivery_count > config.max_deliveries {
            warn!(
                task_id = %message.id,
                task = %message.task,
                delivery = delivery.delivery_count,
                max_deliveries = config.max_deliveries,
                "delivery limit exceeded, failing without running"
            );
            let outcome = TaskOutcome::Failed("delivery limit exceeded".to_string());
            self.dispatcher.finish(&message, &outcome).await?;
            broker.ack(&delivery).await?;
            self.release_hold(&delivery);
            return Ok(());
        }

        if !config.acks_late {
            broker.ack(&delivery).await?;
            self.release_hold(&delivery);
        }

        let dispatcher = self.dispatcher.clone();
        let task_message = message.clone();
        let attempt = delivery.delivery_count;
        let joined =
            tokio::spawn(async move { dispatcher.execute(&task_message, attempt).await }).await;

        let outcome = match joined {
            Ok(Ok(output)) => TaskOutcome::Succeeded(output),
            Ok(Err(err))
                if err.is_transient() && config.acks_late && attempt < config.max_deliveries =>
            {
                broker.requeue(&delivery).await?;
                self.release_hold(&delivery);
                self.dispatcher.retried(&message, attempt, err.message());
                return Ok(());
            }
            Ok(Err(err)) => TaskOutcome::Failed(err.message().to_string()),
            Err(join)
                if join.is_panic() && config.acks_late && attempt < config.max_deliveries =>
            {
                error!(task_id = %message.id, task = %message.task, "task panicked, requeueing");
                if let Some(metrics) = self.dispatcher.metrics() {
                    metrics.inc_redelivery();
                }
                broker.requeue(&delivery).await?;
                self.release_hold(&delivery);
                return Ok(());
            }
            Err(join) if join.is_panic() => {
                error!(task_id = %message.id, task = %message.task, attempt, "task panicked");
                TaskOutcome::Failed("task panicked".to_string())
            }
            Err(join) => TaskOutcome::Failed(format!("task aborted: {join}")),
        };

        self.dispatcher.finish(&message, &outcome).await?;
        if config.acks_late {
            broker.ack(&delivery).await?;
            self.release_hold(&delivery);
        }
        Ok(())
    }

    async fn release(mut self) -> QueueResult<()> {
        while let Some(delivery) = self.buffer.pop_front() {
            debug!(task_id = %delivery.message.id, "returning prefetched message");
            self.dispatcher.broker().requeue(&delivery).await?;
            self.release_hold(&delivery);
        }
        Ok(())
    }

    fn hold(&self, delivery: &Delivery) {
        self.held
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(delivery.message.id, delivery.clone());
    }

    fn release_hold(&self, delivery: &Delivery) {
        self.held
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&delivery.message.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::{Broker, MemoryBroker};
    use crate::config::QueueConfig;
    use crate::message::TaskStatus;
    use crate::results::{MemoryResultBackend, ResultBackend};
    use crate::task::{TaskContext, TaskError, TaskHandler, TaskRegistry};
    use anyhow::{Context, bail};
    use async_trait::async_trait;
    use covis_core::Job;
    use covis_events::Event;
    use serde_json::{Value, json};
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    type TestResult<T> = anyhow::Result<T>;

    enum Script {
        TransientTimes(u32),
        Fatal,
        PanicOnce,
        AlwaysPanic,
        AlwaysTransient,
    }

    struct Scripted {
        script: Script,
        calls: AtomicU32,
    }

    impl Scripted {
        fn new(script: Script) -> Arc<Self> {
            Arc::new(Self {
                script,
                calls: AtomicU32::new(0),
            })
        }
    }

    #[async_trait]
    impl TaskHandler for Scripted {
        async fn run(&self, context: &TaskContext, _args: &[Value]) -> Result<Value, TaskError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            match self.script {
                Script::TransientTimes(n) if call <= n => {
                    Err(TaskError::Transient(format!("attempt {call} timed out")))
                }
                Script::Fatal => Err(TaskError::Fatal("archive is malformed".into())),
                Script::PanicOnce if call == 1 => panic!("worker crashed"),
                Script::AlwaysPanic => panic!("worker crashed on delivery {call}"),
                Script::AlwaysTransient => Err(TaskError::Transient("busy".into())),
                _ => Ok(json!({ "delivery": context.delivery })),
            }
        }
    }

    struct Harness {
        broker: Arc<MemoryBroker>,
        results: Arc<MemoryResultBackend>,
        dispatcher: TaskDispatcher,
    }

    fn harness(handler: Arc<Scripted>, config: QueueConfig) -> Harness {
        let broker = Arc::new(MemoryBroker::new());
        let results = Arc::new(MemoryResultBackend::new(Duration::from_secs(3_600)));
        let dispatcher = TaskDispatcher::new(
            config,
            broker.clone(),
            results.clone(),
            TaskRegistry::new().with("relocation.relocate", handler),
        );
        Harness {
            broker,
            results,
            dispatcher,
        }
    }

    fn fast_config() -> QueueConfig {
        QueueConfig {
            poll_interval: Duration::from_millis(5),
            broker_heartbeat: Duration::from_secs(30),
            ..QueueConfig::default()
        }
    }

    async fn run_until_result(harness: &Harness, id: Uuid) -> TestResult<crate::TaskResult> {
        let (stop, shutdown) = watch::channel(false);
        let worker = Worker::new(harness.dispatcher.clone(), "test");
        let running = tokio::spawn(worker.run(shutdown));

        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        let result = loop {
            if let Some(result) = harness.results.fetch(id).await? {
                break result;
            }
            if tokio::time::Instant::now() > deadline {
                bail!("no result stored for {id}");
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        };
        stop.send(true)?;
        running.await??;
        Ok(result)
    }

    fn retried_count(dispatcher: &TaskDispatcher) -> usize {
        dispatcher
            .events()
            .recent()
            .iter()
            .filter(|envelope| matches!(envelope.event, Event::TaskRetried { .. }))
            .count()
    }

    #[tokio::test]
    async fn transient_failures_are_retried_until_success() -> TestResult<()> {
        let handler = Scripted::new(Script::TransientTimes(2));
        let harness = harness(handler.clone(), fast_config());
        let handle = harness
            .dispatcher
            .submit(&Job::relocate("B", "COVIS-NAS"))
            .await?;

        let result = run_until_result(&harness, handle.id).await?;
        assert_eq!(result.status, TaskStatus::Succeeded);
        assert_eq!(result.output, Some(json!({ "delivery": 3 })));
        assert_eq!(handler.calls.load(Ordering::SeqCst), 3);
        assert_eq!(retried_count(&harness.dispatcher), 2);
        assert_eq!(harness.broker.outstanding(), 0);
        Ok(())
    }

    #[tokio::test]
    async fn transient_failure_becomes_final_at_max_deliveries() -> TestResult<()> {
        let handler = Scripted::new(Script::AlwaysTransient);
        let config = QueueConfig {
            max_deliveries: 3,
            ..fast_config()
        };
        let harness = harness(handler.clone(), config);
        let handle = harness
            .dispatcher
            .submit(&Job::relocate("B", "COVIS-NAS"))
            .await?;

        let result = run_until_result(&harness, handle.id).await?;
        assert_eq!(result.status, TaskStatus::Failed);
        assert_eq!(handler.calls.load(Ordering::SeqCst), 3);
        assert_eq!(harness.broker.outstanding(), 0);
        Ok(())
    }

    #[tokio::test]
    async fn fatal_failure_is_stored_without_redelivery() -> TestResult<()> {
        let handler = Scripted::new(Script::Fatal);
        let harness = harness(handler.clone(), fast_config());
        let handle = harness
            .dispatcher
            .submit(&Job::relocate("B", "COVIS-NAS"))
            .await?;

        let result = run_until_result(&harness, handle.id).await?;
        assert_eq!(result.status, TaskStatus::Failed);
        assert_eq!(result.error.as_deref(), Some("archive is malformed"));
        assert_eq!(handler.calls.load(Ordering::SeqCst), 1);
        assert_eq!(retried_count(&harness.dispatcher), 0);
        assert!(
            harness
                .dispatcher
                .events()
                .recent()
                .iter()
                .any(|envelope| matches!(envelope.event, Event::TaskFailed { .. }))
        );
        Ok(())
    }

    #[tokio::test]
    async fn panicking_handler_is_requeued() -> TestResult<()> {
        let handler = Scripted::new(Script::PanicOnce);
        let harness = harness(handler.clone(), fast_config());
        let handle = harness
            .dispatcher
            .submit(&Job::relocate("B", "COVIS-NAS"))
            .await?;

        let result = run_until_result(&harness, handle.id).await?;
        assert_eq!(result.status, TaskStatus::Succeeded);
        assert_eq!(handler.calls.load(Ordering::SeqCst), 2);
        Ok(())
    }

    #[tokio::test]
    async fn repeated_panics_fail_at_max_deliveries() -> TestResult<()> {
        let handler = Scripted::new(Script::AlwaysPanic);
        let config = QueueConfig {
            max_deliveries: 3,
            ..fast_config()
        };
        let harness = harness(handler.clone(), config);
        let handle = harness
            .dispatcher
            .submit(&Job::relocate("B", "COVIS-NAS"))
            .await?;

        let result = run_until_result(&harness, handle.id).await?;
        assert_eq!(result.status, TaskStatus::Failed);
        assert_eq!(result.error.as_deref(), Some("task panicked"));
        assert_eq!(handler.calls.load(Ordering::SeqCst), 3);
        assert_eq!(harness.broker.outstanding(), 0);
        assert!(
            harness
                .dispatcher
                .events()
                .recent()
                .iter()
                .any(|envelope| matches!(envelope.event, Event::TaskFailed { .. }))
        );
        Ok(())
    }

    #[tokio::test]
    async fn redelivery_past_the_limit_fails_without_running() -> TestResult<()> {
        let handler = Scripted::new(Script::TransientTimes(0));
        let config = QueueConfig {
            max_deliveries: 1,
            ..fast_config()
        };
        let harness = harness(handler.clone(), config);
        let handle = harness
            .dispatcher
            .submit(&Job::relocate("B", "COVIS-NAS"))
            .await?;

        harness
            .broker
            .reserve("relocate", "crashed", Duration::from_millis(10))
            .await?
            .context("expected delivery")?;
        tokio::time::sleep(Duration::from_millis(30)).await;

        let result = run_until_result(&harness, handle.id).await?;
        assert_eq!(result.status, TaskStatus::Failed);
        assert_eq!(result.error.as_deref(), Some("delivery limit exceeded"));
        assert_eq!(handler.calls.load(Ordering::SeqCst), 0);
        assert_eq!(harness.broker.outstanding(), 0);
        Ok(())
    }

    #[tokio::test]
    async fn stopped_worker_leaves_messages_queued() -> TestResult<()> {
        let handler = Scripted::new(Script::TransientTimes(0));
        let harness = harness(handler, fast_config());
        let (stop, shutdown) = watch::channel(true);
        harness
            .dispatcher
            .submit(&Job::relocate("B", "COVIS-NAS"))
            .await?;

        Worker::new(harness.dispatcher.clone(), "idle")
            .run(shutdown)
            .await?;
        drop(stop);
        assert_eq!(harness.broker.pending("relocate"), 1);
        Ok(())
    }

    #[tokio::test]
    async fn lease_expiry_hands_message_to_another_worker() -> TestResult<()> {
        let handler = Scripted::new(Script::TransientTimes(0));
        let config = QueueConfig {
            broker_heartbeat: Duration::from_millis(20),
            ..fast_config()
        };
        let harness = harness(handler, config);
        let handle = harness
            .dispatcher
            .submit(&Job::relocate("B", "COVIS-NAS"))
            .await?;

        let abandoned = harness
            .broker
            .reserve("relocate", "crashed", Duration::from_millis(20))
            .await?
            .context("expected delivery")?;
        assert_eq!(abandoned.message.id, handle.id);
        tokio::time::sleep(Duration::from_millis(40)).await;

        let result = run_until_result(&harness, handle.id).await?;
        assert_eq!(result.output, Some(json!({ "delivery": 2 })));
        Ok(())
    }
}
