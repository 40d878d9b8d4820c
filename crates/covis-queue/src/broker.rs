//! Message brokers with lease-based late acknowledgement.
//!
//! # Design
//! - `reserve` hands out a lease of length `visibility`; until it is acked,
//!   requeued, or expires, no other consumer sees the message.
//! - Expired leases return the message to its queue with the delivery count
//!   preserved, so the next reservation observes the redelivery.
//! - Operations carrying a stale lease token are ignored.

use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, PoisonError};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tracing::debug;
use uuid::Uuid;

use crate::error::QueueResult;
use crate::message::{Delivery, TaskMessage};

/// Durable message transport.
#[async_trait]
pub trait Broker: Send + Sync {
    /// Enqueue `message` on `message.queue`.
    async fn publish(&self, message: &TaskMessage) -> QueueResult<()>;

    /// Lease the next available message on `queue`, if any.
    async fn reserve(
        &self,
        queue: &str,
        consumer: &str,
        visibility: Duration,
    ) -> QueueResult<Option<Delivery>>;

    /// Renew the lease; returns `false` when it has already been lost.
    async fn extend(&self, delivery: &Delivery, visibility: Duration) -> QueueResult<bool>;

    /// Remove the message permanently.
    async fn ack(&self, delivery: &Delivery) -> QueueResult<()>;

    /// Release the lease and make the message immediately available again.
    async fn requeue(&self, delivery: &Delivery) -> QueueResult<()>;
}

#[derive(Debug)]
struct Lease {
    token: Uuid,
    consumer: String,
    expires_at: Instant,
}

#[derive(Debug)]
struct Entry {
    message: TaskMessage,
    deliveries: u32,
    lease: Option<Lease>,
}

#[derive(Debug, Default)]
struct State {
    ready: HashMap<String, VecDeque<Uuid>>,
    entries: HashMap<Uuid, Entry>,
}

impl State {
    fn reclaim_expired(&mut self, now: Instant) {
        let mut expired = Vec::new();
        for (id, entry) in &mut self.entries {
            if entry
                .lease
                .as_ref()
                .is_some_and(|lease| lease.expires_at <= now)
            {
                if let Some(lease) = entry.lease.take() {
                    debug!(task_id = %id, consumer = %lease.consumer, "lease expired");
                }
                expired.push((*id, entry.message.queue.clone()));
            }
        }
        for (id, queue) in expired {
            self.ready.entry(queue).or_default().push_back(id);
        }
    }

    fn holds(&self, delivery: &Delivery) -> bool {
        self.entries
            .get(&delivery.message.id)
            .and_then(|entry| entry.lease.as_ref())
            .is_some_and(|lease| lease.token == delivery.lease)
    }
}

/// In-process broker.
#[derive(Debug, Default)]
pub struct MemoryBroker {
    state: Mutex<State>,
}

impl MemoryBroker {
    /// Empty broker.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Messages waiting on `queue`, excluding leased ones.
    #[must_use]
    pub fn pending(&self, queue: &str) -> usize {
        let mut state = self.lock();
        state.reclaim_expired(Instant::now());
        state.ready.get(queue).map_or(0, VecDeque::len)
    }

    /// Messages not yet acknowledged, leased or not.
    #[must_use]
    pub fn outstanding(&self) -> usize {
        self.lock().entries.len()
    }

    /// Every unacknowledged message, in no particular order.
    #[must_use]
    pub fn messages(&self) -> Vec<TaskMessage> {
        self.lock()
            .entries
            .values()
            .map(|entry| entry.message.clone())
            .collect()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl Broker for MemoryBroker {
    async fn publish(&self, message: &TaskMessage) -> QueueResult<()> {
        let mut state = self.lock();
        state.entries.insert(
            message.id,
            Entry {
                message: message.clone(),
                deliveries: 0,
                lease: None,
            },
        );
        state
            .ready
            .entry(message.queue.clone())
            .or_default()
            .push_back(message.id);
        Ok(())
    }

    async fn reserve(
        &self,
        queue: &str,
        consumer: &str,
        visibility: Duration,
    ) -> QueueResult<Option<Delivery>> {
        let now = Instant::now();
        let mut state = self.lock();
        state.reclaim_expired(now);
        loop {
            let Some(id) = state.ready.get_mut(queue).and_then(VecDeque::pop_front) else {
                return Ok(None);
            };
            let Some(entry) = state.entries.get_mut(&id) else {
                continue;
            };
            if entry.lease.is_some() {
                continue;
            }
            entry.deliveries += 1;
            let token = Uuid::new_v4();
            entry.lease = Some(Lease {
                token,
                consumer: consumer.to_string(),
                expires_at: now + visibility,
            });
            return Ok(Some(Delivery {
                message: entry.message.clone(),
                delivery_count: entry.deliveries,
                lease: token,
                consumer: consumer.to_string(),
            }));
        }
    }

    async fn extend(&self, delivery: &Delivery, visibility: Duration) -> QueueResult<bool> {
        let now = Instant::now();
        let mut state = self.lock();
        if !state.holds(delivery) {
            return Ok(false);
        }
        if let Some(lease) = state
            .entries
            .get_mut(&delivery.message.id)
            .and_then(|entry| entry.lease.as_mut())
        {
            if lease.expires_at <= now {
                return Ok(false);
            }
            lease.expires_at = now + visibility;
        }
        Ok(true)
    }

    async fn ack(&self, delivery: &Delivery) -> QueueResult<()> {
        let mut state = self.lock();
        if state.holds(delivery) {
            state.entries.remove(&delivery.message.id);
        } else {
            debug!(task_id = %delivery.message.id, "ignoring ack for a lost lease");
        }
        Ok(())
    }

    async fn requeue(&self, delivery: &Delivery) -> QueueResult<()> {
        let mut state = self.lock();
        if !state.holds(delivery) {
            debug!(task_id = %delivery.message.id, "ignoring requeue for a lost lease");
            return Ok(());
        }
        if let Some(entry) = state.entries.get_mut(&delivery.message.id) {
            entry.lease = None;
        }
        state
            .ready
            .entry(delivery.message.queue.clone())
            .or_default()
            .push_back(delivery.message.id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::{Context, Result};

    type TestResult<T> = Result<T>;

    fn message(queue: &str) -> TaskMessage {
        TaskMessage::new("relocation.relocate", Vec::new(), queue)
    }

    #[tokio::test]
    async fn reserved_message_is_hidden_until_acked() -> TestResult<()> {
        let broker = MemoryBroker::new();
        broker.publish(&message("relocate")).await?;

        let delivery = broker
            .reserve("relocate", "w1", Duration::from_secs(60))
            .await?
            .context("expected delivery")?;
        assert_eq!(delivery.delivery_count, 1);
        assert!(
            broker
                .reserve("relocate", "w2", Duration::from_secs(60))
                .await?
                .is_none()
        );

        broker.ack(&delivery).await?;
        assert_eq!(broker.outstanding(), 0);
        Ok(())
    }

    #[tokio::test]
    async fn expired_lease_is_redelivered_and_stale_ack_ignored() -> TestResult<()> {
        let broker = MemoryBroker::new();
        let sent = message("relocate");
        broker.publish(&sent).await?;

        let first = broker
            .reserve("relocate", "crashed", Duration::from_millis(20))
            .await?
            .context("expected delivery")?;
        tokio::time::sleep(Duration::from_millis(40)).await;

        assert!(!broker.extend(&first, Duration::from_secs(60)).await?);
        let second = broker
            .reserve("relocate", "survivor", Duration::from_secs(60))
            .await?
            .context("expected redelivery")?;
        assert_eq!(second.message.id, sent.id);
        assert_eq!(second.delivery_count, 2);

        broker.ack(&first).await?;
        assert_eq!(broker.outstanding(), 1);
        broker.ack(&second).await?;
        assert_eq!(broker.outstanding(), 0);
        Ok(())
    }

    #[tokio::test]
    async fn heartbeat_keeps_lease_alive() -> TestResult<()> {
        let broker = MemoryBroker::new();
        broker.publish(&message("process")).await?;
        let delivery = broker
            .reserve("process", "w1", Duration::from_millis(200))
            .await?
            .context("expected delivery")?;

        for _ in 0..3 {
            tokio::time::sleep(Duration::from_millis(120)).await;
            assert!(broker.extend(&delivery, Duration::from_millis(200)).await?);
        }
        assert_eq!(broker.pending("process"), 0);
        Ok(())
    }

    #[tokio::test]
    async fn requeue_makes_message_available_with_count_preserved() -> TestResult<()> {
        let broker = MemoryBroker::new();
        broker.publish(&message("relocate")).await?;
        let first = broker
            .reserve("relocate", "w1", Duration::from_secs(60))
            .await?
            .context("expected delivery")?;
        broker.requeue(&first).await?;
        assert_eq!(broker.pending("relocate"), 1);

        let second = broker
            .reserve("relocate", "w1", Duration::from_secs(60))
            .await?
            .context("expected redelivery")?;
        assert_eq!(second.delivery_count, 2);
        Ok(())
    }

    #[tokio::test]
    async fn queues_are_isolated() -> TestResult<()> {
        let broker = MemoryBroker::new();
        broker.publish(&message("process")).await?;
        assert!(
            broker
                .reserve("relocate", "w1", Duration::from_secs(1))
                .await?
                .is_none()
        );
        assert_eq!(broker.pending("process"), 1);
        Ok(())
    }
}
