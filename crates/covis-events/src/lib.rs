//! Task lifecycle event bus for the COVIS worker fleet.
//!
//! The bus carries a typed event enum with sequential identifiers and keeps a
//! bounded replay ring so late subscribers can catch up. It is built on
//! `tokio::broadcast`; when the channel overflows the oldest events are dropped,
//! and publishing never blocks.
#![forbid(unsafe_code)]
#![deny(
    unused_must_use,
    clippy::all,
    rustdoc::broken_intra_doc_links,
    rustdoc::bare_urls
)]
#![warn(missing_docs, unreachable_pub, clippy::pedantic, clippy::nursery)]

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tokio::sync::broadcast::{Receiver, Sender};
use uuid::Uuid;

/// Identifier assigned to each published event.
pub type EventId = u64;

const DEFAULT_REPLAY_CAPACITY: usize = 1_024;

/// Task lifecycle events.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Event {
    /// A task message was published to the broker.
    TaskSent {
        /// Task identifier.
        task_id: Uuid,
        /// Registered task name.
        task: String,
        /// Destination queue.
        queue: String,
    },
    /// A worker began executing a task.
    TaskStarted {
        /// Task identifier.
        task_id: Uuid,
        /// Registered task name.
        task: String,
        /// Delivery attempt, starting at 1.
        delivery: u32,
    },
    /// A task finished successfully.
    TaskSucceeded {
        /// Task identifier.
        task_id: Uuid,
        /// Registered task name.
        task: String,
    },
    /// A task failed and will not be redelivered.
    TaskFailed {
        /// Task identifier.
        task_id: Uuid,
        /// Registered task name.
        task: String,
        /// Failure description.
        message: String,
    },
    /// A task failed transiently and was requeued.
    TaskRetried {
        /// Task identifier.
        task_id: Uuid,
        /// Registered task name.
        task: String,
        /// Delivery attempt that failed.
        delivery: u32,
        /// Failure description.
        message: String,
    },
}

impl Event {
    /// Machine-friendly discriminator.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::TaskSent { .. } => "task_sent",
            Self::TaskStarted { .. } => "task_started",
            Self::TaskSucceeded { .. } => "task_succeeded",
            Self::TaskFailed { .. } => "task_failed",
            Self::TaskRetried { .. } => "task_retried",
        }
    }

    /// Task the event concerns.
    #[must_use]
    pub const fn task_id(&self) -> Uuid {
        match self {
            Self::TaskSent { task_id, .. }
            | Self::TaskStarted { task_id, .. }
            | Self::TaskSucceeded { task_id, .. }
            | Self::TaskFailed { task_id, .. }
            | Self::TaskRetried { task_id, .. } => *task_id,
        }
    }
}

/// Event plus its sequence number and emission time.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct EventEnvelope {
    /// Sequential identifier.
    pub id: EventId,
    /// Emission time.
    pub timestamp: DateTime<Utc>,
    /// Payload.
    pub event: Event,
}

/// Shared event bus built on top of `tokio::broadcast`.
#[derive(Clone)]
pub struct EventBus {
    sender: Sender<EventEnvelope>,
    buffer: Arc<Mutex<VecDeque<EventEnvelope>>>,
    next_id: Arc<AtomicU64>,
    replay_capacity: usize,
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter
            .debug_struct("EventBus")
            .field("replay_capacity", &self.replay_capacity)
            .field("subscribers", &self.sender.receiver_count())
            .finish_non_exhaustive()
    }
}

impl EventBus {
    /// Construct a bus whose broadcast channel and replay ring hold `capacity` events.
    ///
    /// A zero capacity is raised to one.
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let (sender, _) = broadcast::channel(capacity);
        Self {
            sender,
            buffer: Arc::new(Mutex::new(VecDeque::with_capacity(capacity))),
            next_id: Arc::new(AtomicU64::new(1)),
            replay_capacity: capacity,
        }
    }

    /// Construct a bus with the default buffer size.
    #[must_use]
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_REPLAY_CAPACITY)
    }

    /// Publish `event`, returning its identifier.
    pub fn publish(&self, event: Event) -> EventId {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let envelope = EventEnvelope {
            id,
            timestamp: Utc::now(),
            event,
        };

        {
            let mut buffer = self.buffer.lock().unwrap_or_else(PoisonError::into_inner);
            if buffer.len() == self.replay_capacity {
                buffer.pop_front();
            }
            buffer.push_back(envelope.clone());
        }

        let _ = self.sender.send(envelope);
        id
    }

    /// Subscribe, replaying buffered events newer than `since_id` first.
    #[must_use]
    pub fn subscribe(&self, since_id: Option<EventId>) -> EventStream {
        let receiver = self.sender.subscribe();
        let backlog = since_id.map_or_else(VecDeque::new, |since| {
            let buffer = self.buffer.lock().unwrap_or_else(PoisonError::into_inner);
            buffer.iter().filter(|item| item.id > since).cloned().collect()
        });
        EventStream { backlog, receiver }
    }

    /// Snapshot of the replay ring.
    #[must_use]
    pub fn recent(&self) -> Vec<EventEnvelope> {
        let buffer = self.buffer.lock().unwrap_or_else(PoisonError::into_inner);
        buffer.iter().cloned().collect()
    }

    /// Last assigned identifier, if anything has been published.
    #[must_use]
    pub fn last_event_id(&self) -> Option<EventId> {
        let buffer = self.buffer.lock().unwrap_or_else(PoisonError::into_inner);
        buffer.back().map(|event| event.id)
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

/// Subscription yielding the replay backlog before live events.
pub struct EventStream {
    backlog: VecDeque<EventEnvelope>,
    receiver: Receiver<EventEnvelope>,
}

impl EventStream {
    /// Receive the next event; `None` once the bus is dropped.
    pub async fn next(&mut self) -> Option<EventEnvelope> {
        if let Some(event) = self.backlog.pop_front() {
            return Some(event);
        }
        loop {
            match self.receiver.recv().await {
                Ok(event) => return Some(event),
                Err(broadcast::error::RecvError::Lagged(_)) => {}
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}
