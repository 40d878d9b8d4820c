//! Dispatcher and worker tuning.

use std::time::Duration;

use crate::routing::RoutingTable;

/// Explicit queue configuration shared by the dispatcher and workers.
#[derive(Debug, Clone)]
pub struct QueueConfig {
    /// Broker location.
    pub broker_url: String,
    /// Result backend location.
    pub result_backend: String,
    /// Retention window for stored results.
    pub result_expires: Duration,
    /// Concurrent slots per worker.
    pub worker_concurrency: usize,
    /// Reservations each slot may hold.
    pub prefetch_multiplier: usize,
    /// Acknowledge only after the task finishes.
    pub acks_late: bool,
    /// Bound on the initial broker connection.
    pub broker_connection_timeout: Duration,
    /// Lease length for reserved messages.
    pub broker_heartbeat: Duration,
    /// Emit `TaskSent` when publishing.
    pub send_sent_event: bool,
    /// Emit started/succeeded/failed/retried events from workers.
    pub worker_send_task_events: bool,
    /// Deliveries allowed before a transient failure becomes final.
    pub max_deliveries: u32,
    /// Delay between empty reservation attempts.
    pub poll_interval: Duration,
    /// Task-name to queue routes.
    pub routes: RoutingTable,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            broker_url: "memory://".to_string(),
            result_backend: "memory://".to_string(),
            result_expires: Duration::from_secs(3_600),
            worker_concurrency: 1,
            prefetch_multiplier: 1,
            acks_late: true,
            broker_connection_timeout: Duration::from_secs(60),
            broker_heartbeat: Duration::from_secs(300),
            send_sent_event: true,
            worker_send_task_events: true,
            max_deliveries: 5,
            poll_interval: Duration::from_secs(1),
            routes: RoutingTable::default(),
        }
    }
}

impl QueueConfig {
    /// Interval at which held leases are renewed.
    #[must_use]
    pub fn heartbeat_interval(&self) -> Duration {
        (self.broker_heartbeat / 2).max(Duration::from_millis(1))
    }
}
