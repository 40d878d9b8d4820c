//! Task result storage with a retention window.

use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::error::QueueResult;
use crate::message::TaskResult;

/// Persistent store of terminal task results.
#[async_trait]
pub trait ResultBackend: Send + Sync {
    /// Record or overwrite the result for `result.id`.
    async fn store(&self, result: &TaskResult) -> QueueResult<()>;

    /// Fetch a result that is still inside the retention window.
    async fn fetch(&self, id: Uuid) -> QueueResult<Option<TaskResult>>;

    /// Delete expired results, returning how many were removed.
    async fn purge_expired(&self) -> QueueResult<usize>;
}

/// Cut-off before which results are considered expired.
#[must_use]
pub fn expiry_cutoff(now: DateTime<Utc>, retention: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(retention)
        .ok()
        .and_then(|window| now.checked_sub_signed(window))
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}

/// In-process result backend.
#[derive(Debug)]
pub struct MemoryResultBackend {
    retention: Duration,
    results: Mutex<HashMap<Uuid, TaskResult>>,
}

impl MemoryResultBackend {
    /// Backend keeping results for `retention`.
    #[must_use]
    pub fn new(retention: Duration) -> Self {
        Self {
            retention,
            results: Mutex::new(HashMap::new()),
        }
    }

    /// Every stored result, expired or not.
    #[must_use]
    pub fn all(&self) -> Vec<TaskResult> {
        self.results
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect()
    }
}

#[async_trait]
impl ResultBackend for MemoryResultBackend {
    async fn store(&self, result: &TaskResult) -> QueueResult<()> {
        self.results
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(result.id, result.clone());
        Ok(())
    }

    async fn fetch(&self, id: Uuid) -> QueueResult<Option<TaskResult>> {
        let cutoff = expiry_cutoff(Utc::now(), self.retention);
        Ok(self
            .results
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&id)
            .filter(|result| result.finished_at > cutoff)
            .cloned())
    }

    async fn purge_expired(&self) -> QueueResult<usize> {
        let cutoff = expiry_cutoff(Utc::now(), self.retention);
        let mut results = self.results.lock().unwrap_or_else(PoisonError::into_inner);
        let before = results.len();
        results.retain(|_, result| result.finished_at > cutoff);
        Ok(before - results.len())
    }
}
