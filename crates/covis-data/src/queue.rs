//! `PostgreSQL` broker and result backend.
//!
//! Reservations use `FOR UPDATE SKIP LOCKED`, so concurrent workers never
//! lease the same message; a lease whose expiry has passed is reclaimable by
//! the next `reserve`.

use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use covis_queue::{
    Broker, Delivery, QueueResult, ResultBackend, TaskMessage, TaskResult, TaskStatus,
    expiry_cutoff,
};
use serde_json::Value;
use sqlx::postgres::PgRow;
use sqlx::types::Json;
use sqlx::{PgPool, Row};
use tracing::debug;
use uuid::Uuid;

use crate::error::DataError;

const PUBLISH: &str = r"
    INSERT INTO covis_task_messages (id, task, args, queue, sent_at)
    VALUES ($1, $2, $3, $4, $5)
    ON CONFLICT (id) DO NOTHING
";

const RESERVE: &str = r"
    UPDATE covis_task_messages
    SET deliveries = deliveries + 1,
        lease_token = $3,
        lease_consumer = $2,
        lease_expires_at = now() + make_interval(secs => $4)
    WHERE id = (
        SELECT id FROM covis_task_messages
        WHERE queue = $1
          AND (lease_expires_at IS NULL OR lease_expires_at <= now())
        ORDER BY enqueued_at
        FOR UPDATE SKIP LOCKED
        LIMIT 1
    )
    RETURNING id, task, args, queue, sent_at, deliveries
";

const EXTEND: &str = r"
    UPDATE covis_task_messages
    SET lease_expires_at = now() + make_interval(secs => $3)
    WHERE id = $1 AND lease_token = $2 AND lease_expires_at > now()
";

const ACK: &str = r"DELETE FROM covis_task_messages WHERE id = $1 AND lease_token = $2";

const REQUEUE: &str = r"
    UPDATE covis_task_messages
    SET lease_token = NULL,
        lease_consumer = NULL,
        lease_expires_at = NULL,
        enqueued_at = now()
    WHERE id = $1 AND lease_token = $2
";

const STORE_RESULT: &str = r"
    INSERT INTO covis_task_results (id, task, status, output, error, finished_at)
    VALUES ($1, $2, $3, $4, $5, $6)
    ON CONFLICT (id) DO UPDATE
    SET status = EXCLUDED.status,
        output = EXCLUDED.output,
        error = EXCLUDED.error,
        finished_at = EXCLUDED.finished_at
";

const FETCH_RESULT: &str = r"
    SELECT id, task, status, output, error, finished_at
    FROM covis_task_results
    WHERE id = $1 AND finished_at > $2
";

const PURGE_RESULTS: &str = r"DELETE FROM covis_task_results WHERE finished_at <= $1";

/// Broker backed by the `covis_task_messages` table.
#[derive(Debug, Clone)]
pub struct PgBroker {
    pool: PgPool,
}

impl PgBroker {
    /// Broker over an already migrated pool.
    #[must_use]
    pub const fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl Broker for PgBroker {
    async fn publish(&self, message: &TaskMessage) -> QueueResult<()> {
        sqlx::query(PUBLISH)
            .bind(message.id)
            .bind(&message.task)
            .bind(Json(&message.args))
            .bind(&message.queue)
            .bind(message.sent_at)
            .execute(&self.pool)
            .await
            .map_err(|source| DataError::query("broker.publish", source))?;
        Ok(())
    }

    async fn reserve(
        &self,
        queue: &str,
        consumer: &str,
        visibility: Duration,
    ) -> QueueResult<Option<Delivery>> {
        let lease = Uuid::new_v4();
        let row = sqlx::query(RESERVE)
            .bind(queue)
            .bind(consumer)
            .bind(lease)
            .bind(visibility.as_secs_f64())
            .fetch_optional(&self.pool)
            .await
            .map_err(|source| DataError::query("broker.reserve", source))?;
        let Some(row) = row else {
            return Ok(None);
        };
        let message = decode_message(&row)?;
        let deliveries: i32 = row
            .try_get("deliveries")
            .map_err(|source| DataError::query("broker.reserve.decode", source))?;
        debug!(task_id = %message.id, queue, consumer, "leased message");
        Ok(Some(Delivery {
            message,
            delivery_count: u32::try_from(deliveries).unwrap_or_default(),
            lease,
            consumer: consumer.to_string(),
        }))
    }

    async fn extend(&self, delivery: &Delivery, visibility: Duration) -> QueueResult<bool> {
        let updated = sqlx::query(EXTEND)
            .bind(delivery.message.id)
            .bind(delivery.lease)
            .bind(visibility.as_secs_f64())
            .execute(&self.pool)
            .await
            .map_err(|source| DataError::query("broker.extend", source))?
            .rows_affected();
        Ok(updated == 1)
    }

    async fn ack(&self, delivery: &Delivery) -> QueueResult<()> {
        sqlx::query(ACK)
            .bind(delivery.message.id)
            .bind(delivery.lease)
            .execute(&self.pool)
            .await
            .map_err(|source| DataError::query("broker.ack", source))?;
        Ok(())
    }

    async fn requeue(&self, delivery: &Delivery) -> QueueResult<()> {
        sqlx::query(REQUEUE)
            .bind(delivery.message.id)
            .bind(delivery.lease)
            .execute(&self.pool)
            .await
            .map_err(|source| DataError::query("broker.requeue", source))?;
        Ok(())
    }
}

/// Result backend backed by the `covis_task_results` table.
#[derive(Debug, Clone)]
pub struct PgResultBackend {
    pool: PgPool,
    retention: Duration,
}

impl PgResultBackend {
    /// Backend keeping results for `retention`.
    #[must_use]
    pub const fn new(pool: PgPool, retention: Duration) -> Self {
        Self { pool, retention }
    }
}

#[async_trait]
impl ResultBackend for PgResultBackend {
    async fn store(&self, result: &TaskResult) -> QueueResult<()> {
        sqlx::query(STORE_RESULT)
            .bind(result.id)
            .bind(&result.task)
            .bind(result.status.as_str())
            .bind(result.output.as_ref().map(Json))
            .bind(result.error.as_deref())
            .bind(result.finished_at)
            .execute(&self.pool)
            .await
            .map_err(|source| DataError::query("results.store", source))?;
        Ok(())
    }

    async fn fetch(&self, id: Uuid) -> QueueResult<Option<TaskResult>> {
        let cutoff = expiry_cutoff(Utc::now(), self.retention);
        let row = sqlx::query(FETCH_RESULT)
            .bind(id)
            .bind(cutoff)
            .fetch_optional(&self.pool)
            .await
            .map_err(|source| DataError::query("results.fetch", source))?;
        Ok(row.as_ref().map(decode_result).transpose()?)
    }

    async fn purge_expired(&self) -> QueueResult<usize> {
        let cutoff = expiry_cutoff(Utc::now(), self.retention);
        let removed = sqlx::query(PURGE_RESULTS)
            .bind(cutoff)
            .execute(&self.pool)
            .await
            .map_err(|source| DataError::query("results.purge", source))?
            .rows_affected();
        Ok(usize::try_from(removed).unwrap_or(usize::MAX))
    }
}

fn decode_message(row: &PgRow) -> Result<TaskMessage, DataError> {
    let decode = |source: sqlx::Error| DataError::query("broker.decode", source);
    let Json(args): Json<Vec<Value>> = row.try_get("args").map_err(decode)?;
    Ok(TaskMessage {
        id: row.try_get("id").map_err(decode)?,
        task: row.try_get("task").map_err(decode)?,
        args,
        queue: row.try_get("queue").map_err(decode)?,
        sent_at: row.try_get("sent_at").map_err(decode)?,
    })
}

fn decode_result(row: &PgRow) -> Result<TaskResult, DataError> {
    let decode = |source: sqlx::Error| DataError::query("results.decode", source);
    let status: String = row.try_get("status").map_err(decode)?;
    let status = if status == TaskStatus::Succeeded.as_str() {
        TaskStatus::Succeeded
    } else {
        TaskStatus::Failed
    };
    let output: Option<Json<Value>> = row.try_get("output").map_err(decode)?;
    Ok(TaskResult {
        id: row.try_get("id").map_err(decode)?,
        task: row.try_get("task").map_err(decode)?,
        status,
        output: output.map(|Json(value)| value),
        error: row.try_get("error").map_err(decode)?,
        finished_at: row.try_get("finished_at").map_err(decode)?,
    })
}
