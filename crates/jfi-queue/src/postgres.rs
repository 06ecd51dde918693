use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use jfi_core::{BatchPayload, QueuePriority};
use serde_json::Value as JsonValue;
use sqlx::{PgPool, Row};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::{
    millis, Delivery, EnqueueOptions, FailDisposition, QueueCounts, QueueError, RetentionPolicy,
    WorkQueue,
};

/// Durable queue over the `queue_jobs` table. Leasing uses
/// `FOR UPDATE SKIP LOCKED` so any number of processes can share it.
#[derive(Clone)]
pub struct PgWorkQueue {
    pool: PgPool,
}

impl fmt::Debug for PgWorkQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PgWorkQueue")
            .field("pool_size", &self.pool.size())
            .field("idle_connections", &self.pool.num_idle())
            .finish()
    }
}

impl PgWorkQueue {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl WorkQueue for PgWorkQueue {
    async fn enqueue(
        &self,
        payload: &BatchPayload,
        options: &EnqueueOptions,
    ) -> Result<String, QueueError> {
        let result = sqlx::query(
            r#"
            INSERT INTO queue_jobs (
                id, job_id, payload, priority, state, attempts, max_attempts, backoff_ms
            )
            VALUES ($1, $2, $3, $4, 'waiting', 0, $5, $6)
            ON CONFLICT (job_id) DO NOTHING
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(&options.job_id)
        .bind(serde_json::to_value(payload)?)
        .bind(options.priority.as_i16())
        .bind(i32::try_from(options.max_attempts.max(1)).unwrap_or(i32::MAX))
        .bind(millis(options.backoff))
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(QueueError::DuplicateJobId(options.job_id.clone()));
        }
        Ok(options.job_id.clone())
    }

    async fn lease(
        &self,
        worker_id: &str,
        lease_ttl: Duration,
    ) -> Result<Option<Delivery>, QueueError> {
        let mut tx = self.pool.begin().await?;

        // Stalled jobs that already used every attempt are dead-lettered
        // rather than leased again.
        let exhausted = sqlx::query(
            r#"
            UPDATE queue_jobs
               SET state = 'failed',
                   finished_at = NOW(),
                   lease_owner = NULL,
                   lease_expires_at = NULL,
                   last_error = 'lease expired',
                   updated_at = NOW()
             WHERE state = 'active'
               AND lease_expires_at <= NOW()
               AND attempts >= max_attempts
            "#,
        )
        .execute(&mut *tx)
        .await?
        .rows_affected();
        if exhausted > 0 {
            warn!(exhausted, "stalled queue jobs dead-lettered");
        }

        let row = sqlx::query(
            r#"
            WITH next AS (
                SELECT id
                  FROM queue_jobs
                 WHERE (state = 'waiting' AND available_at <= NOW())
                    OR (state = 'active' AND lease_expires_at <= NOW())
                 ORDER BY priority ASC, available_at ASC, created_at ASC
                 LIMIT 1
                 FOR UPDATE SKIP LOCKED
            )
            UPDATE queue_jobs q
               SET state = 'active',
                   attempts = q.attempts + 1,
                   lease_owner = $1,
                   lease_expires_at = NOW() + ($2::bigint) * INTERVAL '1 millisecond',
                   updated_at = NOW()
              FROM next
             WHERE q.id = next.id
            RETURNING q.id, q.job_id, q.payload, q.priority, q.attempts, q.max_attempts, q.backoff_ms
            "#,
        )
        .bind(worker_id)
        .bind(millis(lease_ttl))
        .fetch_optional(&mut *tx)
        .await?;

        let Some(row) = row else {
            tx.commit().await?;
            return Ok(None);
        };

        let id: Uuid = row.try_get("id")?;
        let job_id: String = row.try_get("job_id")?;
        let payload: JsonValue = row.try_get("payload")?;
        let payload: BatchPayload = match serde_json::from_value(payload) {
            Ok(payload) => payload,
            Err(source) => {
                sqlx::query(
                    "UPDATE queue_jobs SET state = 'failed', finished_at = NOW(), \
                     lease_owner = NULL, last_error = $2, updated_at = NOW() WHERE id = $1",
                )
                .bind(id)
                .bind(format!("unreadable payload: {source}"))
                .execute(&mut *tx)
                .await?;
                tx.commit().await?;
                return Err(QueueError::Payload { job_id, source });
            }
        };

        let priority: i16 = row.try_get("priority")?;
        let attempts: i32 = row.try_get("attempts")?;
        let max_attempts: i32 = row.try_get("max_attempts")?;
        let backoff_ms: i64 = row.try_get("backoff_ms")?;
        tx.commit().await?;

        Ok(Some(Delivery {
            id,
            job_id,
            payload,
            attempt: attempts.max(1) as u32,
            max_attempts: max_attempts.max(1) as u32,
            priority: QueuePriority::from_i16(priority).unwrap_or(QueuePriority::Scheduled),
            backoff: Duration::from_millis(backoff_ms.max(0) as u64),
            lease_owner: worker_id.to_string(),
        }))
    }

    async fn complete(&self, delivery: &Delivery) -> Result<(), QueueError> {
        let result = sqlx::query(
            r#"
            UPDATE queue_jobs
               SET state = 'completed',
                   finished_at = NOW(),
                   lease_owner = NULL,
                   lease_expires_at = NULL,
                   updated_at = NOW()
             WHERE id = $1 AND state = 'active' AND lease_owner = $2
            "#,
        )
        .bind(delivery.id)
        .bind(&delivery.lease_owner)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(QueueError::LeaseLost(delivery.job_id.clone()));
        }
        Ok(())
    }

    async fn fail(&self, delivery: &Delivery, reason: &str) -> Result<FailDisposition, QueueError> {
        let disposition = delivery.fail_disposition();
        let query = match disposition {
            FailDisposition::Retry { delay } => sqlx::query(
                r#"
                UPDATE queue_jobs
                   SET state = 'waiting',
                       available_at = NOW() + ($4::bigint) * INTERVAL '1 millisecond',
                       lease_owner = NULL,
                       lease_expires_at = NULL,
                       last_error = $3,
                       updated_at = NOW()
                 WHERE id = $1 AND state = 'active' AND lease_owner = $2
                "#,
            )
            .bind(delivery.id)
            .bind(&delivery.lease_owner)
            .bind(reason)
            .bind(millis(delay)),
            FailDisposition::Dead => sqlx::query(
                r#"
                UPDATE queue_jobs
                   SET state = 'failed',
                       finished_at = NOW(),
                       lease_owner = NULL,
                       lease_expires_at = NULL,
                       last_error = $3,
                       updated_at = NOW()
                 WHERE id = $1 AND state = 'active' AND lease_owner = $2
                "#,
            )
            .bind(delivery.id)
            .bind(&delivery.lease_owner)
            .bind(reason),
        };

        if query.execute(&self.pool).await?.rows_affected() == 0 {
            return Err(QueueError::LeaseLost(delivery.job_id.clone()));
        }
        Ok(disposition)
    }

    async fn counts(&self) -> Result<QueueCounts, QueueError> {
        let rows = sqlx::query(
            r#"
            SELECT state,
                   (state = 'waiting' AND available_at > NOW()) AS delayed,
                   COUNT(*) AS n
              FROM queue_jobs
             GROUP BY 1, 2
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        let mut counts = QueueCounts::default();
        for row in rows {
            let state: String = row.try_get("state")?;
            let delayed: bool = row.try_get("delayed")?;
            let n = row.try_get::<i64, _>("n")?.max(0) as u64;
            match (state.as_str(), delayed) {
                ("waiting", true) => counts.delayed += n,
                ("waiting", false) => counts.waiting += n,
                ("active", _) => counts.active += n,
                ("completed", _) => counts.completed += n,
                ("failed", _) => counts.failed += n,
                _ => {}
            }
        }
        Ok(counts)
    }

    async fn prune_finished(&self, retention: &RetentionPolicy) -> Result<u64, QueueError> {
        let mut removed = 0;
        for (state, max_age, max_count) in [
            ("completed", retention.completed_age, retention.completed_count),
            ("failed", retention.failed_age, retention.failed_count),
        ] {
            removed += sqlx::query(
                r#"
                DELETE FROM queue_jobs
                 WHERE state = $1
                   AND (
                        finished_at < NOW() - ($2::bigint) * INTERVAL '1 millisecond'
                        OR id IN (
                            SELECT id FROM queue_jobs
                             WHERE state = $1
                             ORDER BY finished_at DESC
                             OFFSET $3
                        )
                   )
                "#,
            )
            .bind(state)
            .bind(millis(max_age))
            .bind(i64::try_from(max_count).unwrap_or(i64::MAX))
            .execute(&self.pool)
            .await?
            .rows_affected();
        }
        if removed > 0 {
            debug!(removed, "pruned finished queue jobs");
        }
        Ok(removed)
    }
}
