use std::fmt;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use jfi_core::{FailedJob, ImportLogEntry, ImportStatus, JobRecord, JobStatus, NormalizedJob, Page};
use serde_json::Value as JsonValue;
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::{PgPool, Postgres, QueryBuilder, Row};
use tracing::{debug, info};

use crate::{
    ledger_cutoff, Housekeeping, ImportLedger, JobQuery, JobStore, KvStore, StatusCounts,
    StoreError, UpsertOutcome, DEFAULT_LEDGER_RETENTION_DAYS,
};

const JOB_COLUMNS: &str = "identity_key, title, link, published_at, description, company, \
     job_type, job_location, source, tags, status, last_imported_at, error_reason, \
     raw_payload, created_at, updated_at";

const LOG_COLUMNS: &str = "\"timestamp\", total_fetched, total_imported, new_jobs, updated_jobs, \
     failed_jobs, duration_ms, queue_job_id, status, source, batch_number";

// Must match the expression of jobs_search_idx so the GIN index is used.
const SEARCH_VECTOR: &str = "to_tsvector('english', coalesce(title, '') || ' ' || \
     coalesce(company, '') || ' ' || coalesce(description, ''))";

/// PostgreSQL-backed job store, import ledger and key-value store.
#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
    ledger_retention: chrono::Duration,
}

impl fmt::Debug for PgStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PgStore")
            .field("pool_size", &self.pool.size())
            .field("idle_connections", &self.pool.num_idle())
            .field("ledger_retention_days", &self.ledger_retention.num_days())
            .finish()
    }
}

impl PgStore {
    pub async fn connect(database_url: &str, max_connections: u32) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections.max(1))
            .acquire_timeout(Duration::from_secs(5))
            .connect(database_url)
            .await?;
        info!(max_connections, "connected to postgres");
        Ok(Self::from_pool(pool))
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self {
            pool,
            ledger_retention: chrono::Duration::days(DEFAULT_LEDGER_RETENTION_DAYS),
        }
    }

    pub fn with_ledger_retention(mut self, retention: chrono::Duration) -> Self {
        self.ledger_retention = retention;
        self
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::migrate!("../../migrations").run(&self.pool).await?;
        info!("database migrations applied");
        Ok(())
    }
}

fn job_from_row(row: &PgRow) -> Result<JobRecord, StoreError> {
    let status: String = row.try_get("status")?;
    let status = JobStatus::parse(&status)
        .ok_or_else(|| StoreError::Invalid(format!("unknown job status `{status}`")))?;
    Ok(JobRecord {
        identity_key: row.try_get("identity_key")?,
        title: row.try_get("title")?,
        link: row.try_get("link")?,
        published_at: row.try_get("published_at")?,
        description: row.try_get("description")?,
        company: row.try_get("company")?,
        job_type: row.try_get("job_type")?,
        job_location: row.try_get("job_location")?,
        source: row.try_get("source")?,
        tags: row.try_get("tags")?,
        status,
        last_imported_at: row.try_get("last_imported_at")?,
        error_reason: row.try_get("error_reason")?,
        raw_payload: row.try_get("raw_payload")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn log_from_row(row: &PgRow) -> Result<ImportLogEntry, StoreError> {
    let status: String = row.try_get("status")?;
    let status = ImportStatus::parse(&status)
        .ok_or_else(|| StoreError::Invalid(format!("unknown import status `{status}`")))?;
    let failed_jobs: JsonValue = row.try_get("failed_jobs")?;
    let failed_jobs: Vec<FailedJob> = serde_json::from_value(failed_jobs)?;
    Ok(ImportLogEntry {
        timestamp: row.try_get("timestamp")?,
        total_fetched: count_from_row(row, "total_fetched")?,
        total_imported: count_from_row(row, "total_imported")?,
        new_jobs: count_from_row(row, "new_jobs")?,
        updated_jobs: count_from_row(row, "updated_jobs")?,
        failed_jobs,
        duration_ms: row.try_get::<i64, _>("duration_ms")?.max(0) as u64,
        queue_job_id: row.try_get("queue_job_id")?,
        status,
        source: row.try_get("source")?,
        batch_number: count_from_row(row, "batch_number")?,
    })
}

fn count_from_row(row: &PgRow, column: &str) -> Result<u32, StoreError> {
    let value: i64 = row.try_get(column)?;
    u32::try_from(value).map_err(|_| StoreError::Invalid(format!("{column} out of range: {value}")))
}

fn push_job_filters(qb: &mut QueryBuilder<'_, Postgres>, query: &JobQuery) {
    if let Some(status) = query.status {
        qb.push(" AND status = ").push_bind(status.as_str());
    }
    if let Some(search) = query.search.as_deref().map(str::trim).filter(|s| !s.is_empty()) {
        qb.push(" AND ")
            .push(SEARCH_VECTOR)
            .push(" @@ plainto_tsquery('english', ")
            .push_bind(search.to_string())
            .push(")");
    }
}

#[async_trait]
impl JobStore for PgStore {
    async fn upsert_imported(
        &self,
        job: &NormalizedJob,
        imported_at: DateTime<Utc>,
    ) -> Result<UpsertOutcome, StoreError> {
        let row = sqlx::query(
            r#"
            INSERT INTO jobs (
                identity_key, title, link, published_at, description, company,
                job_type, job_location, source, tags, status, last_imported_at,
                error_reason, raw_payload, created_at, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, 'imported', $11, NULL, $12, $11, $11)
            ON CONFLICT (identity_key) DO UPDATE SET
                title = EXCLUDED.title,
                link = EXCLUDED.link,
                published_at = EXCLUDED.published_at,
                description = EXCLUDED.description,
                company = EXCLUDED.company,
                job_type = EXCLUDED.job_type,
                job_location = EXCLUDED.job_location,
                source = EXCLUDED.source,
                tags = EXCLUDED.tags,
                status = 'imported',
                last_imported_at = EXCLUDED.last_imported_at,
                error_reason = NULL,
                raw_payload = EXCLUDED.raw_payload,
                updated_at = EXCLUDED.updated_at
            RETURNING (xmax = 0) AS inserted
            "#,
        )
        .bind(&job.identity_key)
        .bind(&job.title)
        .bind(&job.link)
        .bind(job.published_at)
        .bind(&job.description)
        .bind(&job.company)
        .bind(&job.job_type)
        .bind(&job.job_location)
        .bind(&job.source)
        .bind(&job.tags)
        .bind(imported_at)
        .bind(&job.raw)
        .fetch_one(&self.pool)
        .await?;

        let inserted: bool = row.try_get("inserted")?;
        Ok(if inserted {
            UpsertOutcome::Inserted
        } else {
            UpsertOutcome::Updated
        })
    }

    async fn mark_failed(
        &self,
        job: &NormalizedJob,
        reason: &str,
        at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO jobs (
                identity_key, title, link, published_at, description, company,
                job_type, job_location, source, tags, status, error_reason,
                raw_payload, created_at, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, 'failed', $11, $12, $13, $13)
            ON CONFLICT (identity_key) DO UPDATE SET
                status = 'failed',
                error_reason = EXCLUDED.error_reason,
                updated_at = EXCLUDED.updated_at
            "#,
        )
        .bind(&job.identity_key)
        .bind(&job.title)
        .bind(&job.link)
        .bind(job.published_at)
        .bind(&job.description)
        .bind(&job.company)
        .bind(&job.job_type)
        .bind(&job.job_location)
        .bind(&job.source)
        .bind(&job.tags)
        .bind(reason)
        .bind(&job.raw)
        .bind(at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn mark_retrying(&self, keys: &[String]) -> Result<Vec<JobRecord>, StoreError> {
        if keys.is_empty() {
            return Ok(Vec::new());
        }
        let rows = sqlx::query(&format!(
            "UPDATE jobs SET status = 'retrying', updated_at = NOW() \
             WHERE identity_key = ANY($1) RETURNING {JOB_COLUMNS}"
        ))
        .bind(keys)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(job_from_row).collect()
    }

    async fn get(&self, identity_key: &str) -> Result<Option<JobRecord>, StoreError> {
        let row = sqlx::query(&format!(
            "SELECT {JOB_COLUMNS} FROM jobs WHERE identity_key = $1"
        ))
        .bind(identity_key)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(job_from_row).transpose()
    }

    async fn list(&self, query: &JobQuery) -> Result<Page<JobRecord>, StoreError> {
        let mut count_qb = QueryBuilder::<Postgres>::new("SELECT COUNT(*) AS total FROM jobs WHERE TRUE");
        push_job_filters(&mut count_qb, query);
        let total: i64 = count_qb
            .build()
            .fetch_one(&self.pool)
            .await?
            .try_get("total")?;

        let mut qb = QueryBuilder::<Postgres>::new(format!("SELECT {JOB_COLUMNS} FROM jobs WHERE TRUE"));
        push_job_filters(&mut qb, query);
        qb.push(" ORDER BY last_imported_at DESC NULLS LAST, updated_at DESC OFFSET ")
            .push_bind(i64::try_from(query.skip).unwrap_or(i64::MAX))
            .push(" LIMIT ")
            .push_bind(query.limit as i64);
        let rows = qb.build().fetch_all(&self.pool).await?;

        Ok(Page {
            items: rows.iter().map(job_from_row).collect::<Result<_, _>>()?,
            total: total.max(0) as u64,
        })
    }

    async fn delete_many(&self, keys: &[String]) -> Result<u64, StoreError> {
        if keys.is_empty() {
            return Ok(0);
        }
        let result = sqlx::query("DELETE FROM jobs WHERE identity_key = ANY($1)")
            .bind(keys)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    async fn count_by_status(&self) -> Result<StatusCounts, StoreError> {
        let rows = sqlx::query("SELECT status, COUNT(*) AS n FROM jobs GROUP BY status")
            .fetch_all(&self.pool)
            .await?;
        let mut counts = StatusCounts::default();
        for row in rows {
            let status: String = row.try_get("status")?;
            let n: i64 = row.try_get("n")?;
            if let Some(status) = JobStatus::parse(&status) {
                counts.add(status, n.max(0) as u64);
            }
        }
        Ok(counts)
    }

    async fn ping(&self) -> Result<(), StoreError> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}

#[async_trait]
impl ImportLedger for PgStore {
    async fn append(&self, entry: &ImportLogEntry) -> Result<(), StoreError> {
        sqlx::query(&format!(
            "INSERT INTO import_logs ({LOG_COLUMNS}) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)"
        ))
        .bind(entry.timestamp)
        .bind(i64::from(entry.total_fetched))
        .bind(i64::from(entry.total_imported))
        .bind(i64::from(entry.new_jobs))
        .bind(i64::from(entry.updated_jobs))
        .bind(serde_json::to_value(&entry.failed_jobs)?)
        .bind(i64::try_from(entry.duration_ms).unwrap_or(i64::MAX))
        .bind(&entry.queue_job_id)
        .bind(entry.status.as_str())
        .bind(&entry.source)
        .bind(i64::from(entry.batch_number))
        .execute(&self.pool)
        .await?;
        debug!(queue_job_id = %entry.queue_job_id, "import log appended");
        Ok(())
    }

    async fn list_recent(&self, n: u64) -> Result<Vec<ImportLogEntry>, StoreError> {
        Ok(self.page(0, n).await?.items)
    }

    async fn page(&self, skip: u64, limit: u64) -> Result<Page<ImportLogEntry>, StoreError> {
        let cutoff = ledger_cutoff(self.ledger_retention);
        let total: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM import_logs WHERE \"timestamp\" > $1")
                .bind(cutoff)
                .fetch_one(&self.pool)
                .await?;

        let rows = sqlx::query(&format!(
            "SELECT {LOG_COLUMNS} FROM import_logs WHERE \"timestamp\" > $1 \
             ORDER BY \"timestamp\" DESC, id DESC OFFSET $2 LIMIT $3"
        ))
        .bind(cutoff)
        .bind(i64::try_from(skip).unwrap_or(i64::MAX))
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;

        Ok(Page {
            items: rows.iter().map(log_from_row).collect::<Result<_, _>>()?,
            total: total.max(0) as u64,
        })
    }
}

#[async_trait]
impl KvStore for PgStore {
    async fn set_if_absent(&self, key: &str, value: &str, ttl: Duration) -> Result<bool, StoreError> {
        let row = sqlx::query(
            r#"
            INSERT INTO kv_entries (key, value, expires_at)
            VALUES ($1, $2, NOW() + ($3::bigint) * INTERVAL '1 millisecond')
            ON CONFLICT (key) DO UPDATE SET
                value = EXCLUDED.value,
                expires_at = EXCLUDED.expires_at
            WHERE kv_entries.expires_at <= NOW()
            RETURNING key
            "#,
        )
        .bind(key)
        .bind(value)
        .bind(ttl_millis(ttl))
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.is_some())
    }

    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let value = sqlx::query_scalar::<_, String>(
            "SELECT value FROM kv_entries WHERE key = $1 AND expires_at > NOW()",
        )
        .bind(key)
        .fetch_optional(&self.pool)
        .await?;
        Ok(value)
    }

    async fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO kv_entries (key, value, expires_at)
            VALUES ($1, $2, NOW() + ($3::bigint) * INTERVAL '1 millisecond')
            ON CONFLICT (key) DO UPDATE SET
                value = EXCLUDED.value,
                expires_at = EXCLUDED.expires_at
            "#,
        )
        .bind(key)
        .bind(value)
        .bind(ttl_millis(ttl))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        sqlx::query("DELETE FROM kv_entries WHERE key = $1")
            .bind(key)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn ping(&self) -> Result<Duration, StoreError> {
        let started = Instant::now();
        sqlx::query("SELECT 1 FROM kv_entries LIMIT 1")
            .execute(&self.pool)
            .await?;
        Ok(started.elapsed())
    }
}

#[async_trait]
impl Housekeeping for PgStore {
    async fn purge_expired(&self) -> Result<u64, StoreError> {
        let logs = sqlx::query("DELETE FROM import_logs WHERE \"timestamp\" <= $1")
            .bind(ledger_cutoff(self.ledger_retention))
            .execute(&self.pool)
            .await?
            .rows_affected();
        let kv = sqlx::query("DELETE FROM kv_entries WHERE expires_at <= NOW()")
            .execute(&self.pool)
            .await?
            .rows_affected();
        debug!(logs, kv, "purged expired rows");
        Ok(logs + kv)
    }
}

fn ttl_millis(ttl: Duration) -> i64 {
    i64::try_from(ttl.as_millis()).unwrap_or(i64::MAX)
}
