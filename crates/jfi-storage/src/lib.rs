//! Persistent job store, import ledger, shared key-value store and HTTP fetch
//! utilities for the job feed importer.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use jfi_core::{ImportLogEntry, JobRecord, JobStatus, NormalizedJob, Page};
use serde::Serialize;
use thiserror::Error;

mod http;
mod memory;
mod postgres;

pub use http::{
    classify_reqwest_error, classify_status, FetchError, FetchedResponse, HttpClientConfig,
    HttpFetcher, RetryDisposition,
};
pub use memory::{MemoryKv, MemoryStore};
pub use postgres::PgStore;

pub const CRATE_NAME: &str = "jfi-storage";

/// Default ledger retention window.
pub const DEFAULT_LEDGER_RETENTION_DAYS: i64 = 90;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("migration failed: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),
    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
    #[error("invalid record: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    Inserted,
    Updated,
}

/// Filter + window for job listings.
#[derive(Debug, Clone)]
pub struct JobQuery {
    pub status: Option<JobStatus>,
    pub search: Option<String>,
    pub skip: u64,
    pub limit: u64,
}

impl Default for JobQuery {
    fn default() -> Self {
        Self {
            status: None,
            search: None,
            skip: 0,
            limit: 20,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusCounts {
    pub total: u64,
    pub imported: u64,
    pub updated: u64,
    pub failed: u64,
    pub retrying: u64,
}

impl StatusCounts {
    pub fn add(&mut self, status: JobStatus, n: u64) {
        match status {
            JobStatus::Imported => self.imported += n,
            JobStatus::Updated => self.updated += n,
            JobStatus::Failed => self.failed += n,
            JobStatus::Retrying => self.retrying += n,
        }
        self.total += n;
    }
}

/// Job records keyed by identity key. Every write is an upsert on that key.
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Insert-if-absent else merge fields; sets `imported`, refreshes
    /// `last_imported_at`, clears `error_reason`, keeps `created_at`.
    async fn upsert_imported(
        &self,
        job: &NormalizedJob,
        imported_at: DateTime<Utc>,
    ) -> Result<UpsertOutcome, StoreError>;

    /// Records a failed reconciliation attempt as `status = failed`.
    async fn mark_failed(
        &self,
        job: &NormalizedJob,
        reason: &str,
        at: DateTime<Utc>,
    ) -> Result<(), StoreError>;

    /// Flips the existing records among `keys` to `retrying` and returns them.
    async fn mark_retrying(&self, keys: &[String]) -> Result<Vec<JobRecord>, StoreError>;

    async fn get(&self, identity_key: &str) -> Result<Option<JobRecord>, StoreError>;

    async fn list(&self, query: &JobQuery) -> Result<Page<JobRecord>, StoreError>;

    async fn delete_many(&self, keys: &[String]) -> Result<u64, StoreError>;

    async fn count_by_status(&self) -> Result<StatusCounts, StoreError>;

    async fn ping(&self) -> Result<(), StoreError>;
}

/// Append-only audit trail of batch outcomes. Expiry belongs to the backing
/// store; the ledger itself never deletes.
#[async_trait]
pub trait ImportLedger: Send + Sync {
    async fn append(&self, entry: &ImportLogEntry) -> Result<(), StoreError>;

    /// Newest first.
    async fn list_recent(&self, n: u64) -> Result<Vec<ImportLogEntry>, StoreError>;

    /// Newest first.
    async fn page(&self, skip: u64, limit: u64) -> Result<Page<ImportLogEntry>, StoreError>;

    async fn latest(&self) -> Result<Option<ImportLogEntry>, StoreError> {
        Ok(self.list_recent(1).await?.into_iter().next())
    }
}

/// Shared key-value store with per-key TTL, used for leases and markers.
#[async_trait]
pub trait KvStore: Send + Sync {
    /// Atomically sets `key` only when absent or expired.
    async fn set_if_absent(&self, key: &str, value: &str, ttl: Duration) -> Result<bool, StoreError>;

    async fn get(&self, key: &str) -> Result<Option<String>, StoreError>;

    async fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<(), StoreError>;

    async fn delete(&self, key: &str) -> Result<(), StoreError>;

    /// Round-trip latency.
    async fn ping(&self) -> Result<Duration, StoreError>;
}

/// Store-owned expiry of ledger rows and stale key-value entries.
#[async_trait]
pub trait Housekeeping: Send + Sync {
    async fn purge_expired(&self) -> Result<u64, StoreError>;
}

fn ledger_cutoff(retention: chrono::Duration) -> DateTime<Utc> {
    Utc::now() - retention
}
