//! Durable, at-least-once work queue for import batches.

use std::time::Duration;

use async_trait::async_trait;
use jfi_core::{BackoffPolicy, BatchPayload, QueuePriority};
use serde::Serialize;
use thiserror::Error;
use uuid::Uuid;

mod memory;
mod postgres;
mod runner;

pub use memory::MemoryWorkQueue;
pub use postgres::PgWorkQueue;
pub use runner::{
    BatchHandler, QueueObserver, QueueRunner, RunnerConfig, RunnerHandle, TracingObserver,
};

pub const CRATE_NAME: &str = "jfi-queue";

pub const DEFAULT_ATTEMPTS: u32 = 3;
pub const DEFAULT_BACKOFF: Duration = Duration::from_millis(5_000);

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("queue database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("payload of queue job {job_id} is unreadable: {source}")]
    Payload {
        job_id: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("payload serialization failed: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error("lease on queue job {0} is no longer held")]
    LeaseLost(String),
    #[error("queue job {0} already exists")]
    DuplicateJobId(String),
}

/// Submission options: the deduplication id, priority and retry policy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnqueueOptions {
    pub job_id: String,
    pub priority: QueuePriority,
    pub max_attempts: u32,
    pub backoff: Duration,
}

impl EnqueueOptions {
    pub fn new(job_id: impl Into<String>, priority: QueuePriority) -> Self {
        Self {
            job_id: job_id.into(),
            priority,
            max_attempts: DEFAULT_ATTEMPTS,
            backoff: DEFAULT_BACKOFF,
        }
    }

    pub fn with_retry(mut self, max_attempts: u32, backoff: Duration) -> Self {
        self.max_attempts = max_attempts.max(1);
        self.backoff = backoff;
        self
    }
}

/// One leased queue message.
#[derive(Debug, Clone, PartialEq)]
pub struct Delivery {
    pub id: Uuid,
    pub job_id: String,
    pub payload: BatchPayload,
    /// 1-based attempt number of this delivery.
    pub attempt: u32,
    pub max_attempts: u32,
    pub priority: QueuePriority,
    pub backoff: Duration,
    pub lease_owner: String,
}

impl Delivery {
    pub fn backoff_policy(&self) -> BackoffPolicy {
        BackoffPolicy::exponential(self.max_attempts, self.backoff)
    }

    /// Outcome of failing this delivery: retry with `backoff × 2^(attempt-1)`
    /// while attempts remain, else dead-letter.
    pub fn fail_disposition(&self) -> FailDisposition {
        let policy = self.backoff_policy();
        if policy.has_attempts_left(self.attempt) {
            FailDisposition::Retry {
                delay: policy.delay_after_attempt(self.attempt),
            }
        } else {
            FailDisposition::Dead
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailDisposition {
    Retry { delay: Duration },
    Dead,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueCounts {
    pub waiting: u64,
    pub active: u64,
    pub delayed: u64,
    pub completed: u64,
    pub failed: u64,
}

/// How long finished jobs are kept for inspection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetentionPolicy {
    pub completed_age: Duration,
    pub completed_count: u64,
    pub failed_age: Duration,
    pub failed_count: u64,
}

impl Default for RetentionPolicy {
    fn default() -> Self {
        Self {
            completed_age: Duration::from_secs(3600),
            completed_count: 500,
            failed_age: Duration::from_secs(24 * 3600),
            failed_count: 1000,
        }
    }
}

#[async_trait]
pub trait WorkQueue: Send + Sync {
    /// Returns the job id. A job id still retained by the queue is not
    /// enqueued a second time and fails with [`QueueError::DuplicateJobId`].
    async fn enqueue(
        &self,
        payload: &BatchPayload,
        options: &EnqueueOptions,
    ) -> Result<String, QueueError>;

    /// Leases the most urgent ready job: lowest priority value, then earliest
    /// availability. Jobs whose lease expired are leasable again.
    async fn lease(&self, worker_id: &str, lease_ttl: Duration)
        -> Result<Option<Delivery>, QueueError>;

    async fn complete(&self, delivery: &Delivery) -> Result<(), QueueError>;

    async fn fail(&self, delivery: &Delivery, reason: &str) -> Result<FailDisposition, QueueError>;

    async fn counts(&self) -> Result<QueueCounts, QueueError>;

    async fn prune_finished(&self, retention: &RetentionPolicy) -> Result<u64, QueueError>;

    /// Parks an idle worker until work may be available.
    async fn wait_for_work(&self, max_wait: Duration) {
        tokio::time::sleep(max_wait).await;
    }
}

fn millis(duration: Duration) -> i64 {
    i64::try_from(duration.as_millis()).unwrap_or(i64::MAX)
}
