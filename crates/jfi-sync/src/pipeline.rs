use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use jfi_adapters::{FeedSource, Normalizer};
use jfi_core::{QueuePriority, SCHEDULED_FETCH_SOURCE};
use jfi_queue::WorkQueue;
use jfi_storage::KvStore;
use serde::Serialize;
use tracing::{info, warn, Instrument};
use uuid::Uuid;

use crate::config::SyncConfig;
use crate::enqueue::{BatchEnqueuer, CycleRecord, EnqueueReport};
use crate::lock::{Cooldown, RunLock, FETCH_LOCK_KEY};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum CycleOutcome {
    Completed,
    LockContended,
    CoolingDown { remaining_secs: u64 },
}

#[derive(Debug, Clone, Serialize)]
pub struct SyncRunSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub outcome: CycleOutcome,
    pub feeds_polled: usize,
    pub fetched_records: usize,
    pub enqueue: EnqueueReport,
}

impl SyncRunSummary {
    fn skipped(run_id: Uuid, started_at: DateTime<Utc>, outcome: CycleOutcome) -> Self {
        Self {
            run_id,
            started_at,
            finished_at: Utc::now(),
            outcome,
            feeds_polled: 0,
            fetched_records: 0,
            enqueue: EnqueueReport::default(),
        }
    }
}

/// One scheduled fetch cycle: lock, cooldown check, fetch every feed,
/// normalize, enqueue, mark, release.
#[derive(Clone)]
pub struct SyncPipeline {
    feed_urls: Vec<String>,
    lock_ttl: Duration,
    feeds: Arc<dyn FeedSource>,
    normalizer: Arc<Normalizer>,
    enqueuer: BatchEnqueuer,
    lock: RunLock,
    cooldown: Cooldown,
}

impl SyncPipeline {
    pub fn new(
        config: &SyncConfig,
        feeds: Arc<dyn FeedSource>,
        normalizer: Arc<Normalizer>,
        queue: Arc<dyn WorkQueue>,
        kv: Arc<dyn KvStore>,
    ) -> Self {
        Self {
            feed_urls: config.feed_urls.clone(),
            lock_ttl: config.lock_ttl,
            feeds,
            normalizer,
            enqueuer: BatchEnqueuer::new(queue, config.batch_size)
                .with_retry(config.queue_attempts, config.queue_backoff),
            lock: RunLock::new(kv.clone()),
            cooldown: Cooldown::new(kv, config.cooldown, config.cooldown_marker_ttl),
        }
    }

    /// Runs one cycle. Lock contention and cooldown are skips, not errors.
    /// The lock is released on every path once acquired.
    pub async fn run_once(&self) -> Result<SyncRunSummary> {
        let run_id = Uuid::new_v4();
        let span = tracing::info_span!("fetch_cycle", run_id = %run_id);
        self.run_cycle(run_id).instrument(span).await
    }

    async fn run_cycle(&self, run_id: Uuid) -> Result<SyncRunSummary> {
        let started_at = Utc::now();
        let Some(guard) = self
            .lock
            .try_acquire(FETCH_LOCK_KEY, self.lock_ttl)
            .await
            .context("acquiring fetch lock")?
        else {
            warn!("fetch cycle already running elsewhere, skipping");
            return Ok(SyncRunSummary::skipped(run_id, started_at, CycleOutcome::LockContended));
        };

        let result = self.run_locked(run_id, started_at).await;

        if let Err(err) = self.lock.release(guard).await {
            warn!(error = %err, "failed to release fetch lock; it will expire with its TTL");
        }
        result
    }

    async fn run_locked(&self, run_id: Uuid, started_at: DateTime<Utc>) -> Result<SyncRunSummary> {
        if let Some(remaining) = self
            .cooldown
            .remaining(started_at)
            .await
            .context("reading cooldown marker")?
        {
            info!(remaining_secs = remaining.as_secs(), "fetch cycle cooling down, skipping");
            return Ok(SyncRunSummary::skipped(
                run_id,
                started_at,
                CycleOutcome::CoolingDown {
                    remaining_secs: remaining.as_secs(),
                },
            ));
        }

        let mut records: Vec<CycleRecord> = Vec::new();
        let mut fetched_records = 0;
        for url in &self.feed_urls {
            let raw = self.feeds.fetch(url).await;
            let fetched_at = Utc::now();
            fetched_records += raw.len();
            records.extend(
                raw.iter()
                    .map(|record| self.normalizer.normalize_or_reject(record, fetched_at)),
            );
        }

        let enqueue = if records.is_empty() {
            warn!(feeds = self.feed_urls.len(), "no records fetched from any feed");
            EnqueueReport::default()
        } else {
            self.enqueuer
                .enqueue_cycle(SCHEDULED_FETCH_SOURCE, QueuePriority::Scheduled, started_at, records)
                .await
        };

        let all_enqueues_failed = enqueue.failed_batches > 0 && enqueue.batch_ids.is_empty();
        if all_enqueues_failed {
            warn!(failed_batches = enqueue.failed_batches, "every batch enqueue failed; cooldown not armed");
        } else if let Err(err) = self.cooldown.mark(Utc::now()).await {
            warn!(error = %err, "failed to write cooldown marker");
        }

        let summary = SyncRunSummary {
            run_id,
            started_at,
            finished_at: Utc::now(),
            outcome: CycleOutcome::Completed,
            feeds_polled: self.feed_urls.len(),
            fetched_records,
            enqueue,
        };
        info!(
            feeds = summary.feeds_polled,
            fetched = summary.fetched_records,
            queued = summary.enqueue.queued_records,
            rejected = summary.enqueue.rejected_records,
            batches = summary.enqueue.batch_ids.len(),
            failed_batches = summary.enqueue.failed_batches,
            "fetch cycle finished"
        );
        Ok(summary)
    }
}
