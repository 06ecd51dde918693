//! Operator entry points that feed records back into the queue.

use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::Utc;
use jfi_adapters::{raw_record_from_json, Normalizer};
use jfi_core::{FailedJob, JobRecord, QueuePriority, MANUAL_RETRY_SOURCE, MANUAL_UPLOAD_SOURCE};
use jfi_storage::JobStore;
use serde::Serialize;
use serde_json::Value as JsonValue;
use tracing::{info, warn};

use crate::enqueue::{BatchEnqueuer, CycleRecord};

const RETRY_NOT_QUEUED: &str = "retry could not be queued";

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RetryReport {
    pub requeued: usize,
    pub batch_ids: Vec<String>,
    pub failed_batches: usize,
    /// Records put back to `failed` because their batch was never queued.
    pub restored: usize,
}

impl RetryReport {
    pub fn nothing_queued(&self) -> bool {
        self.batch_ids.is_empty() && self.failed_batches > 0
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadReport {
    pub queued: usize,
    pub rejected: usize,
    pub batch_ids: Vec<String>,
    pub failed_batches: usize,
}

#[derive(Clone)]
pub struct ManualImports {
    store: Arc<dyn JobStore>,
    normalizer: Arc<Normalizer>,
    enqueuer: BatchEnqueuer,
}

impl ManualImports {
    pub fn new(store: Arc<dyn JobStore>, normalizer: Arc<Normalizer>, enqueuer: BatchEnqueuer) -> Self {
        Self {
            store,
            normalizer,
            enqueuer,
        }
    }

    /// Flips the existing records to `retrying` and enqueues them with the
    /// manual priority. Unknown keys are ignored. Records whose batch could
    /// not be queued go back to `failed`.
    pub async fn requeue_for_retry(&self, keys: &[String]) -> Result<RetryReport> {
        let records = self
            .store
            .mark_retrying(keys)
            .await
            .context("marking records for retry")?;
        if records.is_empty() {
            return Ok(RetryReport::default());
        }

        let jobs: Vec<CycleRecord> = records.iter().map(|r| Ok(r.to_normalized())).collect();
        let report = self
            .enqueuer
            .enqueue_cycle(MANUAL_RETRY_SOURCE, QueuePriority::Manual, Utc::now(), jobs)
            .await;
        let restored = self.restore_unqueued(&records, &report.failed_keys).await;
        info!(
            requested = keys.len(),
            requeued = report.queued_records,
            batches = report.batch_ids.len(),
            restored,
            "records requeued for retry"
        );
        Ok(RetryReport {
            requeued: report.queued_records,
            batch_ids: report.batch_ids,
            failed_batches: report.failed_batches,
            restored,
        })
    }

    async fn restore_unqueued(&self, records: &[JobRecord], failed_keys: &[String]) -> usize {
        let now = Utc::now();
        let mut restored = 0;
        for record in records.iter().filter(|r| failed_keys.contains(&r.identity_key)) {
            match self
                .store
                .mark_failed(&record.to_normalized(), RETRY_NOT_QUEUED, now)
                .await
            {
                Ok(()) => restored += 1,
                Err(err) => warn!(
                    identity_key = %record.identity_key,
                    error = %err,
                    "could not restore record after failed retry enqueue"
                ),
            }
        }
        restored
    }

    /// Normalizes uploaded JSON objects and enqueues them with the manual
    /// priority. Records that fail normalization travel as rejections.
    pub async fn enqueue_manual_upload(&self, source: Option<&str>, records: Vec<JsonValue>) -> UploadReport {
        let source = source
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .unwrap_or(MANUAL_UPLOAD_SOURCE);
        let uploaded_at = Utc::now();

        let normalized: Vec<CycleRecord> = records
            .into_iter()
            .map(|value| match raw_record_from_json(source, value) {
                Some(raw) => self.normalizer.normalize_or_reject(&raw, uploaded_at),
                None => Err(FailedJob::new(None, "uploaded record is not an object")),
            })
            .collect();

        let report = self
            .enqueuer
            .enqueue_cycle(source, QueuePriority::Manual, uploaded_at, normalized)
            .await;
        info!(
            source,
            queued = report.queued_records,
            rejected = report.rejected_records,
            batches = report.batch_ids.len(),
            "manual upload enqueued"
        );
        UploadReport {
            queued: report.queued_records,
            rejected: report.rejected_records,
            batch_ids: report.batch_ids,
            failed_batches: report.failed_batches,
        }
    }
}
