use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use jfi_core::{BatchPayload, FailedJob, NormalizedJob, QueuePriority};
use jfi_queue::{EnqueueOptions, WorkQueue, DEFAULT_ATTEMPTS, DEFAULT_BACKOFF};
use serde::Serialize;
use tracing::{debug, error};
use uuid::Uuid;

/// Output of normalizing one record: accepted, or rejected with its reason.
pub type CycleRecord = Result<NormalizedJob, FailedJob>;

/// Splits `items` into consecutive chunks of `size`; the last may be shorter.
pub fn partition<T>(items: Vec<T>, size: usize) -> Vec<Vec<T>> {
    let size = size.max(1);
    let mut batches = Vec::with_capacity(items.len().div_ceil(size));
    let mut current = Vec::with_capacity(size.min(items.len()));
    for item in items {
        current.push(item);
        if current.len() == size {
            batches.push(std::mem::replace(&mut current, Vec::with_capacity(size)));
        }
    }
    if !current.is_empty() {
        batches.push(current);
    }
    batches
}

/// `<label>-<cycle ms>-<nonce>-<index>`. The nonce is drawn once per
/// submission so two submissions in the same millisecond never share ids.
pub fn batch_job_id(label: &str, cycle_at: DateTime<Utc>, nonce: &str, index: usize) -> String {
    format!("{label}-{}-{nonce}-{index}", cycle_at.timestamp_millis())
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EnqueueReport {
    pub batch_ids: Vec<String>,
    pub queued_records: usize,
    pub rejected_records: usize,
    pub failed_batches: usize,
    /// Identity keys of accepted jobs whose batch never reached the queue.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub failed_keys: Vec<String>,
}

#[derive(Clone)]
pub struct BatchEnqueuer {
    queue: Arc<dyn WorkQueue>,
    batch_size: usize,
    max_attempts: u32,
    backoff: Duration,
}

impl BatchEnqueuer {
    pub fn new(queue: Arc<dyn WorkQueue>, batch_size: usize) -> Self {
        Self {
            queue,
            batch_size: batch_size.max(1),
            max_attempts: DEFAULT_ATTEMPTS,
            backoff: DEFAULT_BACKOFF,
        }
    }

    pub fn with_retry(mut self, max_attempts: u32, backoff: Duration) -> Self {
        self.max_attempts = max_attempts.max(1);
        self.backoff = backoff;
        self
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    /// Submits the cycle in ascending batch order. A failed submission is
    /// logged and counted; later batches are still attempted.
    pub async fn enqueue_cycle(
        &self,
        source: &str,
        priority: QueuePriority,
        cycle_at: DateTime<Utc>,
        records: Vec<CycleRecord>,
    ) -> EnqueueReport {
        let mut report = EnqueueReport::default();
        let nonce = Uuid::new_v4().simple().to_string();
        for (index, slice) in partition(records, self.batch_size).into_iter().enumerate() {
            let (jobs, rejected): (Vec<_>, Vec<_>) = slice.into_iter().partition(Result::is_ok);
            let payload = BatchPayload {
                jobs: jobs.into_iter().filter_map(Result::ok).collect(),
                source: source.to_string(),
                batch_number: index as u32 + 1,
                rejected: rejected.into_iter().filter_map(Result::err).collect(),
            };
            let options = EnqueueOptions::new(batch_job_id(source, cycle_at, &nonce, index), priority)
                .with_retry(self.max_attempts, self.backoff);

            match self.queue.enqueue(&payload, &options).await {
                Ok(job_id) => {
                    debug!(
                        job_id = %job_id,
                        jobs = payload.jobs.len(),
                        rejected = payload.rejected.len(),
                        "batch enqueued"
                    );
                    report.queued_records += payload.jobs.len();
                    report.rejected_records += payload.rejected.len();
                    report.batch_ids.push(job_id);
                }
                Err(err) => {
                    error!(job_id = %options.job_id, error = %err, "failed to enqueue batch");
                    report.failed_batches += 1;
                    report
                        .failed_keys
                        .extend(payload.jobs.into_iter().map(|job| job.identity_key));
                }
            }
        }
        report
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use async_trait::async_trait;
    use jfi_queue::{Delivery, FailDisposition, MemoryWorkQueue, QueueCounts, QueueError, RetentionPolicy};

    fn job(n: usize) -> NormalizedJob {
        NormalizedJob {
            identity_key: format!("https://jobs.example/{n}"),
            title: format!("Job {n}"),
            link: Some(format!("https://jobs.example/{n}")),
            published_at: Utc::now(),
            description: String::new(),
            company: "Unknown".into(),
            job_type: "Unknown".into(),
            job_location: "Remote".into(),
            source: "https://jobs.example/feed".into(),
            tags: vec![],
            raw: None,
        }
    }

    #[test]
    fn partition_preserves_order_and_sizes() {
        let batches = partition((0..450).collect::<Vec<_>>(), 200);
        assert_eq!(
            batches.iter().map(Vec::len).collect::<Vec<_>>(),
            vec![200, 200, 50]
        );
        assert_eq!(batches.concat(), (0..450).collect::<Vec<_>>());
        assert!(partition(Vec::<u8>::new(), 200).is_empty());
        assert_eq!(partition(vec![1, 2, 3], 0).len(), 3);
    }

    #[tokio::test]
    async fn cycle_batches_carry_job_ids_and_rejections() {
        let queue = Arc::new(MemoryWorkQueue::new());
        let enqueuer = BatchEnqueuer::new(queue.clone(), 2);
        let cycle_at = Utc::now();
        let records = vec![
            Ok(job(1)),
            Err(FailedJob::new(None, "missing identity key")),
            Ok(job(2)),
        ];

        let report = enqueuer
            .enqueue_cycle("scheduled-fetch", QueuePriority::Scheduled, cycle_at, records)
            .await;

        let prefix = format!("scheduled-fetch-{}-", cycle_at.timestamp_millis());
        assert_eq!(report.batch_ids.len(), 2);
        assert!(report.batch_ids.iter().all(|id| id.starts_with(&prefix)));
        assert!(report.batch_ids[0].ends_with("-0"));
        assert!(report.batch_ids[1].ends_with("-1"));
        assert_eq!(report.queued_records, 2);
        assert_eq!(report.rejected_records, 1);

        let payloads = queue.payloads().await;
        assert_eq!(payloads[0].1.jobs.len(), 1);
        assert_eq!(payloads[0].1.rejected.len(), 1);
        assert_eq!(payloads[0].1.batch_number, 1);
        assert_eq!(payloads[1].1.batch_number, 2);
    }

    /// Refuses the batch numbered `reject_batch`.
    pub(crate) struct FlakyQueue {
        pub(crate) inner: MemoryWorkQueue,
        pub(crate) reject_batch: u32,
    }

    #[async_trait]
    impl WorkQueue for FlakyQueue {
        async fn enqueue(&self, payload: &BatchPayload, options: &EnqueueOptions) -> Result<String, QueueError> {
            if payload.batch_number == self.reject_batch {
                return Err(QueueError::LeaseLost(options.job_id.clone()));
            }
            self.inner.enqueue(payload, options).await
        }

        async fn lease(&self, worker_id: &str, ttl: Duration) -> Result<Option<Delivery>, QueueError> {
            self.inner.lease(worker_id, ttl).await
        }

        async fn complete(&self, delivery: &Delivery) -> Result<(), QueueError> {
            self.inner.complete(delivery).await
        }

        async fn fail(&self, delivery: &Delivery, reason: &str) -> Result<FailDisposition, QueueError> {
            self.inner.fail(delivery, reason).await
        }

        async fn counts(&self) -> Result<QueueCounts, QueueError> {
            self.inner.counts().await
        }

        async fn prune_finished(&self, retention: &RetentionPolicy) -> Result<u64, QueueError> {
            self.inner.prune_finished(retention).await
        }
    }

    #[tokio::test]
    async fn failed_enqueue_is_counted_and_later_batches_still_go() {
        let queue = Arc::new(FlakyQueue {
            inner: MemoryWorkQueue::new(),
            reject_batch: 1,
        });
        let enqueuer = BatchEnqueuer::new(queue.clone(), 1);
        let report = enqueuer
            .enqueue_cycle(
                "manual-upload",
                QueuePriority::Manual,
                Utc::now(),
                vec![Ok(job(1)), Ok(job(2)), Ok(job(3))],
            )
            .await;

        assert_eq!(report.failed_batches, 1);
        assert_eq!(report.failed_keys, vec!["https://jobs.example/1".to_string()]);
        assert_eq!(report.batch_ids.len(), 2);
        assert_eq!(queue.inner.counts().await.unwrap().waiting, 2);
    }

    #[tokio::test]
    async fn submissions_in_the_same_millisecond_keep_distinct_ids() {
        let queue = Arc::new(MemoryWorkQueue::new());
        let enqueuer = BatchEnqueuer::new(queue.clone(), 200);
        let at = Utc::now();

        let first = enqueuer
            .enqueue_cycle("manual-upload", QueuePriority::Manual, at, vec![Ok(job(1))])
            .await;
        let second = enqueuer
            .enqueue_cycle("manual-upload", QueuePriority::Manual, at, vec![Ok(job(2))])
            .await;

        assert_eq!(first.failed_batches + second.failed_batches, 0);
        assert_ne!(first.batch_ids, second.batch_ids);
        let payloads = queue.payloads().await;
        assert_eq!(payloads.len(), 2);
        assert_eq!(payloads[1].1.jobs[0].identity_key, "https://jobs.example/2");
    }

    #[tokio::test]
    async fn duplicate_job_id_counts_as_failed_batch() {
        let queue = Arc::new(MemoryWorkQueue::new());
        let at = Utc::now();
        let taken = batch_job_id("manual-upload", at, "n", 0);
        queue
            .enqueue(
                &BatchPayload {
                    jobs: vec![],
                    source: "manual-upload".into(),
                    batch_number: 1,
                    rejected: vec![],
                },
                &EnqueueOptions::new(taken.clone(), QueuePriority::Manual),
            )
            .await
            .unwrap();

        let duplicating = Arc::new(FixedIdQueue {
            inner: queue.clone(),
            job_id: taken,
        });
        let report = BatchEnqueuer::new(duplicating, 200)
            .enqueue_cycle("manual-upload", QueuePriority::Manual, at, vec![Ok(job(5))])
            .await;

        assert!(report.batch_ids.is_empty());
        assert_eq!(report.queued_records, 0);
        assert_eq!(report.failed_batches, 1);
        assert_eq!(report.failed_keys, vec!["https://jobs.example/5".to_string()]);
        assert_eq!(queue.payloads().await.len(), 1);
    }

    /// Forces every submission onto one job id.
    struct FixedIdQueue {
        inner: Arc<MemoryWorkQueue>,
        job_id: String,
    }

    #[async_trait]
    impl WorkQueue for FixedIdQueue {
        async fn enqueue(&self, payload: &BatchPayload, options: &EnqueueOptions) -> Result<String, QueueError> {
            let mut options = options.clone();
            options.job_id = self.job_id.clone();
            self.inner.enqueue(payload, &options).await
        }

        async fn lease(&self, worker_id: &str, ttl: Duration) -> Result<Option<Delivery>, QueueError> {
            self.inner.lease(worker_id, ttl).await
        }

        async fn complete(&self, delivery: &Delivery) -> Result<(), QueueError> {
            self.inner.complete(delivery).await
        }

        async fn fail(&self, delivery: &Delivery, reason: &str) -> Result<FailDisposition, QueueError> {
            self.inner.fail(delivery, reason).await
        }

        async fn counts(&self) -> Result<QueueCounts, QueueError> {
            self.inner.counts().await
        }

        async fn prune_finished(&self, retention: &RetentionPolicy) -> Result<u64, QueueError> {
            self.inner.prune_finished(retention).await
        }
    }
}
