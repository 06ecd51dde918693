use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use chrono::Utc;
use jfi_core::{BatchPayload, FailedJob, ImportLogEntry, ImportStatus, NormalizedJob};
use jfi_queue::{BatchHandler, Delivery};
use jfi_storage::{ImportLedger, JobStore, StoreError, UpsertOutcome};
use tracing::{debug, warn};

/// Reconciles one batch into the job store and records the outcome in the
/// ledger. Records are processed sequentially; one bad record never fails
/// the batch.
#[derive(Clone)]
pub struct ImportWorker {
    store: Arc<dyn JobStore>,
    ledger: Arc<dyn ImportLedger>,
}

impl ImportWorker {
    pub fn new(store: Arc<dyn JobStore>, ledger: Arc<dyn ImportLedger>) -> Self {
        Self { store, ledger }
    }

    /// Returns the appended ledger entry. Only a ledger append failure is an
    /// error; the whole batch is then safe to redeliver.
    pub async fn process_batch(
        &self,
        payload: &BatchPayload,
        queue_job_id: &str,
    ) -> Result<ImportLogEntry, StoreError> {
        let started = Instant::now();
        let mut new_jobs = 0u32;
        let mut updated_jobs = 0u32;
        let mut failed_jobs = Vec::new();

        for job in &payload.jobs {
            match self.reconcile(job).await {
                Ok(UpsertOutcome::Inserted) => new_jobs += 1,
                Ok(UpsertOutcome::Updated) => updated_jobs += 1,
                Err(reason) => {
                    debug!(identity_key = %job.identity_key, reason = %reason, "record failed");
                    self.record_failure(job, &reason).await;
                    failed_jobs.push(FailedJob::new(Some(&job.identity_key), reason));
                }
            }
        }
        failed_jobs.extend(payload.rejected.iter().cloned());

        let total_imported = new_jobs + updated_jobs;
        let entry = ImportLogEntry {
            timestamp: Utc::now(),
            total_fetched: payload.total_records() as u32,
            total_imported,
            new_jobs,
            updated_jobs,
            status: ImportStatus::derive(total_imported as usize, failed_jobs.len()),
            failed_jobs,
            duration_ms: started.elapsed().as_millis() as u64,
            queue_job_id: queue_job_id.to_string(),
            source: payload.source.clone(),
            batch_number: payload.batch_number,
        };

        self.ledger.append(&entry).await?;
        Ok(entry)
    }

    async fn reconcile(&self, job: &NormalizedJob) -> Result<UpsertOutcome, String> {
        if job.identity_key.trim().is_empty() {
            return Err("missing identity key".to_string());
        }
        self.store
            .upsert_imported(job, Utc::now())
            .await
            .map_err(|err| err.to_string())
    }

    async fn record_failure(&self, job: &NormalizedJob, reason: &str) {
        if job.identity_key.trim().is_empty() {
            return;
        }
        if let Err(err) = self.store.mark_failed(job, reason, Utc::now()).await {
            warn!(
                identity_key = %job.identity_key,
                error = %err,
                "could not record failed status"
            );
        }
    }
}

#[async_trait]
impl BatchHandler for ImportWorker {
    async fn handle(&self, delivery: &Delivery) -> anyhow::Result<ImportLogEntry> {
        Ok(self.process_batch(&delivery.payload, &delivery.job_id).await?)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use chrono::DateTime;
    use jfi_core::{JobRecord, JobStatus, Page};
    use jfi_storage::{JobQuery, MemoryStore, StatusCounts};

    pub(crate) fn job(key: &str, title: &str) -> NormalizedJob {
        NormalizedJob {
            identity_key: key.into(),
            title: title.into(),
            link: Some(key.into()),
            published_at: Utc::now(),
            description: "Build things".into(),
            company: "Acme".into(),
            job_type: "Full-Time".into(),
            job_location: "Remote".into(),
            source: "https://jobs.example/feed".into(),
            tags: vec![],
            raw: None,
        }
    }

    fn payload(jobs: Vec<NormalizedJob>) -> BatchPayload {
        BatchPayload {
            jobs,
            source: "scheduled-fetch".into(),
            batch_number: 1,
            rejected: vec![],
        }
    }

    /// Store whose upserts fail for chosen keys and whose failure writes can
    /// also be made to fail.
    pub(crate) struct FailingStore {
        pub inner: MemoryStore,
        pub failing_keys: Vec<String>,
        pub fail_mark_failed: bool,
    }

    #[async_trait]
    impl JobStore for FailingStore {
        async fn upsert_imported(
            &self,
            job: &NormalizedJob,
            at: DateTime<Utc>,
        ) -> Result<UpsertOutcome, StoreError> {
            if self.failing_keys.contains(&job.identity_key) {
                return Err(StoreError::Invalid(format!("write rejected for {}", job.identity_key)));
            }
            self.inner.upsert_imported(job, at).await
        }

        async fn mark_failed(&self, job: &NormalizedJob, reason: &str, at: DateTime<Utc>) -> Result<(), StoreError> {
            if self.fail_mark_failed {
                return Err(StoreError::Invalid("store unavailable".into()));
            }
            self.inner.mark_failed(job, reason, at).await
        }

        async fn mark_retrying(&self, keys: &[String]) -> Result<Vec<JobRecord>, StoreError> {
            self.inner.mark_retrying(keys).await
        }

        async fn get(&self, key: &str) -> Result<Option<JobRecord>, StoreError> {
            self.inner.get(key).await
        }

        async fn list(&self, query: &JobQuery) -> Result<Page<JobRecord>, StoreError> {
            self.inner.list(query).await
        }

        async fn delete_many(&self, keys: &[String]) -> Result<u64, StoreError> {
            self.inner.delete_many(keys).await
        }

        async fn count_by_status(&self) -> Result<StatusCounts, StoreError> {
            self.inner.count_by_status().await
        }

        async fn ping(&self) -> Result<(), StoreError> {
            Ok(())
        }
    }

    struct BrokenLedger;

    #[async_trait]
    impl ImportLedger for BrokenLedger {
        async fn append(&self, _entry: &ImportLogEntry) -> Result<(), StoreError> {
            Err(StoreError::Invalid("ledger offline".into()))
        }

        async fn list_recent(&self, _n: u64) -> Result<Vec<ImportLogEntry>, StoreError> {
            Ok(vec![])
        }

        async fn page(&self, _skip: u64, _limit: u64) -> Result<Page<ImportLogEntry>, StoreError> {
            Ok(Page::empty())
        }
    }

    #[tokio::test]
    async fn repeated_batches_converge_to_one_record_per_key() {
        let store = Arc::new(MemoryStore::default());
        let worker = ImportWorker::new(store.clone(), store.clone());
        let batch = payload(vec![job("https://jobs.example/1", "Rust Engineer")]);

        let first = worker.process_batch(&batch, "q-1").await.unwrap();
        assert_eq!((first.new_jobs, first.updated_jobs), (1, 0));
        let before = store.get("https://jobs.example/1").await.unwrap().unwrap();

        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        let mut renamed = batch.clone();
        renamed.jobs[0].title = "Senior Rust Engineer".into();
        let second = worker.process_batch(&renamed, "q-2").await.unwrap();
        assert_eq!((second.new_jobs, second.updated_jobs), (0, 1));

        let after = store.get("https://jobs.example/1").await.unwrap().unwrap();
        assert_eq!(store.job_count().await, 1);
        assert_eq!(after.created_at, before.created_at);
        assert!(after.last_imported_at > before.last_imported_at);
        assert_eq!(after.title, "Senior Rust Engineer");
        assert_eq!(after.status, JobStatus::Imported);
        assert_eq!(store.list_recent(10).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn failing_records_are_isolated_and_marked() {
        let inner = MemoryStore::default();
        let store = Arc::new(FailingStore {
            inner,
            failing_keys: vec!["https://jobs.example/2".into()],
            fail_mark_failed: false,
        });
        let ledger = Arc::new(MemoryStore::default());
        let worker = ImportWorker::new(store.clone(), ledger.clone());
        let batch = payload(vec![
            job("https://jobs.example/1", "A"),
            job("https://jobs.example/2", "B"),
            job("https://jobs.example/3", "C"),
        ]);

        let entry = worker.process_batch(&batch, "q-1").await.unwrap();
        assert_eq!(entry.total_fetched, 3);
        assert_eq!(entry.total_imported, 2);
        assert_eq!(entry.failed_jobs.len(), 1);
        assert_eq!(entry.failed_jobs[0].identity_key, "https://jobs.example/2");
        assert!(entry.failed_jobs[0].reason.contains("write rejected"));
        assert_eq!(entry.status, ImportStatus::Partial);

        let failed = store.get("https://jobs.example/2").await.unwrap().unwrap();
        assert_eq!(failed.status, JobStatus::Failed);
        assert!(failed.error_reason.is_some());
        assert_eq!(ledger.latest().await.unwrap(), Some(entry));
    }

    #[tokio::test]
    async fn swallowed_failure_write_and_rejections_still_reach_ledger() {
        let store = Arc::new(FailingStore {
            inner: MemoryStore::default(),
            failing_keys: vec!["https://jobs.example/1".into()],
            fail_mark_failed: true,
        });
        let ledger = Arc::new(MemoryStore::default());
        let worker = ImportWorker::new(store, ledger);
        let mut batch = payload(vec![job("https://jobs.example/1", "A"), job("  ", "Blank")]);
        batch
            .rejected
            .push(FailedJob::new(None, "missing identity key"));

        let entry = worker.process_batch(&batch, "q-1").await.unwrap();
        assert_eq!(entry.total_fetched, 3);
        assert_eq!(entry.total_imported, 0);
        assert_eq!(
            entry
                .failed_jobs
                .iter()
                .map(|f| f.identity_key.as_str())
                .collect::<Vec<_>>(),
            vec!["https://jobs.example/1", "N/A", "N/A"]
        );
        assert_eq!(entry.status, ImportStatus::Failed);
    }

    #[tokio::test]
    async fn ledger_failure_fails_the_batch() {
        let store = Arc::new(MemoryStore::default());
        let worker = ImportWorker::new(store.clone(), Arc::new(BrokenLedger));
        let err = worker
            .process_batch(&payload(vec![job("https://jobs.example/1", "A")]), "q-1")
            .await
            .unwrap_err();
        assert!(err.to_string().contains("ledger offline"));
        assert_eq!(store.job_count().await, 1);
    }
}
