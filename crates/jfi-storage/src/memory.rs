use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use jfi_core::{ImportLogEntry, JobRecord, JobStatus, NormalizedJob, Page};
use tokio::sync::Mutex;
use tokio::time::Instant;

use crate::{
    ledger_cutoff, Housekeeping, ImportLedger, JobQuery, JobStore, KvStore, StatusCounts,
    StoreError, UpsertOutcome, DEFAULT_LEDGER_RETENTION_DAYS,
};

#[derive(Debug, Default)]
struct MemoryState {
    jobs: BTreeMap<String, JobRecord>,
    logs: Vec<ImportLogEntry>,
}

/// Process-local job store and ledger for tests and `--memory` runs.
#[derive(Debug)]
pub struct MemoryStore {
    state: Mutex<MemoryState>,
    ledger_retention: chrono::Duration,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new(chrono::Duration::days(DEFAULT_LEDGER_RETENTION_DAYS))
    }
}

impl MemoryStore {
    pub fn new(ledger_retention: chrono::Duration) -> Self {
        Self {
            state: Mutex::new(MemoryState::default()),
            ledger_retention,
        }
    }

    pub async fn job_count(&self) -> usize {
        self.state.lock().await.jobs.len()
    }

    fn visible_logs(logs: &[ImportLogEntry], cutoff: DateTime<Utc>) -> Vec<ImportLogEntry> {
        let mut visible: Vec<ImportLogEntry> = logs
            .iter()
            .filter(|entry| entry.timestamp > cutoff)
            .cloned()
            .collect();
        // Appends are chronological per writer, but concurrent workers may interleave.
        visible.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
        visible
    }
}

fn merge_into(record: &mut JobRecord, job: &NormalizedJob) {
    record.title = job.title.clone();
    record.link = job.link.clone();
    record.published_at = job.published_at;
    record.description = job.description.clone();
    record.company = job.company.clone();
    record.job_type = job.job_type.clone();
    record.job_location = job.job_location.clone();
    record.source = job.source.clone();
    record.tags = job.tags.clone();
    record.raw_payload = job.raw.clone();
}

fn new_record(job: &NormalizedJob, status: JobStatus, at: DateTime<Utc>) -> JobRecord {
    JobRecord {
        identity_key: job.identity_key.clone(),
        title: job.title.clone(),
        link: job.link.clone(),
        published_at: job.published_at,
        description: job.description.clone(),
        company: job.company.clone(),
        job_type: job.job_type.clone(),
        job_location: job.job_location.clone(),
        source: job.source.clone(),
        tags: job.tags.clone(),
        status,
        last_imported_at: None,
        error_reason: None,
        raw_payload: job.raw.clone(),
        created_at: at,
        updated_at: at,
    }
}

fn matches_search(record: &JobRecord, needle: &str) -> bool {
    let needle = needle.to_lowercase();
    [&record.title, &record.company, &record.description]
        .iter()
        .any(|field| field.to_lowercase().contains(&needle))
}

#[async_trait]
impl JobStore for MemoryStore {
    async fn upsert_imported(
        &self,
        job: &NormalizedJob,
        imported_at: DateTime<Utc>,
    ) -> Result<UpsertOutcome, StoreError> {
        if job.identity_key.trim().is_empty() {
            return Err(StoreError::Invalid("identity key is empty".into()));
        }

        let mut state = self.state.lock().await;
        let outcome = match state.jobs.get_mut(&job.identity_key) {
            Some(record) => {
                merge_into(record, job);
                record.status = JobStatus::Imported;
                record.last_imported_at = Some(imported_at);
                record.error_reason = None;
                record.updated_at = imported_at;
                UpsertOutcome::Updated
            }
            None => {
                let mut record = new_record(job, JobStatus::Imported, imported_at);
                record.last_imported_at = Some(imported_at);
                state.jobs.insert(job.identity_key.clone(), record);
                UpsertOutcome::Inserted
            }
        };
        Ok(outcome)
    }

    async fn mark_failed(
        &self,
        job: &NormalizedJob,
        reason: &str,
        at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        if job.identity_key.trim().is_empty() {
            return Err(StoreError::Invalid("identity key is empty".into()));
        }

        let mut state = self.state.lock().await;
        let record = state
            .jobs
            .entry(job.identity_key.clone())
            .or_insert_with(|| new_record(job, JobStatus::Failed, at));
        record.status = JobStatus::Failed;
        record.error_reason = Some(reason.to_string());
        record.updated_at = at;
        Ok(())
    }

    async fn mark_retrying(&self, keys: &[String]) -> Result<Vec<JobRecord>, StoreError> {
        let now = Utc::now();
        let mut state = self.state.lock().await;
        let mut flipped = Vec::new();
        for key in keys {
            if let Some(record) = state.jobs.get_mut(key) {
                record.status = JobStatus::Retrying;
                record.updated_at = now;
                flipped.push(record.clone());
            }
        }
        Ok(flipped)
    }

    async fn get(&self, identity_key: &str) -> Result<Option<JobRecord>, StoreError> {
        Ok(self.state.lock().await.jobs.get(identity_key).cloned())
    }

    async fn list(&self, query: &JobQuery) -> Result<Page<JobRecord>, StoreError> {
        let state = self.state.lock().await;
        let mut matching: Vec<JobRecord> = state
            .jobs
            .values()
            .filter(|r| query.status.map_or(true, |s| r.status == s))
            .filter(|r| {
                query
                    .search
                    .as_deref()
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .map_or(true, |s| matches_search(r, s))
            })
            .cloned()
            .collect();
        matching.sort_by(|a, b| {
            b.last_imported_at
                .cmp(&a.last_imported_at)
                .then_with(|| b.updated_at.cmp(&a.updated_at))
        });

        let total = matching.len() as u64;
        let items = matching
            .into_iter()
            .skip(usize::try_from(query.skip).unwrap_or(usize::MAX))
            .take(query.limit as usize)
            .collect();
        Ok(Page { items, total })
    }

    async fn delete_many(&self, keys: &[String]) -> Result<u64, StoreError> {
        let mut state = self.state.lock().await;
        let deleted = keys
            .iter()
            .filter(|key| state.jobs.remove(key.as_str()).is_some())
            .count();
        Ok(deleted as u64)
    }

    async fn count_by_status(&self) -> Result<StatusCounts, StoreError> {
        let state = self.state.lock().await;
        let mut counts = StatusCounts::default();
        for record in state.jobs.values() {
            counts.add(record.status, 1);
        }
        Ok(counts)
    }

    async fn ping(&self) -> Result<(), StoreError> {
        Ok(())
    }
}

#[async_trait]
impl ImportLedger for MemoryStore {
    async fn append(&self, entry: &ImportLogEntry) -> Result<(), StoreError> {
        self.state.lock().await.logs.push(entry.clone());
        Ok(())
    }

    async fn list_recent(&self, n: u64) -> Result<Vec<ImportLogEntry>, StoreError> {
        let state = self.state.lock().await;
        let mut visible = Self::visible_logs(&state.logs, ledger_cutoff(self.ledger_retention));
        visible.truncate(n as usize);
        Ok(visible)
    }

    async fn page(&self, skip: u64, limit: u64) -> Result<Page<ImportLogEntry>, StoreError> {
        let state = self.state.lock().await;
        let visible = Self::visible_logs(&state.logs, ledger_cutoff(self.ledger_retention));
        let total = visible.len() as u64;
        let items = visible
            .into_iter()
            .skip(usize::try_from(skip).unwrap_or(usize::MAX))
            .take(limit as usize)
            .collect();
        Ok(Page { items, total })
    }
}

#[async_trait]
impl Housekeeping for MemoryStore {
    async fn purge_expired(&self) -> Result<u64, StoreError> {
        let cutoff = ledger_cutoff(self.ledger_retention);
        let mut state = self.state.lock().await;
        let before = state.logs.len();
        state.logs.retain(|entry| entry.timestamp > cutoff);
        Ok((before - state.logs.len()) as u64)
    }
}

/// Process-local key-value store with TTL expiry on tokio's clock.
#[derive(Debug, Default)]
pub struct MemoryKv {
    entries: Mutex<HashMap<String, (String, Instant)>>,
}

impl MemoryKv {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl KvStore for MemoryKv {
    async fn set_if_absent(&self, key: &str, value: &str, ttl: Duration) -> Result<bool, StoreError> {
        let now = Instant::now();
        let mut entries = self.entries.lock().await;
        if let Some((_, expires_at)) = entries.get(key) {
            if *expires_at > now {
                return Ok(false);
            }
        }
        entries.insert(key.to_string(), (value.to_string(), now + ttl));
        Ok(true)
    }

    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let now = Instant::now();
        let entries = self.entries.lock().await;
        Ok(entries
            .get(key)
            .filter(|(_, expires_at)| *expires_at > now)
            .map(|(value, _)| value.clone()))
    }

    async fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<(), StoreError> {
        let expires_at = Instant::now() + ttl;
        self.entries
            .lock()
            .await
            .insert(key.to_string(), (value.to_string(), expires_at));
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        self.entries.lock().await.remove(key);
        Ok(())
    }

    async fn ping(&self) -> Result<Duration, StoreError> {
        Ok(Duration::ZERO)
    }
}

#[async_trait]
impl Housekeeping for MemoryKv {
    async fn purge_expired(&self) -> Result<u64, StoreError> {
        let now = Instant::now();
        let mut entries = self.entries.lock().await;
        let before = entries.len();
        entries.retain(|_, (_, expires_at)| *expires_at > now);
        Ok((before - entries.len()) as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use jfi_core::{FailedJob, ImportStatus};

    fn job(key: &str, title: &str) -> NormalizedJob {
        NormalizedJob {
            identity_key: key.into(),
            title: title.into(),
            link: Some(key.into()),
            published_at: Utc::now(),
            description: "Build ingestion services".into(),
            company: "Acme".into(),
            job_type: "Full-Time".into(),
            job_location: "Remote".into(),
            source: "https://example.com/feed".into(),
            tags: vec![],
            raw: None,
        }
    }

    fn log_at(timestamp: DateTime<Utc>, batch_number: u32) -> ImportLogEntry {
        ImportLogEntry {
            timestamp,
            total_fetched: 1,
            total_imported: 1,
            new_jobs: 1,
            updated_jobs: 0,
            failed_jobs: Vec::<FailedJob>::new(),
            duration_ms: 3,
            queue_job_id: format!("scheduled-fetch-1-{batch_number}"),
            status: ImportStatus::Completed,
            source: "scheduled-fetch".into(),
            batch_number,
        }
    }

    #[tokio::test]
    async fn upsert_is_idempotent_per_identity_key() {
        let store = MemoryStore::default();
        let first_at = Utc::now();
        let second_at = first_at + chrono::Duration::seconds(30);

        let first = store
            .upsert_imported(&job("https://example.com/jobs/1", "Rust Engineer"), first_at)
            .await
            .expect("first upsert");
        let second = store
            .upsert_imported(&job("https://example.com/jobs/1", "Senior Rust Engineer"), second_at)
            .await
            .expect("second upsert");

        assert_eq!(first, UpsertOutcome::Inserted);
        assert_eq!(second, UpsertOutcome::Updated);
        assert_eq!(store.job_count().await, 1);

        let record = store
            .get("https://example.com/jobs/1")
            .await
            .expect("get")
            .expect("record exists");
        assert_eq!(record.title, "Senior Rust Engineer");
        assert_eq!(record.created_at, first_at);
        assert_eq!(record.last_imported_at, Some(second_at));
        assert_eq!(record.status, JobStatus::Imported);
    }

    #[tokio::test]
    async fn failed_then_imported_clears_error_reason() {
        let store = MemoryStore::default();
        let j = job("k-1", "Data Engineer");
        store.mark_failed(&j, "boom", Utc::now()).await.expect("mark failed");
        assert_eq!(
            store.get("k-1").await.unwrap().unwrap().error_reason.as_deref(),
            Some("boom")
        );

        store.upsert_imported(&j, Utc::now()).await.expect("upsert");
        let record = store.get("k-1").await.unwrap().unwrap();
        assert_eq!(record.status, JobStatus::Imported);
        assert!(record.error_reason.is_none());
    }

    #[tokio::test]
    async fn list_filters_by_status_and_search() {
        let store = MemoryStore::default();
        store.upsert_imported(&job("a", "Rust Engineer"), Utc::now()).await.unwrap();
        store.upsert_imported(&job("b", "Designer"), Utc::now()).await.unwrap();
        store.mark_failed(&job("c", "Rust Intern"), "bad", Utc::now()).await.unwrap();

        let page = store
            .list(&JobQuery {
                search: Some("rust".into()),
                ..JobQuery::default()
            })
            .await
            .unwrap();
        assert_eq!(page.total, 2);

        let page = store
            .list(&JobQuery {
                status: Some(JobStatus::Failed),
                ..JobQuery::default()
            })
            .await
            .unwrap();
        assert_eq!(page.total, 1);
        assert_eq!(page.items[0].identity_key, "c");

        let counts = store.count_by_status().await.unwrap();
        assert_eq!(counts.total, 3);
        assert_eq!(counts.imported, 2);
        assert_eq!(counts.failed, 1);
    }

    #[tokio::test]
    async fn ledger_hides_and_purges_entries_past_retention() {
        let store = MemoryStore::new(chrono::Duration::days(1));
        store.append(&log_at(Utc::now() - chrono::Duration::days(2), 1)).await.unwrap();
        store.append(&log_at(Utc::now(), 2)).await.unwrap();

        let page = store.page(0, 10).await.unwrap();
        assert_eq!(page.total, 1);
        assert_eq!(store.latest().await.unwrap().unwrap().batch_number, 2);

        assert_eq!(store.purge_expired().await.unwrap(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn kv_set_if_absent_respects_ttl() {
        let kv = MemoryKv::new();
        assert!(kv.set_if_absent("lock", "a", Duration::from_secs(60)).await.unwrap());
        assert!(!kv.set_if_absent("lock", "b", Duration::from_secs(60)).await.unwrap());
        assert_eq!(kv.get("lock").await.unwrap().as_deref(), Some("a"));

        tokio::time::advance(Duration::from_secs(61)).await;
        assert!(kv.get("lock").await.unwrap().is_none());
        assert!(kv.set_if_absent("lock", "b", Duration::from_secs(60)).await.unwrap());

        kv.delete("lock").await.unwrap();
        assert!(kv.get("lock").await.unwrap().is_none());
    }
}
