use std::time::Duration;

use async_trait::async_trait;
use jfi_core::{BatchPayload, QueuePriority};
use tokio::sync::{Mutex, Notify};
use tokio::time::Instant;
use uuid::Uuid;

use crate::{
    Delivery, EnqueueOptions, FailDisposition, QueueCounts, QueueError, RetentionPolicy, WorkQueue,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Waiting,
    Active,
    Completed,
    Failed,
}

#[derive(Debug, Clone)]
struct Entry {
    id: Uuid,
    job_id: String,
    payload: BatchPayload,
    priority: QueuePriority,
    state: State,
    attempts: u32,
    max_attempts: u32,
    backoff: Duration,
    available_at: Instant,
    lease_owner: Option<String>,
    lease_expires_at: Option<Instant>,
    last_error: Option<String>,
    seq: u64,
    finished_at: Option<Instant>,
}

impl Entry {
    fn lease_expired(&self, now: Instant) -> bool {
        self.state == State::Active && self.lease_expires_at.is_some_and(|at| at <= now)
    }

    fn finish(&mut self, state: State, now: Instant, error: Option<String>) {
        self.state = state;
        self.finished_at = Some(now);
        self.lease_owner = None;
        self.lease_expires_at = None;
        if error.is_some() {
            self.last_error = error;
        }
    }
}

#[derive(Debug, Default)]
struct Inner {
    entries: Vec<Entry>,
    next_seq: u64,
}

/// Process-local queue for tests and `--memory` runs. Nothing survives a
/// restart.
#[derive(Debug, Default)]
pub struct MemoryWorkQueue {
    inner: Mutex<Inner>,
    notify: Notify,
}

impl MemoryWorkQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Payloads of every job still retained, in submission order.
    pub async fn payloads(&self) -> Vec<(String, BatchPayload)> {
        let inner = self.inner.lock().await;
        inner
            .entries
            .iter()
            .map(|e| (e.job_id.clone(), e.payload.clone()))
            .collect()
    }

    pub async fn last_error(&self, job_id: &str) -> Option<String> {
        let inner = self.inner.lock().await;
        inner
            .entries
            .iter()
            .find(|e| e.job_id == job_id)
            .and_then(|e| e.last_error.clone())
    }
}

#[async_trait]
impl WorkQueue for MemoryWorkQueue {
    async fn enqueue(
        &self,
        payload: &BatchPayload,
        options: &EnqueueOptions,
    ) -> Result<String, QueueError> {
        let mut inner = self.inner.lock().await;
        if inner.entries.iter().any(|e| e.job_id == options.job_id) {
            return Err(QueueError::DuplicateJobId(options.job_id.clone()));
        }

        let seq = inner.next_seq;
        inner.next_seq += 1;
        inner.entries.push(Entry {
            id: Uuid::new_v4(),
            job_id: options.job_id.clone(),
            payload: payload.clone(),
            priority: options.priority,
            state: State::Waiting,
            attempts: 0,
            max_attempts: options.max_attempts.max(1),
            backoff: options.backoff,
            available_at: Instant::now(),
            lease_owner: None,
            lease_expires_at: None,
            last_error: None,
            seq,
            finished_at: None,
        });
        drop(inner);
        self.notify.notify_one();
        Ok(options.job_id.clone())
    }

    async fn lease(
        &self,
        worker_id: &str,
        lease_ttl: Duration,
    ) -> Result<Option<Delivery>, QueueError> {
        let now = Instant::now();
        let mut inner = self.inner.lock().await;

        for entry in inner.entries.iter_mut() {
            if entry.lease_expired(now) && entry.attempts >= entry.max_attempts {
                entry.finish(State::Failed, now, Some("lease expired".into()));
            }
        }

        let next = inner
            .entries
            .iter_mut()
            .filter(|e| (e.state == State::Waiting && e.available_at <= now) || e.lease_expired(now))
            .min_by_key(|e| (e.priority, e.available_at, e.seq));

        let Some(entry) = next else {
            return Ok(None);
        };

        entry.state = State::Active;
        entry.attempts += 1;
        entry.lease_owner = Some(worker_id.to_string());
        entry.lease_expires_at = Some(now + lease_ttl);

        Ok(Some(Delivery {
            id: entry.id,
            job_id: entry.job_id.clone(),
            payload: entry.payload.clone(),
            attempt: entry.attempts,
            max_attempts: entry.max_attempts,
            priority: entry.priority,
            backoff: entry.backoff,
            lease_owner: worker_id.to_string(),
        }))
    }

    async fn complete(&self, delivery: &Delivery) -> Result<(), QueueError> {
        let now = Instant::now();
        let mut inner = self.inner.lock().await;
        let entry = held_lease(&mut inner, delivery)?;
        entry.finish(State::Completed, now, None);
        Ok(())
    }

    async fn fail(&self, delivery: &Delivery, reason: &str) -> Result<FailDisposition, QueueError> {
        let now = Instant::now();
        let mut inner = self.inner.lock().await;
        let entry = held_lease(&mut inner, delivery)?;
        let disposition = delivery.fail_disposition();
        match disposition {
            FailDisposition::Retry { delay } => {
                entry.state = State::Waiting;
                entry.available_at = now + delay;
                entry.lease_owner = None;
                entry.lease_expires_at = None;
                entry.last_error = Some(reason.to_string());
            }
            FailDisposition::Dead => entry.finish(State::Failed, now, Some(reason.to_string())),
        }
        Ok(disposition)
    }

    async fn counts(&self) -> Result<QueueCounts, QueueError> {
        let now = Instant::now();
        let inner = self.inner.lock().await;
        let mut counts = QueueCounts::default();
        for entry in &inner.entries {
            match entry.state {
                State::Waiting if entry.available_at > now => counts.delayed += 1,
                State::Waiting => counts.waiting += 1,
                State::Active => counts.active += 1,
                State::Completed => counts.completed += 1,
                State::Failed => counts.failed += 1,
            }
        }
        Ok(counts)
    }

    async fn prune_finished(&self, retention: &RetentionPolicy) -> Result<u64, QueueError> {
        let now = Instant::now();
        let mut inner = self.inner.lock().await;
        let before = inner.entries.len();

        for (state, max_age, max_count) in [
            (State::Completed, retention.completed_age, retention.completed_count),
            (State::Failed, retention.failed_age, retention.failed_count),
        ] {
            let mut finished: Vec<(Instant, Uuid)> = inner
                .entries
                .iter()
                .filter(|e| e.state == state)
                .filter_map(|e| e.finished_at.map(|at| (at, e.id)))
                .collect();
            finished.sort_by(|a, b| b.0.cmp(&a.0));
            let doomed: Vec<Uuid> = finished
                .iter()
                .enumerate()
                .filter(|(rank, (at, _))| *rank as u64 >= max_count || now.duration_since(*at) > max_age)
                .map(|(_, (_, id))| *id)
                .collect();
            inner.entries.retain(|e| !doomed.contains(&e.id));
        }

        Ok((before - inner.entries.len()) as u64)
    }

    async fn wait_for_work(&self, max_wait: Duration) {
        let _ = tokio::time::timeout(max_wait, self.notify.notified()).await;
    }
}

fn held_lease<'a>(inner: &'a mut Inner, delivery: &Delivery) -> Result<&'a mut Entry, QueueError> {
    inner
        .entries
        .iter_mut()
        .find(|e| {
            e.id == delivery.id
                && e.state == State::Active
                && e.lease_owner.as_deref() == Some(delivery.lease_owner.as_str())
        })
        .ok_or_else(|| QueueError::LeaseLost(delivery.job_id.clone()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn payload(batch_number: u32) -> BatchPayload {
        BatchPayload {
            jobs: vec![],
            source: "scheduled-fetch".into(),
            batch_number,
            rejected: vec![],
        }
    }

    #[tokio::test]
    async fn duplicate_job_id_is_refused_visibly() {
        let queue = MemoryWorkQueue::new();
        let options = EnqueueOptions::new("scheduled-fetch-1-0", QueuePriority::Scheduled);
        queue.enqueue(&payload(0), &options).await.unwrap();
        let err = queue.enqueue(&payload(1), &options).await.unwrap_err();
        assert!(matches!(err, QueueError::DuplicateJobId(ref id) if id == "scheduled-fetch-1-0"));
        assert_eq!(queue.counts().await.unwrap().waiting, 1);
        assert_eq!(queue.payloads().await[0].1.batch_number, 0);
    }

    #[tokio::test]
    async fn manual_priority_is_leased_before_scheduled() {
        let queue = MemoryWorkQueue::new();
        queue
            .enqueue(&payload(0), &EnqueueOptions::new("scheduled-0", QueuePriority::Scheduled))
            .await
            .unwrap();
        queue
            .enqueue(&payload(1), &EnqueueOptions::new("scheduled-1", QueuePriority::Scheduled))
            .await
            .unwrap();
        queue
            .enqueue(&payload(9), &EnqueueOptions::new("manual-9", QueuePriority::Manual))
            .await
            .unwrap();

        let ttl = Duration::from_secs(30);
        let order: Vec<String> = [
            queue.lease("w", ttl).await.unwrap().unwrap().job_id,
            queue.lease("w", ttl).await.unwrap().unwrap().job_id,
            queue.lease("w", ttl).await.unwrap().unwrap().job_id,
        ]
        .into();
        assert_eq!(order, vec!["manual-9", "scheduled-0", "scheduled-1"]);
        assert!(queue.lease("w", ttl).await.unwrap().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn failed_delivery_is_delayed_then_dead_lettered() {
        let queue = MemoryWorkQueue::new();
        let options = EnqueueOptions::new("job-1", QueuePriority::Scheduled)
            .with_retry(2, Duration::from_secs(5));
        queue.enqueue(&payload(0), &options).await.unwrap();

        let first = queue.lease("w", Duration::from_secs(30)).await.unwrap().unwrap();
        assert_eq!(first.attempt, 1);
        let disposition = queue.fail(&first, "ledger down").await.unwrap();
        assert_eq!(
            disposition,
            FailDisposition::Retry {
                delay: Duration::from_secs(5)
            }
        );
        assert_eq!(queue.counts().await.unwrap().delayed, 1);
        assert!(queue.lease("w", Duration::from_secs(30)).await.unwrap().is_none());

        tokio::time::advance(Duration::from_secs(5)).await;
        let second = queue.lease("w", Duration::from_secs(30)).await.unwrap().unwrap();
        assert_eq!(second.attempt, 2);
        assert_eq!(queue.fail(&second, "ledger down").await.unwrap(), FailDisposition::Dead);

        let counts = queue.counts().await.unwrap();
        assert_eq!(counts.failed, 1);
        assert_eq!(counts.waiting + counts.delayed + counts.active, 0);
        assert_eq!(queue.last_error("job-1").await.as_deref(), Some("ledger down"));
    }

    #[tokio::test(start_paused = true)]
    async fn expired_lease_is_recovered_by_another_worker() {
        let queue = MemoryWorkQueue::new();
        queue
            .enqueue(&payload(0), &EnqueueOptions::new("job-1", QueuePriority::Scheduled))
            .await
            .unwrap();

        let stalled = queue.lease("w-1", Duration::from_secs(10)).await.unwrap().unwrap();
        assert!(queue.lease("w-2", Duration::from_secs(10)).await.unwrap().is_none());

        tokio::time::advance(Duration::from_secs(11)).await;
        let recovered = queue.lease("w-2", Duration::from_secs(10)).await.unwrap().unwrap();
        assert_eq!(recovered.id, stalled.id);
        assert_eq!(recovered.attempt, 2);

        assert!(matches!(
            queue.complete(&stalled).await,
            Err(QueueError::LeaseLost(_))
        ));
        queue.complete(&recovered).await.unwrap();
        assert_eq!(queue.counts().await.unwrap().completed, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn prune_drops_old_and_excess_finished_jobs() {
        let queue = MemoryWorkQueue::new();
        for i in 0..3 {
            let id = format!("job-{i}");
            queue
                .enqueue(&payload(i), &EnqueueOptions::new(id, QueuePriority::Scheduled))
                .await
                .unwrap();
            let delivery = queue.lease("w", Duration::from_secs(30)).await.unwrap().unwrap();
            queue.complete(&delivery).await.unwrap();
            tokio::time::advance(Duration::from_secs(1)).await;
        }

        let retention = RetentionPolicy {
            completed_count: 2,
            ..RetentionPolicy::default()
        };
        assert_eq!(queue.prune_finished(&retention).await.unwrap(), 1);

        tokio::time::advance(Duration::from_secs(3601)).await;
        assert_eq!(queue.prune_finished(&retention).await.unwrap(), 2);
    }
}
