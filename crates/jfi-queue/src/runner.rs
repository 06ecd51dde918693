//! Worker pool that leases deliveries and reports outcomes to observers.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use jfi_core::ImportLogEntry;
use tokio::sync::broadcast::{self, error::TryRecvError};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn, Instrument};

use crate::{Delivery, FailDisposition, QueueError, WorkQueue};

/// Processes one leased batch. An `Err` fails the delivery so the queue can
/// retry it.
#[async_trait]
pub trait BatchHandler: Send + Sync {
    async fn handle(&self, delivery: &Delivery) -> anyhow::Result<ImportLogEntry>;
}

/// Explicitly registered listener for delivery outcomes.
pub trait QueueObserver: Send + Sync {
    fn on_completed(&self, _delivery: &Delivery, _outcome: &ImportLogEntry) {}

    fn on_failed(&self, _delivery: &Delivery, _reason: &str, _disposition: FailDisposition) {}
}

#[derive(Debug, Clone, Copy, Default)]
pub struct TracingObserver;

impl QueueObserver for TracingObserver {
    fn on_completed(&self, delivery: &Delivery, outcome: &ImportLogEntry) {
        info!(
            job_id = %delivery.job_id,
            attempt = delivery.attempt,
            status = outcome.status.as_str(),
            fetched = outcome.total_fetched,
            new_jobs = outcome.new_jobs,
            updated_jobs = outcome.updated_jobs,
            failed = outcome.failed_jobs.len(),
            duration_ms = outcome.duration_ms,
            "import batch completed"
        );
    }

    fn on_failed(&self, delivery: &Delivery, reason: &str, disposition: FailDisposition) {
        match disposition {
            FailDisposition::Retry { delay } => warn!(
                job_id = %delivery.job_id,
                attempt = delivery.attempt,
                max_attempts = delivery.max_attempts,
                ?delay,
                reason,
                "import batch failed, will retry"
            ),
            FailDisposition::Dead => error!(
                job_id = %delivery.job_id,
                attempt = delivery.attempt,
                reason,
                "import batch failed permanently"
            ),
        }
    }
}

#[derive(Debug, Clone)]
pub struct RunnerConfig {
    pub concurrency: usize,
    pub poll_interval: Duration,
    pub lease_ttl: Duration,
    pub worker_prefix: String,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            concurrency: 5,
            poll_interval: Duration::from_secs(1),
            lease_ttl: Duration::from_secs(300),
            worker_prefix: format!("worker-{}", std::process::id()),
        }
    }
}

#[derive(Clone)]
pub struct QueueRunner {
    queue: Arc<dyn WorkQueue>,
    handler: Arc<dyn BatchHandler>,
    observers: Vec<Arc<dyn QueueObserver>>,
    config: RunnerConfig,
}

impl QueueRunner {
    pub fn new(queue: Arc<dyn WorkQueue>, handler: Arc<dyn BatchHandler>) -> Self {
        Self {
            queue,
            handler,
            observers: Vec::new(),
            config: RunnerConfig::default(),
        }
    }

    pub fn with_config(mut self, config: RunnerConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_observer(mut self, observer: Arc<dyn QueueObserver>) -> Self {
        self.observers.push(observer);
        self
    }

    /// Leases and processes one delivery. Returns `false` when nothing was ready.
    pub async fn process_next(&self, worker_id: &str) -> Result<bool, QueueError> {
        let Some(delivery) = self.queue.lease(worker_id, self.config.lease_ttl).await? else {
            return Ok(false);
        };

        let span = tracing::info_span!(
            "import_batch",
            job_id = %delivery.job_id,
            batch = delivery.payload.batch_number,
            attempt = delivery.attempt
        );
        self.run_delivery(delivery).instrument(span).await?;
        Ok(true)
    }

    async fn run_delivery(&self, delivery: Delivery) -> Result<(), QueueError> {
        match self.handler.handle(&delivery).await {
            Ok(outcome) => {
                self.queue.complete(&delivery).await?;
                for observer in &self.observers {
                    observer.on_completed(&delivery, &outcome);
                }
            }
            Err(err) => {
                let reason = format!("{err:#}");
                let disposition = self.queue.fail(&delivery, &reason).await?;
                for observer in &self.observers {
                    observer.on_failed(&delivery, &reason, disposition);
                }
            }
        }
        Ok(())
    }

    /// Processes ready deliveries in the calling task until none remain.
    /// Delayed retries are left for later.
    pub async fn drain(&self) -> Result<usize, QueueError> {
        let worker_id = format!("{}-drain", self.config.worker_prefix);
        let mut processed = 0;
        while self.process_next(&worker_id).await? {
            processed += 1;
        }
        Ok(processed)
    }

    /// Spawns `concurrency` workers. In-flight batches finish before a worker
    /// honours shutdown.
    pub fn spawn(&self) -> RunnerHandle {
        let (shutdown_tx, _) = broadcast::channel(1);
        let workers = (0..self.config.concurrency.max(1))
            .map(|n| {
                let runner = self.clone();
                let worker_id = format!("{}-{n}", self.config.worker_prefix);
                let shutdown_rx = shutdown_tx.subscribe();
                tokio::spawn(async move { runner.worker_loop(worker_id, shutdown_rx).await })
            })
            .collect();
        info!(
            workers = self.config.concurrency.max(1),
            observers = self.observers.len(),
            "queue runner started"
        );
        RunnerHandle {
            shutdown_tx,
            workers,
        }
    }

    async fn worker_loop(self, worker_id: String, mut shutdown_rx: broadcast::Receiver<()>) {
        debug!(worker_id = %worker_id, "queue worker starting");
        loop {
            if !matches!(shutdown_rx.try_recv(), Err(TryRecvError::Empty)) {
                break;
            }

            match self.process_next(&worker_id).await {
                Ok(true) => continue,
                Ok(false) => {}
                Err(err) => error!(worker_id = %worker_id, error = %err, "queue worker iteration failed"),
            }

            tokio::select! {
                _ = shutdown_rx.recv() => break,
                _ = self.queue.wait_for_work(self.config.poll_interval) => {}
            }
        }
        debug!(worker_id = %worker_id, "queue worker stopped");
    }
}

pub struct RunnerHandle {
    shutdown_tx: broadcast::Sender<()>,
    workers: Vec<JoinHandle<()>>,
}

impl RunnerHandle {
    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.send(());
        for (idx, worker) in self.workers.into_iter().enumerate() {
            if let Err(err) = worker.await {
                error!(worker = idx, error = %err, "queue worker panicked");
            }
        }
        info!("queue runner stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{EnqueueOptions, MemoryWorkQueue};
    use chrono::Utc;
    use jfi_core::{BatchPayload, ImportStatus, QueuePriority};
    use std::sync::Mutex;

    struct CountingHandler {
        fail_batches: Vec<u32>,
    }

    #[async_trait]
    impl BatchHandler for CountingHandler {
        async fn handle(&self, delivery: &Delivery) -> anyhow::Result<ImportLogEntry> {
            let batch = delivery.payload.batch_number;
            if self.fail_batches.contains(&batch) {
                anyhow::bail!("ledger unavailable for batch {batch}");
            }
            Ok(ImportLogEntry {
                timestamp: Utc::now(),
                total_fetched: 0,
                total_imported: 0,
                new_jobs: 0,
                updated_jobs: 0,
                failed_jobs: vec![],
                duration_ms: 0,
                queue_job_id: delivery.job_id.clone(),
                status: ImportStatus::Completed,
                source: delivery.payload.source.clone(),
                batch_number: batch,
            })
        }
    }

    #[derive(Default)]
    struct RecordingObserver {
        completed: Mutex<Vec<String>>,
        failed: Mutex<Vec<(String, FailDisposition)>>,
    }

    impl QueueObserver for RecordingObserver {
        fn on_completed(&self, delivery: &Delivery, _outcome: &ImportLogEntry) {
            self.completed.lock().unwrap().push(delivery.job_id.clone());
        }

        fn on_failed(&self, delivery: &Delivery, _reason: &str, disposition: FailDisposition) {
            self.failed
                .lock()
                .unwrap()
                .push((delivery.job_id.clone(), disposition));
        }
    }

    fn payload(batch_number: u32) -> BatchPayload {
        BatchPayload {
            jobs: vec![],
            source: "scheduled-fetch".into(),
            batch_number,
            rejected: vec![],
        }
    }

    async fn seeded_queue() -> Arc<MemoryWorkQueue> {
        let queue = Arc::new(MemoryWorkQueue::new());
        for n in 0..3 {
            queue
                .enqueue(
                    &payload(n),
                    &EnqueueOptions::new(format!("scheduled-fetch-1-{n}"), QueuePriority::Scheduled),
                )
                .await
                .unwrap();
        }
        queue
    }

    #[tokio::test]
    async fn drain_notifies_observers_of_each_outcome() {
        let queue = seeded_queue().await;
        let observer = Arc::new(RecordingObserver::default());
        let runner = QueueRunner::new(queue.clone(), Arc::new(CountingHandler { fail_batches: vec![1] }))
            .with_observer(observer.clone())
            .with_observer(Arc::new(TracingObserver));

        assert_eq!(runner.drain().await.unwrap(), 3);

        assert_eq!(
            *observer.completed.lock().unwrap(),
            vec!["scheduled-fetch-1-0", "scheduled-fetch-1-2"]
        );
        let failed = observer.failed.lock().unwrap().clone();
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].0, "scheduled-fetch-1-1");
        assert!(matches!(failed[0].1, FailDisposition::Retry { .. }));

        let counts = queue.counts().await.unwrap();
        assert_eq!(counts.completed, 2);
        assert_eq!(counts.delayed, 1);
    }

    #[tokio::test]
    async fn spawned_workers_process_queue_and_shut_down() {
        let queue = seeded_queue().await;
        let observer = Arc::new(RecordingObserver::default());
        let runner = QueueRunner::new(queue.clone(), Arc::new(CountingHandler { fail_batches: vec![] }))
            .with_config(RunnerConfig {
                concurrency: 2,
                poll_interval: Duration::from_millis(10),
                lease_ttl: Duration::from_secs(30),
                worker_prefix: "test".into(),
            })
            .with_observer(observer.clone());

        let handle = runner.spawn();
        for _ in 0..200 {
            if queue.counts().await.unwrap().completed == 3 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        handle.shutdown().await;

        assert_eq!(queue.counts().await.unwrap().completed, 3);
        assert_eq!(observer.completed.lock().unwrap().len(), 3);
    }
}
