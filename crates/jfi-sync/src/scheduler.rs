use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use jfi_queue::{RetentionPolicy, WorkQueue};
use jfi_storage::Housekeeping;
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info, warn};

use crate::config::SyncConfig;
use crate::pipeline::SyncPipeline;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HousekeepingReport {
    pub queue_jobs_pruned: u64,
    pub rows_purged: u64,
    pub errors: usize,
}

/// Prunes finished queue jobs and lets each store expire its own stale rows.
#[derive(Clone)]
pub struct Housekeeper {
    queue: Arc<dyn WorkQueue>,
    stores: Vec<Arc<dyn Housekeeping>>,
    retention: RetentionPolicy,
}

impl Housekeeper {
    pub fn new(queue: Arc<dyn WorkQueue>) -> Self {
        Self {
            queue,
            stores: Vec::new(),
            retention: RetentionPolicy::default(),
        }
    }

    pub fn with_store(mut self, store: Arc<dyn Housekeeping>) -> Self {
        self.stores.push(store);
        self
    }

    pub fn with_retention(mut self, retention: RetentionPolicy) -> Self {
        self.retention = retention;
        self
    }

    pub async fn run_once(&self) -> HousekeepingReport {
        let mut report = HousekeepingReport::default();
        match self.queue.prune_finished(&self.retention).await {
            Ok(n) => report.queue_jobs_pruned = n,
            Err(err) => {
                warn!(error = %err, "queue pruning failed");
                report.errors += 1;
            }
        }
        for store in &self.stores {
            match store.purge_expired().await {
                Ok(n) => report.rows_purged += n,
                Err(err) => {
                    warn!(error = %err, "store purge failed");
                    report.errors += 1;
                }
            }
        }
        info!(
            queue_jobs_pruned = report.queue_jobs_pruned,
            rows_purged = report.rows_purged,
            errors = report.errors,
            "housekeeping finished"
        );
        report
    }
}

/// Periodic timers for fetch cycles and housekeeping.
#[derive(Clone)]
pub struct SyncScheduler {
    enabled: bool,
    fetch_interval: Duration,
    fetch_on_boot: bool,
    housekeeping_interval: Duration,
    pipeline: Arc<SyncPipeline>,
    housekeeper: Arc<Housekeeper>,
}

impl SyncScheduler {
    pub fn new(config: &SyncConfig, pipeline: Arc<SyncPipeline>, housekeeper: Arc<Housekeeper>) -> Self {
        Self {
            enabled: config.scheduler_enabled,
            fetch_interval: config.fetch_interval,
            fetch_on_boot: config.fetch_on_boot,
            housekeeping_interval: config.housekeeping_interval,
            pipeline,
            housekeeper,
        }
    }

    /// Builds the scheduler (not yet started), or `None` when scheduling is
    /// disabled.
    pub async fn maybe_build_scheduler(&self) -> Result<Option<JobScheduler>> {
        if !self.enabled {
            return Ok(None);
        }

        let sched = JobScheduler::new().await.context("creating scheduler")?;

        let pipeline = self.pipeline.clone();
        let fetch = Job::new_repeated_async(self.fetch_interval, move |_uuid, _l| {
            let pipeline = pipeline.clone();
            Box::pin(async move {
                info!("running scheduled job fetch");
                if let Err(err) = pipeline.run_once().await {
                    error!(error = %format!("{err:#}"), "scheduled fetch cycle failed");
                }
            })
        })
        .with_context(|| format!("creating fetch job every {:?}", self.fetch_interval))?;
        sched.add(fetch).await.context("adding fetch job")?;

        let housekeeper = self.housekeeper.clone();
        let housekeeping = Job::new_repeated_async(self.housekeeping_interval, move |_uuid, _l| {
            let housekeeper = housekeeper.clone();
            Box::pin(async move {
                housekeeper.run_once().await;
            })
        })
        .with_context(|| format!("creating housekeeping job every {:?}", self.housekeeping_interval))?;
        sched.add(housekeeping).await.context("adding housekeeping job")?;

        info!(
            fetch_interval = ?self.fetch_interval,
            housekeeping_interval = ?self.housekeeping_interval,
            "scheduler configured"
        );
        Ok(Some(sched))
    }

    /// Kicks off one fetch cycle right away when fetch-on-boot is enabled.
    pub fn spawn_boot_fetch(&self) -> Option<JoinHandle<()>> {
        if !self.enabled || !self.fetch_on_boot {
            return None;
        }
        let pipeline = self.pipeline.clone();
        Some(tokio::spawn(async move {
            info!("running boot-time job fetch");
            if let Err(err) = pipeline.run_once().await {
                error!(error = %format!("{err:#}"), "boot-time fetch cycle failed");
            }
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use jfi_adapters::{FeedSource, Normalizer};
    use jfi_core::{BatchPayload, ImportLogEntry, ImportStatus, QueuePriority, RawRecord};
    use jfi_queue::{EnqueueOptions, MemoryWorkQueue};
    use jfi_storage::{ImportLedger, KvStore, MemoryKv, MemoryStore};

    struct NoFeeds;

    #[async_trait::async_trait]
    impl FeedSource for NoFeeds {
        async fn fetch(&self, _url: &str) -> Vec<RawRecord> {
            Vec::new()
        }
    }

    fn scheduler(config: &SyncConfig) -> SyncScheduler {
        let queue = Arc::new(MemoryWorkQueue::new());
        let pipeline = SyncPipeline::new(
            config,
            Arc::new(NoFeeds),
            Arc::new(Normalizer::default()),
            queue.clone(),
            Arc::new(MemoryKv::new()),
        );
        SyncScheduler::new(config, Arc::new(pipeline), Arc::new(Housekeeper::new(queue)))
    }

    #[tokio::test]
    async fn disabled_scheduler_builds_nothing() {
        let config = SyncConfig {
            scheduler_enabled: false,
            ..SyncConfig::default()
        };
        let scheduler = scheduler(&config);
        assert!(scheduler.maybe_build_scheduler().await.unwrap().is_none());
        assert!(scheduler.spawn_boot_fetch().is_none());
    }

    #[tokio::test]
    async fn boot_fetch_runs_a_cycle() {
        let config = SyncConfig {
            feed_urls: vec!["https://jobs.example/feed".into()],
            ..SyncConfig::default()
        };
        let handle = scheduler(&config).spawn_boot_fetch().unwrap();
        handle.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn housekeeping_prunes_queue_and_purges_stores() {
        let queue = Arc::new(MemoryWorkQueue::new());
        queue
            .enqueue(
                &BatchPayload {
                    jobs: vec![],
                    source: "scheduled-fetch".into(),
                    batch_number: 1,
                    rejected: vec![],
                },
                &EnqueueOptions::new("scheduled-fetch-1-0", QueuePriority::Scheduled),
            )
            .await
            .unwrap();
        let delivery = queue.lease("w", Duration::from_secs(30)).await.unwrap().unwrap();
        queue.complete(&delivery).await.unwrap();

        let kv = Arc::new(MemoryKv::new());
        kv.set("jobs:fetch:lock", "x", Duration::from_secs(1)).await.unwrap();

        let store = Arc::new(MemoryStore::new(chrono::Duration::days(90)));
        store
            .append(&ImportLogEntry {
                timestamp: chrono::Utc::now() - chrono::Duration::days(91),
                total_fetched: 0,
                total_imported: 0,
                new_jobs: 0,
                updated_jobs: 0,
                failed_jobs: vec![],
                duration_ms: 0,
                queue_job_id: "old".into(),
                status: ImportStatus::Completed,
                source: "scheduled-fetch".into(),
                batch_number: 1,
            })
            .await
            .unwrap();

        tokio::time::advance(Duration::from_secs(2 * 3600)).await;

        let report = Housekeeper::new(queue.clone())
            .with_store(kv)
            .with_store(store)
            .run_once()
            .await;
        assert_eq!(report.queue_jobs_pruned, 1);
        assert_eq!(report.rows_purged, 2);
        assert_eq!(report.errors, 0);
        assert_eq!(queue.counts().await.unwrap().completed, 0);
    }
}
