//! Fetch-cycle orchestration: run lock, batch enqueue, import worker,
//! operator requeues and the periodic scheduler.

mod config;
mod enqueue;
mod lock;
mod pipeline;
mod retry;
mod scheduler;
mod worker;

pub use config::{SyncConfig, DEFAULT_USER_AGENT};
pub use enqueue::{batch_job_id, partition, BatchEnqueuer, CycleRecord, EnqueueReport};
pub use lock::{Cooldown, LeaseGuard, RunLock, FETCH_LOCK_KEY, LAST_RUN_MARKER_KEY};
pub use pipeline::{CycleOutcome, SyncPipeline, SyncRunSummary};
pub use retry::{ManualImports, RetryReport, UploadReport};
pub use scheduler::{Housekeeper, HousekeepingReport, SyncScheduler};
pub use worker::ImportWorker;

pub const CRATE_NAME: &str = "jfi-sync";
