use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use jfi_adapters::{FeedSource, FieldMapping, Normalizer, RssFeedSource};
use jfi_queue::{MemoryWorkQueue, PgWorkQueue, QueueRunner, TracingObserver, WorkQueue};
use jfi_storage::{
    Housekeeping, HttpFetcher, ImportLedger, JobStore, KvStore, MemoryKv, MemoryStore, PgStore,
};
use jfi_sync::{
    BatchEnqueuer, Housekeeper, ImportWorker, ManualImports, SyncConfig, SyncPipeline,
    SyncScheduler,
};
use jfi_web::{AppState, WebConfig};
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

const DB_MAX_CONNECTIONS: u32 = 10;

#[derive(Debug, Parser)]
#[command(name = "jfi-cli")]
#[command(about = "Job feed importer command-line interface")]
struct Cli {
    /// Use in-process stores instead of PostgreSQL. Nothing is persisted.
    #[arg(long, global = true)]
    memory: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// API server, queue workers and scheduler in one process.
    Serve,
    /// Run one fetch cycle and exit.
    Sync,
    /// Run queue workers until interrupted.
    Work,
    /// Apply database migrations.
    Migrate,
}

/// Shared clients, constructed once per process and handed down.
struct Backends {
    store: Arc<dyn JobStore>,
    ledger: Arc<dyn ImportLedger>,
    kv: Arc<dyn KvStore>,
    queue: Arc<dyn WorkQueue>,
    housekeeping: Vec<Arc<dyn Housekeeping>>,
}

impl Backends {
    async fn connect(config: &SyncConfig, memory: bool) -> Result<Self> {
        if memory {
            warn!("running with in-memory stores; nothing will be persisted");
            let store = Arc::new(MemoryStore::new(config.ledger_retention()));
            let kv = Arc::new(MemoryKv::new());
            return Ok(Self {
                store: store.clone(),
                ledger: store.clone(),
                kv: kv.clone(),
                queue: Arc::new(MemoryWorkQueue::new()),
                housekeeping: vec![store as Arc<dyn Housekeeping>, kv],
            });
        }

        let store = PgStore::connect(&config.database_url, DB_MAX_CONNECTIONS)
            .await
            .context("connecting to database")?
            .with_ledger_retention(config.ledger_retention());
        store.migrate().await.context("running database migrations")?;
        let queue = Arc::new(PgWorkQueue::new(store.pool().clone()));
        let store = Arc::new(store);
        Ok(Self {
            store: store.clone(),
            ledger: store.clone(),
            kv: store.clone(),
            queue,
            housekeeping: vec![store as Arc<dyn Housekeeping>],
        })
    }

    fn runner(&self, config: &SyncConfig) -> QueueRunner {
        let worker = Arc::new(ImportWorker::new(self.store.clone(), self.ledger.clone()));
        QueueRunner::new(self.queue.clone(), worker)
            .with_config(config.runner_config())
            .with_observer(Arc::new(TracingObserver))
    }

    fn housekeeper(&self) -> Housekeeper {
        self.housekeeping
            .iter()
            .cloned()
            .fold(Housekeeper::new(self.queue.clone()), Housekeeper::with_store)
    }
}

fn enqueuer(config: &SyncConfig, queue: Arc<dyn WorkQueue>) -> BatchEnqueuer {
    BatchEnqueuer::new(queue, config.batch_size).with_retry(config.queue_attempts, config.queue_backoff)
}

fn build_normalizer(config: &SyncConfig) -> Result<Arc<Normalizer>> {
    let mapping = FieldMapping::load_or_default(Some(config.field_mapping_path.as_path()))?;
    Ok(Arc::new(Normalizer::new(mapping)))
}

fn build_pipeline(config: &SyncConfig, backends: &Backends, normalizer: Arc<Normalizer>) -> Result<SyncPipeline> {
    let http = HttpFetcher::new(config.http_client_config()).context("building http client")?;
    let feeds: Arc<dyn FeedSource> =
        Arc::new(RssFeedSource::new(http).with_backoff(config.feed_backoff()));
    Ok(SyncPipeline::new(
        config,
        feeds,
        normalizer,
        backends.queue.clone(),
        backends.kv.clone(),
    ))
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        warn!(error = %err, "failed to listen for ctrl-c");
        std::future::pending::<()>().await;
    }
    info!("shutdown requested");
}

async fn serve(config: SyncConfig, backends: Backends) -> Result<()> {
    let normalizer = build_normalizer(&config)?;
    let pipeline = Arc::new(build_pipeline(&config, &backends, normalizer.clone())?);
    let runner = backends.runner(&config).spawn();

    let scheduler = SyncScheduler::new(&config, pipeline, Arc::new(backends.housekeeper()));
    let mut sched = scheduler.maybe_build_scheduler().await?;
    if let Some(sched) = sched.as_mut() {
        sched.start().await.context("starting scheduler")?;
    }
    let _boot_fetch = scheduler.spawn_boot_fetch();

    let manual = ManualImports::new(
        backends.store.clone(),
        normalizer,
        enqueuer(&config, backends.queue.clone()),
    );
    let state = AppState::new(
        backends.store.clone(),
        backends.ledger.clone(),
        backends.kv.clone(),
        backends.queue.clone(),
        manual,
    );
    let served = jfi_web::serve(&WebConfig::from_env(), state, shutdown_signal()).await;

    if let Some(mut sched) = sched {
        if let Err(err) = sched.shutdown().await {
            warn!(error = %err, "scheduler shutdown failed");
        }
    }
    runner.shutdown().await;
    served
}

async fn sync_once(config: SyncConfig, backends: Backends, memory: bool) -> Result<()> {
    let pipeline = build_pipeline(&config, &backends, build_normalizer(&config)?)?;
    let summary = pipeline.run_once().await?;
    // In-memory queues die with the process, so drain them before exiting.
    if memory {
        let processed = backends.runner(&config).drain().await?;
        info!(processed, "drained in-memory queue");
    }
    println!("{}", serde_json::to_string_pretty(&summary)?);
    Ok(())
}

async fn work(config: SyncConfig, backends: Backends) -> Result<()> {
    let runner = backends.runner(&config).spawn();
    shutdown_signal().await;
    runner.shutdown().await;
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,sqlx=warn".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_target(true))
        .init();

    let cli = Cli::parse();
    let config = SyncConfig::from_env();
    let command = cli.command.unwrap_or(Commands::Serve);

    if let Commands::Migrate = command {
        if cli.memory {
            anyhow::bail!("migrate needs a database; drop --memory");
        }
        let store = PgStore::connect(&config.database_url, 1)
            .await
            .context("connecting to database")?;
        store.migrate().await.context("running database migrations")?;
        info!("migrations applied");
        return Ok(());
    }

    let backends = Backends::connect(&config, cli.memory).await?;
    match command {
        Commands::Serve => serve(config, backends).await,
        Commands::Sync => sync_once(config, backends, cli.memory).await,
        Commands::Work => work(config, backends).await,
        Commands::Migrate => Ok(()),
    }
}
