//! JSON reporting and management API over the job store, import ledger and
//! work queue.

use std::future::Future;
use std::sync::Arc;
use std::time::Instant;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::Utc;
use jfi_core::{ImportLogEntry, JobStatus};
use jfi_queue::WorkQueue;
use jfi_storage::{ImportLedger, JobQuery, JobStore, KvStore};
use jfi_sync::ManualImports;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value as JsonValue};
use tokio::net::TcpListener;
use tracing::{error, info};

pub const CRATE_NAME: &str = "jfi-web";

const DEFAULT_LOG_LIMIT: u64 = 10;
const DEFAULT_JOB_LIMIT: u64 = 20;
const MAX_LIMIT: u64 = 100;

#[derive(Debug, Clone)]
pub struct WebConfig {
    pub bind_addr: String,
    pub port: u16,
}

impl WebConfig {
    pub fn from_env() -> Self {
        Self {
            bind_addr: std::env::var("JFI_BIND_ADDR").unwrap_or_else(|_| "0.0.0.0".to_string()),
            port: std::env::var("PORT")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(5003),
        }
    }
}

pub struct AppState {
    pub store: Arc<dyn JobStore>,
    pub ledger: Arc<dyn ImportLedger>,
    pub kv: Arc<dyn KvStore>,
    pub queue: Arc<dyn WorkQueue>,
    pub manual: ManualImports,
    pub started_at: Instant,
}

impl AppState {
    pub fn new(
        store: Arc<dyn JobStore>,
        ledger: Arc<dyn ImportLedger>,
        kv: Arc<dyn KvStore>,
        queue: Arc<dyn WorkQueue>,
        manual: ManualImports,
    ) -> Self {
        Self {
            store,
            ledger,
            kv,
            queue,
            manual,
            started_at: Instant::now(),
        }
    }
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/api/ping", get(ping_handler))
        .route("/api/health", get(health_handler))
        .route("/api/health/kv", get(kv_health_handler))
        .route("/api/dashboard", get(dashboard_handler))
        .route("/api/import-logs", get(import_logs_handler))
        .route("/api/jobs", get(list_jobs_handler))
        .route("/api/jobs/bulk/retry", post(bulk_retry_handler))
        .route("/api/jobs/bulk/delete", post(bulk_delete_handler))
        .route("/api/jobs/{key}", get(get_job_handler).delete(delete_job_handler))
        .route("/api/imports/upload", post(upload_handler))
        .with_state(Arc::new(state))
}

pub async fn serve(
    config: &WebConfig,
    state: AppState,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> anyhow::Result<()> {
    let listener = TcpListener::bind((config.bind_addr.as_str(), config.port)).await?;
    info!(addr = %listener.local_addr()?, "api listening");
    axum::serve(listener, app(state))
        .with_graceful_shutdown(shutdown)
        .await?;
    Ok(())
}

#[derive(Debug, Default, Deserialize)]
struct PageQuery {
    page: Option<u64>,
    limit: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
struct JobsQuery {
    page: Option<u64>,
    limit: Option<u64>,
    status: Option<String>,
    search: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
struct Pagination {
    total: u64,
    page: u64,
    limit: u64,
    pages: u64,
}

/// Resolves 1-based `page` and a bounded `limit`; zero falls back to the
/// default.
fn page_window(page: Option<u64>, limit: Option<u64>, default_limit: u64) -> (u64, u64) {
    let page = page.unwrap_or(1).max(1);
    let limit = limit
        .filter(|l| *l > 0)
        .unwrap_or(default_limit)
        .min(MAX_LIMIT);
    (page, limit)
}

/// Rows skipped before `page`; saturates for absurd page numbers.
fn page_offset(page: u64, limit: u64) -> u64 {
    page.saturating_sub(1).saturating_mul(limit)
}

impl Pagination {
    fn new(total: u64, page: u64, limit: u64) -> Self {
        Self {
            total,
            page,
            limit,
            pages: total.div_ceil(limit).max(1),
        }
    }
}

#[derive(Debug, Deserialize)]
struct KeysBody {
    #[serde(default)]
    keys: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct UploadBody {
    source: Option<String>,
    #[serde(default)]
    jobs: Vec<JsonValue>,
}

async fn ping_handler() -> &'static str {
    "Ping OK"
}

async fn kv_health(kv: &dyn KvStore) -> (bool, JsonValue) {
    match kv.ping().await {
        Ok(latency) => (
            true,
            json!({ "status": "up", "latencyMs": latency.as_secs_f64() * 1000.0 }),
        ),
        Err(err) => (false, json!({ "status": "down", "message": err.to_string() })),
    }
}

async fn health_handler(State(state): State<Arc<AppState>>) -> Response {
    let (_, kv) = kv_health(state.kv.as_ref()).await;
    let database = match state.store.ping().await {
        Ok(()) => "connected",
        Err(err) => {
            error!(error = %err, "database health check failed");
            "disconnected"
        }
    };
    let queue = match state.queue.counts().await {
        Ok(counts) => json!(counts),
        Err(err) => json!({ "error": err.to_string() }),
    };
    Json(json!({
        "uptime": state.started_at.elapsed().as_secs_f64(),
        "timestamp": Utc::now(),
        "kv": kv,
        "database": database,
        "queue": queue,
    }))
    .into_response()
}

async fn kv_health_handler(State(state): State<Arc<AppState>>) -> Response {
    match kv_health(state.kv.as_ref()).await {
        (true, body) => Json(body).into_response(),
        (false, body) => (StatusCode::INTERNAL_SERVER_ERROR, Json(body)).into_response(),
    }
}

async fn dashboard_handler(State(state): State<Arc<AppState>>) -> Response {
    match load_dashboard(&state).await {
        Ok(body) => Json(body).into_response(),
        Err(err) => server_error(err),
    }
}

async fn load_dashboard(state: &AppState) -> anyhow::Result<JsonValue> {
    let counts = state.store.count_by_status().await?;
    let recent: Vec<ImportLogEntry> = state.ledger.list_recent(5).await?;
    let queue = state.queue.counts().await?;
    let latest = recent.first();

    Ok(json!({
        "summary": {
            "totalJobs": counts.total,
            "lastImportAt": latest.map(|e| e.timestamp),
            "lastImportDuration": latest.map(|e| e.duration_ms),
            "lastImportStatus": latest.map(|e| e.status),
            "failedJobs": counts.failed,
            "retryingJobs": counts.retrying,
        },
        "countsByStatus": counts,
        "queue": queue,
        "recentImports": recent,
    }))
}

async fn import_logs_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<PageQuery>,
) -> Response {
    let (page, limit) = page_window(query.page, query.limit, DEFAULT_LOG_LIMIT);
    match state.ledger.page(page_offset(page, limit), limit).await {
        Ok(logs) => Json(json!({
            "data": logs.items,
            "pagination": Pagination::new(logs.total, page, limit),
        }))
        .into_response(),
        Err(err) => server_error(err.into()),
    }
}

async fn list_jobs_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<JobsQuery>,
) -> Response {
    let status = match query.status.as_deref().map(str::trim).filter(|s| !s.is_empty()) {
        None => None,
        Some(raw) => match JobStatus::parse(raw) {
            Some(status) => Some(status),
            None => return bad_request(format!("unknown status '{raw}'")),
        },
    };
    let (page, limit) = page_window(query.page, query.limit, DEFAULT_JOB_LIMIT);
    let job_query = JobQuery {
        status,
        search: query.search.filter(|s| !s.trim().is_empty()),
        skip: page_offset(page, limit),
        limit,
    };
    match state.store.list(&job_query).await {
        Ok(jobs) => Json(json!({
            "data": jobs.items,
            "pagination": Pagination::new(jobs.total, page, limit),
        }))
        .into_response(),
        Err(err) => server_error(err.into()),
    }
}

async fn get_job_handler(State(state): State<Arc<AppState>>, Path(key): Path<String>) -> Response {
    match state.store.get(&key).await {
        Ok(Some(job)) => Json(job).into_response(),
        Ok(None) => not_found("Job not found"),
        Err(err) => server_error(err.into()),
    }
}

async fn delete_job_handler(State(state): State<Arc<AppState>>, Path(key): Path<String>) -> Response {
    match state.store.delete_many(&[key]).await {
        Ok(0) => not_found("Job not found"),
        Ok(deleted) => Json(json!({ "deleted": deleted })).into_response(),
        Err(err) => server_error(err.into()),
    }
}

async fn bulk_retry_handler(State(state): State<Arc<AppState>>, Json(body): Json<KeysBody>) -> Response {
    if body.keys.is_empty() {
        return bad_request("keys must not be empty");
    }
    match state.manual.requeue_for_retry(&body.keys).await {
        Ok(report) if report.nothing_queued() => server_error(anyhow::anyhow!(
            "failed to enqueue retry; {} records restored to failed",
            report.restored
        )),
        Ok(report) => (
            StatusCode::ACCEPTED,
            Json(json!({ "requeued": report.requeued, "batchIds": report.batch_ids })),
        )
            .into_response(),
        Err(err) => server_error(err),
    }
}

async fn bulk_delete_handler(State(state): State<Arc<AppState>>, Json(body): Json<KeysBody>) -> Response {
    if body.keys.is_empty() {
        return bad_request("keys must not be empty");
    }
    match state.store.delete_many(&body.keys).await {
        Ok(deleted) => Json(json!({ "deleted": deleted })).into_response(),
        Err(err) => server_error(err.into()),
    }
}

async fn upload_handler(State(state): State<Arc<AppState>>, Json(body): Json<UploadBody>) -> Response {
    if body.jobs.is_empty() {
        return bad_request("jobs must contain at least one record");
    }
    let report = state
        .manual
        .enqueue_manual_upload(body.source.as_deref(), body.jobs)
        .await;
    if report.batch_ids.is_empty() && report.failed_batches > 0 {
        return server_error(anyhow::anyhow!("failed to enqueue upload"));
    }
    (
        StatusCode::ACCEPTED,
        Json(json!({
            "message": "Jobs queued for import",
            "queued": report.queued,
            "rejected": report.rejected,
            "batchIds": report.batch_ids,
        })),
    )
        .into_response()
}

fn bad_request(message: impl Into<String>) -> Response {
    (
        StatusCode::BAD_REQUEST,
        Json(json!({ "message": message.into() })),
    )
        .into_response()
}

fn not_found(message: &str) -> Response {
    (StatusCode::NOT_FOUND, Json(json!({ "message": message }))).into_response()
}

fn server_error(err: anyhow::Error) -> Response {
    error!(error = %format!("{err:#}"), "request failed");
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(json!({ "message": format!("Server error: {err}") })),
    )
        .into_response()
}
