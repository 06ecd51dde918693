//! Core domain model for the job feed importer.

use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

pub const CRATE_NAME: &str = "jfi-core";

/// Identity recorded in a failure list when no identity key could be derived.
pub const MISSING_IDENTITY_FALLBACK: &str = "N/A";

/// Batch source label used by operator-triggered retries.
pub const MANUAL_RETRY_SOURCE: &str = "manual-retry";

/// Default source label for records posted through the upload endpoint.
pub const MANUAL_UPLOAD_SOURCE: &str = "manual-upload";

/// Batch source label for scheduled fetch cycles.
pub const SCHEDULED_FETCH_SOURCE: &str = "scheduled-fetch";

/// One loosely-typed feed entry, stamped with the feed it came from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct RawRecord {
    pub source: String,
    pub fields: BTreeMap<String, JsonValue>,
}

impl RawRecord {
    pub fn new(source: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            fields: BTreeMap::new(),
        }
    }

    pub fn with_field(mut self, name: impl Into<String>, value: impl Into<JsonValue>) -> Self {
        self.fields.insert(name.into(), value.into());
        self
    }

    pub fn get(&self, name: &str) -> Option<&JsonValue> {
        self.fields.get(name)
    }

    pub fn fields_as_json(&self) -> JsonValue {
        JsonValue::Object(
            self.fields
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
        )
    }
}

/// Canonical job posting produced by the normalizer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NormalizedJob {
    pub identity_key: String,
    pub title: String,
    pub link: Option<String>,
    pub published_at: DateTime<Utc>,
    pub description: String,
    pub company: String,
    pub job_type: String,
    pub job_location: String,
    pub source: String,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub raw: Option<JsonValue>,
}

/// Entry of a batch failure list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FailedJob {
    pub identity_key: String,
    pub reason: String,
}

impl FailedJob {
    pub fn new(identity_key: Option<&str>, reason: impl Into<String>) -> Self {
        let identity_key = identity_key
            .map(str::trim)
            .filter(|k| !k.is_empty())
            .unwrap_or(MISSING_IDENTITY_FALLBACK)
            .to_string();
        Self {
            identity_key,
            reason: reason.into(),
        }
    }
}

/// Queue payload: one bounded slice of a fetch cycle (or upload / retry).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchPayload {
    pub jobs: Vec<NormalizedJob>,
    pub source: String,
    pub batch_number: u32,
    /// Records of this slice that were rejected before enqueue; they are only
    /// accounted for in the ledger and never reach the store.
    #[serde(default)]
    pub rejected: Vec<FailedJob>,
}

impl BatchPayload {
    pub fn total_records(&self) -> usize {
        self.jobs.len() + self.rejected.len()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Imported,
    Updated,
    Failed,
    Retrying,
}

impl JobStatus {
    pub const ALL: [JobStatus; 4] = [
        JobStatus::Imported,
        JobStatus::Updated,
        JobStatus::Failed,
        JobStatus::Retrying,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Imported => "imported",
            JobStatus::Updated => "updated",
            JobStatus::Failed => "failed",
            JobStatus::Retrying => "retrying",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        Self::ALL
            .into_iter()
            .find(|s| s.as_str().eq_ignore_ascii_case(value.trim()))
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Persisted job posting, one per identity key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobRecord {
    pub identity_key: String,
    pub title: String,
    pub link: Option<String>,
    pub published_at: DateTime<Utc>,
    pub description: String,
    pub company: String,
    pub job_type: String,
    pub job_location: String,
    pub source: String,
    pub tags: Vec<String>,
    pub status: JobStatus,
    pub last_imported_at: Option<DateTime<Utc>>,
    pub error_reason: Option<String>,
    pub raw_payload: Option<JsonValue>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl JobRecord {
    /// Rebuild the canonical form so the record can be fed back through the queue.
    pub fn to_normalized(&self) -> NormalizedJob {
        NormalizedJob {
            identity_key: self.identity_key.clone(),
            title: self.title.clone(),
            link: self.link.clone(),
            published_at: self.published_at,
            description: self.description.clone(),
            company: self.company.clone(),
            job_type: self.job_type.clone(),
            job_location: self.job_location.clone(),
            source: self.source.clone(),
            tags: self.tags.clone(),
            raw: self.raw_payload.clone(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ImportStatus {
    Completed,
    Partial,
    Failed,
}

impl ImportStatus {
    /// Zero failures is `Completed`; failures with no successes is `Failed`.
    pub fn derive(successes: usize, failures: usize) -> Self {
        match (successes, failures) {
            (_, 0) => ImportStatus::Completed,
            (0, _) => ImportStatus::Failed,
            _ => ImportStatus::Partial,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ImportStatus::Completed => "completed",
            ImportStatus::Partial => "partial",
            ImportStatus::Failed => "failed",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "completed" => Some(ImportStatus::Completed),
            "partial" => Some(ImportStatus::Partial),
            "failed" => Some(ImportStatus::Failed),
            _ => None,
        }
    }
}

/// Immutable ledger row describing one processed batch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImportLogEntry {
    pub timestamp: DateTime<Utc>,
    pub total_fetched: u32,
    pub total_imported: u32,
    pub new_jobs: u32,
    pub updated_jobs: u32,
    pub failed_jobs: Vec<FailedJob>,
    pub duration_ms: u64,
    pub queue_job_id: String,
    pub status: ImportStatus,
    pub source: String,
    pub batch_number: u32,
}

/// Queue priority; lower value is served first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum QueuePriority {
    Manual = 1,
    Scheduled = 2,
}

impl QueuePriority {
    pub fn as_i16(self) -> i16 {
        self as i16
    }

    pub fn from_i16(value: i16) -> Option<Self> {
        match value {
            1 => Some(QueuePriority::Manual),
            2 => Some(QueuePriority::Scheduled),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackoffStrategy {
    Linear,
    Exponential,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    pub strategy: BackoffStrategy,
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl BackoffPolicy {
    pub fn linear(max_attempts: u32, base_delay: Duration) -> Self {
        Self {
            strategy: BackoffStrategy::Linear,
            max_attempts,
            base_delay,
            max_delay: Duration::from_secs(60),
        }
    }

    pub fn exponential(max_attempts: u32, base_delay: Duration) -> Self {
        Self {
            strategy: BackoffStrategy::Exponential,
            max_attempts,
            base_delay,
            max_delay: Duration::from_secs(3600),
        }
    }

    /// Delay to wait after the given failed attempt (1-based).
    pub fn delay_after_attempt(&self, attempt: u32) -> Duration {
        let attempt = attempt.max(1);
        let delay = match self.strategy {
            BackoffStrategy::Linear => self.base_delay.saturating_mul(attempt),
            BackoffStrategy::Exponential => {
                let factor = 1u32.checked_shl(attempt - 1).unwrap_or(u32::MAX);
                self.base_delay.saturating_mul(factor)
            }
        };
        delay.min(self.max_delay)
    }

    pub fn has_attempts_left(&self, attempt: u32) -> bool {
        attempt < self.max_attempts
    }
}

/// One page of a listing, with the unpaginated total.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub total: u64,
}

impl<T> Page<T> {
    pub fn empty() -> Self {
        Self {
            items: Vec::new(),
            total: 0,
        }
    }
}
