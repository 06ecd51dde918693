//! Table-driven RawRecord -> NormalizedJob mapping.

use std::path::Path;

use anyhow::{Context, Result};
use chrono::{DateTime, NaiveDate, NaiveDateTime, TimeZone, Utc};
use jfi_core::{FailedJob, NormalizedJob, RawRecord};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;
use tracing::{debug, info};

pub const DEFAULT_COMPANY: &str = "Unknown";
pub const DEFAULT_JOB_TYPE: &str = "Unknown";
pub const DEFAULT_JOB_LOCATION: &str = "Remote";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum NormalizeError {
    #[error("record has no identity key (tried {tried})")]
    MissingIdentityKey { tried: String },
    #[error("field `{field}` has unparseable date `{value}`")]
    MalformedDate { field: String, value: String },
}

/// Candidate source fields for one canonical field, in precedence order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldRule {
    pub sources: Vec<String>,
    #[serde(default)]
    pub default: Option<String>,
}

impl FieldRule {
    fn new(sources: &[&str], default: Option<&str>) -> Self {
        Self {
            sources: sources.iter().map(|s| s.to_string()).collect(),
            default: default.map(str::to_string),
        }
    }
}

/// Ordered mapping table. Keys omitted from a rules file keep the built-in rule.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FieldMapping {
    pub identity: Vec<String>,
    pub title: FieldRule,
    pub link: FieldRule,
    pub published_at: FieldRule,
    pub description: FieldRule,
    pub company: FieldRule,
    pub job_type: FieldRule,
    pub job_location: FieldRule,
    pub tags: FieldRule,
}

impl Default for FieldMapping {
    fn default() -> Self {
        Self {
            identity: vec!["link".into(), "id".into(), "guid".into()],
            title: FieldRule::new(&["title"], None),
            link: FieldRule::new(&["link"], None),
            published_at: FieldRule::new(
                &["pubDate", "publishedAt", "published", "updated", "dc:date"],
                None,
            ),
            description: FieldRule::new(
                &["description", "content:encoded", "summary", "content"],
                None,
            ),
            company: FieldRule::new(
                &["company", "job_listing:company", "dc:creator", "author"],
                Some(DEFAULT_COMPANY),
            ),
            job_type: FieldRule::new(
                &["jobType", "job_listing:job_type"],
                Some(DEFAULT_JOB_TYPE),
            ),
            job_location: FieldRule::new(
                &["jobLocation", "job_listing:location", "location"],
                Some(DEFAULT_JOB_LOCATION),
            ),
            tags: FieldRule::new(&["category", "tags"], None),
        }
    }
}

impl FieldMapping {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        serde_yaml::from_str(&text).with_context(|| format!("parsing {}", path.display()))
    }

    /// Loads `path` when it exists, else the built-in table.
    pub fn load_or_default(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(path) if path.exists() => {
                let mapping = Self::load(path)?;
                info!(path = %path.display(), "loaded field mapping rules");
                Ok(mapping)
            }
            Some(path) => {
                debug!(path = %path.display(), "field mapping file absent, using built-in table");
                Ok(Self::default())
            }
            None => Ok(Self::default()),
        }
    }
}

/// Resolves a loosely-typed value to trimmed, non-empty text.
/// Objects resolve to `href` (Atom links), `#text` or `term` (Atom
/// categories); arrays to their first resolvable element.
fn value_text(value: &JsonValue) -> Option<String> {
    match value {
        JsonValue::String(s) => Some(s.trim().to_string()).filter(|s| !s.is_empty()),
        JsonValue::Number(n) => Some(n.to_string()),
        JsonValue::Bool(b) => Some(b.to_string()),
        JsonValue::Object(map) => map
            .get("href")
            .and_then(value_text)
            .or_else(|| map.get("#text").and_then(value_text))
            .or_else(|| map.get("term").and_then(value_text)),
        JsonValue::Array(items) => items.iter().find_map(value_text),
        JsonValue::Null => None,
    }
}

fn value_texts(value: &JsonValue) -> Vec<String> {
    match value {
        JsonValue::Array(items) => items.iter().filter_map(value_text).collect(),
        other => value_text(other).into_iter().collect(),
    }
}

fn parse_date(value: &JsonValue) -> Option<DateTime<Utc>> {
    if let JsonValue::Number(n) = value {
        return n.as_i64().and_then(|ms| Utc.timestamp_millis_opt(ms).single());
    }
    let text = value_text(value)?;
    if let Ok(dt) = DateTime::parse_from_rfc2822(&text) {
        return Some(dt.with_timezone(&Utc));
    }
    if let Ok(dt) = DateTime::parse_from_rfc3339(&text) {
        return Some(dt.with_timezone(&Utc));
    }
    if let Ok(naive) = NaiveDateTime::parse_from_str(&text, "%Y-%m-%d %H:%M:%S") {
        return Some(naive.and_utc());
    }
    NaiveDate::parse_from_str(&text, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|naive| naive.and_utc())
}

/// Maps raw feed records onto the canonical job shape.
#[derive(Debug, Clone)]
pub struct Normalizer {
    mapping: FieldMapping,
    keep_raw: bool,
}

impl Default for Normalizer {
    fn default() -> Self {
        Self::new(FieldMapping::default())
    }
}

impl Normalizer {
    pub fn new(mapping: FieldMapping) -> Self {
        Self {
            mapping,
            keep_raw: true,
        }
    }

    pub fn without_raw(mut self) -> Self {
        self.keep_raw = false;
        self
    }

    pub fn mapping(&self) -> &FieldMapping {
        &self.mapping
    }

    fn first_text(&self, record: &RawRecord, rule: &FieldRule) -> Option<String> {
        rule.sources
            .iter()
            .filter_map(|name| record.get(name))
            .find_map(value_text)
    }

    fn text_or_default(&self, record: &RawRecord, rule: &FieldRule) -> String {
        self.first_text(record, rule)
            .or_else(|| rule.default.clone())
            .unwrap_or_default()
    }

    pub fn identity_key(&self, record: &RawRecord) -> Option<String> {
        self.mapping
            .identity
            .iter()
            .filter_map(|name| record.get(name))
            .find_map(value_text)
    }

    pub fn normalize(
        &self,
        record: &RawRecord,
        fetched_at: DateTime<Utc>,
    ) -> Result<NormalizedJob, NormalizeError> {
        let identity_key =
            self.identity_key(record)
                .ok_or_else(|| NormalizeError::MissingIdentityKey {
                    tried: self.mapping.identity.join(", "),
                })?;

        let published_at = match self
            .mapping
            .published_at
            .sources
            .iter()
            .find_map(|name| {
                record
                    .get(name)
                    .filter(|v| value_text(v).is_some())
                    .map(|v| (name, v))
            }) {
            Some((name, value)) => parse_date(value).ok_or_else(|| NormalizeError::MalformedDate {
                field: name.clone(),
                value: value_text(value).unwrap_or_default(),
            })?,
            None => fetched_at,
        };

        let mut tags: Vec<String> = Vec::new();
        for name in &self.mapping.tags.sources {
            if let Some(value) = record.get(name) {
                for tag in value_texts(value) {
                    if !tags.contains(&tag) {
                        tags.push(tag);
                    }
                }
            }
        }

        Ok(NormalizedJob {
            identity_key,
            title: self.text_or_default(record, &self.mapping.title),
            link: self.first_text(record, &self.mapping.link),
            published_at,
            description: self.text_or_default(record, &self.mapping.description),
            company: self.text_or_default(record, &self.mapping.company),
            job_type: self.text_or_default(record, &self.mapping.job_type),
            job_location: self.text_or_default(record, &self.mapping.job_location),
            source: record.source.clone(),
            tags,
            raw: self.keep_raw.then(|| record.fields_as_json()),
        })
    }

    /// Like [`Normalizer::normalize`], but folds a failure into the ledger's
    /// failure-list shape.
    pub fn normalize_or_reject(
        &self,
        record: &RawRecord,
        fetched_at: DateTime<Utc>,
    ) -> Result<NormalizedJob, FailedJob> {
        self.normalize(record, fetched_at).map_err(|err| {
            let identity = self.identity_key(record);
            FailedJob::new(identity.as_deref(), err.to_string())
        })
    }
}

/// Builds a RawRecord from an uploaded JSON object; non-objects yield `None`.
pub fn raw_record_from_json(source: &str, value: JsonValue) -> Option<RawRecord> {
    match value {
        JsonValue::Object(map) => Some(RawRecord {
            source: source.to_string(),
            fields: map.into_iter().collect(),
        }),
        _ => None,
    }
}
