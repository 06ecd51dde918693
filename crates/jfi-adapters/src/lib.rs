//! Feed source adapters and the record normalizer.

use std::time::Duration;

use async_trait::async_trait;
use jfi_core::{BackoffPolicy, RawRecord};
use jfi_storage::{FetchError, HttpFetcher, RetryDisposition};
use thiserror::Error;
use tracing::{debug, info, warn};

mod feed;
mod mapping;

pub use feed::{parse_feed_document, ParseError};
pub use mapping::{
    raw_record_from_json, FieldMapping, FieldRule, NormalizeError, Normalizer, DEFAULT_COMPANY,
    DEFAULT_JOB_LOCATION, DEFAULT_JOB_TYPE,
};

pub const CRATE_NAME: &str = "jfi-adapters";

/// Feeds harvested when `FEED_URLS` is not set.
pub const DEFAULT_FEED_URLS: [&str; 9] = [
    "https://jobicy.com/?feed=job_feed",
    "https://jobicy.com/?feed=job_feed&job_categories=smm&job_types=full-time",
    "https://jobicy.com/?feed=job_feed&job_categories=seller&job_types=full-time&search_region=france",
    "https://jobicy.com/?feed=job_feed&job_categories=design-multimedia",
    "https://jobicy.com/?feed=job_feed&job_categories=data-science",
    "https://jobicy.com/?feed=job_feed&job_categories=copywriting",
    "https://jobicy.com/?feed=job_feed&job_categories=business",
    "https://jobicy.com/?feed=job_feed&job_categories=management",
    "https://www.higheredjobs.com/rss/articleFeed.cfm",
];

#[derive(Debug, Error)]
pub enum FeedError {
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error("feed parse failed: {0}")]
    Parse(#[from] ParseError),
}

impl FeedError {
    /// Parse failures count as transient.
    pub fn disposition(&self) -> RetryDisposition {
        match self {
            FeedError::Fetch(err) => err.disposition(),
            FeedError::Parse(_) => RetryDisposition::Retryable,
        }
    }
}

/// One external syndication feed endpoint. Failures never escape: an
/// exhausted or non-retryable fetch yields an empty sequence.
#[async_trait]
pub trait FeedSource: Send + Sync {
    async fn fetch(&self, url: &str) -> Vec<RawRecord>;
}

#[derive(Debug, Clone)]
pub struct RssFeedSource {
    http: HttpFetcher,
    backoff: BackoffPolicy,
}

impl RssFeedSource {
    pub fn new(http: HttpFetcher) -> Self {
        Self {
            http,
            backoff: BackoffPolicy::linear(3, Duration::from_millis(500)),
        }
    }

    pub fn with_backoff(mut self, backoff: BackoffPolicy) -> Self {
        self.backoff = backoff;
        self
    }

    async fn fetch_once(&self, url: &str) -> Result<Vec<RawRecord>, FeedError> {
        let response = self.http.fetch_bytes(url).await?;
        let body = String::from_utf8_lossy(&response.body);
        Ok(parse_feed_document(url, &body)?)
    }
}

#[async_trait]
impl FeedSource for RssFeedSource {
    async fn fetch(&self, url: &str) -> Vec<RawRecord> {
        let mut attempt = 1;
        loop {
            match self.fetch_once(url).await {
                Ok(records) => {
                    info!(url, records = records.len(), attempt, "feed fetched");
                    return records;
                }
                Err(err) => {
                    let retryable = err.disposition() == RetryDisposition::Retryable;
                    if !retryable || !self.backoff.has_attempts_left(attempt) {
                        warn!(url, attempt, error = %err, "feed skipped after failed fetch");
                        return Vec::new();
                    }
                    let delay = self.backoff.delay_after_attempt(attempt);
                    debug!(url, attempt, ?delay, error = %err, "feed fetch failed, retrying");
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
            }
        }
    }
}
