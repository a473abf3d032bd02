//! Record fetcher contract, per-page retry policy, and the HTTP / fixture page sources.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use invsync_core::RawRecord;
use rand::Rng;
use reqwest::StatusCode;
use serde::Deserialize;
use thiserror::Error;
use tracing::{debug, info_span, warn, Instrument};

pub const CRATE_NAME: &str = "invsync-fetch";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

pub fn classify_status(status: StatusCode) -> RetryDisposition {
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

pub fn classify_reqwest_error(err: &reqwest::Error) -> RetryDisposition {
    if err.is_timeout() || err.is_connect() || err.is_request() {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

#[derive(Debug, Error)]
pub enum PageError {
    #[error("page {page} timed out after {after:?}")]
    Timeout { page: u32, after: Duration },
    #[error("page {page}: http status {status} for {url}")]
    HttpStatus { page: u32, status: u16, url: String },
    #[error("page {page}: request failed: {message}")]
    Transport {
        page: u32,
        message: String,
        disposition: RetryDisposition,
    },
    #[error("page {page}: malformed payload: {message}")]
    Decode { page: u32, message: String },
    #[error("page {page}: source unavailable: {message}")]
    Source { page: u32, message: String },
    #[error("page {page}: no record source configured")]
    Unconfigured { page: u32 },
}

impl PageError {
    pub fn page(&self) -> u32 {
        match self {
            PageError::Timeout { page, .. }
            | PageError::HttpStatus { page, .. }
            | PageError::Transport { page, .. }
            | PageError::Decode { page, .. }
            | PageError::Source { page, .. }
            | PageError::Unconfigured { page } => *page,
        }
    }

    pub fn disposition(&self) -> RetryDisposition {
        match self {
            PageError::Timeout { .. } | PageError::Source { .. } => RetryDisposition::Retryable,
            PageError::HttpStatus { status, .. } => StatusCode::from_u16(*status)
                .map(classify_status)
                .unwrap_or(RetryDisposition::NonRetryable),
            PageError::Transport { disposition, .. } => *disposition,
            PageError::Decode { .. } | PageError::Unconfigured { .. } => RetryDisposition::NonRetryable,
        }
    }
}

/// A page that could not be fetched within the retry budget.
#[derive(Debug, Error)]
#[error("page {page} failed after {attempts} attempt(s): {last}")]
pub struct FetchFailure {
    pub page: u32,
    pub attempts: usize,
    #[source]
    pub last: PageError,
}

/// Source of raw inventory records, one page at a time (pages are 1-based).
/// An empty page marks the end of the listing.
#[async_trait]
pub trait RecordFetcher: Send + Sync {
    fn source_name(&self) -> &str;

    async fn fetch(&self, page: u32) -> Result<Vec<RawRecord>, PageError>;
}

#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_attempts: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub jitter: Duration,
    pub attempt_timeout: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(3),
            max_delay: Duration::from_secs(30),
            jitter: Duration::from_secs(2),
            attempt_timeout: Duration::from_secs(60),
        }
    }
}

impl BackoffPolicy {
    /// No sleeping between attempts; for dry runs and tests.
    pub fn immediate(max_attempts: usize) -> Self {
        Self {
            max_attempts,
            base_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            jitter: Duration::ZERO,
            attempt_timeout: Duration::from_secs(5),
        }
    }

    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        let delay = self.base_delay.saturating_mul(factor);
        delay.min(self.max_delay)
    }

    pub fn jittered_delay(&self, attempt_index: usize) -> Duration {
        let base = self.delay_for_attempt(attempt_index);
        let jitter_ms = self.jitter.as_millis() as u64;
        if jitter_ms == 0 {
            return base;
        }
        base + Duration::from_millis(rand::rng().random_range(0..=jitter_ms))
    }
}

/// Fetches one page, retrying retryable failures with exponential backoff.
/// Each attempt runs under its own timeout.
pub async fn fetch_with_retry(
    fetcher: &dyn RecordFetcher,
    page: u32,
    policy: &BackoffPolicy,
) -> Result<Vec<RawRecord>, FetchFailure> {
    let max_attempts = policy.max_attempts.max(1);
    let mut attempts = 0usize;

    loop {
        attempts += 1;
        let span = info_span!("page_fetch", source = fetcher.source_name(), page, attempt = attempts);
        let outcome = tokio::time::timeout(policy.attempt_timeout, fetcher.fetch(page))
            .instrument(span)
            .await
            .unwrap_or(Err(PageError::Timeout {
                page,
                after: policy.attempt_timeout,
            }));

        match outcome {
            Ok(records) => {
                debug!(page, attempts, records = records.len(), "page fetched");
                return Ok(records);
            }
            Err(err) => {
                if err.disposition() == RetryDisposition::Retryable && attempts < max_attempts {
                    let delay = policy.jittered_delay(attempts - 1);
                    warn!(page, attempts, ?delay, error = %err, "page fetch failed; backing off");
                    tokio::time::sleep(delay).await;
                    continue;
                }
                return Err(FetchFailure {
                    page,
                    attempts,
                    last: err,
                });
            }
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum PagePayload {
    Bare(Vec<RawRecord>),
    Wrapped { records: Vec<RawRecord> },
}

pub fn decode_page(page: u32, bytes: &[u8]) -> Result<Vec<RawRecord>, PageError> {
    match serde_json::from_slice::<PagePayload>(bytes) {
        Ok(PagePayload::Bare(records)) | Ok(PagePayload::Wrapped { records }) => Ok(records),
        Err(err) => Err(PageError::Decode {
            page,
            message: err.to_string(),
        }),
    }
}

#[derive(Debug, Clone)]
pub struct HttpFetcherConfig {
    pub base_url: String,
    pub user_agent: Option<String>,
    pub timeout: Duration,
}

/// Pulls JSON pages from an inventory feed. `{page}` in the base URL is substituted,
/// otherwise a `page` query parameter is appended.
#[derive(Debug)]
pub struct HttpPageFetcher {
    client: reqwest::Client,
    base_url: String,
}

impl HttpPageFetcher {
    pub fn new(config: HttpFetcherConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().context("building reqwest client")?;
        Ok(Self {
            client,
            base_url: config.base_url,
        })
    }

    pub fn page_url(&self, page: u32) -> String {
        if self.base_url.contains("{page}") {
            return self.base_url.replace("{page}", &page.to_string());
        }
        let sep = if self.base_url.contains('?') { '&' } else { '?' };
        format!("{}{sep}page={page}", self.base_url)
    }
}

#[async_trait]
impl RecordFetcher for HttpPageFetcher {
    fn source_name(&self) -> &str {
        &self.base_url
    }

    async fn fetch(&self, page: u32) -> Result<Vec<RawRecord>, PageError> {
        let url = self.page_url(page);
        let resp = self.client.get(&url).send().await.map_err(|err| {
            if err.is_timeout() {
                PageError::Timeout {
                    page,
                    after: Duration::ZERO,
                }
            } else {
                PageError::Transport {
                    page,
                    disposition: classify_reqwest_error(&err),
                    message: err.to_string(),
                }
            }
        })?;

        let status = resp.status();
        if !status.is_success() {
            return Err(PageError::HttpStatus {
                page,
                status: status.as_u16(),
                url: resp.url().to_string(),
            });
        }

        let body = resp.bytes().await.map_err(|err| PageError::Transport {
            page,
            disposition: classify_reqwest_error(&err),
            message: err.to_string(),
        })?;
        decode_page(page, &body)
    }
}

/// Stand-in for processes that only read the store. Every page fails without retrying.
#[derive(Debug, Clone, Copy, Default)]
pub struct UnconfiguredFetcher;

#[async_trait]
impl RecordFetcher for UnconfiguredFetcher {
    fn source_name(&self) -> &str {
        "unconfigured"
    }

    async fn fetch(&self, page: u32) -> Result<Vec<RawRecord>, PageError> {
        Err(PageError::Unconfigured { page })
    }
}

/// Reads pages from `page-<n>.json` files; a missing file is the terminal (empty) page.
#[derive(Debug, Clone)]
pub struct FixtureFetcher {
    dir: PathBuf,
    name: String,
}

impl FixtureFetcher {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        let dir = dir.into();
        let name = format!("fixtures:{}", dir.display());
        Self { dir, name }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn page_path(&self, page: u32) -> PathBuf {
        self.dir.join(format!("page-{page}.json"))
    }
}

#[async_trait]
impl RecordFetcher for FixtureFetcher {
    fn source_name(&self) -> &str {
        &self.name
    }

    async fn fetch(&self, page: u32) -> Result<Vec<RawRecord>, PageError> {
        let path = self.page_path(page);
        let exists = tokio::fs::try_exists(&path)
            .await
            .map_err(|err| PageError::Source {
                page,
                message: format!("checking {}: {err}", path.display()),
            })?;
        if !exists {
            return Ok(Vec::new());
        }
        let bytes = tokio::fs::read(&path).await.map_err(|err| PageError::Source {
            page,
            message: format!("reading {}: {err}", path.display()),
        })?;
        decode_page(page, &bytes)
    }
}
