use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use invsync_fetch::{BackoffPolicy, FixtureFetcher, HttpFetcherConfig, HttpPageFetcher, RecordFetcher};
use serde::{Deserialize, Serialize};

use crate::error::SyncError;
use crate::monitor::MonitorSettings;
use crate::snapshot::SnapshotOptions;

pub const CONFIG_PATH_VAR: &str = "INVSYNC_CONFIG";

/// Process configuration. Layered as defaults, then the optional YAML file, then the environment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    pub database_url: String,
    pub source_url: Option<String>,
    pub fixtures_dir: Option<PathBuf>,
    pub user_agent: String,
    pub fetch_timeout_secs: u64,
    pub fetch_max_attempts: usize,
    pub retry_base_ms: u64,
    pub retry_max_ms: u64,
    pub retry_jitter_ms: u64,
    pub open_ended_page_cap: u32,
    pub open_ended_failure_limit: u32,
    pub monitor_idle_poll_secs: u64,
    pub monitor_error_backoff_secs: u64,
    /// A `running` row whose lease is older than this is treated as abandoned.
    pub run_lease_secs: u64,
    /// Six-field cron expression for a scheduled full sync.
    pub sync_cron: Option<String>,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            database_url: "sqlite://invsync.db".to_string(),
            source_url: None,
            fixtures_dir: None,
            user_agent: "invsync-bot/0.1".to_string(),
            fetch_timeout_secs: 60,
            fetch_max_attempts: 3,
            retry_base_ms: 3_000,
            retry_max_ms: 30_000,
            retry_jitter_ms: 2_000,
            open_ended_page_cap: 500,
            open_ended_failure_limit: 3,
            monitor_idle_poll_secs: 15,
            monitor_error_backoff_secs: 60,
            run_lease_secs: 120,
            sync_cron: None,
        }
    }
}

fn parsed<T: std::str::FromStr>(raw: Option<String>, fallback: T) -> T {
    raw.and_then(|v| v.trim().parse().ok()).unwrap_or(fallback)
}

fn non_empty(raw: Option<String>) -> Option<String> {
    raw.map(|v| v.trim().to_string()).filter(|v| !v.is_empty())
}

impl SyncConfig {
    pub fn from_env() -> Self {
        let mut config = Self::default();
        config.overlay_vars(|key| std::env::var(key).ok());
        config
    }

    /// Defaults, overlaid by the YAML file named in `INVSYNC_CONFIG` (if any), overlaid by env.
    pub fn load() -> Result<Self> {
        let mut config = match std::env::var(CONFIG_PATH_VAR) {
            Ok(path) if !path.trim().is_empty() => Self::from_yaml_file(Path::new(path.trim()))?,
            _ => Self::default(),
        };
        config.overlay_vars(|key| std::env::var(key).ok());
        Ok(config)
    }

    pub fn from_yaml_file(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("reading config file {}", path.display()))?;
        serde_yaml::from_str(&raw).with_context(|| format!("parsing config file {}", path.display()))
    }

    pub fn overlay_vars(&mut self, var: impl Fn(&str) -> Option<String>) {
        if let Some(url) = non_empty(var("DATABASE_URL")) {
            self.database_url = url;
        }
        if let Some(url) = non_empty(var("INVSYNC_SOURCE_URL")) {
            self.source_url = Some(url);
        }
        if let Some(dir) = non_empty(var("INVSYNC_FIXTURES_DIR")) {
            self.fixtures_dir = Some(PathBuf::from(dir));
        }
        if let Some(agent) = non_empty(var("INVSYNC_USER_AGENT")) {
            self.user_agent = agent;
        }
        self.fetch_timeout_secs = parsed(var("INVSYNC_FETCH_TIMEOUT_SECS"), self.fetch_timeout_secs);
        self.fetch_max_attempts = parsed(var("INVSYNC_FETCH_MAX_ATTEMPTS"), self.fetch_max_attempts);
        self.retry_base_ms = parsed(var("INVSYNC_RETRY_BASE_MS"), self.retry_base_ms);
        self.retry_max_ms = parsed(var("INVSYNC_RETRY_MAX_MS"), self.retry_max_ms);
        self.retry_jitter_ms = parsed(var("INVSYNC_RETRY_JITTER_MS"), self.retry_jitter_ms);
        self.open_ended_page_cap = parsed(var("INVSYNC_OPEN_ENDED_PAGE_CAP"), self.open_ended_page_cap);
        self.open_ended_failure_limit =
            parsed(var("INVSYNC_OPEN_ENDED_FAILURE_LIMIT"), self.open_ended_failure_limit);
        self.monitor_idle_poll_secs = parsed(var("INVSYNC_MONITOR_IDLE_POLL_SECS"), self.monitor_idle_poll_secs);
        self.monitor_error_backoff_secs =
            parsed(var("INVSYNC_MONITOR_ERROR_BACKOFF_SECS"), self.monitor_error_backoff_secs);
        self.run_lease_secs = parsed(var("INVSYNC_RUN_LEASE_SECS"), self.run_lease_secs);
        if let Some(cron) = non_empty(var("INVSYNC_SYNC_CRON")) {
            self.sync_cron = Some(cron);
        }
    }

    pub fn backoff_policy(&self) -> BackoffPolicy {
        BackoffPolicy {
            max_attempts: self.fetch_max_attempts.max(1),
            base_delay: Duration::from_millis(self.retry_base_ms),
            max_delay: Duration::from_millis(self.retry_max_ms.max(self.retry_base_ms)),
            jitter: Duration::from_millis(self.retry_jitter_ms),
            attempt_timeout: Duration::from_secs(self.fetch_timeout_secs.max(1)),
        }
    }

    pub fn snapshot_options(&self) -> SnapshotOptions {
        SnapshotOptions {
            retry: self.backoff_policy(),
            open_ended_page_cap: self.open_ended_page_cap.max(1),
            open_ended_failure_limit: self.open_ended_failure_limit.max(1),
        }
    }

    pub fn monitor_settings(&self) -> MonitorSettings {
        MonitorSettings {
            idle_poll: Duration::from_secs(self.monitor_idle_poll_secs.max(1)),
            error_backoff: Duration::from_secs(self.monitor_error_backoff_secs.max(1)),
        }
    }

    pub fn run_lease(&self) -> Duration {
        Duration::from_secs(self.run_lease_secs.max(1))
    }

    /// The HTTP source wins over the fixture directory when both are set.
    pub fn build_fetcher(&self) -> Result<Arc<dyn RecordFetcher>> {
        if let Some(url) = &self.source_url {
            let fetcher = HttpPageFetcher::new(HttpFetcherConfig {
                base_url: url.clone(),
                user_agent: Some(self.user_agent.clone()),
                timeout: Duration::from_secs(self.fetch_timeout_secs.max(1)),
            })
            .with_context(|| format!("building http fetcher for {url}"))?;
            return Ok(Arc::new(fetcher));
        }
        if let Some(dir) = &self.fixtures_dir {
            return Ok(Arc::new(FixtureFetcher::new(dir.clone())));
        }
        Err(SyncError::NoSource.into())
    }
}
