//! Periodic drift detection that triggers a full run when the mirror falls behind.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use invsync_core::{MonitorConfig, PageScope, RunTrigger};
use serde::{Deserialize, Serialize};
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::compare::compare;
use crate::error::{ConfigError, SyncError, SyncResult};
use crate::orchestrator::Orchestrator;
use crate::snapshot::collect_snapshot;

pub const MIN_INTERVAL_MINUTES: u32 = 5;
pub const MAX_INTERVAL_MINUTES: u32 = 1440;
pub const MAX_MONITOR_PAGES: u32 = 10_000;

/// Partial update of the persisted monitor settings.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MonitorConfigUpdate {
    #[serde(default)]
    pub enabled: Option<bool>,
    #[serde(default)]
    pub interval_minutes: Option<u32>,
    #[serde(default)]
    pub pages: Option<u32>,
}

impl MonitorConfigUpdate {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.enabled.is_none() && self.interval_minutes.is_none() && self.pages.is_none() {
            return Err(ConfigError::EmptyUpdate);
        }
        if let Some(value) = self.interval_minutes {
            if !(MIN_INTERVAL_MINUTES..=MAX_INTERVAL_MINUTES).contains(&value) {
                return Err(ConfigError::IntervalOutOfRange {
                    value,
                    min: MIN_INTERVAL_MINUTES,
                    max: MAX_INTERVAL_MINUTES,
                });
            }
        }
        if let Some(value) = self.pages {
            if value > MAX_MONITOR_PAGES {
                return Err(ConfigError::PagesOutOfRange {
                    value,
                    max: MAX_MONITOR_PAGES,
                });
            }
        }
        Ok(())
    }

    pub fn apply_to(&self, config: &mut MonitorConfig) {
        if let Some(enabled) = self.enabled {
            config.enabled = enabled;
        }
        if let Some(interval) = self.interval_minutes {
            config.interval_minutes = interval;
        }
        if let Some(pages) = self.pages {
            config.pages = pages;
        }
    }
}

/// Outcome of a comparison that applies nothing.
#[derive(Debug, Clone, Serialize)]
pub struct DriftReport {
    pub checked_at: DateTime<Utc>,
    pub scope: PageScope,
    pub pages_attempted: u32,
    pub page_errors: Vec<String>,
    pub remote_count: usize,
    pub local_active_count: usize,
    pub matched: usize,
    pub new_remote: Vec<String>,
    pub reactivated: Vec<String>,
    pub gone_local: Vec<String>,
    pub changed: Vec<String>,
    pub has_drift: bool,
    pub summary: String,
}

/// Fetches `scope` and compares it against the store without touching either.
pub async fn check_drift(orchestrator: &Orchestrator, scope: PageScope) -> SyncResult<DriftReport> {
    let snapshot = collect_snapshot(
        orchestrator.fetcher().as_ref(),
        orchestrator.options(),
        scope,
        None,
        |_| {},
    )
    .await;
    let local = orchestrator.store().load_records().await?;
    let diff = compare(snapshot.records, &local)?;

    Ok(DriftReport {
        checked_at: Utc::now(),
        scope,
        pages_attempted: snapshot.pages_attempted,
        page_errors: snapshot.page_failures.iter().map(ToString::to_string).collect(),
        remote_count: diff.remote_count,
        local_active_count: diff.local_active_count,
        matched: diff.matched.len(),
        new_remote: diff
            .new_remote
            .iter()
            .filter(|n| !n.reactivated)
            .map(|n| n.identifier().to_string())
            .collect(),
        reactivated: diff
            .new_remote
            .iter()
            .filter(|n| n.reactivated)
            .map(|n| n.identifier().to_string())
            .collect(),
        gone_local: diff.gone_local.iter().map(|r| r.identifier.clone()).collect(),
        changed: diff.changed.iter().map(|c| c.identifier.clone()).collect(),
        has_drift: diff.has_drift(),
        summary: diff.summary(),
    })
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TickOutcome {
    InSync { summary: String },
    DriftTriggered { run_id: Uuid, summary: String },
    Deferred { active_run: Option<Uuid> },
    CheckFailed { error: String },
}

impl TickOutcome {
    /// The short line persisted as the monitor's last check result.
    pub fn describe(&self) -> String {
        match self {
            TickOutcome::InSync { summary } => format!("In sync. {summary}"),
            TickOutcome::DriftTriggered { run_id, summary } => {
                format!("Drift detected ({summary}); started sync run {run_id}.")
            }
            TickOutcome::Deferred { active_run: Some(run_id) } => {
                format!("Deferred: sync run {run_id} already in progress.")
            }
            TickOutcome::Deferred { active_run: None } => "Deferred: a sync run is already in progress.".to_string(),
            TickOutcome::CheckFailed { error } => format!("Check failed: {error}"),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct MonitorSettings {
    /// How often a disabled monitor re-reads its config.
    pub idle_poll: Duration,
    /// Sleep after a failed check, when shorter than the interval.
    pub error_backoff: Duration,
}

impl Default for MonitorSettings {
    fn default() -> Self {
        Self {
            idle_poll: Duration::from_secs(15),
            error_backoff: Duration::from_secs(60),
        }
    }
}

pub struct MonitorScheduler {
    orchestrator: Arc<Orchestrator>,
    wake: Arc<Notify>,
    settings: MonitorSettings,
}

impl MonitorScheduler {
    pub fn new(orchestrator: Arc<Orchestrator>, wake: Arc<Notify>, settings: MonitorSettings) -> Self {
        Self {
            orchestrator,
            wake,
            settings,
        }
    }

    /// One check against an immutable copy of the config. Always records the outcome.
    pub async fn tick(&self, config: &MonitorConfig) -> TickOutcome {
        let scope = config.scope();
        let outcome = if self.orchestrator.is_running() {
            TickOutcome::Deferred {
                active_run: self.orchestrator.active_run(),
            }
        } else {
            match check_drift(&self.orchestrator, scope).await {
                Ok(report) if !report.has_drift => TickOutcome::InSync {
                    summary: report.summary,
                },
                Ok(report) => match self.orchestrator.trigger(scope, RunTrigger::Monitor).await {
                    Ok(run_id) => TickOutcome::DriftTriggered {
                        run_id,
                        summary: report.summary,
                    },
                    Err(SyncError::RunInProgress { run_id }) => TickOutcome::Deferred {
                        active_run: Some(run_id),
                    },
                    Err(err) => TickOutcome::CheckFailed { error: err.to_string() },
                },
                Err(err) => TickOutcome::CheckFailed { error: err.to_string() },
            }
        };

        match &outcome {
            TickOutcome::CheckFailed { error } => warn!(%error, "monitor check failed"),
            TickOutcome::Deferred { .. } => info!("monitor deferred; a run is already active"),
            other => info!(outcome = %other.describe(), "monitor check finished"),
        }
        if let Err(err) = self
            .orchestrator
            .store()
            .record_monitor_check(Utc::now(), &outcome.describe())
            .await
        {
            error!(error = %err, "could not persist monitor check");
        }
        outcome
    }

    /// Runs until `shutdown` fires. Config is re-read at every tick boundary.
    pub async fn run(self, shutdown: CancellationToken) {
        info!("monitor scheduler started");
        let mut tick_no = 0u64;
        loop {
            if shutdown.is_cancelled() {
                break;
            }

            let (enabled, wait) = match self.orchestrator.store().load_monitor_config().await {
                Ok(config) if config.enabled => {
                    tick_no += 1;
                    let interval = Duration::from_secs(
                        u64::from(config.interval_minutes.max(MIN_INTERVAL_MINUTES)) * 60,
                    );
                    let outcome = self
                        .tick(&config)
                        .instrument(info_span!("monitor_tick", tick = tick_no, pages = config.pages))
                        .await;
                    let wait = match outcome {
                        TickOutcome::CheckFailed { .. } => interval.min(self.settings.error_backoff),
                        _ => interval,
                    };
                    (true, wait)
                }
                Ok(_) => (false, self.settings.idle_poll),
                Err(err) => {
                    error!(error = %err, "could not load monitor config");
                    (false, self.settings.error_backoff)
                }
            };

            debug!(?wait, enabled, "monitor sleeping");
            tokio::select! {
                _ = tokio::time::sleep(wait) => {}
                _ = self.wake.notified(), if !enabled => {
                    debug!("monitor woken by a config change");
                }
                _ = shutdown.cancelled() => break,
            }
        }
        info!("monitor scheduler stopped");
    }
}
