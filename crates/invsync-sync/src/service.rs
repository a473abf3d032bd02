//! Entry points for external callers (API layer, CLI, cron).

use std::sync::Arc;

use chrono::Utc;
use invsync_core::{
    normalize_identifier, price_direction, ChangeLogEntry, InventoryRecord, MonitorConfig, PageScope,
    PriceDirection, PricePoint, RunRecord, RunTrigger,
};
use invsync_fetch::RecordFetcher;
use invsync_storage::{InventoryStore, RunPage};
use serde::Serialize;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio_cron_scheduler::{Job, JobScheduler};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;

use crate::error::{SyncError, SyncResult};
use crate::monitor::{check_drift, DriftReport, MonitorConfigUpdate, MonitorScheduler, MonitorSettings};
use crate::orchestrator::{Orchestrator, RunProgress};
use crate::snapshot::SnapshotOptions;

#[derive(Debug, Clone, Serialize)]
pub struct RunStatusView {
    pub run: RunRecord,
    /// Live progress while this run is (or was last) the one being tracked.
    pub progress: Option<RunProgress>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RecordHistory {
    pub record: InventoryRecord,
    pub price_history: Vec<PricePoint>,
    pub changes: Vec<ChangeLogEntry>,
    pub price_direction: PriceDirection,
    /// Signed difference between the two most recent price points.
    pub price_change_amount: Option<f64>,
}

#[derive(Clone)]
pub struct SyncService {
    orchestrator: Arc<Orchestrator>,
    monitor_wake: Arc<Notify>,
    monitor_settings: MonitorSettings,
}

impl SyncService {
    pub fn new(
        store: Arc<dyn InventoryStore>,
        fetcher: Arc<dyn RecordFetcher>,
        options: SnapshotOptions,
        monitor_settings: MonitorSettings,
    ) -> Self {
        Self::with_orchestrator(Orchestrator::new(store, fetcher, options), monitor_settings)
    }

    pub fn with_orchestrator(orchestrator: Orchestrator, monitor_settings: MonitorSettings) -> Self {
        Self {
            orchestrator: Arc::new(orchestrator),
            monitor_wake: Arc::new(Notify::new()),
            monitor_settings,
        }
    }

    pub fn orchestrator(&self) -> &Arc<Orchestrator> {
        &self.orchestrator
    }

    fn store(&self) -> &Arc<dyn InventoryStore> {
        self.orchestrator.store()
    }

    /// Startup bookkeeping; call once before serving. Only runs whose lease expired are failed.
    pub async fn recover(&self) -> SyncResult<u64> {
        self.orchestrator.recover_stale_runs().await
    }

    pub async fn trigger_run(&self, scope: PageScope) -> SyncResult<Uuid> {
        self.orchestrator.trigger(scope, RunTrigger::Manual).await
    }

    /// Starts a run attributed to `trigger` (cron jobs use [`RunTrigger::Scheduled`]).
    pub async fn trigger_run_as(&self, scope: PageScope, trigger: RunTrigger) -> SyncResult<Uuid> {
        self.orchestrator.trigger(scope, trigger).await
    }

    pub fn cancel_run(&self, run_id: Uuid) -> bool {
        self.orchestrator.cancel(run_id)
    }

    pub async fn wait_for_run(&self, run_id: Uuid) -> SyncResult<RunRecord> {
        self.orchestrator.wait_for_run(run_id).await
    }

    /// A specific run, or the most recent one when `run_id` is `None`.
    pub async fn run_status(&self, run_id: Option<Uuid>) -> SyncResult<Option<RunStatusView>> {
        let run = match run_id {
            Some(id) => Some(self.store().get_run(id).await?.ok_or(SyncError::RunNotFound(id))?),
            None => self.store().latest_run().await?,
        };
        Ok(run.map(|run| {
            let progress = self.orchestrator.progress();
            RunStatusView {
                progress: (progress.run_id == Some(run.run_id)).then_some(progress),
                run,
            }
        }))
    }

    pub async fn run_history(&self, page: u32, per_page: u32) -> SyncResult<RunPage> {
        Ok(self.store().list_finished_runs(page, per_page).await?)
    }

    pub async fn monitor_config(&self) -> SyncResult<MonitorConfig> {
        Ok(self.store().load_monitor_config().await?)
    }

    /// Validates and persists; the running scheduler picks it up at its next tick boundary.
    pub async fn update_monitor_config(&self, update: MonitorConfigUpdate) -> SyncResult<MonitorConfig> {
        update.validate()?;
        let mut config = self.store().load_monitor_config().await?;
        update.apply_to(&mut config);
        self.store().save_monitor_settings(&config).await?;
        info!(
            enabled = config.enabled,
            interval_minutes = config.interval_minutes,
            pages = config.pages,
            "monitor config updated"
        );
        if config.enabled {
            self.monitor_wake.notify_one();
        }
        Ok(config)
    }

    pub async fn record_history(&self, identifier: &str) -> SyncResult<RecordHistory> {
        let identifier = normalize_identifier(identifier);
        let record = self
            .store()
            .get_record(&identifier)
            .await?
            .ok_or_else(|| SyncError::RecordNotFound(identifier.clone()))?;
        let price_history = self.store().price_history(&identifier).await?;
        let changes = self.store().change_history(&identifier).await?;
        let (direction, diff_cents) = price_direction(&price_history);
        Ok(RecordHistory {
            record,
            price_history,
            changes,
            price_direction: direction,
            price_change_amount: diff_cents.map(|cents| cents as f64 / 100.0),
        })
    }

    /// Runs the monitor's comparison on demand. Applies nothing, starts nothing.
    pub async fn compare_now(&self, scope: PageScope) -> SyncResult<DriftReport> {
        let outcome = check_drift(&self.orchestrator, scope).await;
        let line = match &outcome {
            Ok(report) => format!("Manual check: {}", report.summary),
            Err(err) => format!("Manual check failed: {err}"),
        };
        self.store().record_monitor_check(Utc::now(), &line).await?;
        outcome
    }

    pub fn monitor(&self) -> MonitorScheduler {
        MonitorScheduler::new(
            Arc::clone(&self.orchestrator),
            Arc::clone(&self.monitor_wake),
            self.monitor_settings,
        )
    }

    pub fn spawn_monitor(&self, shutdown: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(self.monitor().run(shutdown))
    }

    /// A cron job that triggers a full sync, when a schedule is configured.
    pub async fn maybe_build_scheduler(&self, cron: Option<&str>) -> SyncResult<Option<JobScheduler>> {
        let Some(cron) = cron else {
            return Ok(None);
        };

        let service = self.clone();
        let job = Job::new_async(cron, move |_uuid, _l| {
            let service = service.clone();
            Box::pin(async move {
                match service.trigger_run_as(PageScope::all(), RunTrigger::Scheduled).await {
                    Ok(run_id) => info!(%run_id, "scheduled sync started"),
                    Err(SyncError::RunInProgress { run_id }) => {
                        warn!(%run_id, "scheduled sync skipped; a run is already active")
                    }
                    Err(err) => warn!(error = %err, "scheduled sync could not start"),
                }
            })
        })
        .map_err(|err| SyncError::Scheduler(format!("creating job for cron {cron}: {err}")))?;
        let sched = JobScheduler::new()
            .await
            .map_err(|err| SyncError::Scheduler(format!("creating scheduler: {err}")))?;
        sched
            .add(job)
            .await
            .map_err(|err| SyncError::Scheduler(format!("adding job: {err}")))?;
        Ok(Some(sched))
    }
}
