//! Drives one synchronization pass: lock, fetch pages, compare, apply, audit, finalize.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use invsync_core::{InventoryRecord, PageScope, RawRecord, RunCounters, RunRecord, RunStatus, RunTrigger};
use invsync_fetch::RecordFetcher;
use invsync_storage::{ApplyBatch, InventoryStore, RunAdmission};
use serde::Serialize;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::{CancellationToken, DropGuard};
use tracing::{error, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::compare::{compare, DiffResult};
use crate::error::{SyncError, SyncResult};
use crate::ledger::{ChangeLedger, LedgerContext};
use crate::lock::{RunGuard, RunLock};
use crate::snapshot::{collect_snapshot, PageTick, RemoteSnapshot, SnapshotOptions, StopReason};

pub const STALE_RUN_NOTE: &str = "Run lease expired without renewal; its process is gone. Marked failed.";
/// How long a `running` row stays authoritative without a lease renewal.
pub const DEFAULT_RUN_LEASE: Duration = Duration::from_secs(120);
const FINISH_ATTEMPTS: u32 = 3;
const FINISH_RETRY_DELAY: Duration = Duration::from_millis(200);
const UNAPPLIED_PREVIEW: usize = 200;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunPhase {
    Idle,
    Fetching,
    Applying,
    Completed,
    Failed,
}

impl RunPhase {
    pub fn is_terminal(self) -> bool {
        matches!(self, RunPhase::Completed | RunPhase::Failed)
    }
}

/// Live, read-only view of the current (or last) run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RunProgress {
    pub run_id: Option<Uuid>,
    pub phase: RunPhase,
    pub percent: u8,
    pub current_page: u32,
    pub total_pages: Option<u32>,
    pub counters: RunCounters,
    pub message: String,
}

impl Default for RunProgress {
    fn default() -> Self {
        Self {
            run_id: None,
            phase: RunPhase::Idle,
            percent: 0,
            current_page: 0,
            total_pages: None,
            counters: RunCounters::default(),
            message: "No sync running".to_string(),
        }
    }
}

/// Percentage after `pages_done` pages: 10..=80 for bounded scopes, 5 per page capped at 75
/// for open-ended ones.
pub fn page_percent(scope: PageScope, pages_done: u32) -> u8 {
    if scope.is_open_ended() {
        (10 + 5 * pages_done.min(13)).min(75) as u8
    } else {
        let total = scope.pages.max(1);
        (10 + 70 * pages_done.min(total) / total) as u8
    }
}

pub struct Orchestrator {
    store: Arc<dyn InventoryStore>,
    fetcher: Arc<dyn RecordFetcher>,
    ledger: ChangeLedger,
    lock: Arc<RunLock>,
    options: SnapshotOptions,
    progress: watch::Sender<RunProgress>,
    run_lease: Duration,
    /// Terminal record of a run whose outcome never reached the store.
    unsaved: Mutex<Option<RunRecord>>,
}

impl Orchestrator {
    pub fn new(store: Arc<dyn InventoryStore>, fetcher: Arc<dyn RecordFetcher>, options: SnapshotOptions) -> Self {
        let (progress, _) = watch::channel(RunProgress::default());
        Self {
            ledger: ChangeLedger::new(Arc::clone(&store)),
            store,
            fetcher,
            lock: RunLock::new(),
            options,
            progress,
            run_lease: DEFAULT_RUN_LEASE,
            unsaved: Mutex::new(None),
        }
    }

    /// Overrides [`DEFAULT_RUN_LEASE`]. The lease is renewed four times per period.
    pub fn with_run_lease(mut self, lease: Duration) -> Self {
        self.run_lease = lease.max(Duration::from_millis(100));
        self
    }

    pub fn store(&self) -> &Arc<dyn InventoryStore> {
        &self.store
    }

    pub fn fetcher(&self) -> &Arc<dyn RecordFetcher> {
        &self.fetcher
    }

    pub fn options(&self) -> &SnapshotOptions {
        &self.options
    }

    pub fn progress(&self) -> RunProgress {
        self.progress.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<RunProgress> {
        self.progress.subscribe()
    }

    pub fn active_run(&self) -> Option<Uuid> {
        self.lock.active_run()
    }

    pub fn is_running(&self) -> bool {
        self.lock.is_held()
    }

    /// Asks the active run to stop after its current page.
    pub fn cancel(&self, run_id: Uuid) -> bool {
        let accepted = self.lock.cancel(run_id);
        if accepted {
            info!(%run_id, "cancellation requested");
        }
        accepted
    }

    /// Fails every `running` run whose owner stopped renewing its lease. Runs another
    /// process is still driving are left alone.
    pub async fn recover_stale_runs(&self) -> SyncResult<u64> {
        let now = Utc::now();
        let count = self
            .store
            .fail_stale_runs(STALE_RUN_NOTE, self.lease_cutoff(now), now)
            .await?;
        if count > 0 {
            warn!(count, "marked stale runs as failed");
        }
        Ok(count)
    }

    fn lease_cutoff(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        let lease = chrono::Duration::from_std(self.run_lease).unwrap_or_else(|_| chrono::Duration::minutes(2));
        now - lease
    }

    /// Starts a run in the background and returns its id. Rejects with `RunInProgress`.
    pub async fn trigger(self: &Arc<Self>, scope: PageScope, trigger: RunTrigger) -> SyncResult<Uuid> {
        let (guard, cancel, run) = self.begin(scope, trigger).await?;
        let run_id = run.run_id;

        let worker = Arc::clone(self);
        let handle = tokio::spawn(async move { worker.execute(guard, cancel, run).await });

        let supervisor = Arc::clone(self);
        tokio::spawn(async move {
            if let Err(join_err) = handle.await {
                error!(%run_id, error = %join_err, "sync run terminated abnormally");
                supervisor
                    .fail_abandoned(run_id, &format!("Run terminated abnormally: {join_err}"))
                    .await;
            }
        });

        Ok(run_id)
    }

    /// Runs a pass to completion on the current task.
    pub async fn run(&self, scope: PageScope, trigger: RunTrigger) -> SyncResult<RunRecord> {
        let (guard, cancel, run) = self.begin(scope, trigger).await?;
        Ok(self.execute(guard, cancel, run).await)
    }

    /// Resolves once `run_id` is terminal in the store, or once this process finished it
    /// without managing to save the outcome.
    pub async fn wait_for_run(&self, run_id: Uuid) -> SyncResult<RunRecord> {
        let mut updates = self.progress.subscribe();
        loop {
            let run = self.store.get_run(run_id).await?.ok_or(SyncError::RunNotFound(run_id))?;
            if run.status.is_terminal() {
                return Ok(run);
            }
            if let Some(unsaved) = self.unsaved_outcome(run_id) {
                return Ok(unsaved);
            }
            if updates.changed().await.is_err() {
                return Ok(run);
            }
        }
    }

    async fn begin(
        &self,
        scope: PageScope,
        trigger: RunTrigger,
    ) -> SyncResult<(RunGuard, CancellationToken, RunRecord)> {
        let run_id = Uuid::new_v4();
        let (guard, cancel) = self.lock.try_acquire(run_id)?;
        self.flush_unsaved().await;

        let now = Utc::now();
        let cutoff = self.lease_cutoff(now);
        let reclaimed = self.store.fail_stale_runs(STALE_RUN_NOTE, cutoff, now).await?;
        if reclaimed > 0 {
            warn!(count = reclaimed, "reclaimed runs with expired leases");
        }
        let run = RunRecord::start(run_id, trigger, scope, now);
        if let RunAdmission::Busy { run_id: holder } = self.store.create_run(&run, cutoff).await? {
            info!(%holder, "another process holds the run lease");
            return Err(SyncError::RunInProgress { run_id: holder });
        }

        self.progress.send_replace(RunProgress {
            run_id: Some(run_id),
            phase: RunPhase::Fetching,
            percent: 5,
            current_page: 0,
            total_pages: (!scope.is_open_ended()).then_some(scope.pages),
            counters: RunCounters::default(),
            message: "Sync starting".to_string(),
        });
        info!(%run_id, trigger = trigger.as_str(), pages = %scope.label(), "sync run started");
        Ok((guard, cancel, run))
    }

    fn publish(&self, update: impl FnOnce(&mut RunProgress)) {
        self.progress.send_modify(|progress| {
            let floor = progress.percent;
            update(progress);
            progress.percent = progress.percent.max(floor);
        });
    }

    async fn execute(&self, guard: RunGuard, cancel: CancellationToken, run: RunRecord) -> RunRecord {
        let span = info_span!("sync_run", run_id = %run.run_id, trigger = run.trigger.as_str());
        self.execute_inner(guard, cancel, run).instrument(span).await
    }

    async fn execute_inner(&self, guard: RunGuard, cancel: CancellationToken, mut run: RunRecord) -> RunRecord {
        let _lease = self.keep_lease(run.run_id);
        let scope = run.scope;
        let snapshot = collect_snapshot(
            self.fetcher.as_ref(),
            &self.options,
            scope,
            Some(&cancel),
            |tick: PageTick| {
                self.publish(|p| {
                    p.current_page = tick.page;
                    p.percent = page_percent(scope, tick.pages_attempted);
                    p.counters.found = tick.records_so_far as u64;
                    p.message = if tick.failed {
                        format!("Page {} failed; continuing", tick.page)
                    } else {
                        format!("Fetched page {} ({} records so far)", tick.page, tick.records_so_far)
                    };
                })
            },
        )
        .await;
        note_snapshot(&mut run, &snapshot);

        self.publish(|p| {
            p.phase = RunPhase::Applying;
            p.percent = 85;
            p.message = "Applying changes".to_string();
        });

        let outcome = self.reconcile(&mut run, snapshot.records).await;
        run.finished_at = Some(Utc::now());
        match outcome {
            Ok(()) => {
                run.status = RunStatus::Completed;
                run.push_log(format!(
                    "Sync completed. {} records found, {} new, {} updated, {} removed.",
                    run.counters.found, run.counters.new, run.counters.updated, run.counters.removed
                ));
                info!(
                    found = run.counters.found,
                    new = run.counters.new,
                    updated = run.counters.updated,
                    removed = run.counters.removed,
                    errors = run.errors.len(),
                    partial = run.partial,
                    "sync run completed"
                );
            }
            Err(err) => {
                run.status = RunStatus::Failed;
                run.errors.push(err.to_string());
                run.push_log(format!("Sync failed: {err}"));
                error!(error = %err, "sync run failed");
            }
        }

        self.finalize(guard, &mut run).await;
        run
    }

    /// Renews the run's lease in the background until the returned guard drops.
    fn keep_lease(&self, run_id: Uuid) -> DropGuard {
        let stop = CancellationToken::new();
        let stopped = stop.clone();
        let store = Arc::clone(&self.store);
        let period = self.run_lease / 4;
        tokio::spawn(async move {
            let mut renewals = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
            renewals.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = stopped.cancelled() => break,
                    _ = renewals.tick() => match store.renew_run_lease(run_id, Utc::now()).await {
                        Ok(true) => {}
                        Ok(false) => {
                            warn!(%run_id, "run is no longer running in the store; lease renewal stopped");
                            break;
                        }
                        Err(err) => warn!(%run_id, error = %err, "could not renew run lease"),
                    },
                }
            }
        });
        stop.drop_guard()
    }

    /// Compare against one consistent local snapshot, apply atomically, then audit.
    async fn reconcile(&self, run: &mut RunRecord, remote: Vec<RawRecord>) -> SyncResult<()> {
        let local = self.store.load_records().await?;
        let diff = compare(remote, &local)?;
        if diff.dropped_blank > 0 {
            let note = format!("Dropped {} remote record(s) with a blank identifier.", diff.dropped_blank);
            run.errors.push(note.clone());
            run.push_log(note);
        }
        run.push_log(diff.summary());

        let applied_at = Utc::now();
        let batch = apply_batch_for(&diff, applied_at);
        if let Err(err) = self.store.apply_batch(&batch).await {
            run.push_log(unapplied_note(&diff));
            return Err(SyncError::Apply(err));
        }

        run.counters = RunCounters {
            found: diff.remote_count as u64,
            new: diff.new_remote.len() as u64,
            updated: diff.changed.len() as u64,
            removed: diff.gone_local.len() as u64,
        };
        if diff.reactivated_count() > 0 {
            run.push_log(format!("{} archived record(s) reactivated.", diff.reactivated_count()));
        }
        let counters = run.counters;
        self.publish(|p| {
            p.percent = 90;
            p.counters = counters;
            p.message = "Recording change history".to_string();
        });

        let report = self
            .ledger
            .record(
                &diff,
                &LedgerContext {
                    run_id: run.run_id,
                    recorded_at: applied_at,
                },
            )
            .await;
        run.push_log(format!(
            "Ledger: {} change entries, {} price points, {} duplicates skipped.",
            report.entries_written, report.price_points_written, report.duplicates
        ));
        for err in report.errors {
            run.errors.push(err.to_string());
        }
        Ok(())
    }

    async fn finalize(&self, guard: RunGuard, run: &mut RunRecord) {
        self.persist_outcome(run).await;
        drop(guard);

        let phase = match run.status {
            RunStatus::Failed => RunPhase::Failed,
            _ => RunPhase::Completed,
        };
        let counters = run.counters;
        let message = run.log.lines().last().unwrap_or_default().to_string();
        self.publish(|p| {
            p.phase = phase;
            p.percent = 100;
            p.counters = counters;
            p.message = message;
        });
    }

    /// Writes the terminal state, retrying a few times. When every attempt fails the outcome
    /// is kept in memory for [`Self::wait_for_run`]; the row's lease then lapses and the next
    /// run or restart reclaims it.
    async fn persist_outcome(&self, run: &mut RunRecord) {
        let mut attempt = 1;
        loop {
            match self.store.finish_run(run).await {
                Ok(true) => return,
                Ok(false) => {
                    warn!(run_id = %run.run_id, "run was already finalized");
                    return;
                }
                Err(err) if attempt < FINISH_ATTEMPTS => {
                    warn!(run_id = %run.run_id, attempt, error = %err, "could not persist run outcome; retrying");
                    tokio::time::sleep(FINISH_RETRY_DELAY * attempt).await;
                    attempt += 1;
                }
                Err(err) => {
                    error!(run_id = %run.run_id, attempts = attempt, error = %err, "could not persist run outcome");
                    let note = format!("Run outcome could not be saved: {err}");
                    run.errors.push(note.clone());
                    run.push_log(note);
                    *self.unsaved_slot() = Some(run.clone());
                    return;
                }
            }
        }
    }

    /// One more attempt at an outcome that earlier retries could not save, so its row does
    /// not hold the lease until expiry.
    async fn flush_unsaved(&self) {
        let pending = self.unsaved_slot().clone();
        let Some(run) = pending else {
            return;
        };
        match self.store.finish_run(&run).await {
            Ok(_) => {
                info!(run_id = %run.run_id, "saved a previously unsaved run outcome");
                *self.unsaved_slot() = None;
            }
            Err(err) => warn!(run_id = %run.run_id, error = %err, "run outcome still cannot be saved"),
        }
    }

    fn unsaved_slot(&self) -> std::sync::MutexGuard<'_, Option<RunRecord>> {
        self.unsaved.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn unsaved_outcome(&self, run_id: Uuid) -> Option<RunRecord> {
        self.unsaved_slot().as_ref().filter(|run| run.run_id == run_id).cloned()
    }

    async fn fail_abandoned(&self, run_id: Uuid, note: &str) {
        match self.store.get_run(run_id).await {
            Ok(Some(mut run)) if run.status == RunStatus::Running => {
                run.status = RunStatus::Failed;
                run.finished_at = Some(Utc::now());
                run.errors.push(note.to_string());
                run.push_log(note);
                self.persist_outcome(&mut run).await;
            }
            Ok(_) => {}
            Err(err) => error!(%run_id, error = %err, "could not load abandoned run"),
        }
        let message = note.to_string();
        self.progress.send_modify(|p| {
            if p.run_id == Some(run_id) {
                p.phase = RunPhase::Failed;
                p.percent = 100;
                p.message = message;
            }
        });
    }
}

fn note_snapshot(run: &mut RunRecord, snapshot: &RemoteSnapshot) {
    for failure in &snapshot.page_failures {
        let line = failure.to_string();
        run.push_log(&line);
        run.errors.push(line);
    }
    match snapshot.stop {
        StopReason::Cancelled { after_page } => {
            run.partial = true;
            run.push_log(format!(
                "Cancelled after page {after_page}; applying the partial snapshot ({} records).",
                snapshot.records.len()
            ));
        }
        StopReason::FailureLimit { page } => {
            run.partial = true;
            run.push_log(format!("Stopped at page {page} after repeated page failures."));
        }
        StopReason::PageCap { cap } => {
            run.partial = true;
            run.push_log(format!("Stopped at the {cap}-page cap."));
        }
        StopReason::EndOfListing { page } => {
            run.push_log(format!("Reached the end of the listing at page {page}."));
        }
        StopReason::ScopeExhausted => {}
    }
    run.push_log(format!(
        "Fetched {} records from {} page(s).",
        snapshot.records.len(),
        snapshot.pages_attempted
    ));
}

fn apply_batch_for(diff: &DiffResult, at: chrono::DateTime<Utc>) -> ApplyBatch {
    let mut upserts = Vec::with_capacity(diff.changed.len() + diff.new_remote.len());
    for changed in &diff.changed {
        let mut record = changed.previous.clone();
        record.absorb(&changed.remote, at);
        upserts.push(record);
    }
    for added in &diff.new_remote {
        let record = match &added.previous {
            Some(archived) => {
                let mut record = archived.clone();
                record.absorb(&added.remote, at);
                record
            }
            None => InventoryRecord::from_raw(&added.remote, at),
        };
        upserts.push(record);
    }
    ApplyBatch {
        upserts,
        archive: diff.gone_local.iter().map(|r| r.identifier.clone()).collect(),
        at,
    }
}

fn unapplied_note(diff: &DiffResult) -> String {
    let identifiers: Vec<&str> = diff
        .changed
        .iter()
        .map(|c| c.identifier.as_str())
        .chain(diff.new_remote.iter().map(|n| n.identifier()))
        .chain(diff.gone_local.iter().map(|r| r.identifier.as_str()))
        .collect();
    let shown = identifiers.len().min(UNAPPLIED_PREVIEW);
    let mut note = format!(
        "Unapplied snapshot: {} | pending: {}",
        diff.summary(),
        identifiers[..shown].join(", ")
    );
    if identifiers.len() > shown {
        note.push_str(&format!(" ... and {} more", identifiers.len() - shown));
    }
    note
}
