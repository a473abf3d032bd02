use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use invsync_core::{
    ChangeType, InventoryRecord, PageScope, Price, PriceDirection, RawRecord, RunStatus, RunTrigger,
};
use invsync_fetch::{BackoffPolicy, PageError, RecordFetcher};
use invsync_storage::{InventoryStore, MemoryFaults, MemoryStore};
use invsync_sync::orchestrator::STALE_RUN_NOTE;
use invsync_sync::{
    MonitorConfigUpdate, MonitorSettings, Orchestrator, RunPhase, SnapshotOptions, SyncError, SyncService,
    TickOutcome,
};
use tokio::sync::{Notify, Semaphore};
use tokio_util::sync::CancellationToken;

#[derive(Clone, Default)]
struct StaticPages {
    pages: Vec<Vec<RawRecord>>,
    broken: HashSet<u32>,
    panic_on: Option<u32>,
}

impl StaticPages {
    fn new(pages: Vec<Vec<RawRecord>>) -> Self {
        Self {
            pages,
            ..Self::default()
        }
    }

    fn page(&self, page: u32) -> Result<Vec<RawRecord>, PageError> {
        if self.panic_on == Some(page) {
            panic!("fetcher crashed on page {page}");
        }
        if self.broken.contains(&page) {
            return Err(PageError::Source {
                page,
                message: "upstream refused the request".into(),
            });
        }
        Ok(self.pages.get(page as usize - 1).cloned().unwrap_or_default())
    }
}

#[async_trait]
impl RecordFetcher for StaticPages {
    fn source_name(&self) -> &str {
        "static"
    }

    async fn fetch(&self, page: u32) -> Result<Vec<RawRecord>, PageError> {
        self.page(page)
    }
}

/// Blocks the first fetch of `gated_page` until a permit is released.
struct GatedPages {
    inner: StaticPages,
    gated_page: u32,
    entered: Arc<Notify>,
    gate: Arc<Semaphore>,
}

#[async_trait]
impl RecordFetcher for GatedPages {
    fn source_name(&self) -> &str {
        "gated"
    }

    async fn fetch(&self, page: u32) -> Result<Vec<RawRecord>, PageError> {
        if page == self.gated_page {
            self.entered.notify_one();
            let permit = self.gate.acquire().await.map_err(|_| PageError::Source {
                page,
                message: "gate closed".into(),
            })?;
            permit.forget();
        }
        self.inner.page(page)
    }
}

fn priced(identifier: &str, amount: f64) -> RawRecord {
    RawRecord::new(identifier).with_price(amount)
}

fn options() -> SnapshotOptions {
    SnapshotOptions {
        retry: BackoffPolicy {
            attempt_timeout: Duration::from_secs(30),
            ..BackoffPolicy::immediate(3)
        },
        open_ended_page_cap: 100,
        open_ended_failure_limit: 3,
    }
}

fn service(store: &Arc<MemoryStore>, fetcher: impl RecordFetcher + 'static) -> SyncService {
    let store: Arc<dyn InventoryStore> = store.clone();
    SyncService::new(store, Arc::new(fetcher), options(), MonitorSettings::default())
}

/// A service with its own run lease, standing in for a separate process on the same store.
fn leased_service(store: &Arc<MemoryStore>, fetcher: impl RecordFetcher + 'static, lease: Duration) -> SyncService {
    let store: Arc<dyn InventoryStore> = store.clone();
    let orchestrator = Orchestrator::new(store, Arc::new(fetcher), options()).with_run_lease(lease);
    SyncService::with_orchestrator(orchestrator, MonitorSettings::default())
}

async fn running_rows(store: &MemoryStore) -> usize {
    store
        .all_runs()
        .await
        .iter()
        .filter(|r| r.status == RunStatus::Running)
        .count()
}

async fn seed_active(store: &MemoryStore, records: &[(&str, f64)]) {
    let at = Utc::now() - chrono::Duration::days(1);
    store
        .seed(records.iter().map(|(id, amount)| InventoryRecord::from_raw(&priced(id, *amount), at)))
        .await;
}

#[tokio::test]
async fn page_failure_mid_run_still_completes() {
    let store = Arc::new(MemoryStore::new());
    let mut fetcher = StaticPages::new(
        (1..=5)
            .map(|p| vec![priced(&format!("P{p}-A"), 100.0 * p as f64), priced(&format!("P{p}-B"), 50.0)])
            .collect(),
    );
    fetcher.broken.insert(3);
    let svc = service(&store, fetcher);

    let run = svc.orchestrator().run(PageScope::first(5), RunTrigger::Manual).await.unwrap();

    assert_eq!(run.status, RunStatus::Completed);
    assert_eq!(run.counters.found, 8);
    assert_eq!(run.counters.new, 8);
    assert_eq!(run.errors.len(), 1);
    assert!(run.errors[0].contains("page 3"), "{:?}", run.errors);
    assert!(store.get_record("P3-A").await.unwrap().is_none());
    for page in [1, 2, 4, 5] {
        assert!(store.get_record(&format!("P{page}-A")).await.unwrap().is_some());
    }
    assert!(!svc.orchestrator().is_running());
    let progress = svc.orchestrator().progress();
    assert_eq!(progress.phase, RunPhase::Completed);
    assert_eq!(progress.percent, 100);
}

#[tokio::test]
async fn price_drop_and_new_listing_end_to_end() {
    let store = Arc::new(MemoryStore::new());
    seed_active(&store, &[("VIN123", 20_000.0)]).await;
    let svc = service(
        &store,
        StaticPages::new(vec![vec![priced("VIN123", 18_500.0), priced("VIN456", 15_000.0)]]),
    );

    let run = svc.orchestrator().run(PageScope::first(1), RunTrigger::Manual).await.unwrap();
    assert_eq!(run.status, RunStatus::Completed);
    assert_eq!((run.counters.new, run.counters.updated, run.counters.removed), (1, 1, 0));

    let log = store.change_log().await;
    assert_eq!(log.len(), 2);
    let update = log.iter().find(|e| e.identifier == "VIN123").unwrap();
    assert_eq!(update.change_type, ChangeType::Updated);
    assert_eq!(update.field_name.as_deref(), Some("price"));
    assert_eq!((update.old_value.as_deref(), update.new_value.as_deref()), (Some("20000"), Some("18500")));
    assert_eq!(update.run_id, run.run_id);
    assert!(log.iter().any(|e| e.identifier == "VIN456" && e.change_type == ChangeType::New));
    assert_eq!(store.all_price_points().await.len(), 2);

    let vin123 = store.get_record("VIN123").await.unwrap().unwrap();
    assert_eq!(vin123.price, Some(Price::from_cents(1_850_000)));

    let history = svc.record_history("vin456").await.unwrap();
    assert_eq!(history.price_direction, PriceDirection::New);
    assert_eq!(history.changes.len(), 1);
    assert!(matches!(svc.record_history("NOPE").await, Err(SyncError::RecordNotFound(_))));
}

#[tokio::test]
async fn missing_listing_is_archived_not_deleted() {
    let store = Arc::new(MemoryStore::new());
    seed_active(&store, &[("VIN1", 10_000.0), ("VIN789", 7_000.0)]).await;
    let svc = service(&store, StaticPages::new(vec![vec![priced("VIN1", 10_000.0)]]));

    let run = svc.orchestrator().run(PageScope::all(), RunTrigger::Manual).await.unwrap();
    assert_eq!(run.counters.removed, 1);

    let gone = store.get_record("VIN789").await.unwrap().unwrap();
    assert!(!gone.active);
    let log = store.change_log().await;
    assert_eq!(log.len(), 1);
    assert_eq!(log[0].change_type, ChangeType::Removed);
    assert!(store.all_price_points().await.is_empty());
}

#[tokio::test]
async fn repeated_runs_write_no_duplicate_history() {
    let store = Arc::new(MemoryStore::new());
    seed_active(&store, &[("A", 100.0)]).await;
    let svc = service(&store, StaticPages::new(vec![vec![priced("A", 90.0), priced("B", 50.0)]]));

    let first = svc.orchestrator().run(PageScope::all(), RunTrigger::Manual).await.unwrap();
    let entries = store.change_log().await.len();
    let points = store.all_price_points().await.len();
    let second = svc.orchestrator().run(PageScope::all(), RunTrigger::Manual).await.unwrap();

    assert_eq!(first.counters.updated + first.counters.new, 2);
    assert_eq!(second.counters.updated + second.counters.new + second.counters.removed, 0);
    assert_eq!(store.change_log().await.len(), entries);
    assert_eq!(store.all_price_points().await.len(), points);
}

#[tokio::test]
async fn second_trigger_while_running_is_rejected() {
    let store = Arc::new(MemoryStore::new());
    let entered = Arc::new(Notify::new());
    let gate = Arc::new(Semaphore::new(0));
    let svc = service(
        &store,
        GatedPages {
            inner: StaticPages::new(vec![vec![priced("X", 1.0)]]),
            gated_page: 1,
            entered: entered.clone(),
            gate: gate.clone(),
        },
    );

    let run_id = svc.trigger_run(PageScope::first(1)).await.unwrap();
    entered.notified().await;

    match svc.trigger_run(PageScope::all()).await {
        Err(SyncError::RunInProgress { run_id: active }) => assert_eq!(active, run_id),
        other => panic!("expected RunInProgress, got {other:?}"),
    }
    let running: Vec<_> = store
        .all_runs()
        .await
        .into_iter()
        .filter(|r| r.status == RunStatus::Running)
        .collect();
    assert_eq!(running.len(), 1);

    let status = svc.run_status(None).await.unwrap().unwrap();
    assert_eq!(status.run.run_id, run_id);
    assert!(status.progress.is_some());

    gate.add_permits(1);
    let done = svc.wait_for_run(run_id).await.unwrap();
    assert_eq!(done.status, RunStatus::Completed);
    assert!(svc.trigger_run(PageScope::first(1)).await.is_ok());
}

#[tokio::test]
async fn cancellation_drains_accumulated_pages() {
    let store = Arc::new(MemoryStore::new());
    let entered = Arc::new(Notify::new());
    let gate = Arc::new(Semaphore::new(0));
    let svc = service(
        &store,
        GatedPages {
            inner: StaticPages::new(vec![
                vec![priced("P1", 1.0)],
                vec![priced("P2", 2.0)],
                vec![priced("P3", 3.0)],
            ]),
            gated_page: 1,
            entered: entered.clone(),
            gate: gate.clone(),
        },
    );

    let run_id = svc.trigger_run(PageScope::first(3)).await.unwrap();
    entered.notified().await;
    assert!(svc.cancel_run(run_id));
    gate.add_permits(1);

    let run = svc.wait_for_run(run_id).await.unwrap();
    assert_eq!(run.status, RunStatus::Completed);
    assert!(run.partial);
    assert!(run.log.contains("Cancelled after page 1"));
    assert_eq!(run.counters.found, 1);
    assert!(store.get_record("P2").await.unwrap().is_none());
    assert!(!svc.cancel_run(run_id));
}

#[tokio::test]
async fn apply_failure_fails_the_run_and_keeps_the_snapshot_in_the_log() {
    let store = Arc::new(MemoryStore::new());
    store
        .set_faults(MemoryFaults {
            fail_apply: true,
            ..MemoryFaults::default()
        })
        .await;
    let svc = service(&store, StaticPages::new(vec![vec![priced("VINZ", 5.0)]]));

    let run = svc.orchestrator().run(PageScope::first(1), RunTrigger::Manual).await.unwrap();
    assert_eq!(run.status, RunStatus::Failed);
    assert!(run.log.contains("Unapplied snapshot"));
    assert!(run.log.contains("VINZ"));
    assert!(run.errors.iter().any(|e| e.contains("applying changes failed")));
    assert!(store.change_log().await.is_empty());
    assert!(!svc.orchestrator().is_running());
    assert_eq!(svc.orchestrator().progress().phase, RunPhase::Failed);
}

#[tokio::test]
async fn empty_snapshot_never_archives_the_inventory() {
    let store = Arc::new(MemoryStore::new());
    seed_active(&store, &[("KEEP", 1.0)]).await;
    let mut fetcher = StaticPages::new(vec![]);
    fetcher.broken.extend([1, 2, 3]);
    let svc = service(&store, fetcher);

    let run = svc.orchestrator().run(PageScope::all(), RunTrigger::Manual).await.unwrap();
    assert_eq!(run.status, RunStatus::Failed);
    assert!(store.get_record("KEEP").await.unwrap().unwrap().active);
}

#[tokio::test]
async fn panicking_run_is_finalized_failed_and_releases_the_lock() {
    let store = Arc::new(MemoryStore::new());
    let fetcher = StaticPages {
        panic_on: Some(1),
        ..StaticPages::default()
    };
    let svc = service(&store, fetcher);

    let run_id = svc.trigger_run(PageScope::first(1)).await.unwrap();
    let run = svc.wait_for_run(run_id).await.unwrap();
    assert_eq!(run.status, RunStatus::Failed);
    assert!(run.errors.iter().any(|e| e.contains("terminated abnormally")));
    assert!(!svc.orchestrator().is_running());
}

#[tokio::test]
async fn stale_runs_are_recovered_at_startup() {
    let store = Arc::new(MemoryStore::new());
    let stale = invsync_core::RunRecord::start(
        uuid::Uuid::new_v4(),
        RunTrigger::Manual,
        PageScope::all(),
        Utc::now() - chrono::Duration::hours(2),
    );
    store.create_run(&stale, stale.started_at).await.unwrap();
    let svc = service(&store, StaticPages::default());

    assert_eq!(svc.recover().await.unwrap(), 1);
    let status = svc.run_status(Some(stale.run_id)).await.unwrap().unwrap();
    assert_eq!(status.run.status, RunStatus::Failed);
    assert!(status.progress.is_none());
    let history = svc.run_history(1, 20).await.unwrap();
    assert_eq!(history.total, 1);
}

#[tokio::test]
async fn monitor_tick_in_sync_records_check_without_a_run() {
    let store = Arc::new(MemoryStore::new());
    seed_active(&store, &[("SAME", 42.0)]).await;
    let svc = service(&store, StaticPages::new(vec![vec![priced("SAME", 42.0)]]));
    let config = svc
        .update_monitor_config(MonitorConfigUpdate {
            enabled: Some(true),
            pages: Some(1),
            ..Default::default()
        })
        .await
        .unwrap();

    let outcome = svc.monitor().tick(&config).await;
    assert!(matches!(outcome, TickOutcome::InSync { .. }));

    let after = svc.monitor_config().await.unwrap();
    assert!(after.last_check_at.is_some());
    assert!(after.last_check_result.starts_with("In sync."));
    assert!(store.all_runs().await.is_empty());
}

#[tokio::test]
async fn monitor_tick_with_drift_triggers_a_monitor_run() {
    let store = Arc::new(MemoryStore::new());
    seed_active(&store, &[("OLD", 10.0)]).await;
    let svc = service(&store, StaticPages::new(vec![vec![priced("OLD", 9.0)]]));
    let config = svc.monitor_config().await.unwrap();

    let outcome = svc.monitor().tick(&config).await;
    let TickOutcome::DriftTriggered { run_id, .. } = outcome else {
        panic!("expected drift, got {outcome:?}");
    };
    let run = svc.wait_for_run(run_id).await.unwrap();
    assert_eq!(run.trigger, RunTrigger::Monitor);
    assert_eq!(run.counters.updated, 1);
}

#[tokio::test]
async fn monitor_defers_while_a_run_is_active() {
    let store = Arc::new(MemoryStore::new());
    let entered = Arc::new(Notify::new());
    let gate = Arc::new(Semaphore::new(0));
    let svc = service(
        &store,
        GatedPages {
            inner: StaticPages::new(vec![vec![priced("X", 1.0)]]),
            gated_page: 1,
            entered: entered.clone(),
            gate: gate.clone(),
        },
    );
    let run_id = svc.trigger_run(PageScope::first(1)).await.unwrap();
    entered.notified().await;

    let config = svc.monitor_config().await.unwrap();
    let outcome = svc.monitor().tick(&config).await;
    assert_eq!(outcome, TickOutcome::Deferred { active_run: Some(run_id) });
    assert!(svc.monitor_config().await.unwrap().last_check_result.starts_with("Deferred"));

    gate.add_permits(1);
    svc.wait_for_run(run_id).await.unwrap();
    assert_eq!(store.all_runs().await.len(), 1);
}

#[tokio::test]
async fn invalid_monitor_update_is_not_persisted() {
    let store = Arc::new(MemoryStore::new());
    let svc = service(&store, StaticPages::default());
    let err = svc
        .update_monitor_config(MonitorConfigUpdate {
            interval_minutes: Some(2),
            ..Default::default()
        })
        .await
        .unwrap_err();
    assert!(matches!(err, SyncError::Config(_)));
    assert_eq!(svc.monitor_config().await.unwrap().interval_minutes, 30);
}

#[tokio::test]
async fn compare_now_reports_drift_without_applying() {
    let store = Arc::new(MemoryStore::new());
    seed_active(&store, &[("A", 1.0), ("GONE", 2.0)]).await;
    let svc = service(&store, StaticPages::new(vec![vec![priced("A", 1.5), priced("NEW", 3.0)]]));

    let report = svc.compare_now(PageScope::all()).await.unwrap();
    assert!(report.has_drift);
    assert_eq!(report.changed, vec!["A".to_string()]);
    assert_eq!(report.new_remote, vec!["NEW".to_string()]);
    assert_eq!(report.gone_local, vec!["GONE".to_string()]);
    assert_eq!(report.summary, "Remote: 2 | Local: 2 | Matched: 0 | New: 1 | Gone: 1 | Changed: 1");

    assert!(store.get_record("NEW").await.unwrap().is_none());
    assert!(store.all_runs().await.is_empty());
    let config = svc.monitor_config().await.unwrap();
    assert!(config.last_check_result.starts_with("Manual check:"));
}

#[tokio::test(start_paused = true)]
async fn enabling_the_monitor_wakes_the_idle_loop() {
    let store = Arc::new(MemoryStore::new());
    seed_active(&store, &[("SAME", 42.0)]).await;
    let store_dyn: Arc<dyn InventoryStore> = store.clone();
    let svc = SyncService::new(
        store_dyn,
        Arc::new(StaticPages::new(vec![vec![priced("SAME", 42.0)]])),
        options(),
        MonitorSettings {
            idle_poll: Duration::from_secs(3600),
            error_backoff: Duration::from_secs(60),
        },
    );
    let shutdown = CancellationToken::new();
    let handle = svc.spawn_monitor(shutdown.clone());

    tokio::task::yield_now().await;
    assert!(svc.monitor_config().await.unwrap().last_check_at.is_none());

    svc.update_monitor_config(MonitorConfigUpdate {
        enabled: Some(true),
        ..Default::default()
    })
    .await
    .unwrap();

    let mut checked = false;
    for _ in 0..50 {
        if svc.monitor_config().await.unwrap().last_check_at.is_some() {
            checked = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(checked, "monitor never ticked after being enabled");
    assert!(store.all_runs().await.is_empty());

    shutdown.cancel();
    handle.await.unwrap();
}

#[tokio::test]
async fn live_run_of_another_process_survives_recovery_and_blocks_triggers() {
    let store = Arc::new(MemoryStore::new());
    let entered = Arc::new(Notify::new());
    let gate = Arc::new(Semaphore::new(0));
    let lease = Duration::from_millis(200);
    let owner = leased_service(
        &store,
        GatedPages {
            inner: StaticPages::new(vec![vec![priced("X", 1.0)]]),
            gated_page: 1,
            entered: entered.clone(),
            gate: gate.clone(),
        },
        lease,
    );
    let other = leased_service(&store, StaticPages::new(vec![vec![priced("Y", 2.0)]]), lease);

    let run_id = owner.trigger_run(PageScope::first(1)).await.unwrap();
    entered.notified().await;
    // Outlive several lease periods; renewals keep the row authoritative.
    tokio::time::sleep(lease * 3).await;

    assert_eq!(other.recover().await.unwrap(), 0);
    match other.trigger_run(PageScope::first(1)).await {
        Err(SyncError::RunInProgress { run_id: holder }) => assert_eq!(holder, run_id),
        result => panic!("expected RunInProgress, got {result:?}"),
    }
    assert!(!other.orchestrator().is_running());
    assert_eq!(running_rows(&store).await, 1);

    gate.add_permits(1);
    let done = owner.wait_for_run(run_id).await.unwrap();
    assert_eq!(done.status, RunStatus::Completed);
    assert!(store.get_record("X").await.unwrap().is_some());
    assert!(store.get_record("Y").await.unwrap().is_none());

    let next = other.trigger_run(PageScope::first(1)).await.unwrap();
    assert_eq!(other.wait_for_run(next).await.unwrap().status, RunStatus::Completed);
}

#[tokio::test]
async fn expired_lease_is_reclaimed_by_the_next_trigger() {
    let store = Arc::new(MemoryStore::new());
    let abandoned = invsync_core::RunRecord::start(
        uuid::Uuid::new_v4(),
        RunTrigger::Monitor,
        PageScope::all(),
        Utc::now() - chrono::Duration::hours(1),
    );
    store.create_run(&abandoned, abandoned.started_at).await.unwrap();
    let svc = service(&store, StaticPages::new(vec![vec![priced("VIN1", 10.0)]]));

    let run_id = svc.trigger_run(PageScope::first(1)).await.unwrap();
    assert_eq!(svc.wait_for_run(run_id).await.unwrap().status, RunStatus::Completed);
    let reclaimed = store.get_run(abandoned.run_id).await.unwrap().unwrap();
    assert_eq!(reclaimed.status, RunStatus::Failed);
    assert_eq!(reclaimed.errors, vec![STALE_RUN_NOTE.to_string()]);
    assert_eq!(running_rows(&store).await, 0);
}

#[tokio::test]
async fn unsaved_outcome_still_releases_waiters() {
    let store = Arc::new(MemoryStore::new());
    store
        .set_faults(MemoryFaults {
            fail_finish: true,
            ..MemoryFaults::default()
        })
        .await;
    let svc = service(&store, StaticPages::new(vec![vec![priced("VIN1", 10.0)]]));

    let run_id = svc.trigger_run(PageScope::first(1)).await.unwrap();
    let run = tokio::time::timeout(Duration::from_secs(10), svc.wait_for_run(run_id))
        .await
        .expect("waiter hung on an unsaved run")
        .unwrap();
    assert_eq!(run.status, RunStatus::Completed);
    assert!(run.errors.iter().any(|e| e.contains("could not be saved")));
    assert_eq!(store.get_run(run_id).await.unwrap().unwrap().status, RunStatus::Running);
    assert!(!svc.orchestrator().is_running());
    assert_eq!(svc.orchestrator().progress().phase, RunPhase::Completed);

    // Once the store recovers, the next trigger saves the pending outcome before starting.
    store.set_faults(MemoryFaults::default()).await;
    let next = svc.trigger_run(PageScope::first(1)).await.unwrap();
    let saved = store.get_run(run_id).await.unwrap().unwrap();
    assert_eq!(saved.status, RunStatus::Completed);
    assert!(saved.errors.iter().any(|e| e.contains("could not be saved")));
    assert_eq!(svc.wait_for_run(next).await.unwrap().status, RunStatus::Completed);
}

#[tokio::test]
async fn ledger_failure_keeps_the_run_completed_with_the_error_listed() {
    let store = Arc::new(MemoryStore::new());
    store
        .set_faults(MemoryFaults {
            fail_ledger_for: ["BAD".to_string()].into_iter().collect(),
            ..MemoryFaults::default()
        })
        .await;
    let svc = service(&store, StaticPages::new(vec![vec![priced("BAD", 1.0), priced("GOOD", 2.0)]]));

    let run_id = svc.trigger_run(PageScope::first(1)).await.unwrap();
    let run = svc.wait_for_run(run_id).await.unwrap();
    assert_eq!(run.status, RunStatus::Completed);
    assert_eq!(run.counters.new, 2);
    assert!(run.errors.iter().any(|e| e.contains("ledger write for BAD")));
    assert!(store.get_record("BAD").await.unwrap().is_some());
    assert!(store.change_log().await.iter().all(|e| e.identifier == "GOOD"));
    assert!(!store.change_log().await.is_empty());
}

#[tokio::test]
async fn load_failure_fails_the_run_and_releases_the_lock() {
    let store = Arc::new(MemoryStore::new());
    store
        .set_faults(MemoryFaults {
            fail_loads: true,
            ..MemoryFaults::default()
        })
        .await;
    let svc = service(&store, StaticPages::new(vec![vec![priced("VIN1", 10.0)]]));

    let run_id = svc.trigger_run(PageScope::first(1)).await.unwrap();
    let run = svc.wait_for_run(run_id).await.unwrap();
    assert_eq!(run.status, RunStatus::Failed);
    assert!(run.errors.iter().any(|e| e.contains("record load refused")));
    assert!(store.get_record("VIN1").await.unwrap().is_none());
    assert!(!svc.orchestrator().is_running());
    assert_eq!(svc.orchestrator().progress().phase, RunPhase::Failed);

    store.set_faults(MemoryFaults::default()).await;
    let retry = svc.trigger_run(PageScope::first(1)).await.unwrap();
    assert_eq!(svc.wait_for_run(retry).await.unwrap().status, RunStatus::Completed);
}

#[tokio::test]
async fn scheduled_trigger_is_recorded_as_scheduled() {
    let store = Arc::new(MemoryStore::new());
    let svc = service(&store, StaticPages::new(vec![vec![priced("VIN1", 10.0)]]));

    let run_id = svc.trigger_run_as(PageScope::first(1), RunTrigger::Scheduled).await.unwrap();
    let run = svc.wait_for_run(run_id).await.unwrap();
    assert_eq!(run.trigger, RunTrigger::Scheduled);
    assert_eq!(run.status, RunStatus::Completed);
}
