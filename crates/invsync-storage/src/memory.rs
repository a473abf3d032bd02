//! In-process [`InventoryStore`] for tests and dry runs, with switchable failure paths.

use std::collections::{BTreeMap, HashMap, HashSet};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use invsync_core::{ChangeLogEntry, InventoryRecord, MonitorConfig, PricePoint, RunRecord, RunStatus};
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::{
    page_count, page_window, stale_run_failed, AppendOutcome, ApplyBatch, ApplyCounts,
    InventoryStore, RunAdmission, RunPage, StoreError,
};

/// Failure switches for exercising error paths against the in-memory store.
#[derive(Debug, Clone, Default)]
pub struct MemoryFaults {
    pub fail_loads: bool,
    pub fail_apply: bool,
    pub fail_ledger_for: HashSet<String>,
    pub fail_finish: bool,
}

#[derive(Debug, Default)]
struct MemoryState {
    records: BTreeMap<String, InventoryRecord>,
    change_log: Vec<ChangeLogEntry>,
    change_keys: HashSet<String>,
    price_history: Vec<PricePoint>,
    price_keys: HashSet<String>,
    runs: Vec<RunRecord>,
    leases: HashMap<Uuid, DateTime<Utc>>,
    monitor: MonitorConfig,
    faults: MemoryFaults,
}

/// In-process store with the same uniqueness and ordering rules as [`crate::SqliteStore`].
#[derive(Debug, Default)]
pub struct MemoryStore {
    state: Mutex<MemoryState>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn seed(&self, records: impl IntoIterator<Item = InventoryRecord>) {
        let mut state = self.state.lock().await;
        for record in records {
            state.records.insert(record.identifier.clone(), record);
        }
    }

    pub async fn set_faults(&self, faults: MemoryFaults) {
        self.state.lock().await.faults = faults;
    }

    pub async fn change_log(&self) -> Vec<ChangeLogEntry> {
        self.state.lock().await.change_log.clone()
    }

    pub async fn all_price_points(&self) -> Vec<PricePoint> {
        self.state.lock().await.price_history.clone()
    }

    pub async fn all_runs(&self) -> Vec<RunRecord> {
        self.state.lock().await.runs.clone()
    }
}

#[async_trait]
impl InventoryStore for MemoryStore {
    async fn load_records(&self) -> Result<Vec<InventoryRecord>, StoreError> {
        let state = self.state.lock().await;
        if state.faults.fail_loads {
            return Err(StoreError::Unavailable("record load refused".into()));
        }
        Ok(state.records.values().cloned().collect())
    }

    async fn get_record(&self, identifier: &str) -> Result<Option<InventoryRecord>, StoreError> {
        Ok(self.state.lock().await.records.get(identifier).cloned())
    }

    async fn apply_batch(&self, batch: &ApplyBatch) -> Result<ApplyCounts, StoreError> {
        let mut state = self.state.lock().await;
        if state.faults.fail_apply {
            return Err(StoreError::Unavailable("write refused".into()));
        }

        let mut counts = ApplyCounts::default();
        for record in &batch.upserts {
            let mut record = record.clone();
            if let Some(existing) = state.records.get(&record.identifier) {
                record.first_seen = existing.first_seen;
            }
            state.records.insert(record.identifier.clone(), record);
            counts.upserted += 1;
        }
        for identifier in &batch.archive {
            if let Some(record) = state.records.get_mut(identifier) {
                if record.active {
                    record.active = false;
                    record.last_updated = batch.at;
                    counts.archived += 1;
                }
            }
        }
        Ok(counts)
    }

    async fn insert_change_entry(&self, entry: &ChangeLogEntry) -> Result<AppendOutcome, StoreError> {
        let mut state = self.state.lock().await;
        if state.faults.fail_ledger_for.contains(&entry.identifier) {
            return Err(StoreError::Unavailable(format!(
                "change log write refused for {}",
                entry.identifier
            )));
        }
        if !state.change_keys.insert(entry.dedupe_key.clone()) {
            return Ok(AppendOutcome::Duplicate);
        }
        state.change_log.push(entry.clone());
        Ok(AppendOutcome::Inserted)
    }

    async fn append_price_point(&self, point: &PricePoint) -> Result<AppendOutcome, StoreError> {
        let mut state = self.state.lock().await;
        if state.faults.fail_ledger_for.contains(&point.identifier) {
            return Err(StoreError::Unavailable(format!(
                "price history write refused for {}",
                point.identifier
            )));
        }
        if state.price_keys.contains(&point.dedupe_key) {
            return Ok(AppendOutcome::Duplicate);
        }
        let latest = state
            .price_history
            .iter()
            .filter(|p| p.identifier == point.identifier)
            .max_by_key(|p| p.recorded_at);
        if let Some(latest) = latest {
            if latest.price == point.price {
                return Ok(AppendOutcome::Duplicate);
            }
            if latest.recorded_at > point.recorded_at {
                return Err(StoreError::NonMonotonic {
                    identifier: point.identifier.clone(),
                });
            }
        }
        state.price_keys.insert(point.dedupe_key.clone());
        state.price_history.push(point.clone());
        Ok(AppendOutcome::Inserted)
    }

    async fn price_history(&self, identifier: &str) -> Result<Vec<PricePoint>, StoreError> {
        let state = self.state.lock().await;
        let mut points: Vec<_> = state
            .price_history
            .iter()
            .filter(|p| p.identifier == identifier)
            .cloned()
            .collect();
        points.sort_by_key(|p| p.recorded_at);
        Ok(points)
    }

    async fn change_history(&self, identifier: &str) -> Result<Vec<ChangeLogEntry>, StoreError> {
        let state = self.state.lock().await;
        let mut entries: Vec<_> = state
            .change_log
            .iter()
            .filter(|e| e.identifier == identifier)
            .cloned()
            .collect();
        entries.reverse();
        entries.sort_by(|a, b| b.changed_at.cmp(&a.changed_at));
        Ok(entries)
    }

    async fn create_run(&self, run: &RunRecord, lease_cutoff: DateTime<Utc>) -> Result<RunAdmission, StoreError> {
        let mut state = self.state.lock().await;
        if state.runs.iter().any(|r| r.run_id == run.run_id) {
            return Err(StoreError::Corrupt(format!("run {} already exists", run.run_id)));
        }
        let live = state.runs.iter().find(|r| {
            r.status == RunStatus::Running
                && state.leases.get(&r.run_id).is_some_and(|renewed| *renewed >= lease_cutoff)
        });
        if let Some(live) = live {
            return Ok(RunAdmission::Busy { run_id: live.run_id });
        }
        state.leases.insert(run.run_id, run.started_at);
        state.runs.push(run.clone());
        Ok(RunAdmission::Admitted)
    }

    async fn renew_run_lease(&self, run_id: Uuid, at: DateTime<Utc>) -> Result<bool, StoreError> {
        let mut state = self.state.lock().await;
        let running = state
            .runs
            .iter()
            .any(|r| r.run_id == run_id && r.status == RunStatus::Running);
        if running {
            state.leases.insert(run_id, at);
        }
        Ok(running)
    }

    async fn finish_run(&self, run: &RunRecord) -> Result<bool, StoreError> {
        let mut state = self.state.lock().await;
        if state.faults.fail_finish {
            return Err(StoreError::Unavailable("run update refused".into()));
        }
        match state.runs.iter_mut().find(|r| r.run_id == run.run_id) {
            Some(existing) if existing.status == RunStatus::Running => {
                *existing = run.clone();
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn get_run(&self, run_id: Uuid) -> Result<Option<RunRecord>, StoreError> {
        let state = self.state.lock().await;
        Ok(state.runs.iter().find(|r| r.run_id == run_id).cloned())
    }

    async fn latest_run(&self) -> Result<Option<RunRecord>, StoreError> {
        let state = self.state.lock().await;
        Ok(state.runs.iter().max_by_key(|r| r.started_at).cloned())
    }

    async fn list_finished_runs(&self, page: u32, per_page: u32) -> Result<RunPage, StoreError> {
        let (page, per_page, offset) = page_window(page, per_page);
        let state = self.state.lock().await;
        let mut finished: Vec<_> = state
            .runs
            .iter()
            .filter(|r| r.status.is_terminal())
            .cloned()
            .collect();
        finished.sort_by(|a, b| b.started_at.cmp(&a.started_at));
        let total = finished.len() as u64;
        let items = finished
            .into_iter()
            .skip(offset as usize)
            .take(per_page as usize)
            .collect();
        Ok(RunPage {
            items,
            total,
            page,
            per_page,
            pages: page_count(total, per_page),
        })
    }

    async fn fail_stale_runs(
        &self,
        note: &str,
        lease_cutoff: DateTime<Utc>,
        at: DateTime<Utc>,
    ) -> Result<u64, StoreError> {
        let mut state = self.state.lock().await;
        let MemoryState { runs, leases, .. } = &mut *state;
        let mut count = 0;
        for run in runs.iter_mut().filter(|r| r.status == RunStatus::Running) {
            if leases.get(&run.run_id).is_some_and(|renewed| *renewed >= lease_cutoff) {
                continue;
            }
            stale_run_failed(run, note, at);
            count += 1;
        }
        Ok(count)
    }

    async fn load_monitor_config(&self) -> Result<MonitorConfig, StoreError> {
        Ok(self.state.lock().await.monitor.clone())
    }

    async fn save_monitor_settings(&self, config: &MonitorConfig) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        state.monitor.enabled = config.enabled;
        state.monitor.interval_minutes = config.interval_minutes;
        state.monitor.pages = config.pages;
        Ok(())
    }

    async fn record_monitor_check(&self, at: DateTime<Utc>, outcome: &str) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        state.monitor.last_check_at = Some(at);
        state.monitor.last_check_result = outcome.to_string();
        Ok(())
    }
}
