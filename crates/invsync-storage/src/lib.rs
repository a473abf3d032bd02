//! Persistence capability for the inventory mirror: records, append-only audit tables,
//! run records and the singleton monitor settings.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use invsync_core::{ChangeLogEntry, InventoryRecord, MonitorConfig, PricePoint, RunRecord};
use serde::Serialize;
use thiserror::Error;
use uuid::Uuid;

mod memory;
mod sqlite;

pub use memory::{MemoryFaults, MemoryStore};
pub use sqlite::SqliteStore;

pub const CRATE_NAME: &str = "invsync-storage";

pub const MAX_PER_PAGE: u32 = 100;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("migration error: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),
    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
    #[error("corrupt row: {0}")]
    Corrupt(String),
    #[error("price point for {identifier} is older than its latest recorded point")]
    NonMonotonic { identifier: String },
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

/// Outcome of [`InventoryStore::create_run`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunAdmission {
    Admitted,
    /// Another run still holds a live lease.
    Busy { run_id: Uuid },
}

/// Result of an idempotent append.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppendOutcome {
    Inserted,
    Duplicate,
}

/// Store mutations for one apply phase, committed atomically.
#[derive(Debug, Clone)]
pub struct ApplyBatch {
    pub upserts: Vec<InventoryRecord>,
    pub archive: Vec<String>,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ApplyCounts {
    pub upserted: u64,
    pub archived: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct RunPage {
    pub items: Vec<RunRecord>,
    pub total: u64,
    pub page: u32,
    pub per_page: u32,
    pub pages: u32,
}

/// Clamps pagination input and returns `(page, per_page, offset)`.
pub fn page_window(page: u32, per_page: u32) -> (u32, u32, u64) {
    let page = page.max(1);
    let per_page = per_page.clamp(1, MAX_PER_PAGE);
    (page, per_page, u64::from(page - 1) * u64::from(per_page))
}

pub fn page_count(total: u64, per_page: u32) -> u32 {
    total.div_ceil(u64::from(per_page.max(1))) as u32
}

#[async_trait]
pub trait InventoryStore: Send + Sync {
    /// Every record, archived ones included, read at one instant.
    async fn load_records(&self) -> Result<Vec<InventoryRecord>, StoreError>;

    async fn get_record(&self, identifier: &str) -> Result<Option<InventoryRecord>, StoreError>;

    /// Upserts and archives in one transaction. `first_seen` of existing records is preserved.
    async fn apply_batch(&self, batch: &ApplyBatch) -> Result<ApplyCounts, StoreError>;

    /// Inserts unless an entry with the same dedupe key exists.
    async fn insert_change_entry(&self, entry: &ChangeLogEntry) -> Result<AppendOutcome, StoreError>;

    /// Inserts unless the dedupe key exists or the latest point already carries this price.
    /// Rejects points older than the identifier's latest point.
    async fn append_price_point(&self, point: &PricePoint) -> Result<AppendOutcome, StoreError>;

    /// Ascending by time.
    async fn price_history(&self, identifier: &str) -> Result<Vec<PricePoint>, StoreError>;

    /// Newest first.
    async fn change_history(&self, identifier: &str) -> Result<Vec<ChangeLogEntry>, StoreError>;

    /// Inserts `run` with its lease renewed at `run.started_at`, unless another `running`
    /// run renewed its lease at or after `lease_cutoff`. The check and insert are one step.
    async fn create_run(&self, run: &RunRecord, lease_cutoff: DateTime<Utc>) -> Result<RunAdmission, StoreError>;

    /// Returns `false` once the run is no longer `running`.
    async fn renew_run_lease(&self, run_id: Uuid, at: DateTime<Utc>) -> Result<bool, StoreError>;

    /// Writes the terminal state. Returns `false` when the run was no longer `running`.
    async fn finish_run(&self, run: &RunRecord) -> Result<bool, StoreError>;

    async fn get_run(&self, run_id: Uuid) -> Result<Option<RunRecord>, StoreError>;

    async fn latest_run(&self) -> Result<Option<RunRecord>, StoreError>;

    /// Finished (completed or failed) runs, newest first.
    async fn list_finished_runs(&self, page: u32, per_page: u32) -> Result<RunPage, StoreError>;

    /// Fails every `running` run whose lease was last renewed before `lease_cutoff`.
    async fn fail_stale_runs(
        &self,
        note: &str,
        lease_cutoff: DateTime<Utc>,
        at: DateTime<Utc>,
    ) -> Result<u64, StoreError>;

    async fn load_monitor_config(&self) -> Result<MonitorConfig, StoreError>;

    /// Persists enabled / interval / pages, leaving last-check bookkeeping untouched.
    async fn save_monitor_settings(&self, config: &MonitorConfig) -> Result<(), StoreError>;

    async fn record_monitor_check(&self, at: DateTime<Utc>, outcome: &str) -> Result<(), StoreError>;
}

pub(crate) fn stale_run_failed(run: &mut RunRecord, note: &str, at: DateTime<Utc>) {
    run.status = invsync_core::RunStatus::Failed;
    run.finished_at = Some(at);
    run.errors.push(note.to_string());
    run.push_log(note);
}
