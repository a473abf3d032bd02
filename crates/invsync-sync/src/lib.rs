//! Inventory synchronization and change-tracking engine.

use std::sync::Arc;

use anyhow::{Context, Result};
use invsync_core::{PageScope, RunRecord, RunTrigger};
use invsync_fetch::UnconfiguredFetcher;
use invsync_storage::SqliteStore;

pub mod compare;
pub mod config;
pub mod error;
pub mod ledger;
pub mod lock;
pub mod monitor;
pub mod orchestrator;
pub mod service;
pub mod snapshot;

pub use compare::{compare, ChangedRecord, DiffResult, FieldChange, NewRecord};
pub use config::SyncConfig;
pub use error::{CompareError, ConfigError, LedgerWriteError, SyncError, SyncResult};
pub use ledger::{ChangeLedger, LedgerContext, LedgerReport};
pub use lock::{RunGuard, RunLock};
pub use monitor::{check_drift, DriftReport, MonitorConfigUpdate, MonitorScheduler, MonitorSettings, TickOutcome};
pub use orchestrator::{Orchestrator, RunPhase, RunProgress, DEFAULT_RUN_LEASE};
pub use service::{RecordHistory, RunStatusView, SyncService};
pub use snapshot::{collect_snapshot, RemoteSnapshot, SnapshotOptions, StopReason};

pub const CRATE_NAME: &str = "invsync-sync";

/// Opens the configured store, fails runs whose lease expired and wires the configured source.
pub async fn service_from_config(config: &SyncConfig) -> Result<SyncService> {
    let store = SqliteStore::connect(&config.database_url)
        .await
        .with_context(|| format!("opening store at {}", config.database_url))?;
    let fetcher = config.build_fetcher()?;
    let orchestrator = Orchestrator::new(Arc::new(store), fetcher, config.snapshot_options())
        .with_run_lease(config.run_lease());
    let service = SyncService::with_orchestrator(orchestrator, config.monitor_settings());
    service.recover().await.context("recovering stale runs")?;
    Ok(service)
}

/// A service for inspecting the store. Writes nothing at startup and tolerates a missing
/// record source.
pub async fn read_only_service(config: &SyncConfig) -> Result<SyncService> {
    let store = SqliteStore::connect(&config.database_url)
        .await
        .with_context(|| format!("opening store at {}", config.database_url))?;
    let fetcher = match config.build_fetcher() {
        Ok(fetcher) => fetcher,
        Err(_) => Arc::new(UnconfiguredFetcher),
    };
    Ok(SyncService::new(
        Arc::new(store),
        fetcher,
        config.snapshot_options(),
        config.monitor_settings(),
    ))
}

/// One full pass on the current task, configured from the environment.
pub async fn run_sync_once_from_env(scope: PageScope) -> Result<RunRecord> {
    let config = SyncConfig::load()?;
    let service = service_from_config(&config).await?;
    let run = service
        .orchestrator()
        .run(scope, RunTrigger::Manual)
        .await
        .context("running sync")?;
    Ok(run)
}
