use invsync_storage::StoreError;
use thiserror::Error;
use uuid::Uuid;

/// The remote/local pairing cannot be compared.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum CompareError {
    #[error("remote snapshot is empty; refusing to reconcile against it")]
    EmptySnapshot,
    #[error("local snapshot holds identifier {identifier} more than once")]
    DuplicateLocal { identifier: String },
}

/// One failed audit write. Collected per run, never fatal.
#[derive(Debug, Error)]
#[error("ledger write for {identifier} ({what}) failed: {source}")]
pub struct LedgerWriteError {
    pub identifier: String,
    pub what: String,
    #[source]
    pub source: StoreError,
}

/// Rejected monitor configuration update.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("interval_minutes must be between {min} and {max}, got {value}")]
    IntervalOutOfRange { value: u32, min: u32, max: u32 },
    #[error("pages must be at most {max}, got {value}")]
    PagesOutOfRange { value: u32, max: u32 },
    #[error("update does not change any setting")]
    EmptyUpdate,
}

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("a sync run is already in progress ({run_id})")]
    RunInProgress { run_id: Uuid },
    #[error("comparison failed: {0}")]
    Compare(#[from] CompareError),
    #[error("applying changes failed: {0}")]
    Apply(#[source] StoreError),
    #[error("invalid monitor config: {0}")]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("run {0} not found")]
    RunNotFound(Uuid),
    #[error("no record with identifier {0}")]
    RecordNotFound(String),
    #[error("scheduler error: {0}")]
    Scheduler(String),
    #[error("no record source configured (set INVSYNC_SOURCE_URL or INVSYNC_FIXTURES_DIR)")]
    NoSource,
}

pub type SyncResult<T> = Result<T, SyncError>;
