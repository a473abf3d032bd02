//! Paged collection of a remote snapshot.

use invsync_core::{PageScope, RawRecord};
use invsync_fetch::{fetch_with_retry, BackoffPolicy, FetchFailure, RecordFetcher};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

#[derive(Debug, Clone, Copy)]
pub struct SnapshotOptions {
    pub retry: BackoffPolicy,
    /// Hard stop for open-ended scopes.
    pub open_ended_page_cap: u32,
    /// Consecutive failed pages after which an open-ended scope gives up.
    pub open_ended_failure_limit: u32,
}

impl Default for SnapshotOptions {
    fn default() -> Self {
        Self {
            retry: BackoffPolicy::default(),
            open_ended_page_cap: 500,
            open_ended_failure_limit: 3,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    /// Every page in a bounded scope was attempted.
    ScopeExhausted,
    /// An empty page marked the end of the listing.
    EndOfListing { page: u32 },
    Cancelled { after_page: u32 },
    FailureLimit { page: u32 },
    PageCap { cap: u32 },
}

/// Emitted after each attempted page.
#[derive(Debug, Clone, Copy)]
pub struct PageTick {
    pub page: u32,
    pub pages_attempted: u32,
    pub records_so_far: usize,
    pub failed: bool,
}

#[derive(Debug)]
pub struct RemoteSnapshot {
    pub records: Vec<RawRecord>,
    pub page_failures: Vec<FetchFailure>,
    pub pages_attempted: u32,
    pub stop: StopReason,
}

impl RemoteSnapshot {
    pub fn cancelled(&self) -> bool {
        matches!(self.stop, StopReason::Cancelled { .. })
    }
}

/// Pulls pages `1..` for `scope`. Failed pages are recorded and skipped; cancellation is
/// only observed between pages.
pub async fn collect_snapshot<F>(
    fetcher: &dyn RecordFetcher,
    options: &SnapshotOptions,
    scope: PageScope,
    cancel: Option<&CancellationToken>,
    mut on_page: F,
) -> RemoteSnapshot
where
    F: FnMut(PageTick) + Send,
{
    let mut records = Vec::new();
    let mut page_failures = Vec::new();
    let mut consecutive_failures = 0u32;
    let mut page = 0u32;

    let stop = loop {
        if !scope.is_open_ended() && page >= scope.pages {
            break StopReason::ScopeExhausted;
        }
        if scope.is_open_ended() && page >= options.open_ended_page_cap {
            warn!(cap = options.open_ended_page_cap, "open-ended scope hit the page cap");
            break StopReason::PageCap {
                cap: options.open_ended_page_cap,
            };
        }
        if cancel.is_some_and(CancellationToken::is_cancelled) {
            info!(after_page = page, "cancellation observed between pages");
            break StopReason::Cancelled { after_page: page };
        }

        page += 1;
        let outcome = fetch_with_retry(fetcher, page, &options.retry).await;
        let failed = outcome.is_err();
        let mut end_of_listing = false;
        match outcome {
            Ok(batch) => {
                consecutive_failures = 0;
                end_of_listing = batch.is_empty();
                records.extend(batch);
            }
            Err(failure) => {
                warn!(page, attempts = failure.attempts, error = %failure.last, "page failed; skipping");
                consecutive_failures += 1;
                page_failures.push(failure);
            }
        }

        on_page(PageTick {
            page,
            pages_attempted: page,
            records_so_far: records.len(),
            failed,
        });

        if end_of_listing {
            break StopReason::EndOfListing { page };
        }
        if scope.is_open_ended() && consecutive_failures >= options.open_ended_failure_limit.max(1) {
            break StopReason::FailureLimit { page };
        }
    };

    RemoteSnapshot {
        records,
        page_failures,
        pages_attempted: page,
        stop,
    }
}
