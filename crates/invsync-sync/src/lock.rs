//! The single "a run is active" resource.

use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::error::SyncError;

#[derive(Debug)]
struct ActiveRun {
    run_id: Uuid,
    cancel: CancellationToken,
}

/// Admits at most one run at a time. Rejects rather than queues.
#[derive(Debug)]
pub struct RunLock {
    permits: Arc<Semaphore>,
    active: Mutex<Option<ActiveRun>>,
}

/// Held for the full duration of a run; dropping it releases the lock on every exit path,
/// unwinding included.
#[derive(Debug)]
pub struct RunGuard {
    lock: Arc<RunLock>,
    run_id: Uuid,
    permit: Option<OwnedSemaphorePermit>,
}

impl Drop for RunGuard {
    fn drop(&mut self) {
        // Slot and permit change together under the slot mutex, so `try_acquire` never sees
        // a held permit with an empty slot.
        let mut active = self.lock.slot();
        if active.as_ref().is_some_and(|a| a.run_id == self.run_id) {
            *active = None;
        }
        drop(self.permit.take());
    }
}

impl RunLock {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            permits: Arc::new(Semaphore::new(1)),
            active: Mutex::new(None),
        })
    }

    fn slot(&self) -> MutexGuard<'_, Option<ActiveRun>> {
        self.active.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn try_acquire(self: &Arc<Self>, run_id: Uuid) -> Result<(RunGuard, CancellationToken), SyncError> {
        let mut active = self.slot();
        let permit = match Arc::clone(&self.permits).try_acquire_owned() {
            Ok(permit) => permit,
            Err(_) => {
                return Err(SyncError::RunInProgress {
                    run_id: active.as_ref().map(|a| a.run_id).unwrap_or_default(),
                })
            }
        };
        let cancel = CancellationToken::new();
        *active = Some(ActiveRun {
            run_id,
            cancel: cancel.clone(),
        });
        Ok((
            RunGuard {
                lock: Arc::clone(self),
                run_id,
                permit: Some(permit),
            },
            cancel,
        ))
    }

    pub fn active_run(&self) -> Option<Uuid> {
        self.slot().as_ref().map(|a| a.run_id)
    }

    pub fn is_held(&self) -> bool {
        self.permits.available_permits() == 0
    }

    /// Requests cooperative cancellation of `run_id`. `false` when that run is not active.
    pub fn cancel(&self, run_id: Uuid) -> bool {
        match self.slot().as_ref() {
            Some(active) if active.run_id == run_id => {
                active.cancel.cancel();
                true
            }
            _ => false,
        }
    }
}
