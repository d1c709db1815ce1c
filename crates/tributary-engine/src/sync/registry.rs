//! In-flight run bookkeeping
//!
//! Runs of one source are chained: each admitted run waits for the run admitted
//! before it to finish, so at most one run per source merges at a time and they
//! start in admission order. Across sources a global semaphore caps concurrency.
//! The registry also owns each source's shared rate limiter and the cancellation
//! token of every in-flight run.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::{watch, OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::debug;
use uuid::Uuid;

use crate::error::{IntegrationError, Result};
use crate::models::RateLimits;
use crate::rate_limit::RateLimiter;

struct RunHandle {
    source_id: Uuid,
    cancel: CancellationToken,
    done: watch::Receiver<bool>,
}

#[derive(Default)]
struct SourceSlot {
    /// Completion signal of the most recently admitted run
    tail: Option<watch::Receiver<bool>>,
    limiter: Option<Arc<RateLimiter>>,
    editing: bool,
}

#[derive(Default)]
struct Inner {
    sources: HashMap<Uuid, SourceSlot>,
    runs: HashMap<Uuid, RunHandle>,
}

impl Inner {
    fn active_runs(&self, source_id: Uuid) -> impl Iterator<Item = (&Uuid, &RunHandle)> {
        self.runs.iter().filter(move |(_, run)| run.source_id == source_id)
    }
}

pub struct SyncRegistry {
    inner: Mutex<Inner>,
    permits: Arc<Semaphore>,
}

/// Resolves once the run behind `done` has finished or its sender is gone
async fn finished(mut done: watch::Receiver<bool>) {
    let _ = done.wait_for(|done| *done).await.map(|_| ());
}

/// A run's place in its source's queue
pub struct Admission {
    pub sync_id: Uuid,
    pub source_id: Uuid,
    pub cancel: CancellationToken,
    predecessor: Option<watch::Receiver<bool>>,
    done: watch::Sender<bool>,
}

/// Held while a run executes; the global permit is released on drop
pub struct RunSlot {
    _permit: OwnedSemaphorePermit,
}

impl Admission {
    /// Wait for the previous run of the source, then for a global permit
    ///
    /// Returns `None` when the run is cancelled while waiting.
    pub async fn wait_turn(&mut self, permits: Arc<Semaphore>) -> Option<RunSlot> {
        if let Some(predecessor) = self.predecessor.take() {
            tokio::select! {
                _ = self.cancel.cancelled() => return None,
                _ = finished(predecessor) => {}
            }
        }
        tokio::select! {
            _ = self.cancel.cancelled() => None,
            permit = permits.acquire_owned() => permit.ok().map(|p| RunSlot { _permit: p }),
        }
    }

    /// Signal the next queued run of the source
    pub fn finish(&self) {
        self.done.send_replace(true);
    }
}

impl Drop for Admission {
    fn drop(&mut self) {
        self.done.send_replace(true);
    }
}

/// Blocks admissions for a source while its configuration is being changed
pub struct EditGuard {
    registry: Arc<SyncRegistry>,
    source_id: Uuid,
}

impl Drop for EditGuard {
    fn drop(&mut self) {
        if let Some(slot) = self.registry.lock().sources.get_mut(&self.source_id) {
            slot.editing = false;
        }
    }
}

impl SyncRegistry {
    pub fn new(max_concurrent_syncs: usize) -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            permits: Arc::new(Semaphore::new(max_concurrent_syncs.max(1))),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn permits(&self) -> Arc<Semaphore> {
        self.permits.clone()
    }

    pub fn available_permits(&self) -> usize {
        self.permits.available_permits()
    }

    /// Queue a run for `source_id`
    ///
    /// Without `force` a source with a queued or running sync rejects the run with
    /// [`IntegrationError::AlreadyRunning`].
    pub fn admit(&self, source_id: Uuid, sync_id: Uuid, force: bool) -> Result<Admission> {
        let mut inner = self.lock();
        if inner.sources.get(&source_id).is_some_and(|s| s.editing) {
            return Err(IntegrationError::SourceBusy(source_id));
        }
        if !force && inner.active_runs(source_id).next().is_some() {
            return Err(IntegrationError::AlreadyRunning(source_id));
        }

        let (done, receiver) = watch::channel(false);
        let cancel = CancellationToken::new();
        let slot = inner.sources.entry(source_id).or_default();
        let predecessor = slot.tail.replace(receiver.clone());
        inner.runs.insert(
            sync_id,
            RunHandle {
                source_id,
                cancel: cancel.clone(),
                done: receiver,
            },
        );
        debug!(%source_id, %sync_id, queued_behind = predecessor.is_some(), "sync admitted");

        Ok(Admission {
            sync_id,
            source_id,
            cancel,
            predecessor,
            done,
        })
    }

    /// Forget a finished run
    pub fn release(&self, sync_id: Uuid) {
        self.lock().runs.remove(&sync_id);
    }

    pub fn is_busy(&self, source_id: Uuid) -> bool {
        self.lock().active_runs(source_id).next().is_some()
    }

    pub fn is_tracked(&self, sync_id: Uuid) -> bool {
        self.lock().runs.contains_key(&sync_id)
    }

    pub fn active_runs(&self, source_id: Uuid) -> Vec<Uuid> {
        self.lock().active_runs(source_id).map(|(id, _)| *id).collect()
    }

    /// Request cancellation; `false` when the run is not in flight
    pub fn cancel(&self, sync_id: Uuid) -> bool {
        match self.lock().runs.get(&sync_id) {
            Some(run) => {
                run.cancel.cancel();
                true
            }
            None => false,
        }
    }

    /// Wait until `sync_id` is no longer in flight
    pub async fn wait_for(&self, sync_id: Uuid) {
        let receiver = self.lock().runs.get(&sync_id).map(|run| run.done.clone());
        if let Some(done) = receiver {
            finished(done).await;
        }
    }

    /// Mark the source as being edited; fails while any run is in flight
    pub fn begin_edit(self: &Arc<Self>, source_id: Uuid) -> Result<EditGuard> {
        let mut inner = self.lock();
        if inner.active_runs(source_id).next().is_some() {
            return Err(IntegrationError::SourceBusy(source_id));
        }
        let slot = inner.sources.entry(source_id).or_default();
        if slot.editing {
            return Err(IntegrationError::SourceBusy(source_id));
        }
        slot.editing = true;
        Ok(EditGuard {
            registry: self.clone(),
            source_id,
        })
    }

    /// Shared limiter for a source, rebuilt when its limits change
    pub fn limiter(&self, source_id: Uuid, limits: RateLimits) -> Arc<RateLimiter> {
        let mut inner = self.lock();
        let slot = inner.sources.entry(source_id).or_default();
        match &slot.limiter {
            Some(limiter) if *limiter.limits() == limits => limiter.clone(),
            _ => {
                let limiter = Arc::new(RateLimiter::new(limits));
                slot.limiter = Some(limiter.clone());
                limiter
            }
        }
    }

    pub fn forget_source(&self, source_id: Uuid) {
        self.lock().sources.remove(&source_id);
    }
}
