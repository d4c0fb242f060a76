//! Concurrency gate.
//!
//! A process-wide counted semaphore bounds in-flight jobs; waiters are
//! served in FIFO order and acquisition is cancellation-aware. The gate
//! also tracks live job cancellation handles so server shutdown can
//! broadcast cancellation and wait, bounded by a deadline, for jobs to
//! finish their cleanup.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::sync::{Notify, OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::EngineError;

#[derive(Debug, Clone)]
pub struct ConcurrencyGate {
    inner: Arc<GateInner>,
}

#[derive(Debug)]
struct GateInner {
    semaphore: Arc<Semaphore>,
    jobs: Mutex<HashMap<Uuid, CancellationToken>>,
    drained: Notify,
}

/// A held job slot. Dropping it releases the semaphore and deregisters the
/// job.
#[derive(Debug)]
pub struct GateSlot {
    inner: Arc<GateInner>,
    job_id: Uuid,
    _permit: OwnedSemaphorePermit,
}

impl ConcurrencyGate {
    pub fn new(max_concurrent_jobs: usize) -> Self {
        Self {
            inner: Arc::new(GateInner {
                semaphore: Arc::new(Semaphore::new(max_concurrent_jobs)),
                jobs: Mutex::new(HashMap::new()),
                drained: Notify::new(),
            }),
        }
    }

    /// Wait for a slot, FIFO among waiters.
    ///
    /// Returns [`EngineError::Cancelled`] if the job's token fires first;
    /// the job then exits its wait without ever holding a slot.
    pub async fn acquire(
        &self,
        job_id: Uuid,
        cancel: &CancellationToken,
    ) -> Result<GateSlot, EngineError> {
        let permit = tokio::select! {
            permit = self.inner.semaphore.clone().acquire_owned() => {
                permit.map_err(|_| EngineError::Internal("concurrency gate closed".into()))?
            }
            _ = cancel.cancelled() => return Err(EngineError::Cancelled),
        };

        self.inner
            .jobs
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(job_id, cancel.clone());

        debug!(%job_id, "acquired job slot");
        Ok(GateSlot {
            inner: self.inner.clone(),
            job_id,
            _permit: permit,
        })
    }

    /// Slots currently free.
    pub fn available(&self) -> usize {
        self.inner.semaphore.available_permits()
    }

    /// Jobs currently holding a slot.
    pub fn in_flight(&self) -> usize {
        self.inner
            .jobs
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Cancel a specific live job. Returns false if it is not in flight.
    pub fn cancel_job(&self, job_id: Uuid) -> bool {
        let jobs = self
            .inner
            .jobs
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        match jobs.get(&job_id) {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    /// Broadcast cancellation to every live job and wait for them to
    /// release their slots, up to `deadline`.
    pub async fn shutdown(&self, deadline: Duration) {
        let tokens: Vec<CancellationToken> = self
            .inner
            .jobs
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect();

        debug!(count = tokens.len(), "broadcasting shutdown to live jobs");
        for token in &tokens {
            token.cancel();
        }

        let drained = async {
            loop {
                let notified = self.inner.drained.notified();
                if self.in_flight() == 0 {
                    break;
                }
                notified.await;
            }
        };

        if tokio::time::timeout(deadline, drained).await.is_err() {
            warn!(
                remaining = self.in_flight(),
                "shutdown deadline elapsed with jobs still live"
            );
        }
    }
}

impl Drop for GateSlot {
    fn drop(&mut self) {
        self.inner
            .jobs
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.job_id);
        self.inner.drained.notify_waiters();
        debug!(job_id = %self.job_id, "released job slot");
    }
}
