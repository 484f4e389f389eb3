use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::error::{AuditError, AuditResult};

/// Bounded hand-off between the submission path and the worker pool.
///
/// Every id sent is received by exactly one worker. All workers share one
/// receiver, so dequeue order is FIFO across the pool.
pub struct Dispatcher {
    tx: mpsc::Sender<Uuid>,
    rx: Arc<Mutex<mpsc::Receiver<Uuid>>>,
    capacity: usize,
}

/// A reserved queue slot. Dropping it without sending releases the slot.
pub struct DispatchSlot<'a> {
    permit: mpsc::Permit<'a, Uuid>,
}

impl DispatchSlot<'_> {
    pub fn send(self, job_id: Uuid) {
        self.permit.send(job_id);
    }
}

impl Dispatcher {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let (tx, rx) = mpsc::channel(capacity);
        Self {
            tx,
            rx: Arc::new(Mutex::new(rx)),
            capacity,
        }
    }

    /// Capacity for `workers` workers with `multiplier` queued jobs each.
    pub fn for_pool(workers: usize, multiplier: usize) -> Self {
        Self::new(workers.max(1).saturating_mul(multiplier.max(1)))
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Ids waiting in the queue, including reserved but unsent slots.
    pub fn depth(&self) -> usize {
        self.capacity.saturating_sub(self.tx.capacity())
    }

    /// Claim a slot without waiting. A full queue is reported as
    /// `SchedulerOverloaded` so the caller can retry later.
    pub fn reserve(&self) -> AuditResult<DispatchSlot<'_>> {
        match self.tx.try_reserve() {
            Ok(permit) => Ok(DispatchSlot { permit }),
            Err(mpsc::error::TrySendError::Full(())) => Err(AuditError::SchedulerOverloaded {
                capacity: self.capacity,
            }),
            Err(mpsc::error::TrySendError::Closed(())) => {
                Err(AuditError::Internal("dispatch queue is closed".into()))
            }
        }
    }

    /// Enqueue, waiting for room. Used when re-feeding persisted jobs.
    pub async fn enqueue(&self, job_id: Uuid) -> AuditResult<()> {
        self.tx
            .send(job_id)
            .await
            .map_err(|_| AuditError::Internal("dispatch queue is closed".into()))
    }

    /// Next job id, or `None` once `shutdown` fires.
    pub async fn next(&self, shutdown: &CancellationToken) -> Option<Uuid> {
        let mut rx = tokio::select! {
            _ = shutdown.cancelled() => return None,
            rx = self.rx.lock() => rx,
        };
        tokio::select! {
            _ = shutdown.cancelled() => None,
            id = rx.recv() => id,
        }
    }
}
