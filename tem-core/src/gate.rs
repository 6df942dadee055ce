//! FIFO counting semaphore bounding in-flight task executions.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use tokio::sync::{OwnedSemaphorePermit, Semaphore};

/// Wraps `tokio::sync::Semaphore`, which already grants permits in the
/// order they were requested — the same primitive `reqactor::Actor` reaches
/// for rather than a hand-rolled waiter queue.
#[derive(Debug, Clone)]
pub struct ConcurrencyGate {
    semaphore: Arc<Semaphore>,
    running: Arc<AtomicUsize>,
}

impl ConcurrencyGate {
    pub fn new(max_concurrency: usize) -> Self {
        Self {
            semaphore: Arc::new(Semaphore::new(max_concurrency)),
            running: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Suspends until a slot is free, then holds it until the returned
    /// guard is dropped.
    pub async fn acquire(&self) -> GateGuard {
        let permit = self
            .semaphore
            .clone()
            .acquire_owned()
            .await
            .expect("ConcurrencyGate semaphore is never closed");
        self.running.fetch_add(1, Ordering::SeqCst);
        GateGuard {
            _permit: permit,
            running: self.running.clone(),
        }
    }

    /// Current number of outstanding acquisitions.
    pub fn running(&self) -> usize {
        self.running.load(Ordering::SeqCst)
    }

    /// Suspends until every one of `capacity` permits is back in the
    /// semaphore, i.e. until every acquisition in flight when this was
    /// called has released its slot. Used by the worker engine's `stop()`
    /// to await in-flight executions without a separate join-handle
    /// bookkeeping structure, since the gate already tracks exactly that.
    pub async fn drain(&self, capacity: usize) {
        let _permits = self
            .semaphore
            .clone()
            .acquire_many_owned(capacity as u32)
            .await
            .expect("ConcurrencyGate semaphore is never closed");
    }
}

/// Releases its slot back to the gate on drop.
#[derive(Debug)]
pub struct GateGuard {
    _permit: OwnedSemaphorePermit,
    running: Arc<AtomicUsize>,
}

impl Drop for GateGuard {
    fn drop(&mut self) {
        self.running.fetch_sub(1, Ordering::SeqCst);
    }
}
