//! Bounded admission gate for live sandboxes.
//!
//! The pool never holds references to the sandboxes themselves; it hands
//! out capacity tokens. A [`SandboxPermit`] travels inside the handle
//! that consumed it and releases the slot when the handle is dropped, so
//! slot accounting cannot drift from sandbox lifetime and nothing here
//! can form a reference cycle with the handles.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::debug;

use crate::error::EngineError;

#[derive(Clone)]
pub(crate) struct SandboxPool {
    slots: Arc<Semaphore>,
    capacity: usize,
}

/// One occupied slot. Dropping it frees the slot.
pub(crate) struct SandboxPermit {
    _permit: OwnedSemaphorePermit,
}

impl SandboxPool {
    pub fn new(capacity: usize) -> Self {
        Self {
            slots: Arc::new(Semaphore::new(capacity)),
            capacity,
        }
    }

    /// Fail-fast admission: waits at most `window` for a free slot, then
    /// reports exhaustion instead of queueing indefinitely. Waiters are
    /// served in FIFO order within the window.
    pub async fn admit(&self, window: Duration) -> Result<SandboxPermit, EngineError> {
        let acquired = tokio::time::timeout(window, Arc::clone(&self.slots).acquire_owned())
            .await
            .map_err(|_| EngineError::ResourceExhausted)?;
        // The semaphore is never closed, but mapping the error beats
        // unwrapping in a path hostile input can reach.
        let permit = acquired.map_err(|_| EngineError::ResourceExhausted)?;
        debug!(active = self.active(), capacity = self.capacity, "sandbox slot admitted");
        Ok(SandboxPermit { _permit: permit })
    }

    /// Number of currently occupied slots.
    pub fn active(&self) -> usize {
        self.capacity - self.slots.available_permits()
    }
}
