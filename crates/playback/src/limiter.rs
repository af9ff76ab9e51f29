//! Shared limiter capping concurrent hardware-offload sessions.
//!
//! Injected into each orchestrator at construction so tests can instantiate
//! independent limiters per case instead of sharing process-wide state.

use std::sync::Arc;

use parking_lot::Mutex;
use tracing::debug;

/// Counting limiter for a shared hardware resource.
pub struct ResourceLimiter {
    max_sessions: usize,
    active: Mutex<usize>,
}

impl ResourceLimiter {
    pub fn new(max_sessions: usize) -> Arc<Self> {
        Arc::new(Self {
            max_sessions,
            active: Mutex::new(0),
        })
    }

    /// Claim a slot, or `None` when the cap is reached.
    pub fn try_acquire(self: &Arc<Self>) -> Option<ResourcePermit> {
        let mut active = self.active.lock();
        if *active >= self.max_sessions {
            debug!(active = *active, "offload limiter exhausted");
            return None;
        }
        *active += 1;
        Some(ResourcePermit {
            limiter: Arc::clone(self),
        })
    }

    pub fn active(&self) -> usize {
        *self.active.lock()
    }
}

/// RAII permit; releases its slot on drop.
pub struct ResourcePermit {
    limiter: Arc<ResourceLimiter>,
}

impl Drop for ResourcePermit {
    fn drop(&mut self) {
        *self.limiter.active.lock() -= 1;
    }
}
