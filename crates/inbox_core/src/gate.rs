use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Condvar, Mutex};

/// Counts in-flight store work so callers can wait for it to drain.
#[derive(Debug, Clone, Default)]
pub struct PendingGate {
    inner: Arc<GateInner>,
}

#[derive(Debug, Default)]
struct GateInner {
    pending: Mutex<usize>,
    idle: Condvar,
}

/// Held while a unit of work is in flight; leaving happens on drop.
#[derive(Debug)]
#[must_use = "the gate is left as soon as the guard is dropped"]
pub struct GateGuard {
    inner: Arc<GateInner>,
}

impl PendingGate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn enter(&self) -> GateGuard {
        *self.inner.pending.lock() += 1;
        GateGuard {
            inner: Arc::clone(&self.inner),
        }
    }

    pub fn pending(&self) -> usize {
        *self.inner.pending.lock()
    }

    /// Blocks until nothing is in flight. Returns `false` on timeout.
    pub fn wait_idle(&self, timeout: Duration) -> bool {
        let mut pending = self.inner.pending.lock();
        if *pending == 0 {
            return true;
        }
        let result = self
            .inner
            .idle
            .wait_while_for(&mut pending, |pending| *pending > 0, timeout);
        !result.timed_out()
    }
}

impl Drop for GateGuard {
    fn drop(&mut self) {
        let mut pending = self.inner.pending.lock();
        *pending = pending.saturating_sub(1);
        if *pending == 0 {
            self.inner.idle.notify_all();
        }
    }
}
