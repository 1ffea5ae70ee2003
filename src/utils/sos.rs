//! Stop signal: single-fire cooperative cancellation.
//!
//! A [`StopSignal`] is created per unit of background work (a relay loop, a
//! session's event task). Once fired it stays fired; work that needs to run
//! again must allocate a fresh signal.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::Notify;

/// Clones share state, so firing any clone releases every waiter.
#[derive(Debug, Clone, Default)]
pub struct StopSignal {
    inner: Arc<Shared>,
}

#[derive(Debug, Default)]
struct Shared {
    fired: AtomicBool,
    notify: Notify,
}

impl StopSignal {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fire the signal. Idempotent.
    pub fn fire(&self) {
        if !self.inner.fired.swap(true, Ordering::AcqRel) {
            self.inner.notify.notify_waiters();
        }
    }

    pub fn is_fired(&self) -> bool {
        self.inner.fired.load(Ordering::Acquire)
    }

    /// Resolve once the signal has fired. Returns immediately if it already has.
    pub async fn wait(&self) {
        let notified = self.inner.notify.notified();
        tokio::pin!(notified);
        // Register interest before checking the flag so a concurrent `fire`
        // cannot slip between the check and the await.
        notified.as_mut().enable();
        if self.is_fired() {
            return;
        }
        notified.await;
    }
}
