use std::sync::atomic::{AtomicU64, Ordering};

use tokio::sync::Notify;

/// Counts completions towards a fixed target and wakes every waiter once the
/// target is reached. Scoped to one run; build a new one for the next.
#[derive(Debug)]
pub struct CountingBarrier {
    target: u64,
    count: AtomicU64,
    notify: Notify,
}

impl CountingBarrier {
    pub fn new(target: u64) -> Self {
        Self {
            target,
            count: AtomicU64::new(0),
            notify: Notify::new(),
        }
    }

    pub fn target(&self) -> u64 {
        self.target
    }

    /// Records one completion. Returns true for the arrival that reached the
    /// target.
    pub fn arrive(&self) -> bool {
        let count = self.count.fetch_add(1, Ordering::AcqRel) + 1;
        if count == self.target {
            self.notify.notify_waiters();
            true
        } else {
            false
        }
    }

    pub fn count(&self) -> u64 {
        self.count.load(Ordering::Acquire)
    }

    pub fn is_done(&self) -> bool {
        self.count() >= self.target
    }

    /// Resolves once the target has been reached.
    pub async fn wait(&self) {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            // register before checking so an arrival in between is not lost
            notified.as_mut().enable();
            if self.is_done() {
                return;
            }
            notified.await;
        }
    }
}
