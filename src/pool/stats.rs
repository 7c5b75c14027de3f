//! Shared pool counters.

use std::sync::atomic::{AtomicUsize, Ordering};

use serde::Serialize;
use tokio::sync::Notify;

/// Lock-free counters updated by the dispatcher, handoffs and workers.
#[derive(Debug, Default)]
pub struct PoolStats {
    received: AtomicUsize,
    handed_off: AtomicUsize,
    completed: AtomicUsize,
    failed: AtomicUsize,
    dropped: AtomicUsize,
    ready: AtomicUsize,
    executing: AtomicUsize,
    peak_executing: AtomicUsize,
    finished: Notify,
}

/// Point-in-time copy of [`PoolStats`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct StatsSnapshot {
    /// Tasks taken off the intake queue.
    pub received: usize,
    /// Tasks delivered into a worker slot.
    pub handed_off: usize,
    pub completed: usize,
    pub failed: usize,
    /// Tasks that found no live worker.
    pub dropped: usize,
    /// Outstanding worker advertisements.
    pub ready: usize,
    /// Tasks currently inside a handler.
    pub executing: usize,
    pub peak_executing: usize,
}

impl StatsSnapshot {
    /// Every received task has reached a terminal outcome.
    pub fn settled(&self) -> bool {
        self.received == self.completed + self.failed + self.dropped
    }
}

impl PoolStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            received: self.received.load(Ordering::Acquire),
            handed_off: self.handed_off.load(Ordering::Acquire),
            completed: self.completed.load(Ordering::Acquire),
            failed: self.failed.load(Ordering::Acquire),
            dropped: self.dropped.load(Ordering::Acquire),
            ready: self.ready.load(Ordering::Acquire),
            executing: self.executing.load(Ordering::Acquire),
            peak_executing: self.peak_executing.load(Ordering::Acquire),
        }
    }

    pub(crate) fn record_received(&self) {
        self.received.fetch_add(1, Ordering::AcqRel);
    }

    pub(crate) fn record_handed_off(&self) {
        self.handed_off.fetch_add(1, Ordering::AcqRel);
    }

    pub(crate) fn record_dropped(&self) {
        self.dropped.fetch_add(1, Ordering::AcqRel);
    }

    /// Called before an advertisement is sent, so `ready` never underflows
    /// when a handoff consumes it first.
    pub(crate) fn advertise(&self) {
        self.ready.fetch_add(1, Ordering::AcqRel);
    }

    /// Undo or consume one advertisement.
    pub(crate) fn withdraw(&self) {
        self.ready.fetch_sub(1, Ordering::AcqRel);
    }

    pub(crate) fn begin_execution(&self) {
        let now = self.executing.fetch_add(1, Ordering::AcqRel) + 1;
        self.peak_executing.fetch_max(now, Ordering::AcqRel);
    }

    pub(crate) fn end_execution(&self, succeeded: bool) {
        if succeeded {
            self.completed.fetch_add(1, Ordering::AcqRel);
        } else {
            self.failed.fetch_add(1, Ordering::AcqRel);
        }
        self.executing.fetch_sub(1, Ordering::AcqRel);
        self.finished.notify_waiters();
    }

    /// Wait until every task handed to a worker has finished executing.
    pub(crate) async fn wait_idle(&self) {
        loop {
            let notified = self.finished.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let snap = self.snapshot();
            if snap.completed + snap.failed >= snap.handed_off {
                return;
            }
            notified.await;
        }
    }
}
