//! Link observability counters.
//!
//! The data path favors availability over completeness: frame-level and
//! queue-level failures are absorbed internally and only surface here.

use std::sync::atomic::{AtomicU32, Ordering};

#[derive(Default)]
pub(crate) struct LinkStats {
    pub(crate) data_rx: AtomicU32,
    pub(crate) reg_rx: AtomicU32,
    pub(crate) timeouts: AtomicU32,
    pub(crate) errors: AtomicU32,
    pub(crate) unexpected: AtomicU32,
    pub(crate) queue_drops: AtomicU32,
    pub(crate) ring_drops: AtomicU32,
    pub(crate) file_records: AtomicU32,
}

impl LinkStats {
    pub(crate) fn bump(counter: &AtomicU32) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn snapshot(&self) -> LinkStatsSnapshot {
        LinkStatsSnapshot {
            data_rx: self.data_rx.load(Ordering::Relaxed),
            reg_rx: self.reg_rx.load(Ordering::Relaxed),
            timeouts: self.timeouts.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
            unexpected: self.unexpected.load(Ordering::Relaxed),
            queue_drops: self.queue_drops.load(Ordering::Relaxed),
            ring_drops: self.ring_drops.load(Ordering::Relaxed),
            file_records: self.file_records.load(Ordering::Relaxed),
        }
    }

    pub(crate) fn clear(&self) {
        self.data_rx.store(0, Ordering::Relaxed);
        self.reg_rx.store(0, Ordering::Relaxed);
        self.timeouts.store(0, Ordering::Relaxed);
        self.errors.store(0, Ordering::Relaxed);
        self.unexpected.store(0, Ordering::Relaxed);
        self.queue_drops.store(0, Ordering::Relaxed);
        self.ring_drops.store(0, Ordering::Relaxed);
        self.file_records.store(0, Ordering::Relaxed);
    }
}

/// Point-in-time snapshot of a link's counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[non_exhaustive]
pub struct LinkStatsSnapshot {
    /// Data records delivered to the data task.
    pub data_rx: u32,
    /// Register responses that completed a transaction.
    pub reg_rx: u32,
    /// Transaction attempts that hit the response timeout.
    pub timeouts: u32,
    /// Transport and malformed-frame errors absorbed by the pump.
    pub errors: u32,
    /// Register-class frames that matched no outstanding transaction.
    pub unexpected: u32,
    /// Data records dropped on a full inbound queue.
    pub queue_drops: u32,
    /// Records the shared ring refused (oversized payloads).
    pub ring_drops: u32,
    /// Records appended to the file sink.
    pub file_records: u32,
}
