use std::{
    sync::atomic::{AtomicU64, Ordering},
    time::Duration,
};

/// A duration that can be tuned at runtime from another task.
///
/// Stored as whole microseconds, the granularity every timeout in this crate
/// is specified at. Durations beyond `u64::MAX` microseconds saturate.
pub(crate) struct AtomicDuration(AtomicU64);

impl AtomicDuration {
    pub(crate) fn new(duration: Duration) -> Self {
        Self(AtomicU64::new(Self::to_micros(duration)))
    }

    pub(crate) fn store(&self, duration: Duration, order: Ordering) {
        self.0.store(Self::to_micros(duration), order);
    }

    pub(crate) fn load(&self, order: Ordering) -> Duration {
        Duration::from_micros(self.0.load(order))
    }

    fn to_micros(duration: Duration) -> u64 {
        u64::try_from(duration.as_micros()).unwrap_or(u64::MAX)
    }
}
