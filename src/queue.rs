//! Fixed-capacity queue between pipeline stages.
//!
//! Carries opaque payload handles on both the outbound transmit path and
//! the inbound bulk-data path. Push and pop block up to a caller-supplied
//! timeout; the non-blocking push used by the receive task drops on a full
//! queue and counts the loss instead of applying backpressure.

use std::{
    collections::VecDeque,
    sync::{
        Mutex,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use event_listener::{Event, IntoNotification};

pub(crate) struct BoundedQueue<T> {
    inner: Mutex<VecDeque<T>>,
    capacity: usize,
    /// Signaled when an element is pushed.
    filled: Event,
    /// Signaled when an element is popped.
    drained: Event,
    /// Records every element refused by `try_push`.
    dropped: AtomicU64,
}

impl<T> BoundedQueue<T> {
    pub(crate) fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity: capacity.max(1),
            filled: Event::new(),
            drained: Event::new(),
            dropped: AtomicU64::new(0),
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.inner.lock().expect("queue lock").len()
    }

    /// Elements refused by `try_push` since construction.
    pub(crate) fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Non-blocking push. A full queue refuses the element, hands it back
    /// and counts the drop.
    pub(crate) fn try_push(&self, item: T) -> Result<(), T> {
        let mut q = self.inner.lock().expect("queue lock");
        if q.len() >= self.capacity {
            drop(q);
            self.dropped.fetch_add(1, Ordering::Relaxed);
            return Err(item);
        }
        q.push_back(item);
        drop(q);
        self.filled.notify(1.additional());
        Ok(())
    }

    /// Blocking push bounded by `timeout`. Returns the element when no slot
    /// frees up in time; the timeout is not counted as a drop.
    pub(crate) async fn push(&self, item: T, timeout: Duration) -> Result<(), T> {
        // The element parks in this slot so a timed-out future hands it
        // back instead of losing it.
        let mut slot = Some(item);
        let outcome = tokio::time::timeout(timeout, async {
            loop {
                {
                    let mut q = self.inner.lock().expect("queue lock");
                    if q.len() < self.capacity {
                        if let Some(item) = slot.take() {
                            q.push_back(item);
                        }
                        drop(q);
                        self.filled.notify(1.additional());
                        return;
                    }
                }

                let listener = self.drained.listen();
                // Re-check: a pop may have landed before we subscribed.
                let has_room =
                    { self.inner.lock().expect("queue lock").len() < self.capacity };
                if has_room {
                    continue;
                }
                listener.await;
            }
        })
        .await;

        match outcome {
            Ok(()) => Ok(()),
            Err(_) => match slot.take() {
                Some(item) => Err(item),
                // The push landed right at the deadline.
                None => Ok(()),
            },
        }
    }

    pub(crate) fn try_pop(&self) -> Option<T> {
        let item = self.inner.lock().expect("queue lock").pop_front();
        if item.is_some() {
            self.drained.notify(1.additional());
        }
        item
    }

    /// Blocking pop bounded by `timeout`. `None` when the queue stays empty.
    pub(crate) async fn pop(&self, timeout: Duration) -> Option<T> {
        tokio::time::timeout(timeout, async {
            loop {
                if let Some(item) = self.try_pop() {
                    return item;
                }

                let listener = self.filled.listen();
                if let Some(item) = self.try_pop() {
                    return item;
                }
                listener.await;
            }
        })
        .await
        .ok()
    }
}
