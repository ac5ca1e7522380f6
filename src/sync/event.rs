use std::{
    fmt,
    sync::{
        Arc,
        atomic::{AtomicU8, Ordering},
    },
};

use event_listener::{Event, IntoNotification};

/// Error returned when a wait fails because the notifying side has been
/// dropped (e.g. the pump task that would have completed the transaction is
/// gone).
pub struct WaitError;

impl fmt::Display for WaitError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("notifier dropped before signaling")
    }
}

impl fmt::Debug for WaitError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{self}")
    }
}

impl std::error::Error for WaitError {}

/// Error returned when a notify fails because the waiting side has been
/// dropped (e.g. the caller abandoned the transaction).
pub struct NotifyError;

impl fmt::Display for NotifyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("waiter dropped before signal was observed")
    }
}

impl fmt::Debug for NotifyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{self}")
    }
}

impl std::error::Error for NotifyError {}

// Signal states. SIGNALED latches a pending notification, CLOSED latches
// the loss of either endpoint and wins over SIGNALED.
const IDLE: u8 = 0;
const SIGNALED: u8 = 1;
const CLOSED: u8 = 2;

struct Shared {
    event: Event,
    state: AtomicU8,
}

impl Shared {
    /// Consumes a pending signal if one is latched.
    fn take(&self) -> u8 {
        match self
            .state
            .compare_exchange(SIGNALED, IDLE, Ordering::AcqRel, Ordering::Acquire)
        {
            Ok(_) => SIGNALED,
            Err(other) => other,
        }
    }

    fn close(&self) {
        self.state.store(CLOSED, Ordering::Release);
        self.event.notify(usize::MAX);
    }
}

/// Creates a connected notify/wait pair.
///
/// The pair is single-shot in spirit (one outstanding transaction completes
/// once) but a latched signal survives until observed, so notify-then-wait
/// ordering is safe.
pub(crate) fn new() -> (Notifier, Waiter) {
    let shared = Arc::new(Shared {
        event: Event::new(),
        state: AtomicU8::new(IDLE),
    });
    (Notifier(shared.clone()), Waiter(shared))
}

#[repr(transparent)]
pub(crate) struct Notifier(Arc<Shared>);

impl Notifier {
    pub(crate) fn notify(&self) -> Result<(), NotifyError> {
        match self
            .0
            .state
            .compare_exchange(IDLE, SIGNALED, Ordering::AcqRel, Ordering::Acquire)
        {
            Ok(_) | Err(SIGNALED) => {
                self.0.event.notify(1.additional().relaxed());
                Ok(())
            }
            Err(_) => Err(NotifyError),
        }
    }
}

impl Drop for Notifier {
    fn drop(&mut self) {
        self.0.close();
    }
}

#[repr(transparent)]
pub(crate) struct Waiter(Arc<Shared>);

impl Waiter {
    /// Waits until the notifier fires. Callers bound this with
    /// `tokio::time::timeout`; the primitive itself never times out.
    pub(crate) async fn wait(&self) -> Result<(), WaitError> {
        loop {
            match self.0.take() {
                SIGNALED => return Ok(()),
                CLOSED => return Err(WaitError),
                _ => {}
            }

            let listener = self.0.event.listen();

            // Re-check: the signal may have landed between take() and listen().
            match self.0.take() {
                SIGNALED => return Ok(()),
                CLOSED => return Err(WaitError),
                _ => {}
            }

            listener.await;
        }
    }
}

impl Drop for Waiter {
    fn drop(&mut self) {
        self.0.close();
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::time::timeout;

    use super::*;

    #[tokio::test]
    async fn notify_then_wait_is_latched() {
        let (notifier, waiter) = new();

        notifier.notify().unwrap();

        let res = timeout(Duration::from_millis(100), waiter.wait()).await;
        assert!(res.unwrap().is_ok());
    }

    #[tokio::test]
    async fn wait_then_notify() {
        let (notifier, waiter) = new();

        let task = tokio::spawn(async move { waiter.wait().await });

        tokio::time::sleep(Duration::from_millis(10)).await;
        notifier.notify().unwrap();

        assert!(task.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn dropped_notifier_errors_waiter() {
        let (notifier, waiter) = new();

        let task = tokio::spawn(async move { waiter.wait().await });

        tokio::time::sleep(Duration::from_millis(10)).await;
        drop(notifier);

        assert!(task.await.unwrap().is_err());
    }

    #[tokio::test]
    async fn dropped_waiter_errors_notifier() {
        let (notifier, waiter) = new();

        drop(waiter);

        assert!(notifier.notify().is_err());
    }

    #[tokio::test]
    async fn unsignaled_wait_times_out() {
        let (_notifier, waiter) = new();

        let res = timeout(Duration::from_millis(50), waiter.wait()).await;
        assert!(res.is_err());
    }
}
