pub(crate) mod event;
pub(crate) mod time;

pub(crate) use event::{Notifier, Waiter};
pub(crate) use time::AtomicDuration;
