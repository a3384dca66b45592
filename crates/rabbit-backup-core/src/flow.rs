//! In-flight message accounting between a producer and a publisher.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::Notify;
use tracing::warn;

/// Count of messages handed to a publisher but not yet confirmed.
///
/// The producer calls [`begin`] before queueing a message, the publisher
/// calls [`complete`] once the broker confirmed it. [`wait_idle`] resolves
/// when every queued message has been confirmed. Clones share the count.
///
/// [`begin`]: InFlight::begin
/// [`complete`]: InFlight::complete
/// [`wait_idle`]: InFlight::wait_idle
#[derive(Debug, Clone, Default)]
pub struct InFlight {
    inner: Arc<Inner>,
}

#[derive(Debug, Default)]
struct Inner {
    count: AtomicUsize,
    idle: Notify,
}

impl InFlight {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register one message about to be queued
    pub fn begin(&self) {
        self.inner.count.fetch_add(1, Ordering::AcqRel);
    }

    /// Mark one message as done
    pub fn complete(&self) {
        let previous = self
            .inner
            .count
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1));

        match previous {
            Ok(1) => self.inner.idle.notify_waiters(),
            Ok(_) => {}
            Err(_) => warn!("In-flight counter completed more messages than were started"),
        }
    }

    /// Messages not yet completed
    pub fn pending(&self) -> usize {
        self.inner.count.load(Ordering::Acquire)
    }

    /// Wait until no message is in flight
    pub async fn wait_idle(&self) {
        loop {
            let notified = self.inner.idle.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if self.pending() == 0 {
                return;
            }
            notified.await;
        }
    }
}
