//! Delayed re-submission of failed jobs.

use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Sends an item into a channel after a delay.
///
/// Each scheduled item gets its own task that sleeps and then sends. Pending
/// timers are dropped when the owning token is canceled.
#[derive(Debug, Clone)]
pub struct DelayScheduler {
    cancel: CancellationToken,
}

impl DelayScheduler {
    #[must_use]
    pub const fn new(cancel: CancellationToken) -> Self {
        Self { cancel }
    }

    /// Send `item` on `tx` once `delay` has elapsed.
    pub fn schedule<T: Send + 'static>(
        &self,
        delay: Duration,
        tx: mpsc::UnboundedSender<T>,
        item: T,
    ) -> JoinHandle<()> {
        let cancel = self.cancel.clone();
        tokio::spawn(async move {
            tokio::select! {
                () = cancel.cancelled() => {
                    debug!("Delayed send dropped on shutdown");
                }
                () = tokio::time::sleep(delay) => {
                    if tx.send(item).is_err() {
                        debug!("Delayed send target closed");
                    }
                }
            }
        })
    }
}
