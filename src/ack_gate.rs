//! Single-slot wake signal used by the Framer writer between frames.
//!
//! Not a general-purpose semaphore: there is exactly one waiter at a time,
//! guaranteed by the Connection's `send_lock` held across an entire payload
//! send — never by transport access, which this gate has none of.

use tokio::sync::Notify;

/// A gate the writer blocks on between each MSG/END frame and the matching ACK.
#[derive(Debug, Default)]
pub struct AckGate {
    notify: Notify,
}

impl AckGate {
    #[must_use]
    pub fn new() -> Self {
        Self { notify: Notify::new() }
    }

    /// Blocks until the next [`Self::signal`].
    pub async fn wait(&self) {
        self.notify.notified().await;
    }

    /// Wakes the current waiter, if any. Called by the Dispatcher on inbound `ACK`.
    pub fn signal(&self) {
        self.notify.notify_one();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[tokio::test]
    async fn wait_unblocks_after_signal() {
        let gate = Arc::new(AckGate::new());
        let waiter = Arc::clone(&gate);
        let handle = tokio::spawn(async move {
            waiter.wait().await;
        });
        tokio::task::yield_now().await;
        gate.signal();
        handle.await.expect("waiter task panicked");
    }
}
