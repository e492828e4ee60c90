//! A cloneable one-shot shutdown signal.

use tokio::sync::watch;

/// Broadcasts a single "shut down now" signal to any number of consumers.
///
/// - Clone freely; every clone is both a sender and a receiver.
/// - The signal is observable after the fact: a consumer that starts
///   listening after [`send`] was called still completes immediately.
/// - Sending more than once is harmless.
///
/// Internally this is a [`watch`] channel over a bool. We keep one sender
/// alive inside every handle, so the channel can never close from all
/// senders dropping and `changed()` only ever resolves on a real signal.
///
/// [`send`]: ShutdownChannel::send
#[derive(Clone, Debug)]
pub struct ShutdownChannel {
    tx: watch::Sender<bool>,
    rx: watch::Receiver<bool>,
}

impl ShutdownChannel {
    #[allow(clippy::new_without_default)]
    pub fn new() -> Self {
        let (tx, rx) = watch::channel(false);
        Self { tx, rx }
    }

    /// Signal shutdown to all handles.
    pub fn send(&self) {
        // send() can only fail with zero receivers; we always hold one.
        let _ = self.tx.send(true);
    }

    /// Wait for the shutdown signal. Returns immediately if it was already
    /// sent, no matter when this handle was created.
    pub async fn recv(&mut self) {
        while !*self.rx.borrow_and_update() {
            if self.rx.changed().await.is_err() {
                // Unreachable: we hold a sender. Treat as a signal anyway.
                return;
            }
        }
    }

    /// [`recv`](Self::recv) by value, for APIs which want a
    /// `Future<Output = ()> + 'static`.
    pub async fn recv_owned(mut self) {
        self.recv().await
    }

    /// Whether the signal has been sent, without waiting.
    #[must_use]
    pub fn was_sent(&self) -> bool {
        *self.rx.borrow()
    }
}
