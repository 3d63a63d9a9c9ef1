//! Module to signal cancellation of a promfire run.
//!
//! A run is cancelled at most once, usually because the process received
//! SIGINT or SIGTERM. The mechanism here has two components, a `Broadcaster`
//! and a `Watcher`. The `Broadcaster` is responsible for signaling every
//! `Watcher` that the run is over. The `Watcher` is handed to every component
//! with a suspension point -- rate limiting, HTTP requests -- so that each can
//! abandon its work promptly.
//!
//! One `Broadcaster` fans out to any number of cloned `Watcher` instances. The
//! signal is latched: once sent, every later `recv` completes immediately.

#![deny(clippy::all)]
#![deny(clippy::pedantic)]
#![deny(clippy::print_stdout)]
#![deny(clippy::print_stderr)]
#![deny(clippy::dbg_macro)]
#![deny(clippy::unwrap_used)]
#![deny(unreachable_pub)]
#![deny(missing_docs)]
#![deny(missing_debug_implementations)]

use tokio::sync::watch;

/// Construct a `Watcher` and `Broadcaster` pair.
#[must_use]
pub fn signal() -> (Watcher, Broadcaster) {
    // A watch channel rather than a broadcast channel: every watcher needs to
    // observe the same latched value repeatedly, never a queue of messages.
    let (sender, receiver) = watch::channel(false);
    (Watcher { receiver }, Broadcaster { sender })
}

#[derive(Debug)]
/// Mechanism to notify one or more `Watcher` instances that the run is
/// cancelled.
///
/// Dropping a `Broadcaster` without calling `signal` is equivalent to
/// signaling.
pub struct Broadcaster {
    sender: watch::Sender<bool>,
}

impl Broadcaster {
    /// Signal every `Watcher` and return immediately.
    pub fn signal(self) {
        self.sender.send_replace(true);
    }
}

#[derive(Debug, Clone)]
/// Mechanism to watch for cancellation.
pub struct Watcher {
    receiver: watch::Receiver<bool>,
}

impl Watcher {
    /// Resolve once the run is cancelled. Intended as one arm of a
    /// `tokio::select!`.
    pub async fn recv(&mut self) {
        // The only error is the `Broadcaster` dropping, which is a signal in
        // its own right.
        let _ = self.receiver.wait_for(|cancelled| *cancelled).await;
    }

    /// Check if the cancellation signal has been sent without blocking.
    #[must_use]
    pub fn try_recv(&self) -> bool {
        *self.receiver.borrow() || self.receiver.has_changed().is_err()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::time::timeout;

    use crate::signal;

    #[test]
    fn try_receive_before_and_after_signal() {
        let (watcher, broadcaster) = signal();

        assert!(!watcher.try_recv());
        broadcaster.signal();
        assert!(watcher.try_recv());
        // The signal is latched, not consumed.
        assert!(watcher.try_recv());
    }

    #[test]
    fn dropped_broadcaster_is_a_signal() {
        let (watcher, broadcaster) = signal();
        drop(broadcaster);
        assert!(watcher.try_recv());
    }

    #[tokio::test]
    async fn recv_completes_repeatedly_after_signal() {
        let (mut watcher, broadcaster) = signal();
        let mut clone = watcher.clone();

        broadcaster.signal();

        watcher.recv().await;
        watcher.recv().await;
        clone.recv().await;
    }

    #[tokio::test(start_paused = true)]
    async fn recv_blocks_until_signal() {
        let (mut watcher, broadcaster) = signal();

        assert!(
            timeout(Duration::from_secs(1), watcher.recv())
                .await
                .is_err()
        );

        let handle = tokio::spawn(async move {
            watcher.recv().await;
        });
        broadcaster.signal();
        handle.await.expect("watcher task panicked");
    }
}
