//! One-shot shutdown signalling for stat-proxy.
//!
//! The mechanism has two halves, a `Broadcaster` and a `Watcher`. The
//! `Broadcaster` fires exactly once. Every `Watcher` either waits for that
//! with [`Watcher::recv`] or polls it with [`Watcher::try_recv`]. Dropping the
//! `Broadcaster` without signalling counts as a signal so that no watcher can
//! be stranded.
//!
//! There is only one `Broadcaster` and potentially many `Watcher` instances,
//! made by cloning.

#![deny(clippy::all)]
#![deny(unreachable_pub)]
#![deny(missing_docs)]

use tokio::sync::watch;
use tracing::info;

/// Construct a `Watcher` and `Broadcaster` pair.
#[must_use]
pub fn signal() -> (Watcher, Broadcaster) {
    let (sender, receiver) = watch::channel(false);
    (Watcher { receiver }, Broadcaster { sender })
}

#[derive(Debug)]
/// Mechanism to notify one or more `Watcher` instances that shutdown has
/// begun.
pub struct Broadcaster {
    sender: watch::Sender<bool>,
}

impl Broadcaster {
    /// Send the signal to every `Watcher`.
    ///
    /// Function will NOT block until all peers have dropped.
    pub fn signal(self) {
        self.sender.send_replace(true);
    }

    /// Send the signal to every `Watcher`.
    ///
    /// Function WILL block until every `Watcher`, clones included, has been
    /// dropped or consumed by [`Watcher::recv`].
    pub async fn signal_and_wait(self) {
        self.sender.send_replace(true);
        let peers = self.sender.receiver_count();
        if peers > 0 {
            info!("Waiting for {peers} peers");
        }
        self.sender.closed().await;
    }
}

#[derive(Debug, Clone)]
/// Mechanism to watch for shutdown.
pub struct Watcher {
    receiver: watch::Receiver<bool>,
}

impl Watcher {
    /// Wait for the signal, consuming this `Watcher`.
    ///
    /// Returns immediately if the signal was already sent.
    pub async fn recv(mut self) {
        // An error means the broadcaster is gone, which is also shutdown.
        let _ = self.receiver.wait_for(|signalled| *signalled).await;
    }

    /// Check whether the signal has been sent, without blocking.
    #[must_use]
    pub fn try_recv(&self) -> bool {
        *self.receiver.borrow() || self.receiver.has_changed().is_err()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::time::timeout;

    use super::*;

    #[tokio::test]
    async fn watchers_observe_signal() {
        let (watcher, broadcaster) = signal();
        let other = watcher.clone();
        assert!(!watcher.try_recv());

        let waiting = tokio::spawn(other.recv());
        broadcaster.signal();

        assert!(watcher.try_recv());
        timeout(Duration::from_secs(1), waiting)
            .await
            .expect("watcher did not observe signal")
            .unwrap();
    }

    #[tokio::test]
    async fn signal_and_wait_waits_for_every_watcher() {
        let (watcher, broadcaster) = signal();
        let clones: Vec<Watcher> = (0..4).map(|_| watcher.clone()).collect();
        let handles: Vec<_> = clones.into_iter().map(|w| tokio::spawn(w.recv())).collect();
        drop(watcher);

        timeout(Duration::from_secs(1), broadcaster.signal_and_wait())
            .await
            .expect("broadcaster never saw every watcher finish");
        for handle in handles {
            handle.await.unwrap();
        }
    }

    #[tokio::test]
    async fn dropped_broadcaster_is_a_signal() {
        let (watcher, broadcaster) = signal();
        drop(broadcaster);
        assert!(watcher.try_recv());
        timeout(Duration::from_secs(1), watcher.recv())
            .await
            .expect("recv stalled after broadcaster drop");
    }

    #[tokio::test]
    async fn late_recv_returns_immediately() {
        let (watcher, broadcaster) = signal();
        let late = watcher.clone();
        broadcaster.signal();
        timeout(Duration::from_secs(1), late.recv())
            .await
            .expect("late recv stalled");
        drop(watcher);
    }
}
