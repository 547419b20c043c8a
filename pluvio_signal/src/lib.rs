//! Module to control shutdown of the pluvio station.
//!
//! The station runs a handful of long-lived tasks -- the GPIO edge monitor
//! and the measurement-cycle loop -- that must wind down together when the
//! operator stops the daemon. Each task holds a [`Watcher`]; the binary holds
//! the [`Broadcaster`] and trips it exactly once. The signal is one-shot:
//! once received, a `Watcher` reports it forever after.

#![deny(clippy::all)]
#![deny(clippy::pedantic)]
#![deny(clippy::unwrap_used)]
#![deny(unreachable_pub)]
#![deny(missing_docs)]
#![deny(missing_debug_implementations)]

use std::sync::Arc;

use tokio::sync::broadcast;
use tracing::info;

/// Errors produced by [`Broadcaster`].
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// No live `Watcher` remained to receive the signal.
    #[error("no watcher remained to receive the signal: {0}")]
    NoWatchers(#[from] broadcast::error::SendError<()>),
}

/// Construct a connected [`Watcher`]/[`Broadcaster`] pair.
///
/// There should be one call to this function per process; further watchers
/// are created by cloning the returned `Watcher`.
#[must_use]
pub fn signal() -> (Watcher, Broadcaster) {
    let (sender, receiver) = broadcast::channel(1);
    let sender = Arc::new(sender);

    let watcher = Watcher {
        sender: Arc::clone(&sender),
        receiver,
        received: false,
    };
    let broadcaster = Broadcaster { sender };

    (watcher, broadcaster)
}

#[derive(Debug, Clone)]
/// Sending half of the shutdown signal.
pub struct Broadcaster {
    sender: Arc<broadcast::Sender<()>>,
}

impl Broadcaster {
    /// Send the shutdown signal to every [`Watcher`] derived from this pair.
    ///
    /// Returns the number of watchers that will observe the signal.
    ///
    /// # Errors
    ///
    /// Function will return an error if every watcher has already been
    /// dropped, in which case there is nothing left to stop.
    pub fn signal(&self) -> Result<usize, Error> {
        info!("broadcasting shutdown signal");
        Ok(self.sender.send(())?)
    }
}

#[derive(Debug)]
/// Receiving half of the shutdown signal.
///
/// Tasks either block on [`Watcher::recv`] -- typically inside a `select!`
/// against their work -- or poll [`Watcher::try_recv`] between blocking
/// steps. Create every watcher before the broadcaster can fire: a clone
/// taken after the signal has been sent will not observe it.
pub struct Watcher {
    /// Retained only so that clones can subscribe to the same channel.
    sender: Arc<broadcast::Sender<()>>,
    receiver: broadcast::Receiver<()>,
    /// `true` once the signal has been observed by this instance.
    received: bool,
}

impl Watcher {
    /// Wait until the shutdown signal arrives.
    ///
    /// Returns immediately on every call after the signal has been received.
    pub async fn recv(&mut self) {
        if self.received {
            return;
        }
        // The channel carries at most one value and the sender never drops
        // before a send, so Lagged cannot happen; Closed counts as a signal.
        let _ = self.receiver.recv().await;
        self.received = true;
    }

    /// Check for the shutdown signal without blocking.
    ///
    /// Sticky: once this returns `true` it returns `true` forever.
    pub fn try_recv(&mut self) -> bool {
        if self.received {
            return true;
        }
        match self.receiver.try_recv() {
            Ok(()) | Err(broadcast::error::TryRecvError::Closed) => {
                self.received = true;
                true
            }
            Err(broadcast::error::TryRecvError::Empty) => false,
            // Only one value is ever sent, lagging is impossible; if it
            // somehow happens the signal was certainly sent.
            Err(broadcast::error::TryRecvError::Lagged(_)) => {
                self.received = true;
                true
            }
        }
    }
}

impl Clone for Watcher {
    fn clone(&self) -> Self {
        Self {
            sender: Arc::clone(&self.sender),
            receiver: self.sender.subscribe(),
            received: self.received,
        }
    }
}
