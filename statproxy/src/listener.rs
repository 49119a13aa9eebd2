//! The UDP listener.
//!
//! Every datagram carries one metric event, see [`statproxy_core::protocol`].
//! Decoded events are dispatched straight into the shared registry. A datagram
//! that fails to decode is counted, logged at debug and dropped. A warning
//! summarising rejections is emitted at most once per [`REJECTION_SILENCE`].
//! Nothing is ever sent back to the peer.
//!
//! ## Metrics
//!
//! `packet_received`: Total packets received
//! `bytes_received`: Total bytes received
//! `packet_rejected`: Total packets that failed to decode, labeled by `reason`
//!

use std::{
    io,
    net::SocketAddr,
    sync::Arc,
    time::{Duration, Instant},
};

use metrics::counter;
use serde::{Deserialize, Serialize};
use statproxy_core::{Registry, protocol};
use statproxy_signal::Watcher;
use tokio::net::UdpSocket;
use tracing::{debug, info, warn};

#[derive(thiserror::Error, Debug)]
/// Errors produced by [`Listener`].
pub enum Error {
    /// Error binding UDP socket
    #[error("Failed to bind UDP socket to {addr}: {source}")]
    Bind {
        /// Binding address
        addr: SocketAddr,
        /// Underlying IO error
        #[source]
        source: Box<io::Error>,
    },
    /// Error receiving packet
    #[error("Failed to receive packet on {addr}: {source}")]
    Recv {
        /// Listening address
        addr: SocketAddr,
        /// Underlying IO error
        #[source]
        source: Box<io::Error>,
    },
}

/// Minimum time between two rejection warnings.
pub const REJECTION_SILENCE: Duration = Duration::from_secs(10);

/// Rate limit for the rejection warning.
#[derive(Debug)]
struct RejectionLog {
    silence: Duration,
    last_warned: Option<Instant>,
    suppressed: u64,
}

impl RejectionLog {
    fn new(silence: Duration) -> Self {
        Self {
            silence,
            last_warned: None,
            suppressed: 0,
        }
    }

    /// Note one rejection at `now`. Returns the number of rejections
    /// suppressed since the last warning when a warning is due.
    fn note(&mut self, now: Instant) -> Option<u64> {
        if let Some(last) = self.last_warned {
            if now.saturating_duration_since(last) < self.silence {
                self.suppressed += 1;
                return None;
            }
        }
        self.last_warned = Some(now);
        Some(std::mem::take(&mut self.suppressed))
    }
}

#[derive(Debug, Deserialize, Serialize, Clone, Copy, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
/// Configuration for [`Listener`].
pub struct Config {
    /// address -- IP plus port -- to bind to
    pub binding_addr: SocketAddr,
}

#[derive(Debug)]
/// The UDP listener.
pub struct Listener {
    socket: UdpSocket,
    addr: SocketAddr,
    registry: Arc<Registry>,
    shutdown: Watcher,
    metric_labels: Vec<(String, String)>,
}

impl Listener {
    /// Bind a new [`Listener`].
    ///
    /// # Errors
    ///
    /// Function will return an error if the socket cannot be bound.
    pub async fn bind(
        config: &Config,
        registry: Arc<Registry>,
        shutdown: Watcher,
    ) -> Result<Self, Error> {
        let socket = UdpSocket::bind(&config.binding_addr)
            .await
            .map_err(|source| Error::Bind {
                addr: config.binding_addr,
                source: Box::new(source),
            })?;
        let addr = socket.local_addr().map_err(|source| Error::Bind {
            addr: config.binding_addr,
            source: Box::new(source),
        })?;
        info!(%addr, "listening for metric events");

        Ok(Self {
            socket,
            addr,
            registry,
            shutdown,
            metric_labels: vec![("component".to_string(), "listener".to_string())],
        })
    }

    /// The address the socket is bound to.
    #[must_use]
    pub fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    /// Run [`Listener`] to completion
    ///
    /// This function receives datagrams forever, unless a shutdown signal is
    /// received or an unrecoverable error is encountered.
    ///
    /// # Errors
    ///
    /// Function will return an error if receiving a packet fails.
    pub async fn run(self) -> Result<(), Error> {
        let mut buf = vec![0; protocol::MAX_DATAGRAM_BYTES];
        let mut rejections = RejectionLog::new(REJECTION_SILENCE);

        let shutdown_wait = self.shutdown.recv();
        tokio::pin!(shutdown_wait);
        loop {
            tokio::select! {
                packet = self.socket.recv_from(&mut buf) => {
                    let (bytes, peer) = packet.map_err(|source| Error::Recv {
                        addr: self.addr,
                        source: Box::new(source),
                    })?;
                    counter!("packet_received", &self.metric_labels).increment(1);
                    counter!("bytes_received", &self.metric_labels).increment(bytes as u64);

                    match protocol::decode(&buf[..bytes]) {
                        Ok(event) => self.registry.dispatch(&event),
                        Err(err) => {
                            let mut labels = self.metric_labels.clone();
                            labels.push(("reason".to_string(), err.reason().to_string()));
                            counter!("packet_rejected", &labels).increment(1);
                            debug!(%peer, %err, "datagram rejected");
                            if let Some(suppressed) = rejections.note(Instant::now()) {
                                warn!(%peer, %err, suppressed, "rejecting malformed datagrams");
                            }
                        }
                    }
                }
                () = &mut shutdown_wait => {
                    info!("shutdown signal received");
                    return Ok(())
                }
            }
        }
    }
}
