//! Client side of the wire protocol.
//!
//! An [`Emitter`] sends one datagram per event to a stat-proxy listener. The
//! protocol is fire-and-forget: a successful [`Emitter::emit`] means the
//! datagram left this host, not that anyone counted it.

use std::{
    io,
    net::{Ipv4Addr, Ipv6Addr, SocketAddr},
};

use statproxy_core::{Event, protocol::MAX_DATAGRAM_BYTES};
use tokio::net::UdpSocket;
use tracing::trace;

#[derive(thiserror::Error, Debug)]
/// Errors produced by [`Emitter`].
pub enum Error {
    /// Error binding or connecting the UDP socket
    #[error("Failed to connect UDP socket to {addr}: {source}")]
    Connect {
        /// Target address
        addr: SocketAddr,
        /// Underlying IO error
        #[source]
        source: Box<io::Error>,
    },
    /// Error sending a datagram
    #[error("Failed to send datagram to {addr}: {source}")]
    Send {
        /// Target address
        addr: SocketAddr,
        /// Underlying IO error
        #[source]
        source: Box<io::Error>,
    },
    /// The encoded event does not fit one datagram
    #[error("Encoded event is {0} bytes, the limit is {MAX_DATAGRAM_BYTES}")]
    Oversize(usize),
}

#[derive(Debug)]
/// Sends events to one stat-proxy listener.
pub struct Emitter {
    socket: UdpSocket,
    target: SocketAddr,
}

impl Emitter {
    /// Create an [`Emitter`] for `target`.
    ///
    /// # Errors
    ///
    /// Function will return an error if a local socket cannot be bound or
    /// connected.
    pub async fn bind(target: SocketAddr) -> Result<Self, Error> {
        let local = match target {
            SocketAddr::V4(_) => SocketAddr::from((Ipv4Addr::UNSPECIFIED, 0)),
            SocketAddr::V6(_) => SocketAddr::from((Ipv6Addr::UNSPECIFIED, 0)),
        };
        let connect_err = |source| Error::Connect {
            addr: target,
            source: Box::new(source),
        };
        let socket = UdpSocket::bind(local).await.map_err(connect_err)?;
        socket.connect(target).await.map_err(connect_err)?;
        Ok(Self { socket, target })
    }

    /// Send one event.
    ///
    /// # Errors
    ///
    /// Function will return an error if the encoded event exceeds
    /// [`MAX_DATAGRAM_BYTES`] or the datagram cannot be sent.
    pub async fn emit(&self, event: &Event<'_>) -> Result<(), Error> {
        let datagram = event.to_string();
        if datagram.len() > MAX_DATAGRAM_BYTES {
            return Err(Error::Oversize(datagram.len()));
        }
        self.socket
            .send(datagram.as_bytes())
            .await
            .map_err(|source| Error::Send {
                addr: self.target,
                source: Box::new(source),
            })?;
        trace!(addr = %self.target, %datagram, "event emitted");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use statproxy_core::{Kind, Op, SketchSet, protocol};

    use super::*;

    #[tokio::test]
    async fn emitted_events_decode() {
        let server = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let emitter = Emitter::bind(server.local_addr().unwrap()).await.unwrap();

        let sent = [
            Event {
                source: "dev_log_saver/0",
                metric: "start",
                op: Op::Scalar {
                    kind: Kind::Sum,
                    value: 1,
                },
            },
            Event {
                source: "web/2",
                metric: "users",
                op: Op::Cardinality {
                    set: SketchSet::Daily,
                    value: 0,
                    pattern: "u17",
                },
            },
        ];
        let mut buf = vec![0; MAX_DATAGRAM_BYTES];
        for event in &sent {
            emitter.emit(event).await.unwrap();
            let bytes = server.recv(&mut buf).await.unwrap();
            assert_eq!(protocol::decode(&buf[..bytes]).unwrap(), *event);
        }
    }

    #[tokio::test]
    async fn oversize_events_are_refused() {
        let server = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let emitter = Emitter::bind(server.local_addr().unwrap()).await.unwrap();
        let pattern = "p".repeat(MAX_DATAGRAM_BYTES);
        let event = Event {
            source: "a",
            metric: "b",
            op: Op::Pattern {
                kind: Kind::Set,
                value: 1,
                pattern: &pattern,
            },
        };
        assert!(matches!(emitter.emit(&event).await, Err(Error::Oversize(_))));
    }
}
