//! Low-level TCP connection handling for the overlay.
//!
//! This module provides the transport layer for overlay connections:
//!
//! - [`Connection`] - A single TCP connection with framed parcel I/O
//! - [`Listener`] - Accepts incoming TCP connections on a port
//!
//! # Architecture
//!
//! Connections wrap a TCP stream with the [`ParcelCodec`] for automatic
//! framing. The higher-level [`Peer`] type runs a reader task and a writer
//! task on top of the split halves of a `Connection`.
//!
//! [`ParcelCodec`]: crate::ParcelCodec
//! [`Peer`]: crate::Peer

use crate::{codec::ParcelCodec, OverlayError, Parcel, Result};
use futures::{SinkExt, StreamExt};
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;
use tokio_util::codec::Framed;
use tracing::{debug, trace};

/// Upper bound on a single framed write. A connection that cannot flush one
/// parcel in this window is treated as dead.
const SEND_TIMEOUT: Duration = Duration::from_secs(10);

/// Direction of a peer connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionDirection {
    /// We initiated the connection.
    Outbound,
    /// The peer connected to us.
    Inbound,
}

/// A TCP connection to a peer with framed parcel I/O.
///
/// Wraps a TCP stream with the [`ParcelCodec`] for automatic framing.
/// Provides async methods for sending and receiving [`Parcel`]s.
///
/// # Lifecycle
///
/// 1. Create via [`Connection::connect`] (outbound) or from [`Listener::accept`] (inbound)
/// 2. Split into halves with [`split`](Connection::split) and hand them to the peer tasks
/// 3. Dropping either half closes the underlying stream
///
/// [`ParcelCodec`]: crate::ParcelCodec
pub struct Connection {
    /// Framed stream for parcel encoding/decoding.
    framed: Framed<TcpStream, ParcelCodec>,
    /// Remote peer's socket address.
    remote_addr: SocketAddr,
    /// Whether we initiated or accepted this connection.
    direction: ConnectionDirection,
}

impl Connection {
    /// Creates a connection from an existing TCP stream.
    ///
    /// Configures TCP_NODELAY to reduce latency and wraps the stream
    /// with the parcel codec.
    pub fn new(
        stream: TcpStream,
        direction: ConnectionDirection,
        max_parcel_size: usize,
    ) -> Result<Self> {
        let remote_addr = stream.peer_addr()?;

        // Disable Nagle's algorithm for lower latency
        stream.set_nodelay(true)?;

        let framed = Framed::new(stream, ParcelCodec::new(max_parcel_size));

        Ok(Self {
            framed,
            remote_addr,
            direction,
        })
    }

    /// Connects to `host:port` with a timeout.
    ///
    /// # Errors
    ///
    /// Returns `ConnectionTimeout` if the connection is not established
    /// within `dial_timeout`, or `ConnectionFailed` for other errors.
    pub async fn connect(
        addr: &str,
        dial_timeout: Duration,
        max_parcel_size: usize,
    ) -> Result<Self> {
        debug!("Connecting to peer: {}", addr);

        let stream = timeout(dial_timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| OverlayError::ConnectionTimeout(addr.to_string()))?
            .map_err(|e| OverlayError::ConnectionFailed(format!("{}: {}", addr, e)))?;

        debug!("Connected to peer: {}", addr);
        Self::new(stream, ConnectionDirection::Outbound, max_parcel_size)
    }

    /// Returns the remote peer's socket address.
    pub fn remote_addr(&self) -> SocketAddr {
        self.remote_addr
    }

    /// Returns whether this is an inbound or outbound connection.
    pub fn direction(&self) -> ConnectionDirection {
        self.direction
    }

    /// Sends a parcel, flushing the frame.
    pub async fn send(&mut self, parcel: Parcel) -> Result<()> {
        trace!("Sending parcel to {}", self.remote_addr);
        match timeout(SEND_TIMEOUT, self.framed.send(parcel)).await {
            Ok(result) => result,
            Err(_) => Err(OverlayError::ConnectionTimeout(format!(
                "send timeout after {:?} to {}",
                SEND_TIMEOUT, self.remote_addr
            ))),
        }
    }

    /// Receives the next parcel from the peer.
    ///
    /// Returns `Ok(None)` if the connection was closed cleanly by the peer.
    pub async fn recv(&mut self) -> Result<Option<Parcel>> {
        match self.framed.next().await {
            Some(Ok(parcel)) => Ok(Some(parcel)),
            Some(Err(e)) => Err(e),
            None => Ok(None),
        }
    }

    /// Splits the connection into separate send and receive halves.
    ///
    /// This allows the peer's writer and reader tasks to run concurrently
    /// on the same socket.
    pub fn split(self) -> (ConnectionSender, ConnectionReceiver) {
        let (sink, stream) = self.framed.split();
        (
            ConnectionSender {
                sink,
                remote_addr: self.remote_addr,
            },
            ConnectionReceiver {
                stream,
                remote_addr: self.remote_addr,
            },
        )
    }
}

/// Send half of a split connection.
///
/// Created by [`Connection::split`]. Writes are strictly ordered; each
/// parcel is flushed before the next is taken.
pub struct ConnectionSender {
    sink: futures::stream::SplitSink<Framed<TcpStream, ParcelCodec>, Parcel>,
    remote_addr: SocketAddr,
}

impl ConnectionSender {
    /// Sends a parcel to the peer.
    ///
    /// Includes a timeout to prevent blocking indefinitely on TCP
    /// backpressure, matching [`Connection::send`].
    pub async fn send(&mut self, parcel: Parcel) -> Result<()> {
        trace!("Sending parcel to {}", self.remote_addr);
        match timeout(SEND_TIMEOUT, self.sink.send(parcel)).await {
            Ok(result) => result,
            Err(_) => Err(OverlayError::ConnectionTimeout(format!(
                "send timeout after {:?} to {}",
                SEND_TIMEOUT, self.remote_addr
            ))),
        }
    }

    /// Returns the remote peer's socket address.
    pub fn remote_addr(&self) -> SocketAddr {
        self.remote_addr
    }
}

/// Receive half of a split connection.
///
/// Created by [`Connection::split`].
pub struct ConnectionReceiver {
    stream: futures::stream::SplitStream<Framed<TcpStream, ParcelCodec>>,
    remote_addr: SocketAddr,
}

impl ConnectionReceiver {
    /// Receives the next parcel from the peer.
    ///
    /// Returns `Ok(None)` if the connection was closed.
    pub async fn recv(&mut self) -> Result<Option<Parcel>> {
        match self.stream.next().await {
            Some(Ok(parcel)) => {
                trace!("Received parcel from {}", self.remote_addr);
                Ok(Some(parcel))
            }
            Some(Err(e)) => Err(e),
            None => Ok(None),
        }
    }

    /// Returns the remote peer's socket address.
    pub fn remote_addr(&self) -> SocketAddr {
        self.remote_addr
    }
}

/// TCP listener for accepting incoming peer connections.
///
/// Binds to a port and accepts new connections, wrapping them as
/// inbound [`Connection`]s.
pub struct Listener {
    listener: TcpListener,
    local_addr: SocketAddr,
    max_parcel_size: usize,
}

impl Listener {
    /// Binds to the specified interface and port.
    ///
    /// # Errors
    ///
    /// Returns an IO error if the port is already in use or binding fails.
    pub async fn bind(bind_ip: &str, port: u16, max_parcel_size: usize) -> Result<Self> {
        let addr = format!("{}:{}", bind_ip, port);
        let listener = TcpListener::bind(&addr).await?;
        let local_addr = listener.local_addr()?;

        debug!("Listening on {}", local_addr);

        Ok(Self {
            listener,
            local_addr,
            max_parcel_size,
        })
    }

    /// Returns the local address the listener is bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Accepts the next incoming connection.
    ///
    /// Blocks until a new connection arrives, then returns it as an
    /// inbound [`Connection`].
    pub async fn accept(&self) -> Result<Connection> {
        let (stream, remote_addr) = self.listener.accept().await?;
        debug!("Accepted connection from {}", remote_addr);

        Connection::new(stream, ConnectionDirection::Inbound, self.max_parcel_size)
    }
}
