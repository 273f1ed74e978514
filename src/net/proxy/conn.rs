//! Upstream connection handles kept by a persistent transport.

use core::fmt;
use core::future::Future;
use core::pin::Pin;
use std::io;

use tokio::io::AsyncWriteExt;
use tokio::net::{TcpStream, UdpSocket};
use tokio::time::Instant;
#[cfg(feature = "tls")]
use tokio_rustls::client::TlsStream;

//------------ TransportType -------------------------------------------------

/// The kind of transport an upstream connection uses.
///
/// Idle connections are kept in one bucket per transport type.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum TransportType {
    /// Connected datagram socket.
    Udp,

    /// Plain stream connection.
    Tcp,

    /// Stream connection wrapped in TLS.
    Tls,
}

impl TransportType {
    /// The number of transport types.
    pub const COUNT: usize = 3;

    /// All transport types in bucket order.
    pub const ALL: [TransportType; Self::COUNT] =
        [TransportType::Udp, TransportType::Tcp, TransportType::Tls];

    /// Returns the index of the bucket for this transport type.
    pub fn index(self) -> usize {
        match self {
            TransportType::Udp => 0,
            TransportType::Tcp => 1,
            TransportType::Tls => 2,
        }
    }
}

impl fmt::Display for TransportType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportType::Udp => f.write_str("udp"),
            TransportType::Tcp => f.write_str("tcp"),
            TransportType::Tls => f.write_str("tcp-tls"),
        }
    }
}

//------------ UpstreamConn --------------------------------------------------

/// An established connection to an upstream server.
///
/// The persistent transport treats connections as opaque. It only needs to
/// know which bucket a connection belongs in and how to get rid of it.
/// Closing consumes the connection, so a connection can be closed at most
/// once.
pub trait UpstreamConn: Send + 'static {
    /// The future closing the connection.
    type Fut: Future<Output = Result<(), io::Error>> + Send + 'static;

    /// Returns the transport type of the connection.
    fn transport_type(&self) -> TransportType;

    /// Returns a future that closes the connection.
    ///
    /// The future may be driven on a different task than the one that
    /// created the connection.
    fn close(self) -> Self::Fut;
}

//------------ UpstreamStream ------------------------------------------------

/// A connection to an upstream server over one of the supported transports.
#[derive(Debug)]
pub enum UpstreamStream {
    /// A UDP socket connected to the upstream.
    Udp(UdpSocket),

    /// A TCP connection.
    Tcp(TcpStream),

    /// A TLS connection over TCP.
    #[cfg(feature = "tls")]
    Tls(TlsStream<TcpStream>),
}

impl UpstreamConn for UpstreamStream {
    type Fut = Pin<Box<dyn Future<Output = Result<(), io::Error>> + Send>>;

    fn transport_type(&self) -> TransportType {
        match self {
            UpstreamStream::Udp(_) => TransportType::Udp,
            UpstreamStream::Tcp(_) => TransportType::Tcp,
            #[cfg(feature = "tls")]
            UpstreamStream::Tls(_) => TransportType::Tls,
        }
    }

    fn close(self) -> Self::Fut {
        match self {
            // Nothing to tear down for datagrams, dropping releases the
            // socket.
            UpstreamStream::Udp(sock) => Box::pin(async move {
                drop(sock);
                Ok(())
            }),
            UpstreamStream::Tcp(mut stream) => {
                Box::pin(async move { stream.shutdown().await })
            }
            // Shutting down the TLS stream sends close_notify before the
            // TCP connection goes away.
            #[cfg(feature = "tls")]
            UpstreamStream::Tls(mut stream) => {
                Box::pin(async move { stream.shutdown().await })
            }
        }
    }
}

impl From<UdpSocket> for UpstreamStream {
    fn from(sock: UdpSocket) -> Self {
        UpstreamStream::Udp(sock)
    }
}

impl From<TcpStream> for UpstreamStream {
    fn from(stream: TcpStream) -> Self {
        UpstreamStream::Tcp(stream)
    }
}

#[cfg(feature = "tls")]
impl From<TlsStream<TcpStream>> for UpstreamStream {
    fn from(stream: TlsStream<TcpStream>) -> Self {
        UpstreamStream::Tls(stream)
    }
}

//------------ PersistConn ---------------------------------------------------

/// An idle upstream connection together with the time it was last used.
#[derive(Debug)]
pub struct PersistConn<C> {
    /// The connection.
    conn: C,

    /// When the connection was last handed back to the transport.
    used: Instant,
}

impl<C> PersistConn<C> {
    /// Wraps a connection, marking it as used now.
    pub fn new(conn: C) -> Self {
        Self {
            conn,
            used: Instant::now(),
        }
    }

    /// Returns a reference to the connection.
    pub fn conn(&self) -> &C {
        &self.conn
    }

    /// Returns a mutable reference to the connection.
    pub fn conn_mut(&mut self) -> &mut C {
        &mut self.conn
    }

    /// Unwraps the connection.
    pub fn into_conn(self) -> C {
        self.conn
    }

    /// Returns when the connection was last used.
    pub fn used(&self) -> Instant {
        self.used
    }

    /// Marks the connection as used now.
    pub(super) fn touch(&mut self) {
        self.used = Instant::now();
    }

    /// Returns whether the connection was last used at or before
    /// `stale_time`.
    pub(super) fn is_stale(&self, stale_time: Instant) -> bool {
        self.used <= stale_time
    }
}

impl<C> From<C> for PersistConn<C> {
    fn from(conn: C) -> Self {
        Self::new(conn)
    }
}

//============ Tests =========================================================
