//! Byte transports under the session engine.
//!
//! A [`Transport`] moves whole encrypted frames; framing on the wire is its
//! own business. A [`Connector`] opens one per connection attempt.
//!
//! * [`TcpTransport`]: abridged, intermediate or full framing over tokio TCP.
//! * [`HttpTransport`](crate::transport_http::HttpTransport): `POST /api` long-polling.
//! * [`memory`]: channel pairs for tests and in-process servers.

use std::fmt;
use std::future::Future;
use std::io;
use std::net::SocketAddr;

use tdmtp_mtproto::{FrameCodec, FrameError, Framing};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

use crate::dc_options::Protocol;
use crate::transport_http::{HttpConnector, HttpTransport};
use crate::TransportKind;

// ─── Errors ───────────────────────────────────────────────────────────────────

/// Why a transport stopped working.
#[derive(Debug)]
pub enum TransportError {
    Io(io::Error),
    Frame(FrameError),
    Http(String),
    /// The peer closed the stream.
    Closed,
}

impl TransportError {
    /// Negative code the server sent in place of a packet (`-404`, `-429`, ...).
    pub fn server_code(&self) -> Option<i32> {
        match self {
            Self::Frame(FrameError::Server { code }) => Some(*code),
            _ => None,
        }
    }
}

impl fmt::Display for TransportError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Io(e)    => write!(f, "I/O: {e}"),
            Self::Frame(e) => write!(f, "framing: {e}"),
            Self::Http(s)  => write!(f, "HTTP: {s}"),
            Self::Closed   => write!(f, "connection closed by peer"),
        }
    }
}

impl std::error::Error for TransportError {}

impl From<io::Error> for TransportError {
    fn from(e: io::Error) -> Self { Self::Io(e) }
}

impl From<FrameError> for TransportError {
    fn from(e: FrameError) -> Self { Self::Frame(e) }
}

impl From<TransportError> for crate::InvocationError {
    fn from(e: TransportError) -> Self {
        match e {
            TransportError::Io(e) => Self::Io(e),
            other => Self::Transport(other.to_string()),
        }
    }
}

// ─── Traits ───────────────────────────────────────────────────────────────────

/// One open connection carrying whole frames.
///
/// `recv` must be cancel-safe: the worker polls it inside `select!` and
/// drops the future whenever a timer fires first.
pub trait Transport: Send + 'static {
    fn send(&mut self, frame: Vec<u8>) -> impl Future<Output = Result<(), TransportError>> + Send;

    fn recv(&mut self) -> impl Future<Output = Result<Vec<u8>, TransportError>> + Send;

    /// Long-poll transports ask the server to hold replies with `http_wait`.
    fn needs_http_wait(&self) -> bool { false }
}

/// Opens transports to an address.
pub trait Connector: Send + Sync + 'static {
    type Transport: Transport;

    fn connect(&self, addr: SocketAddr) -> impl Future<Output = Result<Self::Transport, TransportError>> + Send;

    /// Which endpoints of the DC table this connector can use.
    fn protocol(&self) -> Protocol { Protocol::Tcp }
}

// ─── TCP ──────────────────────────────────────────────────────────────────────

/// Framed MTProto over a TCP stream.
pub struct TcpTransport {
    stream: TcpStream,
    codec:  FrameCodec,
    inbox:  Vec<u8>,
    outbox: Vec<u8>,
}

impl TcpTransport {
    pub async fn connect(addr: SocketAddr, framing: Framing) -> Result<Self, TransportError> {
        let stream = TcpStream::connect(addr).await?;
        stream.set_nodelay(true)?;
        socket2::SockRef::from(&stream).set_keepalive(true)?;
        Ok(Self { stream, codec: FrameCodec::new(framing), inbox: Vec::new(), outbox: Vec::new() })
    }
}

impl Transport for TcpTransport {
    async fn send(&mut self, frame: Vec<u8>) -> Result<(), TransportError> {
        self.outbox.clear();
        self.codec.encode(&frame, &mut self.outbox);
        self.stream.write_all(&self.outbox).await?;
        Ok(())
    }

    async fn recv(&mut self) -> Result<Vec<u8>, TransportError> {
        loop {
            if let Some((used, payload)) = self.codec.decode(&self.inbox)? {
                self.inbox.drain(..used);
                return Ok(payload);
            }
            if self.stream.read_buf(&mut self.inbox).await? == 0 {
                return Err(TransportError::Closed);
            }
        }
    }
}

pub struct TcpConnector {
    framing: Framing,
}

impl TcpConnector {
    pub fn new(framing: Framing) -> Self { Self { framing } }
}

impl Connector for TcpConnector {
    type Transport = TcpTransport;

    fn connect(&self, addr: SocketAddr) -> impl Future<Output = Result<TcpTransport, TransportError>> + Send {
        TcpTransport::connect(addr, self.framing)
    }
}

// ─── Default connector ────────────────────────────────────────────────────────

/// The connector picked by [`TransportKind`].
pub enum DefaultConnector {
    Tcp(TcpConnector),
    Http(HttpConnector),
}

impl DefaultConnector {
    pub fn new(kind: TransportKind) -> Self {
        match kind {
            TransportKind::Abridged     => Self::Tcp(TcpConnector::new(Framing::Abridged)),
            TransportKind::Intermediate => Self::Tcp(TcpConnector::new(Framing::Intermediate)),
            TransportKind::Full         => Self::Tcp(TcpConnector::new(Framing::Full)),
            TransportKind::Http         => Self::Http(HttpConnector::new()),
        }
    }
}

pub enum DefaultTransport {
    Tcp(TcpTransport),
    Http(HttpTransport),
}

impl Transport for DefaultTransport {
    async fn send(&mut self, frame: Vec<u8>) -> Result<(), TransportError> {
        match self {
            Self::Tcp(t)  => t.send(frame).await,
            Self::Http(t) => t.send(frame).await,
        }
    }

    async fn recv(&mut self) -> Result<Vec<u8>, TransportError> {
        match self {
            Self::Tcp(t)  => t.recv().await,
            Self::Http(t) => t.recv().await,
        }
    }

    fn needs_http_wait(&self) -> bool { matches!(self, Self::Http(_)) }
}

impl Connector for DefaultConnector {
    type Transport = DefaultTransport;

    async fn connect(&self, addr: SocketAddr) -> Result<DefaultTransport, TransportError> {
        match self {
            Self::Tcp(c)  => c.connect(addr).await.map(DefaultTransport::Tcp),
            Self::Http(c) => c.connect(addr).await.map(DefaultTransport::Http),
        }
    }

    fn protocol(&self) -> Protocol {
        match self {
            Self::Tcp(_)  => Protocol::Tcp,
            Self::Http(_) => Protocol::Http,
        }
    }
}

// ─── In-memory ────────────────────────────────────────────────────────────────

pub mod memory {
    //! Frame channels standing in for sockets.

    use std::collections::HashMap;
    use std::future::Future;
    use std::net::SocketAddr;
    use std::time::Duration;

    use tokio::sync::mpsc;

    use super::{Connector, Transport, TransportError};

    /// One end of an in-process connection.
    pub struct MemoryTransport {
        tx: mpsc::UnboundedSender<Vec<u8>>,
        rx: mpsc::UnboundedReceiver<Vec<u8>>,
    }

    /// Two connected ends.
    pub fn pair() -> (MemoryTransport, MemoryTransport) {
        let (a_tx, a_rx) = mpsc::unbounded_channel();
        let (b_tx, b_rx) = mpsc::unbounded_channel();
        (MemoryTransport { tx: a_tx, rx: b_rx }, MemoryTransport { tx: b_tx, rx: a_rx })
    }

    impl Transport for MemoryTransport {
        async fn send(&mut self, frame: Vec<u8>) -> Result<(), TransportError> {
            self.tx.send(frame).map_err(|_| TransportError::Closed)
        }

        async fn recv(&mut self) -> Result<Vec<u8>, TransportError> {
            self.rx.recv().await.ok_or(TransportError::Closed)
        }
    }

    impl MemoryTransport {
        /// Next frame from the peer, `None` once it hung up.
        pub async fn next(&mut self) -> Option<Vec<u8>> { self.rx.recv().await }

        /// Push a frame to the peer; `false` once it hung up.
        pub fn push(&self, frame: Vec<u8>) -> bool { self.tx.send(frame).is_ok() }
    }

    /// A server-side connection handed out by [`MemoryConnector`].
    pub struct Accepted {
        pub addr:      SocketAddr,
        pub transport: MemoryTransport,
    }

    /// Connects by handing the far end of a fresh pair to a listener.
    ///
    /// Per-address delays and refusals let tests stage connection races.
    #[derive(Clone)]
    pub struct MemoryConnector {
        listener: mpsc::UnboundedSender<Accepted>,
        delays:   HashMap<SocketAddr, Duration>,
        refused:  Vec<SocketAddr>,
    }

    impl MemoryConnector {
        pub fn new() -> (Self, mpsc::UnboundedReceiver<Accepted>) {
            let (listener, accepted) = mpsc::unbounded_channel();
            (Self { listener, delays: HashMap::new(), refused: Vec::new() }, accepted)
        }

        pub fn with_delay(mut self, addr: SocketAddr, delay: Duration) -> Self {
            self.delays.insert(addr, delay);
            self
        }

        pub fn refusing(mut self, addr: SocketAddr) -> Self {
            self.refused.push(addr);
            self
        }
    }

    impl Connector for MemoryConnector {
        type Transport = MemoryTransport;

        fn connect(&self, addr: SocketAddr) -> impl Future<Output = Result<MemoryTransport, TransportError>> + Send {
            let delay = self.delays.get(&addr).copied();
            let refused = self.refused.contains(&addr);
            let listener = self.listener.clone();
            async move {
                if let Some(delay) = delay {
                    tokio::time::sleep(delay).await;
                }
                if refused {
                    return Err(TransportError::Io(std::io::ErrorKind::ConnectionRefused.into()));
                }
                let (client, server) = pair();
                listener
                    .send(Accepted { addr, transport: server })
                    .map_err(|_| TransportError::Closed)?;
                Ok(client)
            }
        }
    }
}
