//! Transport Module
//!
//! Byte-stream transports the Link Manager can run a session over. A
//! transport knows how to pre-bind a listening endpoint (responder role) and
//! how to dial a peer (initiator role); both produce a [`TransportSocket`].

use crate::domain::models::PeerIdentity;
use crate::domain::settings::LinkSettings;
use async_trait::async_trait;
use interprocess::local_socket::tokio::{Listener as LocalListener, Stream as LocalStream};
use interprocess::local_socket::traits::tokio::{Listener as _, Stream as _};
use interprocess::local_socket::{GenericNamespaced, ListenerOptions, Name, NameType, ToNsName};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, info};

pub type SocketReader = Box<dyn AsyncRead + Send + Unpin>;
pub type SocketWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// An established duplex byte stream and the peer on the other end.
pub struct TransportSocket {
    pub peer: PeerIdentity,
    pub reader: SocketReader,
    pub writer: SocketWriter,
}

impl TransportSocket {
    pub fn new(
        peer: PeerIdentity,
        reader: impl AsyncRead + Send + Unpin + 'static,
        writer: impl AsyncWrite + Send + Unpin + 'static,
    ) -> Self {
        Self {
            peer,
            reader: Box::new(reader),
            writer: Box::new(writer),
        }
    }

    fn from_tcp(stream: TcpStream) -> io::Result<Self> {
        // Frames are tiny and periodic
        stream.set_nodelay(true)?;
        let peer = PeerIdentity::new(stream.peer_addr()?.to_string());
        let (reader, writer) = stream.into_split();
        Ok(Self::new(peer, reader, writer))
    }
}

impl fmt::Debug for TransportSocket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransportSocket")
            .field("peer", &self.peer)
            .finish_non_exhaustive()
    }
}

/// A pre-bound listening endpoint.
#[async_trait]
pub trait Acceptor: Send {
    /// Wait for one inbound connection.
    async fn accept(&mut self) -> io::Result<TransportSocket>;
}

#[async_trait]
pub trait Transport: Send + Sync {
    /// Bind the listening endpoint used by the responder role.
    async fn listen(&self) -> io::Result<Box<dyn Acceptor>>;

    /// Open an outbound connection to `address`.
    async fn connect(&self, address: &str) -> io::Result<TransportSocket>;

    /// Short human-readable description for logs
    fn describe(&self) -> String;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransportKind {
    #[default]
    Tcp,
    LocalSocket,
}

/// Build the transport selected in the settings
pub fn from_settings(settings: &LinkSettings) -> Arc<dyn Transport> {
    match settings.transport {
        TransportKind::Tcp => Arc::new(TcpTransport::new(settings.listen_address.clone())),
        TransportKind::LocalSocket => {
            Arc::new(LocalSocketTransport::new(settings.local_socket_name.clone()))
        }
    }
}

// ── TCP ──────────────────────────────────────────────────────────

pub struct TcpTransport {
    listen_address: String,
    bound: Mutex<Option<SocketAddr>>,
}

impl TcpTransport {
    pub fn new(listen_address: impl Into<String>) -> Self {
        Self {
            listen_address: listen_address.into(),
            bound: Mutex::new(None),
        }
    }

    /// Address of the most recently bound listener (resolves port 0)
    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.bound.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl Transport for TcpTransport {
    async fn listen(&self) -> io::Result<Box<dyn Acceptor>> {
        let listener = TcpListener::bind(self.listen_address.as_str()).await?;
        let local = listener.local_addr()?;
        *self.bound.lock().unwrap_or_else(PoisonError::into_inner) = Some(local);
        info!("Listening for peers on {}", local);
        Ok(Box::new(TcpAcceptor { listener }))
    }

    async fn connect(&self, address: &str) -> io::Result<TransportSocket> {
        debug!("Dialling {}", address);
        let stream = TcpStream::connect(address).await?;
        TransportSocket::from_tcp(stream)
    }

    fn describe(&self) -> String {
        format!("tcp ({})", self.listen_address)
    }
}

struct TcpAcceptor {
    listener: TcpListener,
}

#[async_trait]
impl Acceptor for TcpAcceptor {
    async fn accept(&mut self) -> io::Result<TransportSocket> {
        let (stream, _) = self.listener.accept().await?;
        TransportSocket::from_tcp(stream)
    }
}

// ── Local sockets ────────────────────────────────────────────────

/// Named local sockets (abstract Unix sockets / Windows named pipes).
///
/// Peer addresses are socket names; an empty address dials the configured
/// name.
pub struct LocalSocketTransport {
    name: String,
}

impl LocalSocketTransport {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

fn socket_name(name: &str) -> io::Result<Name<'_>> {
    if !GenericNamespaced::is_supported() {
        return Err(io::Error::new(
            io::ErrorKind::Unsupported,
            "namespaced local sockets are not supported on this platform",
        ));
    }
    name.to_ns_name::<GenericNamespaced>()
}

fn local_socket(name: &str, stream: LocalStream) -> TransportSocket {
    let (reader, writer) = stream.split();
    TransportSocket::new(PeerIdentity::new(format!("local:{}", name)), reader, writer)
}

#[async_trait]
impl Transport for LocalSocketTransport {
    async fn listen(&self) -> io::Result<Box<dyn Acceptor>> {
        let listener = ListenerOptions::new()
            .name(socket_name(&self.name)?)
            .create_tokio()?;
        info!("Listening for peers on local socket {}", self.name);
        Ok(Box::new(LocalAcceptor {
            name: self.name.clone(),
            listener,
        }))
    }

    async fn connect(&self, address: &str) -> io::Result<TransportSocket> {
        let target = if address.is_empty() {
            self.name.as_str()
        } else {
            address
        };
        debug!("Dialling local socket {}", target);
        let stream = LocalStream::connect(socket_name(target)?).await?;
        Ok(local_socket(target, stream))
    }

    fn describe(&self) -> String {
        format!("local socket ({})", self.name)
    }
}

struct LocalAcceptor {
    name: String,
    listener: LocalListener,
}

#[async_trait]
impl Acceptor for LocalAcceptor {
    async fn accept(&mut self) -> io::Result<TransportSocket> {
        let stream = self.listener.accept().await?;
        Ok(local_socket(&self.name, stream))
    }
}
