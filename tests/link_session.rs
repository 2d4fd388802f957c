//! End-to-end session scenarios against real localhost peers.

use async_trait::async_trait;
use remote_gyro_sensor::domain::models::{
    LinkEvent, MessageSeverity, PeerIdentity, Role, SessionState, StartOutcome,
};
use remote_gyro_sensor::domain::orientation::RotationMatrix;
use remote_gyro_sensor::infrastructure::link::protocol::{
    encode_rotation_frame, parse_rotation_frame, ROTATION_FRAME_LEN,
};
use remote_gyro_sensor::infrastructure::link::transport::{
    Acceptor, TcpTransport, Transport, TransportSocket,
};
use remote_gyro_sensor::infrastructure::link::{FailureFallback, LinkConfig, LinkManager};
use std::io::{self, Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::thread;
use std::time::{Duration, Instant};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::sync::mpsc::error::TryRecvError;
use tokio::sync::mpsc::UnboundedReceiver;

const EVENT_TIMEOUT: Duration = Duration::from_secs(5);
const QUIET_PERIOD: Duration = Duration::from_millis(200);

type Events = UnboundedReceiver<LinkEvent>;

fn next_event(events: &mut Events) -> LinkEvent {
    let deadline = Instant::now() + EVENT_TIMEOUT;
    loop {
        match events.try_recv() {
            Ok(event) => return event,
            Err(TryRecvError::Empty) if Instant::now() < deadline => {
                thread::sleep(Duration::from_millis(5))
            }
            Err(e) => panic!("no event within {:?}: {:?}", EVENT_TIMEOUT, e),
        }
    }
}

fn expect_state(events: &mut Events, expected: SessionState) -> Option<PeerIdentity> {
    match next_event(events) {
        LinkEvent::StateChanged { state, peer } if state == expected => peer,
        other => panic!("expected StateChanged({}), got {:?}", expected, other),
    }
}

fn expect_notice(events: &mut Events) -> (String, MessageSeverity) {
    match next_event(events) {
        LinkEvent::Notice(msg) => (msg.message, msg.severity),
        other => panic!("expected Notice, got {:?}", other),
    }
}

fn assert_quiet(events: &mut Events) {
    thread::sleep(QUIET_PERIOD);
    if let Ok(event) = events.try_recv() {
        panic!("unexpected event: {:?}", event);
    }
}

fn tcp_manager(config: LinkConfig) -> (Arc<TcpTransport>, LinkManager, Events) {
    let transport = Arc::new(TcpTransport::new("127.0.0.1:0"));
    let (manager, events) = LinkManager::new(transport.clone(), config).unwrap();
    (transport, manager, events)
}

/// An address nothing is listening on.
fn unreachable_addr() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap()
}

fn peer_stream(addr: SocketAddr) -> TcpStream {
    let stream = TcpStream::connect(addr).unwrap();
    stream.set_read_timeout(Some(EVENT_TIMEOUT)).unwrap();
    stream
}

/// Dial the manager from a peer socket and wait for the session to come up.
fn connect_peer(transport: &TcpTransport, events: &mut Events) -> TcpStream {
    let stream = peer_stream(transport.local_addr().unwrap());
    match next_event(events) {
        LinkEvent::PeerIdentified(name) => assert_eq!(name, stream.local_addr().unwrap().to_string()),
        other => panic!("expected PeerIdentified, got {:?}", other),
    }
    let peer = expect_state(events, SessionState::Connected).unwrap();
    assert_eq!(peer.address, stream.local_addr().unwrap().to_string());
    stream
}

#[test]
fn responder_listens_until_stopped() {
    let (transport, manager, mut events) = tcp_manager(LinkConfig::default());

    assert_eq!(manager.start(Role::Responder).unwrap(), StartOutcome::Started);
    expect_state(&mut events, SessionState::Listening);
    assert_quiet(&mut events);
    assert_eq!(manager.state(), SessionState::Listening);

    let addr = transport.local_addr().unwrap();
    manager.stop();
    expect_state(&mut events, SessionState::Idle);
    assert_eq!(manager.state(), SessionState::Idle);
    assert_quiet(&mut events);

    // The accept worker is gone along with its listening endpoint
    assert!(TcpStream::connect(addr).is_err());
}

#[test]
fn stop_is_idempotent() {
    let (_transport, manager, mut events) = tcp_manager(LinkConfig::default());

    manager.stop();
    assert_quiet(&mut events);

    manager.start(Role::Responder).unwrap();
    expect_state(&mut events, SessionState::Listening);
    manager.stop();
    manager.stop();
    expect_state(&mut events, SessionState::Idle);
    assert_quiet(&mut events);
}

#[test]
fn unreachable_initiator_falls_back_to_idle() {
    let (_transport, manager, mut events) = tcp_manager(LinkConfig::default());
    let address = unreachable_addr().to_string();

    manager
        .start(Role::Initiator {
            address: address.clone(),
        })
        .unwrap();
    expect_state(&mut events, SessionState::Connecting);

    let (message, severity) = expect_notice(&mut events);
    assert!(message.contains(&address), "{}", message);
    assert_eq!(severity, MessageSeverity::Warning);

    expect_state(&mut events, SessionState::Idle);
    assert_quiet(&mut events);
    assert_eq!(manager.state(), SessionState::Idle);
}

#[test]
fn initiator_session_carries_frames_both_ways() {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    let (_transport, manager, mut events) = tcp_manager(LinkConfig::default());

    manager
        .start(Role::Initiator {
            address: addr.to_string(),
        })
        .unwrap();
    expect_state(&mut events, SessionState::Connecting);

    let (mut peer, _) = listener.accept().unwrap();
    peer.set_read_timeout(Some(EVENT_TIMEOUT)).unwrap();

    match next_event(&mut events) {
        LinkEvent::PeerIdentified(name) => assert_eq!(name, addr.to_string()),
        other => panic!("expected PeerIdentified, got {:?}", other),
    }
    let identity = expect_state(&mut events, SessionState::Connected).unwrap();
    assert_eq!(identity.address, addr.to_string());
    assert_eq!(manager.state(), SessionState::Connected);

    // Outbound: one 65-byte frame, decoded by the reference parser
    manager.write(encode_rotation_frame(&RotationMatrix::IDENTITY));
    let mut frame = [0u8; ROTATION_FRAME_LEN];
    peer.read_exact(&mut frame).unwrap();
    assert_eq!(parse_rotation_frame(&frame).unwrap(), RotationMatrix::IDENTITY);

    // Inbound: byte counts add up and order is preserved
    let mut sent = Vec::new();
    for chunk in [&b"hello "[..], &b"from the "[..], &[7u8; 3000][..]] {
        peer.write_all(chunk).unwrap();
        sent.extend_from_slice(chunk);
    }

    let mut received = Vec::new();
    while received.len() < sent.len() {
        match next_event(&mut events) {
            LinkEvent::DataReceived(bytes) => {
                assert!(!bytes.is_empty());
                received.extend(bytes);
            }
            other => panic!("expected DataReceived, got {:?}", other),
        }
    }
    assert_eq!(received, sent);

    // Peer hangs up mid-stream
    drop(peer);
    let (message, _) = expect_notice(&mut events);
    assert_eq!(message, "Device connection was lost");
    expect_state(&mut events, SessionState::Idle);
    assert_quiet(&mut events);
    assert_eq!(manager.state(), SessionState::Idle);
}

#[test]
fn accepted_session_closes_socket_on_stop() {
    let (transport, manager, mut events) = tcp_manager(LinkConfig::default());
    manager.start(Role::Responder).unwrap();
    expect_state(&mut events, SessionState::Listening);

    let mut peer = connect_peer(&transport, &mut events);

    manager.stop();
    expect_state(&mut events, SessionState::Idle);
    assert_quiet(&mut events);

    let mut buf = [0u8; 16];
    assert_eq!(peer.read(&mut buf).unwrap(), 0);
}

#[test]
fn writes_outside_a_session_are_dropped() {
    let (transport, manager, mut events) = tcp_manager(LinkConfig::default());

    manager.write(vec![1, 2, 3]);
    assert_quiet(&mut events);

    manager.start(Role::Responder).unwrap();
    expect_state(&mut events, SessionState::Listening);
    manager.write(encode_rotation_frame(&RotationMatrix::IDENTITY));

    let mut peer = connect_peer(&transport, &mut events);
    peer.set_read_timeout(Some(QUIET_PERIOD)).unwrap();
    let mut buf = [0u8; ROTATION_FRAME_LEN];
    let err = peer.read(&mut buf).unwrap_err();
    assert!(
        matches!(
            err.kind(),
            io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut
        ),
        "{:?}",
        err
    );
    assert_quiet(&mut events);
}

#[test]
fn start_while_active_is_reported() {
    let (_transport, manager, mut events) = tcp_manager(LinkConfig::default());
    manager.start(Role::Responder).unwrap();
    expect_state(&mut events, SessionState::Listening);

    assert_eq!(
        manager.start(Role::Responder).unwrap(),
        StartOutcome::AlreadyActive(SessionState::Listening)
    );
    assert_eq!(
        manager
            .start(Role::Initiator {
                address: "127.0.0.1:1".to_string()
            })
            .unwrap(),
        StartOutcome::AlreadyActive(SessionState::Listening)
    );
    assert_quiet(&mut events);
}

#[test]
fn manager_restarts_after_session_ends() {
    let (transport, manager, mut events) = tcp_manager(LinkConfig::default());

    for _ in 0..2 {
        manager.start(Role::Responder).unwrap();
        expect_state(&mut events, SessionState::Listening);
        let peer = connect_peer(&transport, &mut events);
        drop(peer);
        expect_notice(&mut events);
        expect_state(&mut events, SessionState::Idle);
    }
    assert_quiet(&mut events);
}

#[test]
fn failed_connect_can_fall_back_to_listening() {
    let config = LinkConfig {
        fallback: FailureFallback::Listen,
        ..Default::default()
    };
    let (transport, manager, mut events) = tcp_manager(config);

    manager
        .start(Role::Initiator {
            address: unreachable_addr().to_string(),
        })
        .unwrap();
    expect_state(&mut events, SessionState::Connecting);
    expect_notice(&mut events);
    expect_state(&mut events, SessionState::Listening);

    let _peer = connect_peer(&transport, &mut events);
    assert_eq!(manager.state(), SessionState::Connected);
}

#[test]
fn dropping_the_manager_ends_the_session() {
    let (transport, manager, mut events) = tcp_manager(LinkConfig::default());
    manager.start(Role::Responder).unwrap();
    expect_state(&mut events, SessionState::Listening);
    let mut peer = connect_peer(&transport, &mut events);

    drop(manager);
    let mut buf = [0u8; 4];
    assert_eq!(peer.read(&mut buf).unwrap(), 0);
}

// ── Scripted transports ──────────────────────────────────────────

/// Connects never complete; accepts fail immediately.
struct Stalled;

struct FailingAcceptor;

#[async_trait]
impl Acceptor for FailingAcceptor {
    async fn accept(&mut self) -> io::Result<TransportSocket> {
        Err(io::Error::new(io::ErrorKind::ConnectionAborted, "radio off"))
    }
}

#[async_trait]
impl Transport for Stalled {
    async fn listen(&self) -> io::Result<Box<dyn Acceptor>> {
        Ok(Box::new(FailingAcceptor))
    }

    async fn connect(&self, _address: &str) -> io::Result<TransportSocket> {
        std::future::pending().await
    }

    fn describe(&self) -> String {
        "stalled".to_string()
    }
}

/// No listening endpoint can be bound.
struct Unavailable;

#[async_trait]
impl Transport for Unavailable {
    async fn listen(&self) -> io::Result<Box<dyn Acceptor>> {
        Err(io::Error::new(io::ErrorKind::AddrInUse, "endpoint busy"))
    }

    async fn connect(&self, _address: &str) -> io::Result<TransportSocket> {
        Err(io::ErrorKind::ConnectionRefused.into())
    }

    fn describe(&self) -> String {
        "unavailable".to_string()
    }
}

#[test]
fn connect_attempt_times_out() {
    let config = LinkConfig {
        connect_timeout: Duration::from_millis(50),
        ..Default::default()
    };
    let (manager, mut events) = LinkManager::new(Arc::new(Stalled), config).unwrap();

    manager
        .start(Role::Initiator {
            address: "peer".to_string(),
        })
        .unwrap();
    expect_state(&mut events, SessionState::Connecting);
    let (message, _) = expect_notice(&mut events);
    assert!(message.contains("timed out"), "{}", message);
    expect_state(&mut events, SessionState::Idle);
}

#[test]
fn stop_cancels_pending_connect_silently() {
    let (manager, mut events) = LinkManager::new(Arc::new(Stalled), LinkConfig::default()).unwrap();

    manager
        .start(Role::Initiator {
            address: "peer".to_string(),
        })
        .unwrap();
    expect_state(&mut events, SessionState::Connecting);

    manager.stop();
    expect_state(&mut events, SessionState::Idle);
    assert_quiet(&mut events);
}

#[test]
fn accept_failure_returns_to_idle() {
    let (manager, mut events) = LinkManager::new(Arc::new(Stalled), LinkConfig::default()).unwrap();

    manager.start(Role::Responder).unwrap();
    expect_state(&mut events, SessionState::Listening);
    let (message, _) = expect_notice(&mut events);
    assert!(message.contains("radio off"), "{}", message);
    expect_state(&mut events, SessionState::Idle);
    assert_quiet(&mut events);
}

#[test]
fn unavailable_transport_refuses_to_start() {
    let (manager, mut events) =
        LinkManager::new(Arc::new(Unavailable), LinkConfig::default()).unwrap();

    assert!(manager.start(Role::Responder).is_err());
    let (message, severity) = expect_notice(&mut events);
    assert!(message.contains("endpoint busy"), "{}", message);
    assert_eq!(severity, MessageSeverity::Error);
    assert_quiet(&mut events);
    assert_eq!(manager.state(), SessionState::Idle);

    // Still usable afterwards
    manager
        .start(Role::Initiator {
            address: "peer".to_string(),
        })
        .unwrap();
    expect_state(&mut events, SessionState::Connecting);
}

/// Reads never complete.
struct SilentReader;

impl AsyncRead for SilentReader {
    fn poll_read(
        self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        _buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Poll::Pending
    }
}

/// Every write fails as if the peer had gone away.
struct BrokenWriter;

impl AsyncWrite for BrokenWriter {
    fn poll_write(
        self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        _buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Poll::Ready(Err(io::Error::new(io::ErrorKind::BrokenPipe, "broken pipe")))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }
}

/// Connects succeed onto a socket that cannot be written.
struct BrokenPipe;

#[async_trait]
impl Transport for BrokenPipe {
    async fn listen(&self) -> io::Result<Box<dyn Acceptor>> {
        Err(io::ErrorKind::Unsupported.into())
    }

    async fn connect(&self, address: &str) -> io::Result<TransportSocket> {
        Ok(TransportSocket::new(
            PeerIdentity::new(address),
            SilentReader,
            BrokenWriter,
        ))
    }

    fn describe(&self) -> String {
        "broken pipe".to_string()
    }
}

#[test]
fn write_failure_ends_the_session() {
    let (manager, mut events) =
        LinkManager::new(Arc::new(BrokenPipe), LinkConfig::default()).unwrap();

    manager
        .start(Role::Initiator {
            address: "peer".to_string(),
        })
        .unwrap();
    expect_state(&mut events, SessionState::Connecting);
    assert_eq!(
        next_event(&mut events),
        LinkEvent::PeerIdentified("peer".to_string())
    );
    expect_state(&mut events, SessionState::Connected);

    manager.write(vec![1, 2, 3]);
    let (message, severity) = expect_notice(&mut events);
    assert!(message.starts_with("Write failed"), "{}", message);
    assert_eq!(severity, MessageSeverity::Warning);
    expect_state(&mut events, SessionState::Idle);
    assert_quiet(&mut events);
    assert_eq!(manager.state(), SessionState::Idle);
}
