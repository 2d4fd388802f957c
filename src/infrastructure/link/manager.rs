//! Link Manager
//!
//! Session state machine. A [`LinkManager`] is a thread-safe handle; the
//! state, the active socket and every worker handle are owned by an actor
//! running on a dedicated `link-manager` thread, and all transitions happen
//! inside that actor one at a time.
//!
//! ```text
//!            start(Responder)             accept ok
//!   Idle ─────────────────────► Listening ──────────┐
//!    ▲ ▲                            │ stop()        ▼
//!    │ └────────────────────────────┘           Connected
//!    │       start(Initiator)         connect ok    ▲ │ read/write
//!    ├──────────────────────► Connecting ───────────┘ │ failure, stop()
//!    │      connect failed        │                   │
//!    └────────────────────────────┴───────────────────┘
//! ```

use crate::domain::models::{
    LinkEvent, MessageSeverity, PeerIdentity, Role, SessionState, StartOutcome,
};
use crate::infrastructure::link::error::LinkError;
use crate::infrastructure::link::transport::{Transport, TransportSocket};
use crate::infrastructure::link::workers::{self, ReportSender, Worker, WorkerReport};
use crate::infrastructure::link::write_queue::{FrameQueue, QueueConfig};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, trace, warn};

/// Where the manager goes when establishing a session fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureFallback {
    /// Return to `Idle`; the caller decides whether to start again
    #[default]
    Idle,
    /// Keep (or start) listening as a responder
    Listen,
}

/// Configuration for session behavior
#[derive(Debug, Clone)]
pub struct LinkConfig {
    /// Upper bound for a single outbound connection attempt
    pub connect_timeout: Duration,
    /// Applied after a failed connect or accept
    pub fallback: FailureFallback,
    /// Size of the Read Worker's buffer
    pub read_buffer_size: usize,
    pub write_queue: QueueConfig,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(12),
            fallback: FailureFallback::Idle,
            read_buffer_size: 1024,
            write_queue: QueueConfig::default(),
        }
    }
}

enum Command {
    Start {
        role: Role,
        ack: oneshot::Sender<Result<StartOutcome, LinkError>>,
    },
    Stop {
        ack: oneshot::Sender<()>,
    },
}

/// State visible to callers without a round trip to the actor.
#[derive(Default)]
struct Shared {
    state: SessionState,
    /// Present iff `state` is `Connected`
    outbound: Option<Arc<FrameQueue>>,
}

fn lock(shared: &Mutex<Shared>) -> MutexGuard<'_, Shared> {
    shared.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Handle to a running Link Manager.
///
/// `start` and `stop` block the calling thread until the actor has applied
/// them and must not be called from inside an async context. `state` and
/// `write` never wait on the actor.
pub struct LinkManager {
    commands: Option<mpsc::UnboundedSender<Command>>,
    shared: Arc<Mutex<Shared>>,
    thread: Option<thread::JoinHandle<()>>,
}

impl LinkManager {
    /// Spawn the manager thread. Events are delivered on the returned
    /// receiver in the order they are produced.
    pub fn new(
        transport: Arc<dyn Transport>,
        config: LinkConfig,
    ) -> Result<(Self, mpsc::UnboundedReceiver<LinkEvent>), LinkError> {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .map_err(LinkError::Runtime)?;

        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (report_tx, report_rx) = mpsc::unbounded_channel();
        let shared = Arc::new(Mutex::new(Shared::default()));

        info!("Starting link manager over {}", transport.describe());
        let actor = LinkActor {
            transport,
            config,
            shared: shared.clone(),
            events: event_tx,
            reports: report_tx,
            generation: 0,
            establishing: None,
            session: None,
        };

        let thread = thread::Builder::new()
            .name("link-manager".to_string())
            .spawn(move || runtime.block_on(actor.run(command_rx, report_rx)))
            .map_err(LinkError::Runtime)?;

        Ok((
            Self {
                commands: Some(command_tx),
                shared,
                thread: Some(thread),
            },
            event_rx,
        ))
    }

    /// Start listening (responder) or dialling (initiator).
    ///
    /// Only acts from `Idle`; otherwise returns `AlreadyActive` and changes
    /// nothing.
    pub fn start(&self, role: Role) -> Result<StartOutcome, LinkError> {
        let (ack, done) = oneshot::channel();
        self.send(Command::Start { role, ack })?;
        done.blocking_recv().map_err(|_| LinkError::ManagerClosed)?
    }

    /// Stop whatever the manager is doing and return to `Idle`.
    ///
    /// When this returns, every worker has exited, the socket is closed and
    /// no further events will be emitted for the stopped session.
    pub fn stop(&self) {
        let (ack, done) = oneshot::channel();
        if self.send(Command::Stop { ack }).is_ok() {
            let _ = done.blocking_recv();
        }
    }

    /// Current state snapshot
    pub fn state(&self) -> SessionState {
        lock(&self.shared).state
    }

    /// Queue a frame for the connected peer.
    ///
    /// Frames written while not `Connected` are dropped without error.
    pub fn write(&self, frame: impl Into<Vec<u8>>) {
        let shared = lock(&self.shared);
        match (&shared.outbound, shared.state) {
            (Some(queue), SessionState::Connected) => {
                if !queue.push(frame.into()) {
                    trace!("Write queue full, frame replaced");
                }
            }
            _ => trace!("Dropping frame written while {}", shared.state),
        }
    }

    fn send(&self, command: Command) -> Result<(), LinkError> {
        self.commands
            .as_ref()
            .ok_or(LinkError::ManagerClosed)?
            .send(command)
            .map_err(|_| LinkError::ManagerClosed)
    }
}

impl Drop for LinkManager {
    fn drop(&mut self) {
        // Closing the command channel makes the actor tear down and exit
        self.commands.take();
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                error!("Link manager thread panicked");
            }
        }
    }
}

/// An established session: the peer plus the workers holding the socket
/// halves.
struct Session {
    peer: PeerIdentity,
    reader: Worker,
    writer: Worker,
}

struct LinkActor {
    transport: Arc<dyn Transport>,
    config: LinkConfig,
    shared: Arc<Mutex<Shared>>,
    events: mpsc::UnboundedSender<LinkEvent>,
    reports: ReportSender,
    /// Bumped whenever workers are started or torn down; reports from older
    /// generations are stale
    generation: u64,
    /// Accept or connect worker, never both
    establishing: Option<Worker>,
    session: Option<Session>,
}

impl LinkActor {
    async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<Command>,
        mut reports: mpsc::UnboundedReceiver<WorkerReport>,
    ) {
        loop {
            tokio::select! {
                biased;
                command = commands.recv() => match command {
                    Some(Command::Start { role, ack }) => {
                        let outcome = self.start(role).await;
                        let _ = ack.send(outcome);
                    }
                    Some(Command::Stop { ack }) => {
                        self.stop().await;
                        let _ = ack.send(());
                    }
                    None => break,
                },
                Some(report) = reports.recv() => self.handle_report(report).await,
            }
        }

        self.stop().await;
        debug!("Link manager exited");
    }

    fn state(&self) -> SessionState {
        lock(&self.shared).state
    }

    fn set_state(&self, state: SessionState, outbound: Option<Arc<FrameQueue>>) {
        let mut shared = lock(&self.shared);
        debug!("Link state {} -> {}", shared.state, state);
        shared.state = state;
        shared.outbound = outbound;
    }

    fn emit(&self, event: LinkEvent) {
        // The owner may have dropped the receiver; nothing to do then
        let _ = self.events.send(event);
    }

    fn transition(&self, state: SessionState, peer: Option<PeerIdentity>) {
        self.set_state(state, None);
        self.emit(LinkEvent::StateChanged { state, peer });
    }

    fn notice(&self, message: impl Into<String>, severity: MessageSeverity) {
        self.emit(LinkEvent::notice(message, severity));
    }

    fn next_generation(&mut self) -> u64 {
        self.generation += 1;
        self.generation
    }

    async fn start(&mut self, role: Role) -> Result<StartOutcome, LinkError> {
        let current = self.state();
        if current.is_active() {
            debug!("Ignoring start while {}", current);
            return Ok(StartOutcome::AlreadyActive(current));
        }

        match role {
            Role::Responder => self.begin_listening().await?,
            Role::Initiator { address } => self.begin_connecting(address),
        }
        Ok(StartOutcome::Started)
    }

    async fn begin_listening(&mut self) -> Result<(), LinkError> {
        let acceptor = match self.transport.listen().await {
            Ok(acceptor) => acceptor,
            Err(e) => {
                let error = LinkError::TransportUnavailable(e);
                error!("{}", error);
                self.notice(error.to_string(), MessageSeverity::Error);
                return Err(error);
            }
        };

        let generation = self.next_generation();
        let retry = self.config.fallback == FailureFallback::Listen;
        let reports = self.reports.clone();
        self.establishing = Some(Worker::spawn("accept", move |cancel| {
            workers::accept_loop(acceptor, retry, generation, reports, cancel)
        }));
        self.transition(SessionState::Listening, None);
        Ok(())
    }

    fn begin_connecting(&mut self, address: String) {
        info!("Connecting to {}", address);
        let generation = self.next_generation();
        let transport = self.transport.clone();
        let timeout = self.config.connect_timeout;
        let reports = self.reports.clone();
        self.establishing = Some(Worker::spawn("connect", move |cancel| {
            workers::connect_once(transport, address, timeout, generation, reports, cancel)
        }));
        self.transition(SessionState::Connecting, None);
    }

    async fn handle_report(&mut self, report: WorkerReport) {
        if report.generation() != self.generation {
            trace!("Discarding stale report from generation {}", report.generation());
            return;
        }

        match report {
            WorkerReport::Established { socket, .. } => {
                if let Some(worker) = self.establishing.take() {
                    worker.stop().await;
                }
                self.enter_connected(socket);
            }
            WorkerReport::AcceptFailed {
                error, retrying, ..
            } => {
                self.notice(error.to_string(), MessageSeverity::Warning);
                if !retrying {
                    if let Some(worker) = self.establishing.take() {
                        worker.stop().await;
                    }
                    self.generation += 1;
                    self.transition(SessionState::Idle, None);
                }
            }
            WorkerReport::ConnectFailed { error, .. } => {
                warn!("{}", error);
                if let Some(worker) = self.establishing.take() {
                    worker.stop().await;
                }
                self.generation += 1;
                // Recoverable: only an unusable transport is an Error
                self.notice(error.to_string(), MessageSeverity::Warning);

                match self.config.fallback {
                    FailureFallback::Idle => self.transition(SessionState::Idle, None),
                    FailureFallback::Listen => {
                        if self.begin_listening().await.is_err() {
                            self.transition(SessionState::Idle, None);
                        }
                    }
                }
            }
            WorkerReport::SessionFailed { error, .. } => {
                let peer = self.close_session().await;
                let name = peer
                    .as_ref()
                    .map(|p| p.display_name().to_string())
                    .unwrap_or_default();
                match error {
                    LinkError::PeerClosed => info!("{} closed the link", name),
                    ref other => warn!("Session with {} failed: {}", name, other),
                }
                self.notice(error.to_string(), MessageSeverity::Warning);
                self.transition(SessionState::Idle, None);
            }
        }
    }

    fn enter_connected(&mut self, socket: TransportSocket) {
        let TransportSocket {
            peer,
            reader,
            writer,
        } = socket;
        let generation = self.next_generation();
        let queue = Arc::new(FrameQueue::new(self.config.write_queue));

        self.set_state(SessionState::Connected, Some(queue.clone()));
        info!("Connected to {}", peer.display_name());
        self.emit(LinkEvent::PeerIdentified(peer.display_name().to_string()));
        self.emit(LinkEvent::StateChanged {
            state: SessionState::Connected,
            peer: Some(peer.clone()),
        });

        // Spawned after StateChanged(Connected) so no data can precede it
        let buffer_size = self.config.read_buffer_size;
        let events = self.events.clone();
        let reports = self.reports.clone();
        let reader = Worker::spawn("read", move |cancel| {
            workers::read_loop(reader, buffer_size, events, generation, reports, cancel)
        });
        let reports = self.reports.clone();
        let writer = Worker::spawn("write", move |cancel| {
            workers::write_loop(writer, queue, generation, reports, cancel)
        });

        self.session = Some(Session {
            peer,
            reader,
            writer,
        });
    }

    /// Cancel and join the session workers, closing the socket.
    async fn close_session(&mut self) -> Option<PeerIdentity> {
        let session = self.session.take()?;
        self.generation += 1;
        // Stop accepting frames before the drainer goes away
        lock(&self.shared).outbound = None;
        session.reader.stop().await;
        session.writer.stop().await;
        debug!("Closed session with {}", session.peer.display_name());
        Some(session.peer)
    }

    async fn stop(&mut self) {
        let was_active = self.state().is_active();

        if let Some(worker) = self.establishing.take() {
            self.generation += 1;
            worker.stop().await;
        }
        if self.close_session().await.is_some() {
            info!("Disconnected");
        }

        if was_active {
            self.transition(SessionState::Idle, None);
        }
    }
}
