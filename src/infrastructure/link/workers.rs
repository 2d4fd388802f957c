//! Session Workers
//!
//! The accept, connect, read and write-drain tasks spawned by the Link
//! Manager. Workers never touch manager state: they report outcomes over the
//! manager's report channel, tagged with the generation they were started
//! for, and exit silently when their cancellation token fires.

use crate::domain::models::LinkEvent;
use crate::infrastructure::link::error::LinkError;
use crate::infrastructure::link::transport::{
    Acceptor, SocketReader, SocketWriter, Transport, TransportSocket,
};
use crate::infrastructure::link::write_queue::FrameQueue;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

/// Pause before accepting again after a failed accept
const ACCEPT_RETRY_DELAY: Duration = Duration::from_millis(500);

/// Outcome reported by a worker to the Link Manager
#[derive(Debug)]
pub(crate) enum WorkerReport {
    /// An accept or connect attempt produced a socket
    Established {
        generation: u64,
        socket: TransportSocket,
    },
    AcceptFailed {
        generation: u64,
        error: LinkError,
        /// The accept loop keeps listening
        retrying: bool,
    },
    ConnectFailed {
        generation: u64,
        error: LinkError,
    },
    /// Read or write failure on an established session
    SessionFailed {
        generation: u64,
        error: LinkError,
    },
}

impl WorkerReport {
    pub(crate) fn generation(&self) -> u64 {
        match self {
            Self::Established { generation, .. }
            | Self::AcceptFailed { generation, .. }
            | Self::ConnectFailed { generation, .. }
            | Self::SessionFailed { generation, .. } => *generation,
        }
    }
}

pub(crate) type ReportSender = mpsc::UnboundedSender<WorkerReport>;

/// A spawned worker and the token that cancels it
pub(crate) struct Worker {
    name: &'static str,
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

impl Worker {
    pub(crate) fn spawn<F, Fut>(name: &'static str, f: F) -> Self
    where
        F: FnOnce(CancellationToken) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(f(cancel.clone()));
        trace!("Spawned {} worker", name);
        Self {
            name,
            cancel,
            handle,
        }
    }

    /// Cancel the worker and wait until it has exited.
    pub(crate) async fn stop(self) {
        self.cancel.cancel();
        if let Err(e) = self.handle.await {
            if e.is_panic() {
                warn!("{} worker panicked", self.name);
            }
        }
        trace!("{} worker stopped", self.name);
    }
}

/// Accept inbound connections until one succeeds.
pub(crate) async fn accept_loop(
    mut acceptor: Box<dyn Acceptor>,
    retry: bool,
    generation: u64,
    reports: ReportSender,
    cancel: CancellationToken,
) {
    loop {
        let result = tokio::select! {
            _ = cancel.cancelled() => return,
            result = acceptor.accept() => result,
        };

        match result {
            Ok(socket) => {
                info!("Accepted connection from {}", socket.peer.address);
                let _ = reports.send(WorkerReport::Established { generation, socket });
                // Dropping the acceptor closes the listening endpoint
                return;
            }
            Err(e) => {
                warn!("Accept failed: {}", e);
                let _ = reports.send(WorkerReport::AcceptFailed {
                    generation,
                    error: LinkError::AcceptFailure(e),
                    retrying: retry,
                });
                if !retry {
                    return;
                }
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = tokio::time::sleep(ACCEPT_RETRY_DELAY) => {}
                }
            }
        }
    }
}

/// Make exactly one outbound connection attempt.
pub(crate) async fn connect_once(
    transport: Arc<dyn Transport>,
    address: String,
    timeout: Duration,
    generation: u64,
    reports: ReportSender,
    cancel: CancellationToken,
) {
    let attempt = tokio::time::timeout(timeout, transport.connect(&address));
    let result = tokio::select! {
        _ = cancel.cancelled() => return,
        result = attempt => result,
    };

    let report = match result {
        Ok(Ok(socket)) => {
            info!("Connected to {}", socket.peer.address);
            WorkerReport::Established { generation, socket }
        }
        Ok(Err(source)) => WorkerReport::ConnectFailed {
            generation,
            error: LinkError::ConnectFailure { address, source },
        },
        Err(_) => WorkerReport::ConnectFailed {
            generation,
            error: LinkError::ConnectTimeout { address, timeout },
        },
    };
    let _ = reports.send(report);
}

/// Forward everything read from the socket as `DataReceived` events.
pub(crate) async fn read_loop(
    mut reader: SocketReader,
    buffer_size: usize,
    events: mpsc::UnboundedSender<LinkEvent>,
    generation: u64,
    reports: ReportSender,
    cancel: CancellationToken,
) {
    let mut buffer = vec![0u8; buffer_size];
    loop {
        let result = tokio::select! {
            _ = cancel.cancelled() => return,
            result = reader.read(&mut buffer) => result,
        };

        let error = match result {
            Ok(0) => LinkError::PeerClosed,
            Ok(n) => {
                trace!("Read {} bytes", n);
                let _ = events.send(LinkEvent::DataReceived(buffer[..n].to_vec()));
                continue;
            }
            Err(e) => LinkError::ReadFailure(e),
        };

        debug!("Read loop ending: {}", error);
        let _ = reports.send(WorkerReport::SessionFailed { generation, error });
        return;
    }
}

/// Drain the session's frame queue into the socket.
pub(crate) async fn write_loop(
    mut writer: SocketWriter,
    queue: Arc<FrameQueue>,
    generation: u64,
    reports: ReportSender,
    cancel: CancellationToken,
) {
    loop {
        let frame = tokio::select! {
            _ = cancel.cancelled() => break,
            frame = queue.next() => frame,
        };

        let result = tokio::select! {
            _ = cancel.cancelled() => break,
            result = write_frame(&mut writer, &frame) => result,
        };

        if let Err(e) = result {
            debug!("Write loop ending: {}", e);
            let _ = reports.send(WorkerReport::SessionFailed {
                generation,
                error: LinkError::WriteFailure(e),
            });
            return;
        }
    }

    let _ = writer.shutdown().await;
}

async fn write_frame(writer: &mut SocketWriter, frame: &[u8]) -> std::io::Result<()> {
    writer.write_all(frame).await?;
    writer.flush().await?;
    trace!("Wrote {} bytes", frame.len());
    Ok(())
}
