//! Error types for the link layer

use std::io;
use std::time::Duration;
use thiserror::Error;

/// Errors raised while establishing or running a session.
#[derive(Error, Debug)]
pub enum LinkError {
    /// The medium could not be opened at all (e.g. the endpoint cannot be bound)
    #[error("Transport unavailable: {0}")]
    TransportUnavailable(#[source] io::Error),

    #[error("Unable to accept connection: {0}")]
    AcceptFailure(#[source] io::Error),

    #[error("Unable to connect to {address}: {source}")]
    ConnectFailure {
        address: String,
        #[source]
        source: io::Error,
    },

    #[error("Connection to {address} timed out after {timeout:?}")]
    ConnectTimeout { address: String, timeout: Duration },

    #[error("Device connection was lost")]
    PeerClosed,

    #[error("Read failed: {0}")]
    ReadFailure(#[source] io::Error),

    #[error("Write failed: {0}")]
    WriteFailure(#[source] io::Error),

    #[error("Link manager is not running")]
    ManagerClosed,

    #[error("Failed to start link manager: {0}")]
    Runtime(#[source] io::Error),
}

/// Errors raised while decoding a rotation frame.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum FrameError {
    #[error("Invalid frame length: expected {expected}, got {actual}")]
    InvalidLength { expected: usize, actual: usize },

    #[error("Unknown frame tag: {0:#04x}")]
    UnknownTag(u8),
}
