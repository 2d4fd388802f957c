use serde::{Deserialize, Serialize};
use std::fmt;

/// Lifecycle state of the Link Manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SessionState {
    #[default]
    Idle,
    Listening,
    Connecting,
    Connected,
}

impl SessionState {
    /// Anything other than `Idle` counts as an active link.
    pub fn is_active(&self) -> bool {
        !matches!(self, Self::Idle)
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Idle => write!(f, "Idle"),
            Self::Listening => write!(f, "Listening"),
            Self::Connecting => write!(f, "Connecting"),
            Self::Connected => write!(f, "Connected"),
        }
    }
}

/// Address and optional display name of the remote end of a session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerIdentity {
    pub address: String,
    pub name: Option<String>,
}

impl PeerIdentity {
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            name: None,
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// The name to show a user, falling back to the address
    pub fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or(&self.address)
    }
}

/// How the Link Manager should establish a session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Role {
    /// Wait for a peer to connect to us
    Responder,
    /// Dial the peer at `address`
    Initiator { address: String },
}

/// Result of a `start()` call that reached the Link Manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartOutcome {
    Started,
    /// The manager was not idle; nothing was changed.
    AlreadyActive(SessionState),
}

/// Events delivered, in order, to the owner of a Link Manager.
#[derive(Debug, Clone, PartialEq)]
pub enum LinkEvent {
    StateChanged {
        state: SessionState,
        peer: Option<PeerIdentity>,
    },
    /// Exactly the bytes returned by one socket read.
    DataReceived(Vec<u8>),
    PeerIdentified(String),
    Notice(StatusMessage),
}

impl LinkEvent {
    pub(crate) fn notice(message: impl Into<String>, severity: MessageSeverity) -> Self {
        Self::Notice(StatusMessage {
            message: message.into(),
            severity,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusMessage {
    pub message: String,
    pub severity: MessageSeverity,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageSeverity {
    Info,
    Success,
    Warning,
    Error,
}
