//! Link Module
//!
//! Point-to-point session between the sensor device and one peer.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────┐
//! │                      LinkManager                         │
//! │  (state machine - public API for the application)        │
//! └─────────────────────┬───────────────────────────────────┘
//!                       │ spawns / cancels
//!         ┌─────────────┼──────────────┐
//!         ▼             ▼              ▼
//! ┌─────────────┐ ┌───────────┐ ┌─────────────┐
//! │ Accept /    │ │   Read    │ │ Write drain │
//! │ Connect     │ │  Worker   │ │ (FrameQueue)│
//! └──────┬──────┘ └─────┬─────┘ └──────┬──────┘
//!        └──────────────┼──────────────┘
//!                       ▼
//!                  Transport (TCP / local socket)
//! ```
//!
//! ## Modules
//!
//! - [`protocol`] - Rotation frame wire layout and reassembly
//! - [`transport`] - Listening and dialling over concrete byte streams
//! - [`write_queue`] - Bounded outbound frame queue
//! - [`manager`] - Session state machine
//! - [`error`] - Link and frame errors

pub mod error;
pub mod manager;
pub mod protocol;
pub mod transport;
pub mod write_queue;

mod workers;

pub use error::{FrameError, LinkError};
pub use manager::{FailureFallback, LinkConfig, LinkManager};
pub use transport::{LocalSocketTransport, TcpTransport, Transport, TransportKind};
