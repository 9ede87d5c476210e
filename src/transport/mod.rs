//! Transport seam between the connection manager and the network
//!
//! A [`Transport`] opens one link at a time. A link is a pair of channels:
//! outbound [`ClientMessage`]s and inbound [`TransportSignal`]s. Closing is
//! signalled in-band (`Closed`/`Error`) and by dropping the outbound sender.
//!
//! - [`WebSocketTransport`]: tokio-tungstenite client for a real backend
//! - [`MemoryTransport`]: in-process backend, used by tests and embedders

pub mod memory;
pub mod websocket;

use std::fmt;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::error::SyncResult;
use crate::protocol::{ClientMessage, ServerMessage};

pub use memory::{AckMode, MemoryBackend, MemoryTransport};
pub use websocket::WebSocketTransport;

/// Capacity of the per-link channels
pub(crate) const LINK_CHANNEL_CAPACITY: usize = 256;

/// WebSocket close codes that mean the credentials were refused
const UNAUTHORIZED_CLOSE_CODES: [u16; 2] = [1008, 4001];

/// Why a link closed
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloseReason {
    /// Close code, if the transport provided one
    pub code: Option<u16>,
    pub message: String,
}

impl CloseReason {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            code: None,
            message: message.into(),
        }
    }

    pub fn with_code(code: u16, message: impl Into<String>) -> Self {
        Self {
            code: Some(code),
            message: message.into(),
        }
    }

    /// Whether the backend closed the link because credentials were refused
    pub fn is_unauthorized(&self) -> bool {
        self.code
            .map(|c| UNAUTHORIZED_CLOSE_CODES.contains(&c))
            .unwrap_or(false)
    }
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.code {
            Some(code) => write!(f, "{} (code: {})", self.message, code),
            None => write!(f, "{}", self.message),
        }
    }
}

/// Something that happened on an open link
#[derive(Debug, Clone, PartialEq)]
pub enum TransportSignal {
    Message(ServerMessage),
    Closed(CloseReason),
    Error(String),
}

/// One open connection to the backend
#[derive(Debug)]
pub struct TransportLink {
    pub outbound: mpsc::Sender<ClientMessage>,
    pub inbound: mpsc::Receiver<TransportSignal>,
}

impl TransportLink {
    pub fn new(
        outbound: mpsc::Sender<ClientMessage>,
        inbound: mpsc::Receiver<TransportSignal>,
    ) -> Self {
        Self { outbound, inbound }
    }
}

/// Opens links to the backend event source
#[async_trait]
pub trait Transport: Send + Sync {
    /// Establish a new link. Fails with `SyncError::Connection`.
    async fn connect(&self) -> SyncResult<TransportLink>;

    /// Human-readable target, for logs
    fn describe(&self) -> String;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unauthorized_close_codes() {
        assert!(CloseReason::with_code(4001, "token expired").is_unauthorized());
        assert!(CloseReason::with_code(1008, "policy").is_unauthorized());
        assert!(!CloseReason::with_code(1000, "bye").is_unauthorized());
        assert!(!CloseReason::new("reset").is_unauthorized());
    }

    #[test]
    fn test_close_reason_display() {
        assert_eq!(
            CloseReason::with_code(1006, "abnormal").to_string(),
            "abnormal (code: 1006)"
        );
        assert_eq!(CloseReason::new("stream ended").to_string(), "stream ended");
    }
}
