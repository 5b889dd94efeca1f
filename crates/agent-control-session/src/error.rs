//! Registry and session errors.

use agent_control_core::{ClientId, HandshakeError, TransportError};
use thiserror::Error;

/// Registry error.
#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("Handshake failed: {0}")]
    HandshakeFailed(#[from] HandshakeError),
    #[error("Client not found: {0}")]
    NotFound(ClientId),
    #[error("Client already connected: {0}")]
    AlreadyConnected(ClientId),
}

/// Session error.
#[derive(Debug, Error)]
pub enum SessionError {
    /// The write failed; the session is closed and deregistered.
    #[error("Client {client_id} disconnected: {source}")]
    Disconnected {
        client_id: ClientId,
        #[source]
        source: TransportError,
    },
    /// The session was already closed; nothing was written.
    #[error("Session for {0} is closed")]
    Closed(ClientId),
    #[error("Failed to encode command: {0}")]
    Encode(#[from] serde_json::Error),
}

impl SessionError {
    /// Whether the session is gone and should no longer be used.
    #[must_use]
    pub const fn is_disconnected(&self) -> bool {
        matches!(self, Self::Disconnected { .. } | Self::Closed(_))
    }
}
