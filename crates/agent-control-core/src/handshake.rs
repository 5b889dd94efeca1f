//! Connection handshake.
//!
//! The first message an agent sends is a hello carrying its MAC address.
//! Nothing else is read from the connection afterwards; the channel is
//! server-push only once the handshake completes.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{
    protocol::ClientId,
    traits::{CommandTransport, TransportError},
};

/// Hello message sent by an agent right after connecting.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HelloMessage {
    pub mac: String,
}

impl HelloMessage {
    /// Create a hello message.
    #[must_use]
    pub fn new(mac: impl Into<String>) -> Self {
        Self { mac: mac.into() }
    }

    /// Parse and validate a hello message.
    ///
    /// # Errors
    /// Returns error if the text is not `{"mac": <string>}` or the MAC is empty.
    pub fn parse(text: &str) -> Result<Self, HandshakeError> {
        let hello: Self = serde_json::from_str(text)?;
        if hello.mac.trim().is_empty() {
            return Err(HandshakeError::EmptyMac);
        }
        Ok(hello)
    }
}

/// Handshake error.
#[derive(Debug, Error)]
pub enum HandshakeError {
    #[error("No hello message within {0:?}")]
    Timeout(Duration),
    #[error("Connection closed before hello message")]
    TransportClosed,
    #[error("Malformed hello message: {0}")]
    Malformed(#[from] serde_json::Error),
    #[error("Hello message has an empty mac")]
    EmptyMac,
    #[error("Transport error during handshake: {0}")]
    Transport(#[from] TransportError),
}

/// Wait for the hello message and return the agent's identity.
///
/// Exactly one message is read. The wait is bounded by `timeout`.
///
/// # Errors
/// Returns error on timeout, early close, or a malformed hello.
pub async fn read_hello(
    transport: &dyn CommandTransport,
    timeout: Duration,
) -> Result<ClientId, HandshakeError> {
    let received = tokio::time::timeout(timeout, transport.receive())
        .await
        .map_err(|_| HandshakeError::Timeout(timeout))?;

    let text = match received {
        Ok(Some(text)) => text,
        Ok(None) | Err(TransportError::Closed) => return Err(HandshakeError::TransportClosed),
        Err(e) => return Err(e.into()),
    };

    let hello = HelloMessage::parse(&text)?;
    tracing::debug!(mac = %hello.mac, "Received hello");
    Ok(ClientId::new(hello.mac))
}
