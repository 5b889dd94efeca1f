//! Core transport trait.

use async_trait::async_trait;
use thiserror::Error;

/// Transport error.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("Connection closed")]
    Closed,
    #[error("Transport I/O error: {0}")]
    Io(String),
}

/// One message-oriented, full-duplex connection to an agent.
///
/// Implementations take `&self` so that a session can hold the transport
/// behind an `Arc` and read from it while a send is in flight. Callers are
/// responsible for never issuing two sends concurrently.
#[async_trait]
pub trait CommandTransport: Send + Sync {
    /// Write one text message.
    async fn send(&self, message: String) -> Result<(), TransportError>;

    /// Read the next text message.
    ///
    /// Returns `Ok(None)` once the remote side has closed the connection.
    async fn receive(&self) -> Result<Option<String>, TransportError>;

    /// Close the connection gracefully.
    async fn close(&self) -> Result<(), TransportError>;
}
