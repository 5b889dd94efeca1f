//! In-memory transport backed by tokio channels.
//!
//! Useful for tests and for embedding an agent in the same process.
//! [`ChannelTransport`] is the server end; [`ChannelPeer`] plays the agent.

use std::sync::{
    Arc,
    atomic::{AtomicBool, AtomicUsize, Ordering},
};

use async_trait::async_trait;
use tokio::sync::{Mutex, mpsc};

use crate::traits::{CommandTransport, TransportError};

#[derive(Default)]
struct Shared {
    send_attempts: AtomicUsize,
    closed: AtomicBool,
}

/// Server end of an in-memory connection.
pub struct ChannelTransport {
    outbound: Mutex<Option<mpsc::UnboundedSender<String>>>,
    inbound: Mutex<mpsc::UnboundedReceiver<String>>,
    shared: Arc<Shared>,
}

/// Agent end of an in-memory connection.
pub struct ChannelPeer {
    outbound: Option<mpsc::UnboundedReceiver<String>>,
    inbound: mpsc::UnboundedSender<String>,
    shared: Arc<Shared>,
}

impl ChannelTransport {
    /// Create a connected transport/peer pair.
    #[must_use]
    pub fn pair() -> (Self, ChannelPeer) {
        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let (in_tx, in_rx) = mpsc::unbounded_channel();
        let shared = Arc::new(Shared::default());

        let transport = Self {
            outbound: Mutex::new(Some(out_tx)),
            inbound: Mutex::new(in_rx),
            shared: Arc::clone(&shared),
        };
        let peer = ChannelPeer {
            outbound: Some(out_rx),
            inbound: in_tx,
            shared,
        };
        (transport, peer)
    }
}

#[async_trait]
impl CommandTransport for ChannelTransport {
    async fn send(&self, message: String) -> Result<(), TransportError> {
        self.shared.send_attempts.fetch_add(1, Ordering::SeqCst);
        let outbound = self.outbound.lock().await;
        let tx = outbound.as_ref().ok_or(TransportError::Closed)?;
        tx.send(message).map_err(|_| TransportError::Closed)
    }

    async fn receive(&self) -> Result<Option<String>, TransportError> {
        Ok(self.inbound.lock().await.recv().await)
    }

    async fn close(&self) -> Result<(), TransportError> {
        self.shared.closed.store(true, Ordering::SeqCst);
        self.outbound.lock().await.take();
        Ok(())
    }
}

impl ChannelPeer {
    /// Send a message to the server end.
    ///
    /// # Errors
    /// Returns error if the server end has been dropped.
    pub fn send(&self, message: impl Into<String>) -> Result<(), TransportError> {
        self.inbound
            .send(message.into())
            .map_err(|_| TransportError::Closed)
    }

    /// Wait for the next message from the server end.
    ///
    /// Returns `None` once the server end is closed or dropped.
    pub async fn recv(&mut self) -> Option<String> {
        match self.outbound.as_mut() {
            Some(rx) => rx.recv().await,
            None => None,
        }
    }

    /// Take a message if one is already queued.
    pub fn try_recv(&mut self) -> Option<String> {
        self.outbound.as_mut().and_then(|rx| rx.try_recv().ok())
    }

    /// Stop accepting messages while keeping the connection half-open.
    ///
    /// Every later write on the server end fails with [`TransportError::Closed`].
    pub fn stop_reading(&mut self) {
        self.outbound = None;
    }

    /// Number of writes the server end has attempted, failed ones included.
    #[must_use]
    pub fn send_attempts(&self) -> usize {
        self.shared.send_attempts.load(Ordering::SeqCst)
    }

    /// Whether the server end closed the connection.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::SeqCst)
    }
}
