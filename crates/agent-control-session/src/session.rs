//! One agent's live connection.
//!
//! A session owns its transport exclusively. All writes go through a
//! per-session send lock, so commands issued on one session reach the
//! wire complete and in call order.
//!
//! Closing the transport never waits for the send lock. A write stalled on a
//! dead connection only returns once the transport is closed, so every
//! teardown path closes the transport first and drains the lock afterwards.

use std::sync::{Arc, Mutex, PoisonError, Weak};

use agent_control_core::{
    ClientId, Command, CommandEnvelope, CommandTransport, ProcessFilter, TransportError,
};
use serde_json::Value;
use tokio::sync::watch;
use uuid::Uuid;

use crate::{error::SessionError, registry::RegistryInner};

/// Session lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Registered and accepting commands.
    Connected,
    /// `close()` is in progress.
    Closing,
    /// Terminal.
    Closed,
}

/// Live command channel to one agent.
pub struct Session {
    client_id: ClientId,
    connection_id: Uuid,
    transport: Arc<dyn CommandTransport>,
    state: Mutex<SessionState>,
    send_lock: tokio::sync::Mutex<()>,
    closed_tx: watch::Sender<bool>,
    registry: Weak<RegistryInner>,
}

impl Session {
    pub(crate) fn new(
        client_id: ClientId,
        transport: Arc<dyn CommandTransport>,
        registry: Weak<RegistryInner>,
    ) -> Arc<Self> {
        let (closed_tx, _) = watch::channel(false);
        Arc::new(Self {
            client_id,
            connection_id: Uuid::new_v4(),
            transport,
            state: Mutex::new(SessionState::Connected),
            send_lock: tokio::sync::Mutex::new(()),
            closed_tx,
            registry,
        })
    }

    /// Agent identity from the handshake.
    #[must_use]
    pub const fn client_id(&self) -> &ClientId {
        &self.client_id
    }

    /// Identifier of this particular connection.
    ///
    /// Distinguishes successive sessions of the same agent.
    #[must_use]
    pub const fn connection_id(&self) -> Uuid {
        self.connection_id
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> SessionState {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Whether the session still accepts commands.
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.state() == SessionState::Connected
    }

    /// Wait until the session reaches `Closed`.
    pub async fn closed(&self) {
        let mut rx = self.closed_tx.subscribe();
        let _ = rx.wait_for(|closed| *closed).await;
    }

    /// Send a raw `{command, data}` envelope.
    ///
    /// # Errors
    /// Returns [`SessionError::Closed`] without writing if the session is not
    /// connected, or [`SessionError::Disconnected`] if the write fails. In the
    /// latter case the session is already closed and deregistered on return.
    pub async fn send(&self, command: &str, data: Value) -> Result<(), SessionError> {
        self.write(CommandEnvelope::new(command, data)).await
    }

    /// Send a typed command.
    ///
    /// # Errors
    /// See [`Session::send`].
    pub async fn dispatch(&self, command: &Command) -> Result<(), SessionError> {
        self.write(command.to_envelope()).await
    }

    /// Replace the agent's process filter.
    ///
    /// # Errors
    /// See [`Session::send`].
    pub async fn set_filter(&self, filter: &ProcessFilter) -> Result<(), SessionError> {
        self.dispatch(&Command::SetFilter(filter.clone())).await
    }

    /// Ask the agent to shut its host down.
    ///
    /// The session stays registered until it is closed or the agent disconnects.
    ///
    /// # Errors
    /// See [`Session::send`].
    pub async fn shutdown(&self) -> Result<(), SessionError> {
        self.dispatch(&Command::Shutdown).await
    }

    /// Create or replace a script on the agent.
    ///
    /// # Errors
    /// See [`Session::send`].
    pub async fn script_update(&self, id: &str, content: &str) -> Result<(), SessionError> {
        self.dispatch(&Command::ScriptUpdate {
            id: id.to_string(),
            content: content.to_string(),
        })
        .await
    }

    /// Run a stored script on the agent.
    ///
    /// # Errors
    /// See [`Session::send`].
    pub async fn script_exec(&self, id: &str) -> Result<(), SessionError> {
        self.dispatch(&Command::ScriptExec(id.to_string())).await
    }

    /// Delete a stored script on the agent.
    ///
    /// # Errors
    /// See [`Session::send`].
    pub async fn script_remove(&self, id: &str) -> Result<(), SessionError> {
        self.dispatch(&Command::ScriptRemove(id.to_string())).await
    }

    /// Deregister the session and close its transport.
    ///
    /// Idempotent. An in-flight write is interrupted by the transport close
    /// and fails with [`SessionError::Disconnected`]; `close` returns once it has.
    pub async fn close(&self) {
        if !self.transition(SessionState::Connected, SessionState::Closing) {
            return;
        }
        self.deregister().await;
        self.release_transport().await;

        drop(self.send_lock.lock().await);
        self.mark_closed();
        tracing::info!(
            client_id = %self.client_id,
            connection_id = %self.connection_id,
            "Session closed"
        );
    }

    async fn write(&self, envelope: CommandEnvelope) -> Result<(), SessionError> {
        let _guard = self.send_lock.lock().await;
        if !self.is_connected() {
            return Err(SessionError::Closed(self.client_id.clone()));
        }

        let text = envelope.to_json()?;
        match self.transport.send(text).await {
            Ok(()) => {
                tracing::debug!(
                    client_id = %self.client_id,
                    command = %envelope.command,
                    "Command sent"
                );
                Ok(())
            }
            Err(source) => {
                tracing::warn!(
                    client_id = %self.client_id,
                    command = %envelope.command,
                    "Command send failed: {source}"
                );
                self.mark_closed();
                self.deregister().await;
                self.release_transport().await;
                Err(SessionError::Disconnected {
                    client_id: self.client_id.clone(),
                    source,
                })
            }
        }
    }

    /// Tear down after the remote end went away.
    pub(crate) async fn handle_remote_close(&self, cause: Option<TransportError>) {
        if !self.transition(SessionState::Connected, SessionState::Closed) {
            return;
        }
        self.closed_tx.send_replace(true);
        self.deregister().await;
        self.release_transport().await;
        drop(self.send_lock.lock().await);

        match cause {
            Some(e) => tracing::info!(
                client_id = %self.client_id,
                connection_id = %self.connection_id,
                "Agent connection lost: {e}"
            ),
            None => tracing::info!(
                client_id = %self.client_id,
                connection_id = %self.connection_id,
                "Agent disconnected"
            ),
        }
    }

    /// Watch the transport for a remote close and tear the session down when it happens.
    pub(crate) fn spawn_disconnect_watcher(self: &Arc<Self>) {
        let session = Arc::clone(self);
        let mut closed_rx = self.closed_tx.subscribe();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    () = async { let _ = closed_rx.wait_for(|closed| *closed).await; } => break,
                    received = session.transport.receive() => match received {
                        Ok(Some(text)) => {
                            tracing::debug!(
                                client_id = %session.client_id,
                                len = text.len(),
                                "Ignoring inbound message after handshake"
                            );
                        }
                        Ok(None) => {
                            session.handle_remote_close(None).await;
                            break;
                        }
                        Err(e) => {
                            session.handle_remote_close(Some(e)).await;
                            break;
                        }
                    },
                }
            }
        });
    }

    fn transition(&self, from: SessionState, to: SessionState) -> bool {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if *state == from {
            *state = to;
            true
        } else {
            false
        }
    }

    fn mark_closed(&self) {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner) = SessionState::Closed;
        self.closed_tx.send_replace(true);
    }

    async fn deregister(&self) {
        if let Some(registry) = self.registry.upgrade() {
            registry
                .remove_session(&self.client_id, self.connection_id)
                .await;
        }
    }

    async fn release_transport(&self) {
        if let Err(e) = self.transport.close().await {
            tracing::debug!(client_id = %self.client_id, "Transport release failed: {e}");
        }
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("client_id", &self.client_id)
            .field("connection_id", &self.connection_id)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}
