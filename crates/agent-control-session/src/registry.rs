//! Directory of live sessions keyed by client id.

use std::{collections::HashMap, sync::Arc};

use agent_control_core::{ClientId, CommandTransport, handshake};
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::{
    config::{CollisionPolicy, RegistryConfig},
    error::RegistryError,
    session::Session,
};

pub(crate) struct RegistryInner {
    config: RegistryConfig,
    sessions: RwLock<HashMap<ClientId, Arc<Session>>>,
}

impl RegistryInner {
    /// Remove `client_id` only if it still maps to the given connection.
    ///
    /// An evicted session tearing itself down must not deregister its successor.
    pub(crate) async fn remove_session(&self, client_id: &ClientId, connection_id: Uuid) {
        let mut sessions = self.sessions.write().await;
        if sessions
            .get(client_id)
            .is_some_and(|s| s.connection_id() == connection_id)
        {
            sessions.remove(client_id);
        }
    }
}

/// Registry of connected agents.
///
/// Cheap to clone; all clones share the same map.
#[derive(Clone)]
pub struct ConnectionRegistry {
    inner: Arc<RegistryInner>,
}

impl Default for ConnectionRegistry {
    fn default() -> Self {
        Self::new(RegistryConfig::default())
    }
}

impl ConnectionRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new(config: RegistryConfig) -> Self {
        Self {
            inner: Arc::new(RegistryInner {
                config,
                sessions: RwLock::new(HashMap::new()),
            }),
        }
    }

    /// Registry configuration.
    #[must_use]
    pub fn config(&self) -> &RegistryConfig {
        &self.inner.config
    }

    /// Run the handshake on a new connection and register the resulting session.
    ///
    /// On failure the transport is closed and nothing is registered.
    ///
    /// # Errors
    /// Returns [`RegistryError::HandshakeFailed`] on a missing, late or malformed
    /// hello, or [`RegistryError::AlreadyConnected`] when the id is taken and the
    /// policy is [`CollisionPolicy::RejectNew`].
    pub async fn accept<T>(&self, transport: T) -> Result<Arc<Session>, RegistryError>
    where
        T: CommandTransport + 'static,
    {
        let transport: Arc<dyn CommandTransport> = Arc::new(transport);
        let timeout = self.inner.config.handshake_timeout();

        let client_id = match handshake::read_hello(transport.as_ref(), timeout).await {
            Ok(id) => id,
            Err(e) => {
                tracing::warn!("Handshake failed: {e}");
                release(transport.as_ref()).await;
                return Err(e.into());
            }
        };

        let session = Session::new(
            client_id.clone(),
            Arc::clone(&transport),
            Arc::downgrade(&self.inner),
        );

        let previous = {
            let mut sessions = self.inner.sessions.write().await;
            if self.inner.config.collision_policy == CollisionPolicy::RejectNew
                && sessions.contains_key(&client_id)
            {
                drop(sessions);
                tracing::warn!(client_id = %client_id, "Rejecting duplicate connection");
                release(transport.as_ref()).await;
                return Err(RegistryError::AlreadyConnected(client_id));
            }
            sessions.insert(client_id.clone(), Arc::clone(&session))
        };

        if let Some(previous) = previous {
            tracing::warn!(
                client_id = %client_id,
                evicted = %previous.connection_id(),
                "Evicting previous session for reconnecting agent"
            );
            previous.close().await;
        }

        session.spawn_disconnect_watcher();
        tracing::info!(
            client_id = %client_id,
            connection_id = %session.connection_id(),
            "Agent connected"
        );
        Ok(session)
    }

    /// Get the live session for `client_id`.
    ///
    /// # Errors
    /// Returns [`RegistryError::NotFound`] if no session is registered.
    pub async fn lookup(&self, client_id: &str) -> Result<Arc<Session>, RegistryError> {
        self.inner
            .sessions
            .read()
            .await
            .get(client_id)
            .cloned()
            .ok_or_else(|| RegistryError::NotFound(ClientId::from(client_id)))
    }

    /// Deregister `client_id` and close its session.
    ///
    /// Removing an absent id is a no-op.
    pub async fn remove(&self, client_id: &str) {
        let removed = self.inner.sessions.write().await.remove(client_id);
        if let Some(session) = removed {
            session.close().await;
        }
    }

    /// Whether `client_id` has a live session.
    pub async fn contains(&self, client_id: &str) -> bool {
        self.inner.sessions.read().await.contains_key(client_id)
    }

    /// Number of live sessions.
    pub async fn len(&self) -> usize {
        self.inner.sessions.read().await.len()
    }

    /// Whether no session is registered.
    pub async fn is_empty(&self) -> bool {
        self.inner.sessions.read().await.is_empty()
    }

    /// Ids of all live sessions, sorted.
    pub async fn client_ids(&self) -> Vec<ClientId> {
        let mut ids: Vec<ClientId> = self.inner.sessions.read().await.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Close every live session.
    pub async fn close_all(&self) {
        let sessions: Vec<Arc<Session>> = self
            .inner
            .sessions
            .write()
            .await
            .drain()
            .map(|(_, session)| session)
            .collect();

        for session in sessions {
            session.close().await;
        }
    }
}

async fn release(transport: &dyn CommandTransport) {
    if let Err(e) = transport.close().await {
        tracing::debug!("Failed to close rejected connection: {e}");
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use agent_control_core::{ChannelPeer, ChannelTransport, ProcessFilter, TransportError};
    use async_trait::async_trait;
    use tokio::sync::{Notify, watch};
    use tokio_test::{assert_err, assert_ok};

    use super::*;
    use crate::{error::SessionError, session::SessionState};

    const BOUND: Duration = Duration::from_secs(3);

    /// Connection to an agent that stopped reading: writes block until `close`.
    struct StalledTransport {
        hello: std::sync::Mutex<Option<String>>,
        closed: watch::Sender<bool>,
        write_started: Arc<Notify>,
    }

    fn stalled(mac: &str) -> (StalledTransport, Arc<Notify>) {
        let write_started = Arc::new(Notify::new());
        let transport = StalledTransport {
            hello: std::sync::Mutex::new(Some(format!(r#"{{"mac":"{mac}"}}"#))),
            closed: watch::channel(false).0,
            write_started: Arc::clone(&write_started),
        };
        (transport, write_started)
    }

    impl StalledTransport {
        async fn wait_closed(&self) {
            let mut rx = self.closed.subscribe();
            let _ = rx.wait_for(|closed| *closed).await;
        }
    }

    #[async_trait]
    impl CommandTransport for StalledTransport {
        async fn send(&self, _message: String) -> Result<(), TransportError> {
            self.write_started.notify_one();
            self.wait_closed().await;
            Err(TransportError::Closed)
        }

        async fn receive(&self) -> Result<Option<String>, TransportError> {
            let hello = self.hello.lock().unwrap().take();
            if hello.is_some() {
                return Ok(hello);
            }
            self.wait_closed().await;
            Ok(None)
        }

        async fn close(&self) -> Result<(), TransportError> {
            self.closed.send_replace(true);
            Ok(())
        }
    }

    /// Register a stalled agent and leave a write hanging on it.
    async fn stalled_write(
        registry: &ConnectionRegistry,
        mac: &str,
    ) -> (Arc<Session>, tokio::task::JoinHandle<Result<(), SessionError>>) {
        let (transport, write_started) = stalled(mac);
        let session = registry.accept(transport).await.unwrap();
        let pending = {
            let session = Arc::clone(&session);
            tokio::spawn(async move { session.shutdown().await })
        };
        write_started.notified().await;
        (session, pending)
    }

    fn connect(mac: &str) -> (ChannelTransport, ChannelPeer) {
        let (transport, peer) = ChannelTransport::pair();
        peer.send(format!(r#"{{"mac":"{mac}"}}"#)).unwrap();
        (transport, peer)
    }

    #[tokio::test]
    async fn test_accept_then_lookup() {
        let registry = ConnectionRegistry::default();
        let (transport, _peer) = connect("AA:BB:CC");

        let session = assert_ok!(registry.accept(transport).await);
        assert_eq!(session.client_id().as_str(), "AA:BB:CC");
        assert_eq!(session.state(), SessionState::Connected);

        let found = assert_ok!(registry.lookup("AA:BB:CC").await);
        assert!(Arc::ptr_eq(&found, &session));
    }

    #[tokio::test]
    async fn test_malformed_handshake_leaves_registry_unchanged() {
        let registry = ConnectionRegistry::default();
        let (transport, _peer) = connect("existing");
        registry.accept(transport).await.unwrap();

        for payload in ["garbage", r#"{"mac":""}"#, r#"{"id":"x"}"#] {
            let (transport, peer) = ChannelTransport::pair();
            peer.send(payload).unwrap();

            let before = registry.len().await;
            let result = registry.accept(transport).await;
            assert!(matches!(result, Err(RegistryError::HandshakeFailed(_))));
            assert_eq!(registry.len().await, before);
            assert!(peer.is_closed());
        }
    }

    #[tokio::test]
    async fn test_closed_before_hello() {
        let registry = ConnectionRegistry::default();
        let (transport, peer) = ChannelTransport::pair();
        drop(peer);

        let result = registry.accept(transport).await;
        assert!(matches!(result, Err(RegistryError::HandshakeFailed(_))));
        assert!(registry.is_empty().await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_handshake_deadline() {
        let registry = ConnectionRegistry::new(RegistryConfig {
            handshake_timeout_secs: 2,
            ..RegistryConfig::default()
        });
        let (transport, peer) = ChannelTransport::pair();

        let result = registry.accept(transport).await;
        assert!(matches!(result, Err(RegistryError::HandshakeFailed(_))));
        assert!(peer.is_closed());
    }

    #[tokio::test]
    async fn test_lookup_missing() {
        let registry = ConnectionRegistry::default();
        let result = registry.lookup("nobody").await;
        assert!(matches!(result, Err(RegistryError::NotFound(id)) if id.as_str() == "nobody"));
    }

    #[tokio::test]
    async fn test_remove_is_idempotent() {
        let registry = ConnectionRegistry::default();
        let (transport, peer) = connect("AA");
        let session = registry.accept(transport).await.unwrap();

        registry.remove("AA").await;
        registry.remove("AA").await;
        registry.remove("never-registered").await;

        assert!(registry.is_empty().await);
        assert_eq!(session.state(), SessionState::Closed);
        assert!(peer.is_closed());
    }

    #[tokio::test]
    async fn test_concurrent_accepts() {
        let registry = ConnectionRegistry::default();
        let (t1, _p1) = connect("mac-1");
        let (t2, _p2) = connect("mac-2");

        let (r1, r2) = tokio::join!(registry.accept(t1), registry.accept(t2));
        assert_ok!(r1);
        assert_ok!(r2);

        assert_ok!(registry.lookup("mac-1").await);
        assert_ok!(registry.lookup("mac-2").await);
        assert_eq!(
            registry.client_ids().await,
            vec![ClientId::from("mac-1"), ClientId::from("mac-2")]
        );
    }

    #[tokio::test]
    async fn test_many_concurrent_accepts() {
        let registry = ConnectionRegistry::default();
        let mut handles = Vec::new();
        let mut peers = Vec::new();
        for i in 0..32 {
            let (transport, peer) = connect(&format!("agent-{i}"));
            peers.push(peer);
            let registry = registry.clone();
            handles.push(tokio::spawn(async move { registry.accept(transport).await }));
        }
        for handle in handles {
            assert_ok!(handle.await.unwrap());
        }
        assert_eq!(registry.len().await, 32);
    }

    #[tokio::test]
    async fn test_reconnect_evicts_previous_session() {
        let registry = ConnectionRegistry::default();
        let (t1, old_peer) = connect("AA");
        let old = registry.accept(t1).await.unwrap();

        let (t2, _new_peer) = connect("AA");
        let new = registry.accept(t2).await.unwrap();

        assert_eq!(old.state(), SessionState::Closed);
        assert!(old_peer.is_closed());
        assert_ne!(old.connection_id(), new.connection_id());

        let found = registry.lookup("AA").await.unwrap();
        assert!(Arc::ptr_eq(&found, &new));
        assert_eq!(registry.len().await, 1);
    }

    #[tokio::test]
    async fn test_evicted_session_teardown_keeps_successor() {
        let registry = ConnectionRegistry::default();
        let (t1, old_peer) = connect("AA");
        let old = registry.accept(t1).await.unwrap();
        let (t2, _new_peer) = connect("AA");
        let new = registry.accept(t2).await.unwrap();

        drop(old_peer);
        old.close().await;
        let err = assert_err!(old.shutdown().await);
        assert!(err.is_disconnected());

        let found = registry.lookup("AA").await.unwrap();
        assert!(Arc::ptr_eq(&found, &new));
    }

    #[tokio::test]
    async fn test_reject_new_policy() {
        let registry = ConnectionRegistry::new(RegistryConfig {
            collision_policy: CollisionPolicy::RejectNew,
            ..RegistryConfig::default()
        });
        let (t1, _p1) = connect("AA");
        let existing = registry.accept(t1).await.unwrap();

        let (t2, p2) = connect("AA");
        let result = registry.accept(t2).await;
        assert!(matches!(result, Err(RegistryError::AlreadyConnected(_))));
        assert!(p2.is_closed());

        let found = registry.lookup("AA").await.unwrap();
        assert!(Arc::ptr_eq(&found, &existing));
        assert!(existing.is_connected());
    }

    #[tokio::test]
    async fn test_send_failure_deregisters() {
        let registry = ConnectionRegistry::default();
        let (transport, mut peer) = connect("AA:BB:CC");
        let session = registry.accept(transport).await.unwrap();

        peer.stop_reading();
        let err = session
            .set_filter(&ProcessFilter::blacklist(["a"]))
            .await
            .unwrap_err();
        assert!(matches!(err, SessionError::Disconnected { .. }));
        assert_eq!(session.state(), SessionState::Closed);
        assert!(matches!(
            registry.lookup("AA:BB:CC").await,
            Err(RegistryError::NotFound(_))
        ));

        let attempts = peer.send_attempts();
        let err = session.shutdown().await.unwrap_err();
        assert!(matches!(err, SessionError::Closed(_)));
        assert!(err.is_disconnected());
        assert_eq!(peer.send_attempts(), attempts);
    }

    #[tokio::test]
    async fn test_remote_disconnect_deregisters() {
        let registry = ConnectionRegistry::default();
        let (transport, peer) = connect("AA");
        let session = registry.accept(transport).await.unwrap();

        drop(peer);
        tokio::time::timeout(Duration::from_secs(5), session.closed())
            .await
            .unwrap();

        assert_eq!(session.state(), SessionState::Closed);
        assert!(!registry.contains("AA").await);
        assert!(session.script_exec("t1").await.unwrap_err().is_disconnected());
    }

    #[tokio::test]
    async fn test_stray_inbound_messages_are_ignored() {
        let registry = ConnectionRegistry::default();
        let (transport, mut peer) = connect("AA");
        let session = registry.accept(transport).await.unwrap();

        peer.send(r#"{"unexpected":true}"#).unwrap();
        tokio::task::yield_now().await;

        assert_ok!(session.shutdown().await);
        assert_eq!(
            peer.recv().await.as_deref(),
            Some(r#"{"command":"shutdown","data":null}"#)
        );
        assert!(registry.contains("AA").await);
    }

    #[tokio::test]
    async fn test_close_all() {
        let registry = ConnectionRegistry::default();
        let (t1, p1) = connect("a");
        let (t2, p2) = connect("b");
        let s1 = registry.accept(t1).await.unwrap();
        let s2 = registry.accept(t2).await.unwrap();

        registry.close_all().await;

        assert!(registry.is_empty().await);
        assert_eq!(s1.state(), SessionState::Closed);
        assert_eq!(s2.state(), SessionState::Closed);
        assert!(p1.is_closed() && p2.is_closed());
    }

    #[tokio::test]
    async fn test_reconnect_evicts_session_with_stalled_write() {
        let registry = ConnectionRegistry::default();
        let (old, pending) = stalled_write(&registry, "AA").await;

        let (transport, _peer) = connect("AA");
        let new = tokio::time::timeout(BOUND, registry.accept(transport))
            .await
            .expect("accept blocked behind the evicted session's write")
            .unwrap();

        assert_eq!(old.state(), SessionState::Closed);
        let found = registry.lookup("AA").await.unwrap();
        assert!(Arc::ptr_eq(&found, &new));

        let err = pending.await.unwrap().unwrap_err();
        assert!(err.is_disconnected());
    }

    #[tokio::test]
    async fn test_close_interrupts_stalled_write() {
        let registry = ConnectionRegistry::default();
        let (session, pending) = stalled_write(&registry, "AA").await;

        tokio::time::timeout(BOUND, session.close())
            .await
            .expect("close blocked behind a stalled write");

        assert_eq!(session.state(), SessionState::Closed);
        assert!(registry.is_empty().await);
        assert!(pending.await.unwrap().unwrap_err().is_disconnected());
    }

    #[tokio::test]
    async fn test_close_all_with_stalled_write() {
        let registry = ConnectionRegistry::default();
        let (stuck, pending) = stalled_write(&registry, "stuck").await;
        let (transport, peer) = connect("healthy");
        let healthy = registry.accept(transport).await.unwrap();

        tokio::time::timeout(BOUND, registry.close_all())
            .await
            .expect("close_all blocked behind a stalled write");

        assert!(registry.is_empty().await);
        assert_eq!(stuck.state(), SessionState::Closed);
        assert_eq!(healthy.state(), SessionState::Closed);
        assert!(peer.is_closed());
        assert!(pending.await.unwrap().unwrap_err().is_disconnected());
    }
}
