//! WebSocket transport for agent connections.

use std::sync::Arc;

use agent_control_core::{CommandTransport, TransportError};
use agent_control_session::{ConnectionRegistry, Session};
use async_trait::async_trait;
use axum::{
    extract::{
        State, WebSocketUpgrade,
        ws::{Message, WebSocket},
    },
    response::IntoResponse,
};
use futures::{
    SinkExt, StreamExt,
    stream::{SplitSink, SplitStream},
};
use tokio::sync::{Mutex, mpsc};
use tokio_util::sync::CancellationToken;

/// [`CommandTransport`] over an upgraded axum WebSocket.
///
/// The socket is split so a pending read never blocks a write. `close`
/// cancels a write stalled on a dead peer before taking the sink.
pub struct WsTransport {
    sink: Mutex<SplitSink<WebSocket, Message>>,
    stream: Mutex<SplitStream<WebSocket>>,
    closing: CancellationToken,
}

impl WsTransport {
    /// Wrap an upgraded socket.
    #[must_use]
    pub fn new(socket: WebSocket) -> Self {
        let (sink, stream) = socket.split();
        Self {
            sink: Mutex::new(sink),
            stream: Mutex::new(stream),
            closing: CancellationToken::new(),
        }
    }
}

#[async_trait]
impl CommandTransport for WsTransport {
    async fn send(&self, message: String) -> Result<(), TransportError> {
        tokio::select! {
            biased;

            () = self.closing.cancelled() => Err(TransportError::Closed),

            result = async {
                self.sink
                    .lock()
                    .await
                    .send(Message::Text(message.into()))
                    .await
            } => result.map_err(|e| TransportError::Io(e.to_string())),
        }
    }

    async fn receive(&self) -> Result<Option<String>, TransportError> {
        let mut stream = self.stream.lock().await;
        loop {
            match stream.next().await {
                Some(Ok(Message::Text(text))) => return Ok(Some(text.as_str().to_owned())),
                Some(Ok(Message::Binary(data))) => match String::from_utf8(data.to_vec()) {
                    Ok(text) => return Ok(Some(text)),
                    Err(_) => {
                        tracing::debug!("Dropping non-UTF-8 binary frame");
                    }
                },
                Some(Ok(Message::Close(_))) | None => return Ok(None),
                Some(Ok(_)) => {}
                Some(Err(e)) => return Err(TransportError::Io(e.to_string())),
            }
        }
    }

    async fn close(&self) -> Result<(), TransportError> {
        self.closing.cancel();
        let mut sink = self.sink.lock().await;
        sink.send(Message::Close(None))
            .await
            .map_err(|e| TransportError::Io(e.to_string()))?;
        sink.close()
            .await
            .map_err(|e| TransportError::Io(e.to_string()))
    }
}

/// Agent endpoint state.
#[derive(Clone)]
pub struct ControlState {
    /// Registry that accepted connections are registered in.
    pub registry: ConnectionRegistry,
    connected_tx: Option<mpsc::UnboundedSender<Arc<Session>>>,
}

impl ControlState {
    /// Create endpoint state without connect notifications.
    #[must_use]
    pub const fn new(registry: ConnectionRegistry) -> Self {
        Self {
            registry,
            connected_tx: None,
        }
    }

    /// Create endpoint state that announces every newly registered session.
    #[must_use]
    pub fn with_notifier(
        registry: ConnectionRegistry,
    ) -> (Self, mpsc::UnboundedReceiver<Arc<Session>>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let state = Self {
            registry,
            connected_tx: Some(tx),
        };
        (state, rx)
    }
}

/// WebSocket upgrade handler for agents.
///
/// Use this as an Axum route handler.
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<ControlState>,
) -> impl IntoResponse {
    ws.on_upgrade(|socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: ControlState) {
    let session = match state.registry.accept(WsTransport::new(socket)).await {
        Ok(session) => session,
        Err(e) => {
            tracing::warn!("Agent connection rejected: {e}");
            return;
        }
    };

    if let Some(tx) = &state.connected_tx {
        if tx.send(session).is_err() {
            tracing::debug!("No listener for new sessions");
        }
    }
}

/// Create the agent router.
///
/// # Example
/// ```ignore
/// let app = Router::new()
///     .merge(control_router("/client/socket", ControlState::new(registry)));
/// ```
#[must_use]
pub fn control_router(path: &str, state: ControlState) -> axum::Router {
    axum::Router::new()
        .route(path, axum::routing::get(ws_handler))
        .with_state(state)
}
