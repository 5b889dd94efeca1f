//! Transport layer for agent connections.
//!
//! Provides:
//! - WebSocket `CommandTransport` over axum (feature: websocket)
//! - Router mounting the agent endpoint and announcing new sessions

#[cfg(feature = "websocket")]
pub mod websocket;

#[cfg(feature = "websocket")]
pub use websocket::{ControlState, WsTransport, control_router};
