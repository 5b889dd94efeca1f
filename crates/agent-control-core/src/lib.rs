//! Core abstractions for the agent control channel.
//!
//! This crate provides the fundamental building blocks:
//! - `ClientId` - Stable agent identity (hardware MAC address)
//! - `CommandEnvelope` / `Command` - Wire envelope and typed command catalog
//! - `ProcessFilter` - Process watch/block filters and their wire form
//! - `CommandTransport` - Message transport trait owned by a session
//! - Handshake protocol and an in-memory `ChannelTransport`

pub mod channel;
pub mod filter;
pub mod handshake;
pub mod protocol;
pub mod traits;

pub use channel::{ChannelPeer, ChannelTransport};
pub use filter::ProcessFilter;
pub use handshake::{HandshakeError, HelloMessage};
pub use protocol::{ClientId, Command, CommandEnvelope, ProtocolError};
pub use traits::{CommandTransport, TransportError};
