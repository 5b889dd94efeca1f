//! Session registry and command dispatch for connected agents.
//!
//! Provides:
//! - `ConnectionRegistry` - Handshake, register, look up and remove sessions
//! - `Session` - One agent's live connection and its command methods
//! - `RegistryConfig` - Handshake deadline and id-collision policy

pub mod config;
pub mod error;
pub mod registry;
pub mod session;

pub use config::{CollisionPolicy, RegistryConfig};
pub use error::{RegistryError, SessionError};
pub use registry::ConnectionRegistry;
pub use session::{Session, SessionState};
