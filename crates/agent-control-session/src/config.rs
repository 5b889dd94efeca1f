//! Registry configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// What to do when an agent connects with an id that already has a live session.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CollisionPolicy {
    /// Close the existing session and register the new connection.
    #[default]
    EvictExisting,
    /// Close the new connection and keep the existing session.
    RejectNew,
}

/// Registry configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistryConfig {
    /// Upper bound on the wait for an agent's hello message.
    pub handshake_timeout_secs: u64,
    /// Policy for a second live connection under the same id.
    pub collision_policy: CollisionPolicy,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            handshake_timeout_secs: 10,
            collision_policy: CollisionPolicy::default(),
        }
    }
}

impl RegistryConfig {
    /// Handshake deadline as a [`Duration`].
    #[must_use]
    pub const fn handshake_timeout(&self) -> Duration {
        Duration::from_secs(self.handshake_timeout_secs)
    }
}
