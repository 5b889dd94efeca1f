//! Wire protocol for server-to-agent commands.

use std::{borrow::Borrow, fmt};

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use crate::filter::ProcessFilter;

/// Command name: replace the process watcher filter.
pub const SET_FILTER: &str = "processes-watcher-set-filter";
/// Command name: shut the agent's host down.
pub const SHUTDOWN: &str = "shutdown";
/// Command name: create or replace a script.
pub const SCRIPTS_UPDATE: &str = "scripts-update";
/// Command name: execute a stored script.
pub const SCRIPTS_EXEC: &str = "scripts-exec";
/// Command name: delete a stored script.
pub const SCRIPTS_REMOVE: &str = "scripts-remove";

/// Stable agent identity, a MAC address in practice.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ClientId(String);

impl ClientId {
    /// Create a client id.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Borrow as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ClientId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

impl From<String> for ClientId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

impl Borrow<str> for ClientId {
    fn borrow(&self) -> &str {
        &self.0
    }
}

/// The `{command, data}` unit written for every command.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandEnvelope {
    pub command: String,
    pub data: Value,
}

impl CommandEnvelope {
    /// Create an envelope.
    #[must_use]
    pub fn new(command: impl Into<String>, data: Value) -> Self {
        Self {
            command: command.into(),
            data,
        }
    }

    /// Serialize to the JSON text sent on the wire.
    ///
    /// # Errors
    /// Returns error if the payload cannot be serialized.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Parse an envelope received from the wire.
    ///
    /// # Errors
    /// Returns error if the text is not a `{command, data}` object.
    pub fn from_json(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }
}

/// Protocol decoding error.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("Unknown command: {0}")]
    UnknownCommand(String),
    #[error("Invalid data for {command}: {source}")]
    InvalidData {
        command: &'static str,
        #[source]
        source: serde_json::Error,
    },
}

#[derive(Deserialize)]
struct ScriptUpdate {
    id: String,
    content: String,
}

/// Typed command catalog.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Replace the agent's process filter.
    SetFilter(ProcessFilter),
    /// Shut the agent's host down.
    Shutdown,
    /// Create or replace a script.
    ScriptUpdate { id: String, content: String },
    /// Execute a stored script.
    ScriptExec(String),
    /// Delete a stored script.
    ScriptRemove(String),
}

impl Command {
    /// Wire name of this command.
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::SetFilter(_) => SET_FILTER,
            Self::Shutdown => SHUTDOWN,
            Self::ScriptUpdate { .. } => SCRIPTS_UPDATE,
            Self::ScriptExec(_) => SCRIPTS_EXEC,
            Self::ScriptRemove(_) => SCRIPTS_REMOVE,
        }
    }

    /// Shape the payload carried in the envelope's `data` field.
    #[must_use]
    pub fn data(&self) -> Value {
        match self {
            Self::SetFilter(filter) => filter.to_wire_form(),
            Self::Shutdown => Value::Null,
            Self::ScriptUpdate { id, content } => json!({
                "id": id,
                "content": content,
            }),
            Self::ScriptExec(id) | Self::ScriptRemove(id) => Value::String(id.clone()),
        }
    }

    /// Build the wire envelope for this command.
    #[must_use]
    pub fn to_envelope(&self) -> CommandEnvelope {
        CommandEnvelope::new(self.name(), self.data())
    }
}

impl From<Command> for CommandEnvelope {
    fn from(command: Command) -> Self {
        command.to_envelope()
    }
}

fn decode<T: serde::de::DeserializeOwned>(
    command: &'static str,
    data: Value,
) -> Result<T, ProtocolError> {
    serde_json::from_value(data).map_err(|source| ProtocolError::InvalidData { command, source })
}

impl TryFrom<CommandEnvelope> for Command {
    type Error = ProtocolError;

    fn try_from(envelope: CommandEnvelope) -> Result<Self, Self::Error> {
        let CommandEnvelope { command, data } = envelope;
        match command.as_str() {
            SET_FILTER => Ok(Self::SetFilter(decode(SET_FILTER, data)?)),
            SHUTDOWN => Ok(Self::Shutdown),
            SCRIPTS_UPDATE => {
                let ScriptUpdate { id, content } = decode(SCRIPTS_UPDATE, data)?;
                Ok(Self::ScriptUpdate { id, content })
            }
            SCRIPTS_EXEC => Ok(Self::ScriptExec(decode(SCRIPTS_EXEC, data)?)),
            SCRIPTS_REMOVE => Ok(Self::ScriptRemove(decode(SCRIPTS_REMOVE, data)?)),
            _ => Err(ProtocolError::UnknownCommand(command)),
        }
    }
}
