//! Server configuration.

use std::{net::SocketAddr, path::Path};

use agent_control_core::{Command, ProcessFilter};
use agent_control_session::RegistryConfig;
use anyhow::Context;
use serde::Deserialize;

/// Script pushed to every agent on connect.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ScriptConfig {
    pub id: String,
    pub content: String,
    /// Run the script right after uploading it.
    #[serde(default)]
    pub exec: bool,
}

/// Commands issued to each agent once it connects.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct OnConnect {
    /// Executable paths to blacklist.
    pub blacklist: Option<Vec<String>>,
    pub scripts: Vec<ScriptConfig>,
}

impl OnConnect {
    /// Commands to send, in order.
    #[must_use]
    pub fn commands(&self) -> Vec<Command> {
        let mut commands = Vec::new();
        if let Some(paths) = &self.blacklist {
            commands.push(Command::SetFilter(ProcessFilter::blacklist(paths.clone())));
        }
        for script in &self.scripts {
            commands.push(Command::ScriptUpdate {
                id: script.id.clone(),
                content: script.content.clone(),
            });
            if script.exec {
                commands.push(Command::ScriptExec(script.id.clone()));
            }
        }
        commands
    }
}

/// Server configuration file.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub bind: SocketAddr,
    /// URL path agents connect to.
    pub path: String,
    pub registry: RegistryConfig,
    pub on_connect: OnConnect,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: SocketAddr::from(([127, 0, 0, 1], 8000)),
            path: "/client/socket".to_string(),
            registry: RegistryConfig::default(),
            on_connect: OnConnect::default(),
        }
    }
}

impl ServerConfig {
    /// Read a TOML config file.
    ///
    /// # Errors
    /// Returns error if the file cannot be read or parsed.
    pub fn read(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        Self::parse(&content).with_context(|| format!("parsing {}", path.display()))
    }

    /// Parse TOML config text.
    ///
    /// # Errors
    /// Returns error on invalid TOML or unknown values.
    pub fn parse(content: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(content)
    }
}
