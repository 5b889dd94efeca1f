//! Operator server for remote agents.
//!
//! Run with: cargo run -p control-server -- --config control.toml
//!
//! Agents connect over WebSocket, say hello with their MAC address, and
//! receive the commands listed under `[on_connect]` in the config file.

mod config;

use std::{path::PathBuf, sync::Arc};

use agent_control_core::Command;
use agent_control_session::{ConnectionRegistry, Session};
use agent_control_transport::{ControlState, control_router};
use anyhow::Context;
use clap::Parser;
use tower_http::trace::TraceLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::ServerConfig;

#[derive(Debug, Parser)]
#[command(about = "Push commands to connected remote agents")]
struct Cli {
    /// TOML config file.
    #[arg(short, long, env = "CONTROL_CONFIG")]
    config: Option<PathBuf>,
    /// Listen address, overrides the config file.
    #[arg(long, env = "CONTROL_BIND")]
    bind: Option<std::net::SocketAddr>,
    /// Agent endpoint path, overrides the config file.
    #[arg(long)]
    path: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let cli = Cli::parse();
    let mut config = match &cli.config {
        Some(path) => ServerConfig::read(path)?,
        None => ServerConfig::default(),
    };
    if let Some(bind) = cli.bind {
        config.bind = bind;
    }
    if let Some(path) = cli.path {
        config.path = path;
    }

    let registry = ConnectionRegistry::new(config.registry.clone());
    let (state, mut connected) = ControlState::with_notifier(registry.clone());

    let commands = Arc::new(config.on_connect.commands());
    tokio::spawn(async move {
        while let Some(session) = connected.recv().await {
            tokio::spawn(push_commands(session, Arc::clone(&commands)));
        }
    });

    let app = control_router(&config.path, state).layer(TraceLayer::new_for_http());

    let listener = tokio::net::TcpListener::bind(config.bind)
        .await
        .with_context(|| format!("binding {}", config.bind))?;
    tracing::info!("Agent endpoint listening on ws://{}{}", config.bind, config.path);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    registry.close_all().await;
    tracing::info!("All agent sessions closed");
    Ok(())
}

async fn push_commands(session: Arc<Session>, commands: Arc<Vec<Command>>) {
    for command in commands.iter() {
        if let Err(e) = session.dispatch(command).await {
            tracing::error!(
                client_id = %session.client_id(),
                command = command.name(),
                "Failed to push command: {e}"
            );
            return;
        }
    }
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to listen for ctrl-c: {e}");
    }
}
