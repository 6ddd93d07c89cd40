//! # relay-agent
//!
//! Relay listener binary. Loads settings, starts the WebSocket transport and
//! records every sender as a reply destination until Ctrl-C.

#![deny(unsafe_code)]

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use clap::Parser;
use relay_core::EncryptedMessage;
use relay_core::logging::init_subscriber;
use relay_settings::{RelaySettings, load_settings_from_path, settings_path};
use relay_transport::{
    BoxError, InMemoryTransportService, ListenerBinding, ListenerConfig, MessageReceiver,
    TransportSession, WsInboundTransport,
};
use tracing::{debug, info};

/// Relay WebSocket listener.
#[derive(Parser, Debug)]
#[command(name = "relay-agent", about = "Relay WebSocket listener")]
struct Cli {
    /// Host to bind (overrides settings).
    #[arg(long)]
    host: Option<String>,

    /// Port to bind, 0 for auto-assign (overrides settings).
    #[arg(long)]
    port: Option<u16>,

    /// Settings file (defaults to `~/.relay/settings.json`).
    #[arg(long)]
    settings: Option<PathBuf>,

    /// Log level filter (overrides settings).
    #[arg(long)]
    log_level: Option<String>,
}

impl Cli {
    /// Fold command-line overrides into loaded settings.
    fn apply(&self, settings: &mut RelaySettings) {
        if let Some(ref host) = self.host {
            settings.transport.host.clone_from(host);
        }
        if let Some(port) = self.port {
            settings.transport.port = port;
        }
        if let Some(ref level) = self.log_level {
            settings.logging.level.clone_from(level);
        }
    }
}

/// Logs each inbound envelope and keeps its sender as a reply route.
struct LoggingReceiver {
    sessions: Arc<InMemoryTransportService>,
}

#[async_trait]
impl MessageReceiver for LoggingReceiver {
    async fn receive_message(
        &self,
        message: EncryptedMessage,
        session: Arc<dyn TransportSession>,
    ) -> std::result::Result<(), BoxError> {
        let kind = message
            .get("type")
            .and_then(|v| v.as_str())
            .unwrap_or("unknown");
        debug!(session_id = %session.id(), kind, fields = message.fields().len(), "envelope received");
        let _ = self.sessions.save_session(session).await;
        Ok(())
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let path = cli.settings.clone().unwrap_or_else(settings_path);
    let mut settings = load_settings_from_path(&path)
        .with_context(|| format!("Failed to load settings from {}", path.display()))?;
    cli.apply(&mut settings);

    init_subscriber(&settings.logging.level, settings.logging.format);
    info!(settings = %path.display(), "starting relay agent");

    let sessions = Arc::new(InMemoryTransportService::new());
    let receiver = Arc::new(LoggingReceiver {
        sessions: sessions.clone(),
    });
    let transport = WsInboundTransport::new(
        ListenerBinding::from_settings(&settings.transport),
        ListenerConfig::from_settings(&settings.transport),
        receiver,
        sessions.clone(),
    );

    let addr = transport
        .start()
        .await
        .context("Failed to start relay listener")?;
    info!(%addr, "relay agent listening");

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for shutdown signal")?;
    info!(
        open_sessions = sessions.session_count().await,
        "shutdown signal received"
    );

    transport
        .stop()
        .await
        .context("Failed to stop relay listener")?;
    Ok(())
}
