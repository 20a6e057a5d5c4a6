//! hassdash-bridge: keeps a local history of Home Assistant state changes.
//!
//! ```bash
//! # Run until Ctrl-C using ~/.config/hassdash/bridge.toml
//! hassdash-bridge
//!
//! # Dump the store (settings and every entity history) and exit
//! hassdash-bridge --export hassdash-db.json
//!
//! # Save the effective config (file plus HASSDASH_* overrides) and exit
//! HASSDASH_URL=http://hass.local:8123 hassdash-bridge --write-config
//! ```

mod config;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

use hassdash_bridge::{Bridge, BridgeEvent, export_json};
use hassdash_connection::{ConnectionError, ConnectionEvent};
use hassdash_history::{FileStore, HistoryStore};

use config::AppConfig;

#[derive(Parser, Debug)]
#[command(
    name = "hassdash-bridge",
    version,
    about = "Records Home Assistant state changes into a local history store"
)]
struct Cli {
    /// Config file. Defaults to `<config dir>/hassdash/bridge.toml`.
    #[arg(short, long, env = "HASSDASH_CONFIG")]
    config: Option<PathBuf>,

    /// Write every stored record as JSON to FILE and exit.
    #[arg(long, value_name = "FILE")]
    export: Option<PathBuf>,

    /// Save the effective configuration to the config file and exit.
    #[arg(long, conflicts_with = "export")]
    write_config: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config_path = match cli.config {
        Some(path) => path,
        None => config::config_path()?,
    };
    let cfg = AppConfig::load(&config_path)?.with_env_overrides();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cfg.log_filter)),
        )
        .init();
    debug!(path = %config_path.display(), mode = ?cfg.mode, "configuration loaded");

    if cli.write_config {
        cfg.save(&config_path)?;
        info!(path = %config_path.display(), "configuration written");
        return Ok(());
    }

    let store = FileStore::open(&cfg.data_dir)
        .await
        .with_context(|| format!("opening store at {}", cfg.data_dir.display()))?;
    let history = Arc::new(HistoryStore::new(store));

    if let Some(out) = cli.export {
        let json = export_json(&history).await?;
        std::fs::write(&out, json).with_context(|| format!("writing {}", out.display()))?;
        info!(path = %out.display(), "store exported");
        return Ok(());
    }

    let (bridge, mut events) = Bridge::start(history, cfg.connect_options()?).await?;

    let interrupt = tokio::signal::ctrl_c();
    tokio::pin!(interrupt);
    loop {
        tokio::select! {
            result = &mut interrupt => {
                if let Err(e) = result {
                    warn!(error = %e, "failed to listen for Ctrl-C");
                }
                info!("shutting down bridge");
                break;
            }
            event = events.recv() => match event {
                Some(event) => log_event(&event),
                None => break,
            },
        }
    }

    bridge.shutdown().await;
    Ok(())
}

fn log_event(event: &BridgeEvent) {
    match event {
        BridgeEvent::Connection(ConnectionEvent::Status(status)) => {
            info!(status = %status, "connection status");
        }
        BridgeEvent::Connection(ConnectionEvent::Opened { ha_version }) => {
            info!(ha_version = ha_version.as_deref().unwrap_or("unknown"), "connected to hub");
        }
        BridgeEvent::Connection(ConnectionEvent::StateChanged(change)) => {
            debug!(entity_id = %change.entity_id, "state changed");
        }
        BridgeEvent::Connection(ConnectionEvent::Snapshot(states)) => {
            info!(entities = states.len(), "initial states received");
        }
        BridgeEvent::Connection(ConnectionEvent::Closed(reason)) => {
            info!(reason = %reason, "connection closed");
        }
        BridgeEvent::Connection(ConnectionEvent::Error(ConnectionError::RetriesExhausted {
            attempts,
        })) => {
            error!(attempts, "gave up reconnecting; restart or fix the hub URL");
        }
        BridgeEvent::Connection(ConnectionEvent::Error(e)) => {
            warn!(error = %e, "connection error");
        }
        BridgeEvent::StorageFailed { entity_id, .. } => {
            debug!(entity_id = %entity_id, "state change not persisted");
        }
    }
}
