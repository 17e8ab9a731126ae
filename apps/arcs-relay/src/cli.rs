use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use futures_util::{SinkExt, StreamExt};
use std::path::Path;
use tokio::time::{timeout, Duration};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::debug;

use crate::protocol;
use crate::registry::DeviceRegistry;

#[derive(Parser, Debug)]
#[command(name = "arcs-relay")]
#[command(about = "ARCS relay server and maintenance client")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Commands>,

    /// Override the listen port from ARCS_PORT
    #[arg(long)]
    pub port: Option<u16>,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Add a device credential to the device store
    RegisterDevice {
        /// Device store path (defaults to ARCS_DEVICE_STORE)
        #[arg(long)]
        store: Option<String>,

        #[arg(long)]
        device_id: String,

        #[arg(long)]
        secret: String,

        #[arg(long, default_value = "unknown")]
        model: String,

        #[arg(long)]
        android_version: Option<String>,
    },

    /// Ping a running relay and print the round-trip time
    Ping {
        /// Relay URL
        #[arg(short, long, default_value = "ws://localhost:8080")]
        url: String,
    },
}

pub fn run_register_device(
    store: &str,
    device_id: &str,
    secret: &str,
    model: &str,
    android_version: Option<String>,
) -> Result<()> {
    let path = Path::new(store);
    let registry = DeviceRegistry::new();

    if path.exists() {
        let count = registry
            .load_from_path(path)
            .with_context(|| format!("loading device store {}", store))?;
        debug!(count, store, "loaded existing device store");
    }

    if !registry.register_entry(device_id, secret, model, android_version) {
        anyhow::bail!("device {} is already registered", device_id);
    }

    registry
        .save_to_path(path)
        .with_context(|| format!("writing device store {}", store))?;
    println!("registered device {} ({} total)", device_id, registry.count());
    Ok(())
}

/// Connect to a running relay, send a protocol-level ping, and wait for
/// the pong.
pub async fn run_ping_client(url: String) -> Result<()> {
    let ws_url = format!("{}/ws", url.trim_end_matches('/'));
    let started = std::time::Instant::now();

    let (ws_stream, _) = timeout(Duration::from_secs(5), connect_async(&ws_url))
        .await
        .context("connection timed out")?
        .with_context(|| format!("connecting to {}", ws_url))?;

    let (mut sender, mut receiver) = ws_stream.split();
    sender
        .send(Message::Text(r#"{"type":"ping"}"#.to_string()))
        .await
        .context("sending ping")?;

    let deadline = Duration::from_secs(5);
    loop {
        let frame = timeout(deadline, receiver.next())
            .await
            .context("timed out waiting for pong")?;
        let Some(frame) = frame else {
            anyhow::bail!("connection closed before pong");
        };
        if let Message::Text(text) = frame.context("websocket read")? {
            let msg = protocol::parse(&text)?;
            if protocol::MessageType::of(&msg) == protocol::MessageType::Pong {
                println!(
                    "pong from {} in {:.1} ms (server_time={})",
                    ws_url,
                    started.elapsed().as_secs_f64() * 1000.0,
                    msg.get("timestamp").and_then(|v| v.as_i64()).unwrap_or(0),
                );
                return Ok(());
            }
        }
    }
}
