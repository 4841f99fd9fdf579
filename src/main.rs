//! cadbridge - send commands to a CAD application over its socket bridge.
//!
//! Each invocation opens one scoped connection, issues one command, prints
//! the JSON result on stdout and disconnects. Logs go to stderr and are
//! controlled by `RUST_LOG` (default `cadbridge=info`).

use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde_json::{json, Value};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use cadbridge::ipc::{ConnectionManager, Framing};
use cadbridge::BridgeConfig;

#[derive(Debug, Parser)]
#[command(name = "cadbridge", version, about = "Send commands to a CAD application")]
struct Cli {
    /// Peer host (overrides config and CADBRIDGE_HOST)
    #[arg(long, global = true)]
    host: Option<String>,

    /// Peer port (overrides config and CADBRIDGE_PORT)
    #[arg(long, global = true)]
    port: Option<u16>,

    /// Wire framing: json (default) or content-length
    #[arg(long, global = true)]
    framing: Option<Framing>,

    /// Per-request timeout in seconds
    #[arg(long, global = true, value_name = "SECS")]
    timeout: Option<u64>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Send one command and print its result
    Call {
        /// Command name, e.g. get_current_view_info
        method: String,

        /// Command arguments as a JSON object
        #[arg(long, default_value = "{}")]
        params: String,
    },
    /// Check the peer answers and report the round-trip time
    Ping,
}

impl Cli {
    fn config(&self) -> Result<BridgeConfig> {
        let mut config = BridgeConfig::load().context("Failed to load configuration")?;
        if let Some(host) = &self.host {
            config.peer.host = host.clone();
        }
        if let Some(port) = self.port {
            config.peer.port = port;
        }
        if let Some(framing) = self.framing {
            config.framing = framing;
        }
        if let Some(secs) = self.timeout {
            config.request_timeout = Duration::from_secs(secs);
        }
        Ok(config)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Logs on stderr, stdout is reserved for results
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "cadbridge=info".into()),
        ))
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_writer(std::io::stderr),
        )
        .init();

    let cli = Cli::parse();
    let config = cli.config()?;
    tracing::debug!("Using peer {} ({} framing)", config.peer, config.framing);
    let manager = ConnectionManager::new(config);

    match cli.command {
        Command::Call { method, params } => {
            let params: Value = serde_json::from_str(&params)
                .with_context(|| format!("--params is not valid JSON: {}", params))?;

            let result = manager
                .with_connection(|client| async move {
                    client
                        .send_command(&method, params)
                        .await
                        .with_context(|| format!("Command '{}' failed", method))
                })
                .await?;

            println!("{}", serde_json::to_string_pretty(&result)?);
        }
        Command::Ping => {
            let (latency, reply) = manager
                .with_connection(|client| async move {
                    let start = Instant::now();
                    let reply = client.send_command("ping", json!({})).await?;
                    anyhow::Ok((start.elapsed(), reply))
                })
                .await?;

            tracing::info!("ping replied {}", reply);
            println!("{:?}", latency);
        }
    }

    Ok(())
}
