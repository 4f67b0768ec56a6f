//! Standalone relay binary
//!
//! Run with:
//!   cargo run --bin relay-server -- --port 9000
//!
//! The legacy `-port 9000` spelling is also accepted.

use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::time::interval;
use tracing::info;
use tracing_subscriber::EnvFilter;

use fusionlink::network::{RelayConfig, RelayServer, DEFAULT_RELAY_PORT};

/// UDP relay for peers that cannot connect directly
#[derive(Parser, Debug)]
#[command(name = "relay-server")]
#[command(about = "UDP relay for fusionlink peers that cannot connect directly")]
struct Args {
    /// UDP port to listen on
    #[arg(short, long, env = "RELAY_PORT", default_value_t = DEFAULT_RELAY_PORT)]
    port: u16,

    /// Seconds between session count reports
    #[arg(long, default_value = "60")]
    report_interval: u64,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

/// Accept `-port N` alongside `--port N`
fn legacy_args() -> Vec<String> {
    std::env::args()
        .map(|arg| if arg == "-port" { "--port".to_string() } else { arg })
        .collect()
}

fn setup_logging(verbose: bool) {
    let default = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .compact()
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse_from(legacy_args());
    setup_logging(args.verbose);

    let mut relay = RelayServer::new(RelayConfig {
        port: args.port,
        ..Default::default()
    });
    relay
        .start()
        .await
        .with_context(|| format!("Failed to start relay on port {}", args.port))?;

    info!("=== fusionlink Relay Server ===");
    info!("Relaying on UDP port {}", relay.port());
    info!("Press Ctrl-C to stop");

    let mut report = interval(Duration::from_secs(args.report_interval.max(1)));
    report.tick().await;

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Shutting down...");
                break;
            }
            _ = report.tick() => {
                info!("Active relay sessions: {}", relay.session_count());
            }
        }
    }

    relay.stop().await;
    Ok(())
}
