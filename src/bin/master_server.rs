//! Standalone master registry binary
//!
//! Run with:
//!   cargo run --bin master-server -- --port 8080
//!
//! The legacy `-port 8080` spelling is also accepted.

use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use fusionlink::registry::{MasterConfig, MasterServer, DEFAULT_MASTER_PORT};

/// Master registry for fusionlink game sessions
#[derive(Parser, Debug)]
#[command(name = "master-server")]
#[command(about = "Master registry for fusionlink game sessions")]
struct Args {
    /// Port to listen on
    #[arg(short, long, env = "MASTER_PORT", default_value_t = DEFAULT_MASTER_PORT)]
    port: u16,

    /// Seconds between stale-session sweeps
    #[arg(long, default_value = "30")]
    sweep_interval: u64,

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

    let server = MasterServer::new(MasterConfig {
        port: args.port,
        sweep_interval: Duration::from_secs(args.sweep_interval.max(1)),
        ..Default::default()
    });

    let listener = server
        .bind()
        .await
        .with_context(|| format!("Failed to bind port {}", args.port))?;

    info!("=== fusionlink Master Server ===");
    info!("API endpoints:");
    info!("  GET    /api/servers        - List servers");
    info!("  POST   /api/servers        - Register server");
    info!("  PUT    /api/servers/{{id}}   - Update server (heartbeat)");
    info!("  DELETE /api/servers/{{id}}   - Unregister server");
    info!("  POST   /api/invite/create  - Create invite code");
    info!("  POST   /api/invite/validate - Validate invite code");
    info!("  GET    /api/stats          - Server statistics");
    info!("Press Ctrl-C to stop");

    server
        .run(listener, async {
            let _ = tokio::signal::ctrl_c().await;
            info!("Shutting down...");
        })
        .await?;

    Ok(())
}
