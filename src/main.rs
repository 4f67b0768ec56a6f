//! fusionlink - P2P session matchmaking for multiplayer games

use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tokio::time::interval;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use fusionlink::network::{
    ClientConfig, HostConfig, NatProber, NatProberConfig, SessionClient, SessionHost,
};
use fusionlink::protocol::{Packet, PacketType};
use fusionlink::registry::{
    MasterClient, Privacy, ServerFilter, SessionDescriptor, SessionUpdate,
};

/// Interval between registry heartbeats while hosting
const REGISTRY_HEARTBEAT: Duration = Duration::from_secs(30);

#[derive(Parser)]
#[command(name = "fusionlink")]
#[command(about = "P2P session matchmaking for multiplayer games")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Host a session
    Host {
        /// UDP port to listen on
        #[arg(short, long, default_value = "7777")]
        port: u16,

        /// Server name shown in the browser
        #[arg(short, long, default_value = "My Server")]
        name: String,

        /// Join password (empty for none)
        #[arg(long, default_value = "")]
        password: String,

        /// Player slots, the host included
        #[arg(long, default_value = "16")]
        max_players: usize,

        #[arg(long, default_value = "Deathmatch")]
        game_mode: String,

        #[arg(long, default_value = "Default")]
        map: String,

        /// Only listed identities may join
        #[arg(long)]
        invite_only: bool,

        /// Master registry URL to advertise on (e.g., http://master:8080)
        #[arg(long, env = "FUSIONLINK_MASTER_URL")]
        master: Option<String>,

        /// Probe the public endpoint before starting
        #[arg(long)]
        detect_nat: bool,
    },

    /// Join a session
    Join {
        /// Host address or name
        address: String,

        /// Host UDP port
        port: u16,

        /// Your display name
        #[arg(short, long, default_value = "Player")]
        name: String,

        /// Join password
        #[arg(long, default_value = "")]
        password: String,
    },

    /// Detect the NAT type and public endpoint
    Nat {
        /// Local UDP port to probe from (0 for any)
        #[arg(short, long, default_value = "0")]
        port: u16,
    },

    /// List sessions on a master registry
    Servers {
        /// Master registry URL
        #[arg(short, long, env = "FUSIONLINK_MASTER_URL")]
        master: String,

        #[arg(long)]
        game_mode: Option<String>,

        #[arg(long)]
        map: Option<String>,

        /// Hide full sessions
        #[arg(long)]
        not_full: bool,

        /// Hide password-protected sessions
        #[arg(long)]
        no_password: bool,
    },

    /// Create or redeem invite codes
    Invite {
        /// Master registry URL
        #[arg(short, long, env = "FUSIONLINK_MASTER_URL", global = true)]
        master: Option<String>,

        #[command(subcommand)]
        action: InviteAction,
    },
}

#[derive(Subcommand)]
enum InviteAction {
    /// Issue a code for a registered session
    Create {
        server_id: String,

        /// Your identity
        #[arg(long)]
        steam_id: Option<String>,

        /// Lifetime in minutes
        #[arg(long, default_value = "60")]
        expires: i64,
    },

    /// Redeem a code
    Validate {
        code: String,

        /// Your identity
        #[arg(long)]
        steam_id: Option<String>,
    },
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

fn print_prompt() {
    print!("chat> ");
    let _ = std::io::Write::flush(&mut std::io::stdout());
}

#[allow(clippy::too_many_arguments)]
async fn run_host(
    port: u16,
    name: String,
    password: String,
    max_players: usize,
    game_mode: String,
    map: String,
    invite_only: bool,
    master: Option<String>,
    detect_nat: bool,
) -> Result<()> {
    let mut public_ip = String::new();
    if detect_nat {
        let nat = NatProber::new(NatProberConfig::default()).detect(port).await;
        info!("NAT type: {:?}", nat.nat_type);
        if let Some(endpoint) = nat.public_endpoint {
            info!("Public endpoint: {}", endpoint);
            public_ip = endpoint.ip().to_string();
        }
        if !nat.can_use_p2p {
            warn!("Direct connections are unlikely to work; consider a relay");
        }
    }

    let privacy = if invite_only {
        Privacy::InviteOnly
    } else if !password.is_empty() {
        Privacy::PasswordProtected
    } else {
        Privacy::Public
    };

    let mut host = SessionHost::new(HostConfig {
        port,
        server_name: name,
        password,
        max_players,
        game_mode,
        map_name: map,
        privacy,
        ..Default::default()
    });

    host.set_peer_connected_callback(|peer| {
        println!("+ {} joined ({})", peer.display_name, peer.endpoint);
    });
    host.set_peer_disconnected_callback(|peer| {
        println!("- {} left ({})", peer.display_name, peer.endpoint);
    });
    host.set_data_callback(|peer, packet_type, payload| {
        if packet_type == PacketType::ChatMessage {
            println!("{}: {}", peer.display_name, String::from_utf8_lossy(payload));
        }
    });

    host.start().await.context("Failed to start host")?;
    info!("Hosting '{}' on UDP port {}", host.config().server_name, host.port());

    let registration = match master {
        Some(url) => {
            let client = MasterClient::new(&url)?;
            let descriptor = SessionDescriptor {
                external_ip: public_ip,
                ..host.descriptor()
            };
            let server_id = client
                .register(&descriptor)
                .await
                .with_context(|| format!("Failed to register with {}", url))?;
            info!("Registered with {} as {}", url, server_id);
            Some((client, server_id))
        }
        None => None,
    };

    let mut heartbeat = interval(REGISTRY_HEARTBEAT);
    heartbeat.tick().await;

    let mut stdin_reader = BufReader::new(tokio::io::stdin()).lines();
    let mut stdin_open = true;
    print_prompt();

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Shutting down...");
                break;
            }
            _ = heartbeat.tick() => {
                if let Some((ref client, ref server_id)) = registration {
                    let update = SessionUpdate {
                        current_players: Some(host.current_players() as i64),
                        ..Default::default()
                    };
                    if let Err(e) = client.heartbeat(server_id, &update).await {
                        warn!("Registry heartbeat failed: {}", e);
                    }
                }
            }
            line = stdin_reader.next_line(), if stdin_open => {
                match line {
                    Ok(Some(line)) => {
                        let line = line.trim();
                        if !line.is_empty() {
                            host.broadcast(&Packet::text(PacketType::ChatMessage, line)).await?;
                        }
                        print_prompt();
                    }
                    Ok(None) => stdin_open = false,
                    Err(e) => {
                        warn!("stdin error: {}", e);
                        stdin_open = false;
                    }
                }
            }
        }
    }

    if let Some((client, server_id)) = registration {
        if let Err(e) = client.unregister(&server_id).await {
            warn!("Failed to unregister: {}", e);
        }
    }
    host.stop().await;
    Ok(())
}

async fn run_join(address: String, port: u16, name: String, password: String) -> Result<()> {
    let mut client = SessionClient::new(ClientConfig {
        player_name: name,
        password,
        ..Default::default()
    });

    let (tx_closed, mut rx_closed) = mpsc::unbounded_channel::<String>();
    client.set_disconnected_callback(move |reason| {
        let _ = tx_closed.send(reason.to_string());
    });
    client.set_data_callback(|packet_type, payload| {
        if packet_type == PacketType::ChatMessage {
            println!("{}", String::from_utf8_lossy(payload));
        }
    });

    if let Err(e) = client.connect(&address, port).await {
        bail!("Could not join {}:{}: {}", address, port, e);
    }
    info!("Joined {}:{}", address, port);

    let mut stdin_reader = BufReader::new(tokio::io::stdin()).lines();
    let mut stdin_open = true;
    print_prompt();

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Leaving...");
                break;
            }
            Some(reason) = rx_closed.recv() => {
                println!("Session ended: {}", reason);
                break;
            }
            line = stdin_reader.next_line(), if stdin_open => {
                match line {
                    Ok(Some(line)) => {
                        let line = line.trim();
                        if !line.is_empty() {
                            client.send(&Packet::text(PacketType::ChatMessage, line)).await?;
                        }
                        print_prompt();
                    }
                    Ok(None) => stdin_open = false,
                    Err(e) => {
                        warn!("stdin error: {}", e);
                        stdin_open = false;
                    }
                }
            }
        }
    }

    client.disconnect().await;
    Ok(())
}

async fn run_nat(port: u16) -> Result<()> {
    let info = NatProber::new(NatProberConfig::default()).detect(port).await;

    println!("NAT type:        {:?}", info.nat_type);
    match info.public_endpoint {
        Some(endpoint) => println!("Public endpoint: {}", endpoint),
        None => println!("Public endpoint: (unknown)"),
    }
    match info.local_endpoint {
        Some(endpoint) => println!("Local endpoint:  {}", endpoint),
        None => println!("Local endpoint:  (unknown)"),
    }
    println!("P2P possible:    {}", if info.can_use_p2p { "yes" } else { "no" });
    Ok(())
}

async fn run_servers(master: String, filter: ServerFilter) -> Result<()> {
    let client = MasterClient::new(&master)?;
    let servers = client.list_servers(&filter).await?;

    if servers.is_empty() {
        println!("No servers found");
        return Ok(());
    }

    println!(
        "{:<28} {:<22} {:<14} {:<14} {:>7} {}",
        "NAME", "ADDRESS", "MODE", "MAP", "PLAYERS", "ID"
    );
    for server in servers {
        let lock = if server.has_password { " [pw]" } else { "" };
        println!(
            "{:<28} {:<22} {:<14} {:<14} {:>3}/{:<3} {}",
            format!("{}{}", server.server_name, lock),
            server.address(),
            server.game_mode,
            server.map_name,
            server.current_players,
            server.max_players,
            server.server_id
        );
    }
    Ok(())
}

async fn run_invite(master: Option<String>, action: InviteAction) -> Result<()> {
    let Some(master) = master else {
        bail!("--master or FUSIONLINK_MASTER_URL is required");
    };
    let client = MasterClient::new(&master)?;

    match action {
        InviteAction::Create {
            server_id,
            steam_id,
            expires,
        } => {
            let code = client
                .create_invite(&server_id, steam_id.as_deref(), Some(expires))
                .await?;
            println!("Invite code: {}", code);
        }
        InviteAction::Validate { code, steam_id } => {
            match client.validate_invite(&code, steam_id.as_deref()).await? {
                Some(server) => {
                    println!("Valid invite for '{}'", server.server_name);
                    println!("Connect to {}", server.address());
                }
                None => println!("Invalid or expired invite"),
            }
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    setup_logging(cli.verbose);

    match cli.command {
        Commands::Host {
            port,
            name,
            password,
            max_players,
            game_mode,
            map,
            invite_only,
            master,
            detect_nat,
        } => {
            run_host(
                port,
                name,
                password,
                max_players,
                game_mode,
                map,
                invite_only,
                master,
                detect_nat,
            )
            .await?;
        }
        Commands::Join {
            address,
            port,
            name,
            password,
        } => {
            run_join(address, port, name, password).await?;
        }
        Commands::Nat { port } => {
            run_nat(port).await?;
        }
        Commands::Servers {
            master,
            game_mode,
            map,
            not_full,
            no_password,
        } => {
            let filter = ServerFilter {
                game_mode,
                map,
                not_full,
                no_password,
            };
            run_servers(master, filter).await?;
        }
        Commands::Invite { master, action } => {
            run_invite(master, action).await?;
        }
    }

    Ok(())
}
