//! meshgate daemon
//!
//! Gateway control plane for a hub-and-spoke mesh: node registry, address
//! allocation, certificate authority and the join endpoint.

use anyhow::Context;
use axum_server::Handle;
use clap::{Parser, Subcommand};
use ipnetwork::Ipv4Network;
use meshgate_common::{token_fingerprint, NodeRole};
use std::net::TcpListener;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

mod config;
mod join;
mod registry;
mod reload;
mod scheduler;
mod server;
mod state;

use config::DaemonConfig;
use state::ControlPlane;

#[derive(Parser)]
#[command(name = "meshgated")]
#[command(about = "meshgate daemon - mesh identity and topology control plane")]
#[command(version)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, env = "MESHGATE_CONFIG")]
    config: Option<PathBuf>,

    /// Store directory
    #[arg(short, long, env = "MESHGATE_STORE")]
    store: Option<PathBuf>,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Create the gateway node, its certificate authority and Docker subnet
    InitGateway {
        /// Public host name or address of this machine
        #[arg(long)]
        public_host: Option<String>,

        /// Additional names for the control endpoint certificate
        #[arg(long = "san")]
        extra_names: Vec<String>,
    },

    /// Serve the mTLS control endpoint
    Serve {
        /// Listen address, overrides the configuration
        #[arg(short, long)]
        listen: Option<String>,
    },

    /// Issue a one-shot join token
    IssueToken {
        /// Role the new node receives (server or client)
        #[arg(short, long, default_value = "server")]
        role: NodeRole,

        /// Docker subnet to hand to a server, e.g. 172.25.0.0/16
        #[arg(long)]
        subnet: Option<Ipv4Network>,
    },

    /// Join a mesh using a token issued by its gateway
    Join {
        /// The join token
        token: String,
    },

    /// Show this machine's node
    Show,

    /// List all known nodes
    Nodes,

    /// List outstanding join requests
    Pending,

    /// Cancel an outstanding join request
    Cancel {
        /// Join request id
        id: String,
    },

    /// Delete all nodes and join requests from the local store
    Reset {
        /// Do not ask for confirmation
        #[arg(long)]
        yes: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let filter = if cli.debug {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };

    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(filter)
        .init();

    let config_path = cli
        .config
        .clone()
        .unwrap_or_else(meshgate_common::default_config_path);
    let mut config = DaemonConfig::load(&config_path)?;
    if let Some(store) = cli.store.clone() {
        config.store_path = store;
    }

    match cli.command {
        Command::InitGateway {
            public_host,
            extra_names,
        } => {
            if let Some(host) = public_host {
                config.gateway.public_host = host;
                config.save(&config_path)?;
                info!("Saved configuration to {:?}", config_path);
            }
            let plane = ControlPlane::open(&config)?;
            let node = plane.init_gateway(&extra_names).await?;
            println!("{}", serde_json::to_string_pretty(&node.without_ca())?);
        }
        Command::Serve { listen } => {
            if let Some(listen) = listen {
                config.gateway.control_listen = listen;
            }
            serve(config).await?;
        }
        Command::IssueToken { role, subnet } => {
            let plane = ControlPlane::open(&config)?;
            let token = plane.join_service()?.issue_join_token(role, subnet)?;
            info!(fingerprint = %token_fingerprint(&token), "Token ready");
            println!("{}", token);
        }
        Command::Join { token } => {
            let plane = ControlPlane::open(&config)?;
            let node =
                join::join_mesh(plane.registry(), plane.docker(), plane.runner(), &token).await?;
            println!("{}", serde_json::to_string_pretty(&node)?);
        }
        Command::Show => {
            let plane = ControlPlane::open(&config)?;
            let node = plane.registry().get_current()?;
            println!("{}", serde_json::to_string_pretty(&node.without_ca())?);
        }
        Command::Nodes => {
            let plane = ControlPlane::open(&config)?;
            println!(
                "{:<38} {:<8} {:<12} {:<16} {}",
                "ID", "ROLE", "ADDRESS", "SUBNET", "PEERS"
            );
            for node in plane.registry().list()? {
                println!(
                    "{:<38} {:<8} {:<12} {:<16} {}{}",
                    node.id,
                    node.role,
                    node.private_address,
                    node.docker_subnet.map(|s| s.to_string()).unwrap_or_else(|| "-".into()),
                    node.peers.len(),
                    if node.is_current { " *" } else { "" },
                );
            }
        }
        Command::Pending => {
            let plane = ControlPlane::open(&config)?;
            println!("{:<38} {:<8} {}", "ID", "ROLE", "SUBNET");
            for request in plane.join_service()?.list_pending()? {
                println!(
                    "{:<38} {:<8} {}",
                    request.id,
                    request.role,
                    request
                        .forced_docker_subnet
                        .map(|s| s.to_string())
                        .unwrap_or_else(|| "-".into()),
                );
            }
        }
        Command::Cancel { id } => {
            let plane = ControlPlane::open(&config)?;
            plane.join_service()?.cancel(&id)?;
            println!("Cancelled {}", id);
        }
        Command::Reset { yes } => {
            if !yes {
                anyhow::bail!("reset deletes every node and join request; pass --yes to confirm");
            }
            let plane = ControlPlane::open(&config)?;
            plane.registry().delete_all()?;
            println!("Local mesh state deleted");
        }
    }

    Ok(())
}

async fn serve(config: DaemonConfig) -> anyhow::Result<()> {
    info!("meshgate daemon v{}", meshgate_common::VERSION);

    let plane = ControlPlane::open(&config)?;
    let gateway = plane
        .registry()
        .get_gateway()
        .context("this machine has no gateway node; run init-gateway first")?;
    let tls = gateway
        .ca
        .as_ref()
        .context("gateway row carries no certificate authority")?
        .server_tls_config()?;

    let join = Arc::new(plane.join_service()?);
    let listener = TcpListener::bind(&config.gateway.control_listen)
        .with_context(|| format!("binding {}", config.gateway.control_listen))?;

    let handle = Handle::new();
    let server_handle = tokio::spawn(server::serve(listener, tls, join, handle.clone()));

    info!(
        gateway = %gateway.id,
        advertised = %config.advertised_control_address()?,
        "Daemon started"
    );

    // Wait for shutdown signal
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Received shutdown signal");
            handle.graceful_shutdown(Some(Duration::from_secs(10)));
        }
        result = server_handle => {
            match result {
                Ok(Err(e)) => error!("Control endpoint error: {}", e),
                Err(e) => error!("Control endpoint task failed: {}", e),
                Ok(Ok(())) => {}
            }
        }
    }

    info!("Daemon shutdown complete");
    Ok(())
}
