//! quorumkv member binary

use clap::{Parser, Subcommand};
use quorumkv::common::Config;
use quorumkv::server::KvServer;
use std::net::SocketAddr;
use std::path::PathBuf;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "quorumkv")]
#[command(about = "quorumkv member: key-space API, membership and watches")]
#[command(version = quorumkv::VERSION)]
struct Cli {
    /// Config file (defaults to ./quorumkv.toml when present)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start a member
    Serve {
        /// Member name
        #[arg(long)]
        name: Option<String>,

        /// Listen address for client requests
        #[arg(long)]
        listen_client: Option<SocketAddr>,

        /// Client URLs advertised to the cluster (comma-separated)
        #[arg(long, value_delimiter = ',')]
        advertise_client_urls: Vec<String>,

        /// Peer URLs advertised to the cluster (comma-separated)
        #[arg(long, value_delimiter = ',')]
        initial_advertise_peer_urls: Vec<String>,

        /// Initial cluster, `name=url,name=url`
        #[arg(long)]
        initial_cluster: Option<String>,

        /// Token mixed into member and cluster IDs
        #[arg(long)]
        initial_cluster_token: Option<String>,
    },
    /// Print the effective configuration and exit
    Config,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => Config::load_from(path)?,
        None => Config::load()?,
    };
    if config.log_level.is_empty() {
        config.log_level = "info".to_string();
    }

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| config.log_level.clone().into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    match cli.command {
        Commands::Serve {
            name,
            listen_client,
            advertise_client_urls,
            initial_advertise_peer_urls,
            initial_cluster,
            initial_cluster_token,
        } => {
            // CLI flags win over file and environment
            let server_config = &mut config.server;
            if let Some(name) = name {
                server_config.name = name;
            }
            if let Some(addr) = listen_client {
                server_config.client_addr = addr;
            }
            if !advertise_client_urls.is_empty() {
                server_config.advertise_client_urls = advertise_client_urls;
            }
            if !initial_advertise_peer_urls.is_empty() {
                server_config.initial_advertise_peer_urls = initial_advertise_peer_urls;
            }
            if let Some(cluster) = initial_cluster {
                server_config.initial_cluster = cluster;
            }
            if let Some(token) = initial_cluster_token {
                server_config.initial_cluster_token = token;
            }

            tracing::info!("Starting {}", quorumkv::BUILD_INFO);
            tracing::info!("  name: {}", config.server.name);
            tracing::info!("  client address: {}", config.server.client_addr);
            tracing::info!("  initial cluster: {}", config.server.initial_cluster_or_self());

            let server = KvServer::new(config.server)?;
            server.serve().await?;
        }
        Commands::Config => {
            config.server.validate()?;
            println!("{}", serde_json::to_string_pretty(&config)?);
        }
    }

    Ok(())
}
