//! sonar - Ethereum node discovery agent

use anyhow::Result;
use clap::{Parser, Subcommand};
use sonar_core::{NodeEndpoint, PublicKey};
use sonar_node::config::{expand_path, Config, DEFAULT_CONFIG_PATH};
use sonar_node::node::{load_identity, Node};
use std::path::Path;
use std::time::Duration;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Parser)]
#[command(name = "sonar")]
#[command(about = "Discover Ethereum peers over discv4", long_about = None)]
struct Cli {
    /// Path to config file
    #[arg(short, long, default_value = DEFAULT_CONFIG_PATH)]
    config: String,

    /// Enable verbose output
    #[arg(short, long)]
    verbose: bool,

    /// Data directory (overrides config)
    #[arg(short, long)]
    data_dir: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the discovery agent until interrupted
    Run {
        /// UDP port to listen on
        #[arg(short, long)]
        port: Option<u16>,

        /// Bootstrap node enode URL (repeatable, replaces configured seeds)
        #[arg(short, long)]
        bootnode: Vec<String>,

        /// Node key file
        #[arg(short, long)]
        key_file: Option<String>,
    },

    /// Print the local node's enode URL, creating a key if needed
    Id {
        /// Node key file
        #[arg(short, long)]
        key_file: Option<String>,
    },

    /// Find the nodes closest to a public key
    Lookup {
        /// Target public key (128 hex characters)
        #[arg(required = true)]
        target: String,

        /// Print results as JSON
        #[arg(long)]
        json: bool,

        /// Seconds to wait for the first peers before looking up
        #[arg(long, default_value = "10")]
        wait: u64,
    },

    /// Write a default configuration file
    Init,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Set up logging; RUST_LOG wins when set
    let level = if cli.verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(filter)
        .init();

    let config_path = expand_path(&cli.config);
    let mut config = match cli.command {
        Commands::Init => Config::default(),
        _ => Config::load_or_default(&config_path)?,
    };
    if let Some(dir) = cli.data_dir {
        config.data_dir = dir;
    }

    match cli.command {
        Commands::Run {
            port,
            bootnode,
            key_file,
        } => {
            if let Some(port) = port {
                config.discovery.listen_port = port;
            }
            if !bootnode.is_empty() {
                config.discovery.bootstrap_seeds = bootnode;
            }
            if key_file.is_some() {
                config.key_file = key_file;
            }
            run(config).await?;
        }
        Commands::Id { key_file } => {
            if key_file.is_some() {
                config.key_file = key_file;
            }
            show_id(&config)?;
        }
        Commands::Lookup { target, json, wait } => {
            lookup(config, &target, json, Duration::from_secs(wait)).await?;
        }
        Commands::Init => {
            init_config(&config, &config_path)?;
        }
    }

    Ok(())
}

async fn run(config: Config) -> Result<()> {
    let node = Node::start(&config).await?;
    println!("Listening as {}", node.enode_url());
    println!("Press Ctrl+C to stop.");

    tokio::signal::ctrl_c().await?;
    tracing::info!("interrupt received, shutting down");
    node.shutdown().await;
    Ok(())
}

fn show_id(config: &Config) -> Result<()> {
    let identity = load_identity(&config.key_file())?;
    let record = identity.record(NodeEndpoint::from_udp(config.listen_addr(), config.discovery.listen_port));
    println!("Node ID: {}", identity.node_id());
    println!("{}", record.to_enode_url());
    Ok(())
}

async fn lookup(config: Config, target: &str, json: bool, wait: Duration) -> Result<()> {
    let target: PublicKey = target.parse()?;

    let node = Node::start(&config).await?;
    if !node.wait_for_peers(1, wait).await {
        tracing::warn!("no peers reachable yet, looking up anyway");
    }
    let result = node.lookup(&target).await;
    node.shutdown().await;
    let found = result?;

    if json {
        println!("{}", serde_json::to_string_pretty(&found)?);
        return Ok(());
    }

    if found.is_empty() {
        println!("No nodes found.");
        return Ok(());
    }
    println!("Closest {} node(s) to {}:", found.len(), target.id().short());
    for record in &found {
        println!("  {}  {}", record.id.short(), record.to_enode_url());
    }
    Ok(())
}

fn init_config(config: &Config, path: &Path) -> Result<()> {
    if path.exists() {
        println!("Config already exists at: {}", path.display());
        return Ok(());
    }

    let data_dir = config.data_dir();
    if !data_dir.exists() {
        std::fs::create_dir_all(&data_dir)?;
        tracing::info!("Created data directory: {}", data_dir.display());
    }
    config.save(path)?;

    println!("Initialized sonar at: {}", path.display());
    Ok(())
}
