use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use polyp::commands::{self, Command};
use polyp::config::PolypConfig;
use polyp::link::IpRoute;
use polyp::store::FileStore;
use polyp::types::Scope;
use polyp::ResourceManager;

/// Manage VLAN bridge networks and their container endpoints
#[derive(Parser)]
#[command(name = "polyp", author, version, about)]
struct Cli {
    /// Path to a JSON configuration file
    #[arg(long)]
    config: Option<PathBuf>,

    /// Directory holding network and endpoint records
    #[arg(long)]
    state_dir: Option<PathBuf>,

    /// Physical uplink interface
    #[arg(long)]
    uplink: Option<String>,

    /// Scope declared to the orchestrator (local or global)
    #[arg(long)]
    scope: Option<Scope>,

    /// Enable verbose output
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

fn main() {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .finish();
    let _ = tracing::subscriber::set_global_default(subscriber);

    if let Err(err) = run(cli) {
        error!("polyp error: {:#}", err);
        std::process::exit(1);
    }
}

fn run(cli: Cli) -> Result<()> {
    let mut config = match &cli.config {
        Some(path) => PolypConfig::load(path)?,
        None => PolypConfig::default(),
    };
    config.apply_env().context("Invalid environment")?;
    if let Some(dir) = cli.state_dir {
        config.state_dir = dir;
    }
    if let Some(uplink) = cli.uplink {
        config.uplink = uplink;
    }
    if let Some(scope) = cli.scope {
        config.scope = scope;
    }

    if !nix::unistd::geteuid().is_root() {
        warn!("Not running as root, kernel changes will likely be refused");
    }

    let store = FileStore::open(&config.state_dir).with_context(|| {
        format!("Failed to open state directory {}", config.state_dir.display())
    })?;
    let manager =
        ResourceManager::from_config(&config, Arc::new(store), Arc::new(IpRoute::default()))
            .context("Failed to start driver")?;

    let output = commands::execute(&manager, &config.network_options(), cli.command)?;
    println!("{}", serde_json::to_string_pretty(&output)?);
    Ok(())
}
