//! ---
//! ems_section: "01-core-functionality"
//! ems_subsection: "binary"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Binary entrypoint for the botdeck control plane daemon."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use botdeck_common::{init_tracing, AppConfig};
use botdeck_metrics::{new_registry, spawn_http_server};
use botdeck_net::{ControlPlaneServerBuilder, DirectoryDeployBackend, StaticTokenVerifier};
use botdeck_store::{verify_snapshot, MemoryDocumentStore};
use clap::{Parser, Subcommand};
use tokio::signal;
use tracing::{info, warn};

#[derive(Debug, Parser)]
#[command(author, version, about = "botdeck control plane daemon", long_about = None)]
struct Cli {
    #[arg(long, value_name = "FILE", help = "Path to configuration file")]
    config: Option<PathBuf>,

    #[arg(long, value_name = "ADDR", help = "Override the listen address")]
    listen: Option<SocketAddr>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    #[command(about = "Serve the control plane until interrupted")]
    Run,
    #[command(about = "Check the record snapshot named in the configuration")]
    VerifySnapshot,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let mut candidates = Vec::new();
    if let Some(path) = &cli.config {
        candidates.push(path.clone());
    }
    candidates.push(PathBuf::from("configs/botdeck.toml"));

    let loaded = AppConfig::load_with_source(&candidates)?;
    let mut config = loaded.config;
    if let Some(listen) = cli.listen {
        config.server.listen = listen;
    }
    init_tracing("botdeckd", &config.logging)?;
    match &loaded.source {
        Some(path) => info!(config_path = %path.display(), "configuration loaded"),
        None => info!("configuration defaults in effect"),
    }

    match cli.command.unwrap_or(Commands::Run) {
        Commands::Run => run_daemon(config).await,
        Commands::VerifySnapshot => {
            let Some(path) = &config.server.snapshot_path else {
                println!("no snapshot_path configured");
                return Ok(());
            };
            let valid = verify_snapshot(path);
            println!("{}: {}", path.display(), if valid { "ok" } else { "INVALID" });
            if !valid {
                anyhow::bail!("snapshot {} failed verification", path.display());
            }
            Ok(())
        }
    }
}

async fn run_daemon(config: AppConfig) -> Result<()> {
    let server_settings = config.server.clone();
    let store = match &server_settings.snapshot_path {
        Some(path) if path.exists() => Arc::new(MemoryDocumentStore::load_from(
            path,
            server_settings.default_balance,
            server_settings.push_buffer,
        )?),
        _ => Arc::new(MemoryDocumentStore::new(
            server_settings.default_balance,
            server_settings.push_buffer,
        )),
    };
    if server_settings.tokens.is_empty() {
        warn!("no tokens configured; every request will be rejected");
    }

    let registry = new_registry();
    let metrics_server = if config.metrics.enabled {
        info!(address = %config.metrics.listen, "metrics exporter enabled");
        Some(spawn_http_server(registry.clone(), config.metrics.listen)?)
    } else {
        info!("metrics exporter disabled by configuration");
        None
    };

    let server = ControlPlaneServerBuilder::new(
        server_settings.listen,
        store.clone(),
        Arc::new(StaticTokenVerifier::new(server_settings.tokens.clone())),
        Arc::new(DirectoryDeployBackend::new(&config.deploy)),
    )
    .with_metrics_registry(registry)
    .spawn()
    .await?;

    info!(address = %server.local_addr(), users = store.len(), "daemon running; waiting for termination signal");
    signal::ctrl_c().await?;
    info!("ctrl-c received; shutting down");
    server.shutdown().await?;

    if let Some(path) = &server_settings.snapshot_path {
        store.save_to(path)?;
    }
    if let Some(server) = metrics_server {
        server.shutdown().await?;
    }
    Ok(())
}
