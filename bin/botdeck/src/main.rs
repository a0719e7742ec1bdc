//! ---
//! ems_section: "05-networking-external-interfaces"
//! ems_subsection: "binary"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Operator CLI driving a bot through the lifecycle controller."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use botdeck_common::{format_file_size, format_uptime, AppConfig};
use botdeck_core::{
    AuthGateway, ControlPlane, ControllerDeps, ControllerHandle, EnvAuthGateway, FileSlot,
    LifecycleController, OperationReport, StaticAuthGateway,
};
use botdeck_logging as logging;
use botdeck_net::{HttpControlPlane, HttpRecordStore};
use chrono::Utc;
use clap::{Parser, Subcommand};
use tracing::debug;

mod dashboard;

const SETTLE_TIMEOUT: Duration = Duration::from_secs(3);

#[derive(Debug, Parser)]
#[command(author, version, about = "botdeck operator CLI", long_about = None)]
struct Cli {
    #[arg(long, value_name = "FILE", help = "Path to configuration file")]
    config: Option<PathBuf>,

    #[arg(long, value_name = "USER", default_value = "operator", help = "Label used in logs")]
    user: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    #[command(about = "Show the bot's remote status")]
    Status,
    #[command(about = "Start the bot")]
    Start,
    #[command(about = "Stop the bot")]
    Stop,
    #[command(about = "Upload a file into the primary or dependencies slot")]
    Upload {
        path: PathBuf,
        #[arg(long, help = "primary or dependencies; inferred from the extension when omitted")]
        slot: Option<String>,
    },
    #[command(about = "Deploy the selected files, uploading any given here first")]
    Deploy {
        #[arg(long, value_name = "FILE")]
        primary: Option<PathBuf>,
        #[arg(long, value_name = "FILE")]
        dependencies: Option<PathBuf>,
    },
    #[command(about = "Interactive dashboard streaming controller events")]
    Dashboard,
}

#[tokio::main]
async fn main() -> Result<()> {
    logging::init();
    let cli = Cli::parse();
    let mut candidates = Vec::new();
    if let Some(path) = &cli.config {
        candidates.push(path.clone());
    }
    candidates.push(PathBuf::from("configs/botdeck.toml"));
    let config = AppConfig::load(&candidates)?;

    let auth: Arc<dyn AuthGateway> = match &config.auth.token {
        Some(token) => Arc::new(StaticAuthGateway::new(Some(token.clone()))),
        None => Arc::new(EnvAuthGateway::new(config.auth.token_env.clone())),
    };
    let control_plane = Arc::new(HttpControlPlane::new(&config.client)?);
    if let Commands::Status = cli.command {
        return print_status(control_plane.as_ref(), auth.as_ref()).await;
    }

    let deps = ControllerDeps {
        control_plane,
        auth: auth.clone(),
        store: Arc::new(HttpRecordStore::new(&config.client, auth)?),
        metrics: None,
    };
    let handle = LifecycleController::spawn(cli.user.clone(), config.controller.clone(), deps);

    let outcome = match cli.command {
        Commands::Status => Ok(()),
        Commands::Start => finish(handle.start().await),
        Commands::Stop => finish(handle.stop().await),
        Commands::Upload { path, slot } => {
            settle(&handle).await;
            upload(&handle, &path, slot.as_deref()).await
        }
        Commands::Deploy {
            primary,
            dependencies,
        } => {
            settle(&handle).await;
            deploy(&handle, primary.as_deref(), dependencies.as_deref()).await
        }
        Commands::Dashboard => dashboard::run(&handle).await,
    };
    handle.shutdown().await;
    outcome
}

async fn print_status(control_plane: &dyn ControlPlane, auth: &dyn AuthGateway) -> Result<()> {
    let credential = auth.credential().await?;
    let report = control_plane.status(&credential).await?;
    println!("state:        {}", report.bot_state);
    if report.bot_state.is_running() {
        if let Some(started) = report.last_started {
            let elapsed = (Utc::now() - started).to_std().unwrap_or_default();
            println!("uptime:       {}", format_uptime(elapsed));
        }
    }
    if let Some(url) = &report.deployment_url {
        println!("deployment:   {url}");
    }
    if let Some(reference) = &report.repository_ref {
        println!("repository:   {reference}");
    }
    if let Some(deployed) = report.last_deployed {
        println!("deployed at:  {}", deployed.to_rfc3339());
    }
    if let Some(balance) = report.balance {
        println!("balance:      {balance:.2}");
    }
    if let Some(has_primary) = report.has_primary_file {
        println!("primary file: {}", if has_primary { "selected" } else { "none" });
    }
    Ok(())
}

/// Give the controller's initial record load a chance to land so file
/// selections already on the record are known before acting on them.
async fn settle(handle: &ControllerHandle) {
    let mut view = handle.watch();
    if tokio::time::timeout(SETTLE_TIMEOUT, view.changed()).await.is_err() {
        debug!("initial record load did not arrive before the settle timeout");
    }
}

async fn upload(handle: &ControllerHandle, path: &Path, slot: Option<&str>) -> Result<()> {
    let name = path
        .file_name()
        .and_then(|name| name.to_str())
        .with_context(|| format!("{} has no usable file name", path.display()))?;
    let slot = match slot {
        Some(slot) => slot.to_string(),
        None => match FileSlot::infer(name) {
            Some(slot) => slot.as_str().to_string(),
            None => bail!("cannot infer a slot for {name}; pass --slot"),
        },
    };
    let bytes = tokio::fs::read(path)
        .await
        .with_context(|| format!("unable to read {}", path.display()))?;
    println!("uploading {name} ({})", format_file_size(bytes.len() as u64));
    finish(handle.capture_file(&slot, name, bytes).await)
}

async fn deploy(
    handle: &ControllerHandle,
    primary: Option<&Path>,
    dependencies: Option<&Path>,
) -> Result<()> {
    if let Some(path) = primary {
        upload(handle, path, Some(FileSlot::Primary.as_str())).await?;
    }
    if let Some(path) = dependencies {
        upload(handle, path, Some(FileSlot::Dependencies.as_str())).await?;
    }
    let report = handle.deploy().await;
    if report.is_ok() {
        let view = handle.view();
        if let Some(url) = &view.deployment_url {
            println!("deployment url: {url}");
        }
    }
    finish(report)
}

fn finish(report: OperationReport) -> Result<()> {
    println!("{report}");
    if report.is_ok() {
        Ok(())
    } else {
        bail!("{} did not succeed", report.operation.as_str())
    }
}
