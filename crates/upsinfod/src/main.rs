//! upsinfod - Synology UPS bridge daemon
//!
//! Polls UPS status over SSH and keeps the battery (and optional load sensor)
//! services of every configured accessory up to date.

use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use upsinfod::accessory::{Accessory, AccessoryRegistry};
use upsinfod::config::{accessory_type_of, Config, UpsConfig};
use upsinfod::hap::Service;
use upsinfod::remote::{RemoteShell, RusshShell};
use upsinfod::UpsPoller;

#[derive(Parser)]
#[command(name = "upsinfod")]
#[command(version, about = "Synology UPS status over SSH, bridged to accessory services")]
struct Cli {
    /// Config file (default: /etc/upsinfo/config.toml, then /var/lib/upsinfo/config.toml)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Poll every configured UPS once, print a JSON report and exit
    #[arg(long)]
    once: bool,

    /// Log filter, overrides the config file (RUST_LOG still wins)
    #[arg(long)]
    log_level: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => Config::load_from_path(path)
            .with_context(|| format!("Failed to load config from {}", path.display()))?,
        None => Config::load(),
    };

    let level = cli
        .log_level
        .clone()
        .unwrap_or_else(|| config.daemon.log_level.clone());
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&level)),
        )
        .init();

    info!("upsinfod v{} starting", env!("CARGO_PKG_VERSION"));

    let shell: Arc<dyn RemoteShell> = Arc::new(RusshShell::new());

    if cli.once {
        return run_once(&config, shell).await;
    }

    let mut registry = AccessoryRegistry::new();
    upsinfod::register(&mut registry, Arc::clone(&shell))
        .context("Failed to register UPS accessory")?;

    let mut accessories: Vec<Box<dyn Accessory>> = Vec::new();
    for table in &config.accessories {
        let Some(accessory_type) = accessory_type_of(table) else {
            warn!("Skipping accessory entry without an 'accessory' type");
            continue;
        };

        match registry.create(accessory_type, table) {
            Ok(accessory) => {
                for service in accessory.services() {
                    info!("[{}] Exposing {:?} service '{}'", accessory.name(), service.kind(), service.name());
                    spawn_update_logger(&service);
                }
                accessories.push(accessory);
            }
            Err(e) => error!("{}", e),
        }
    }

    if accessories.is_empty() {
        warn!("No accessories configured, nothing to poll");
    }

    tokio::signal::ctrl_c().await?;
    info!("Shutting down gracefully");

    for accessory in &accessories {
        accessory.shutdown();
    }
    for accessory in &accessories {
        accessory.stopped().await;
    }
    info!("All pollers stopped");

    Ok(())
}

/// Log every value pushed to a service
fn spawn_update_logger(service: &Arc<Service>) {
    let mut updates = service.subscribe();
    tokio::spawn(async move {
        loop {
            match updates.recv().await {
                Ok(update) => info!(
                    "[{}] {} = {}",
                    update.service, update.characteristic, update.value
                ),
                Err(RecvError::Lagged(skipped)) => {
                    warn!("Dropped {} characteristic updates", skipped)
                }
                Err(RecvError::Closed) => break,
            }
        }
    });
}

/// One cycle per configured UPS, report on stdout
async fn run_once(config: &Config, shell: Arc<dyn RemoteShell>) -> Result<()> {
    let mut reports = Vec::new();
    let mut failures = 0;

    for table in config.accessories_of(upsinfod::ACCESSORY_NAME) {
        let poller = UpsPoller::new(UpsConfig::from_table(table), Arc::clone(&shell));
        if poller.run_cycle().await.is_failure() {
            failures += 1;
        }
        reports.push(poller.report());
    }

    println!("{}", serde_json::to_string_pretty(&reports)?);

    if !reports.is_empty() && failures == reports.len() {
        anyhow::bail!("All {} UPS polls failed", failures);
    }
    Ok(())
}
