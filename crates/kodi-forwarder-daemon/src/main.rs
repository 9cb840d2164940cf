//! kodi-forwarder daemon
//!
//! Forwards button presses from a paired remote control to a Kodi host,
//! resolving chords against a configurable mapping and managing the host
//! connection (including wake-on-LAN power-on and SSH-backed power-off).

mod controller;
mod dispatcher;
mod eventserver;
mod forwarder;
mod power;
mod resolver;
mod rpc;
mod session;
mod shell;
mod wake;

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "kodi-forwarderd")]
#[command(about = "Forwards a paired remote control's input to a Kodi host")]
struct Args {
    /// Path to configuration file
    #[arg(short, long, default_value = "/etc/kodi-forwarder/config.kdl")]
    config: String,

    /// Log level (error, warn, info, debug, trace)
    #[arg(short, long, env = "LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// Override the Kodi host from the config file
    #[arg(long)]
    host: Option<String>,

    /// Override the mapping name from the config file
    #[arg(long)]
    mapping: Option<String>,

    /// Override the mappings directory from the config file
    #[arg(long)]
    mappings_dir: Option<PathBuf>,

    /// List available input devices and exit
    #[arg(long)]
    list_devices: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log_level)),
        )
        .init();

    if args.list_devices {
        return list_devices();
    }

    let config_path: PathBuf = shellexpand::tilde(&args.config).into_owned().into();
    tracing::info!("Loading configuration from {}", config_path.display());

    let mut config = kodi_forwarder_config::parse_config(&config_path)
        .with_context(|| format!("loading {}", config_path.display()))?;

    if let Some(host) = args.host {
        config.kodi.host = host;
    }
    if let Some(mapping) = args.mapping {
        config.controller.mapping = mapping;
    }
    if let Some(dir) = args.mappings_dir {
        config.controller.mappings_dir = dir;
    }

    let table = kodi_forwarder_config::load_mapping(
        &config.controller.mappings_dir,
        &config.controller.mapping,
    )
    .context("loading the button mapping")?;

    tracing::info!(
        "Forwarding controller {} to {} with mapping '{}'",
        config.controller.identity,
        config.kodi.host,
        table.name()
    );

    let forwarder = forwarder::Forwarder::new(config, table)?;

    let shutdown = CancellationToken::new();
    {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            wait_for_signal().await;
            shutdown.cancel();
        });
    }

    forwarder.run(shutdown).await?;

    tracing::info!("kodi-forwarder shutdown complete");
    Ok(())
}

async fn wait_for_signal() {
    let ctrl_c = tokio::signal::ctrl_c();
    match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
        Ok(mut terminate) => {
            tokio::select! {
                _ = ctrl_c => {}
                _ = terminate.recv() => {}
            }
        }
        Err(e) => {
            tracing::warn!("Could not install SIGTERM handler: {}", e);
            let _ = ctrl_c.await;
        }
    }
    tracing::info!("Shutdown signal received");
}

fn list_devices() -> Result<()> {
    println!("Available input devices:\n");
    for device in controller::enumerate_devices()? {
        println!(
            "  {}  {}  (phys: {})",
            device.path.display(),
            device.name,
            device.phys.as_deref().unwrap_or("-")
        );
    }
    Ok(())
}
