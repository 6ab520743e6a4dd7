//! `vlxmqttha` – Velux gateway to Home Assistant MQTT bridge
//!
//! This binary:
//!
//! 1. Reads the TOML configuration named on the command line and applies
//!    `VLXBRIDGE_*` environment overrides.
//! 2. Initialises logging (optional log file, optional OTLP export).
//! 3. Creates the PID file, refusing to start if another instance holds it.
//! 4. Connects to the MQTT broker, retrying until it answers.
//! 5. Starts the [`BridgeRegistry`] for every opening device of the gateway.
//! 6. Waits for Ctrl-C / SIGTERM, then tears down bridges, gateway and bus in
//!    that order.

mod config;
mod pidfile;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::sync::Notify;
use tracing::{error, info, warn};

use vlxbridge_hal::Gateway;
use vlxbridge_middleware::{MessageBus, MqttBus};
use vlxbridge_runtime::{BridgeRegistry, init_tracing};

use crate::pidfile::PidFile;

#[derive(Debug, Parser)]
#[command(name = "vlxmqttha", version)]
#[command(about = "Expose Velux windows, blinds and awnings to Home Assistant over MQTT")]
struct Cli {
    /// Path to the TOML configuration file
    config_file: PathBuf,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let cfg = config::load_from(&cli.config_file)
        .with_context(|| format!("loading {}", cli.config_file.display()))?;

    let _telemetry = init_tracing("vlxmqttha", &cfg.log_settings());
    info!(config = ?cfg, "configuration loaded");
    if !cfg.velux.host.is_empty() {
        info!(host = %cfg.velux.host, devices = cfg.gateway.devices.len(), "using simulated gateway");
    }

    let _pidfile = PidFile::create(&cfg.daemon.pidfile)?;

    // ── Signal handling ───────────────────────────────────────────────────
    // ctrlc's `termination` feature covers SIGTERM as well as SIGINT.
    let shutdown = Arc::new(Notify::new());
    let trigger = shutdown.clone();
    if let Err(e) = ctrlc::set_handler(move || trigger.notify_one()) {
        warn!(error = %e, "failed to install signal handler; only SIGKILL will stop the bridge");
    }

    // ── Bus ───────────────────────────────────────────────────────────────
    let mqtt = cfg.mqtt_settings();
    let bus: Arc<dyn MessageBus> = tokio::select! {
        bus = MqttBus::connect(&mqtt) => Arc::new(bus.context("connecting to the MQTT broker")?),
        _ = shutdown.notified() => {
            info!("interrupted while connecting to the MQTT broker");
            return Ok(());
        }
    };

    // ── Bridges ───────────────────────────────────────────────────────────
    let gateway: Arc<dyn Gateway> = Arc::new(cfg.sim_gateway());
    let registry = match BridgeRegistry::start(bus.clone(), gateway, cfg.registry_settings()).await {
        Ok(registry) => registry,
        Err(e) => {
            error!(error = %e, "bridge startup failed");
            let _ = bus.disconnect().await;
            return Err(e).context("starting the bridge registry");
        }
    };
    info!(devices = ?registry.identities(), "bridge running");

    shutdown.notified().await;
    info!("shutdown requested");
    registry.shutdown().await.context("shutting down")?;
    Ok(())
}
