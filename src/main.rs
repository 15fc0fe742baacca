//! devwatch - Device Availability Monitor
//!
//! Polls a list of network devices, tracks their online/offline state,
//! raises debounced alerts and keeps a status history.

mod config;
mod db;
mod device;
mod monitor;
mod probe;
mod registry;
mod web;

use config::ServerConfig;
use db::Store;
use monitor::{AlertKind, HistoryLog, Monitor, MonitorEvent};
use probe::PingProber;
use web::Server;

use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(tracing_subscriber::EnvFilter::from_default_env()
            .add_directive("devwatch=info".parse()?))
        .init();

    // Load configuration
    let cfg = ServerConfig::load();
    tracing::info!("Starting devwatch on port {}...", cfg.http_port);
    tracing::info!("Using database at {}", cfg.db_path);

    // Initialize database
    let store = Arc::new(Store::new(&cfg.db_path)?);
    tracing::info!("Database initialized successfully");

    let logging = monitor::load_logging_flag(&cfg.logging_state_path);
    let history = HistoryLog::new(store, logging);
    tracing::info!("History logging is {}", if logging { "on" } else { "off" });

    let monitor = Arc::new(Monitor::new(
        cfg.monitor_settings(),
        Arc::new(PingProber),
        history,
        Some(PathBuf::from(&cfg.devices_path)),
    ));

    // Restore devices
    let loaded = monitor.restore_devices();
    tracing::info!("Loaded {} devices from {}", loaded, cfg.devices_path);

    tokio::spawn(log_alerts(monitor.subscribe()));
    monitor.start();

    let server = Server::new(cfg.clone(), monitor.clone());
    server.start(shutdown_signal()).await?;

    monitor.shutdown().await;
    if let Err(e) = monitor::save_logging_flag(&cfg.logging_state_path, monitor.history().is_enabled()) {
        tracing::error!("Failed to save logging flag: {}", e);
    }

    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
    tracing::info!("Shutdown requested");
}

/// Surface alerts in the service log.
async fn log_alerts(mut events: broadcast::Receiver<MonitorEvent>) {
    loop {
        match events.recv().await {
            Ok(MonitorEvent::Alert(alert)) => match alert.kind {
                AlertKind::Unreachable => {
                    tracing::warn!("ALERT: {} ({}) is unreachable", alert.label, alert.address)
                }
                AlertKind::Recovered => {
                    tracing::info!("ALERT: {} ({}) is back online", alert.label, alert.address)
                }
            },
            Ok(MonitorEvent::Transition(_)) => {}
            Err(broadcast::error::RecvError::Lagged(n)) => {
                tracing::warn!("Alert logger lagged, skipped {} events", n)
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}
