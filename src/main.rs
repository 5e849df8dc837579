use node_status_updater::config::NsuConfig;
use node_status_updater::dispatch::{EventBus, NsuEvent};
use node_status_updater::metrics;
use node_status_updater::model::{NodeId, Resource};
use node_status_updater::service::NodeStatusUpdaterService;

use anyhow::{Context, Result};
use std::net::SocketAddr;
use tracing::{error, info, warn};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "node_status_updater=info".into()),
        )
        .with_target(false)
        .with_thread_ids(true)
        .with_line_number(true)
        .init();

    info!(
        "Starting Node Status Updater v{}",
        env!("CARGO_PKG_VERSION")
    );

    let config_name = std::env::var("NSU_CONFIG").unwrap_or_else(|_| "config.dev".to_string());
    let config_paths = vec![config_name.clone(), format!("config/{config_name}"), "config/default".to_string()];

    let mut config = None;
    for path in &config_paths {
        match NsuConfig::from_file(path) {
            Ok(loaded) => {
                info!(path = %path, "configuration loaded");
                config = Some(loaded);
                break;
            }
            Err(e) => {
                tracing::debug!(path = %path, error = %e, "could not load configuration from this path");
            }
        }
    }

    let config = config.unwrap_or_else(|| {
        warn!("no configuration file found, using defaults");
        NsuConfig::default()
    });

    if let Err(e) = config.validate() {
        error!(error = %e, "configuration validation failed");
        return Err(anyhow::anyhow!("invalid configuration: {e}"));
    }

    info!(
        controller_url = %config.controller.url,
        provider_mode = %config.node_labels.provider_mode,
        recovery_enabled = config.recovery.enabled,
        "node status updater configured"
    );

    let node_host = std::env::var("NSU_NODE_HOST").unwrap_or_else(|_| "127.0.0.1".to_string());
    let node_port: u16 = std::env::var("NSU_NODE_PORT").ok().and_then(|v| v.parse().ok()).unwrap_or(45454);
    let http_port: u16 = std::env::var("NSU_HTTP_PORT").ok().and_then(|v| v.parse().ok()).unwrap_or(8042);
    let memory_mib: u64 = std::env::var("NSU_MEMORY_MIB").ok().and_then(|v| v.parse().ok()).unwrap_or(8192);
    let v_cores: u32 = std::env::var("NSU_V_CORES").ok().and_then(|v| v.parse().ok()).unwrap_or(4);

    let node_id = NodeId { host: node_host, port: node_port };
    let physical_resource = Resource::new(memory_mib, v_cores);

    let (bus, mut bus_rx) = EventBus::channel(128);

    tokio::spawn(async move {
        while let Some(event) = bus_rx.recv().await {
            match event {
                NsuEvent::CompletedContainers(ids) => info!(count = ids.len(), "containers completed"),
                NsuEvent::CompletedApplications(ids) => info!(count = ids.len(), "applications completed"),
                NsuEvent::ContainersToUpdate(ids) => info!(count = ids.len(), "containers to update"),
                NsuEvent::ContainersToSignal(ids) => info!(count = ids.len(), "containers to signal"),
                NsuEvent::Shutdown { diagnostics } => warn!(diagnostics = %diagnostics, "controller directed shutdown"),
                NsuEvent::Resync => warn!("controller directed resync"),
            }
        }
    });

    let service = NodeStatusUpdaterService::init(config.clone(), node_id, http_port, physical_resource, bus)
        .context("failed to initialize node status updater service")?;

    service.start(Vec::new()).await.context("failed to register with controller")?;
    info!("node status updater registered and heartbeat loop running");

    if config.metrics.enabled {
        let metrics_handle = service.metrics();
        let addr: SocketAddr = format!("{}:{}", config.metrics.listen_address, config.metrics.listen_port)
            .parse()
            .context("invalid metrics listen address")?;
        tokio::spawn(async move {
            if let Err(e) = metrics::start_metrics_server(addr, metrics_handle).await {
                error!(error = %e, "metrics server exited");
            }
        });
    }

    tokio::signal::ctrl_c().await.context("failed to listen for shutdown signal")?;
    info!("shutdown signal received, stopping node status updater");
    service.stop().await.context("failed to stop cleanly")?;

    Ok(())
}
