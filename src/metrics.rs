//! Prometheus metrics surface (spec §10.5). Ambient observability, not a
//! scheduling feature — carried regardless of what the core spec scopes out.

use anyhow::{Context, Result};
use metrics::{describe_counter, describe_gauge, gauge};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

/// Process-local counters/gauges, mirrored into the Prometheus registry by
/// `start_metrics_server`'s periodic sweep.
#[derive(Default)]
pub struct NsuMetrics {
    pub heartbeats_sent: AtomicU64,
    pub heartbeats_missed: AtomicU64,
    pub registrations_attempted: AtomicU64,
    pub pending_completion_buffer_size: AtomicI64,
    pub advertised_memory_mib: AtomicI64,
    pub advertised_v_cores: AtomicI64,
}

impl NsuMetrics {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }
}

pub fn initialize_metrics() {
    describe_counter!("nsu_heartbeats_sent_total", "Total heartbeat rounds attempted");
    describe_counter!("nsu_heartbeats_missed_total", "Total heartbeat rounds that failed transiently");
    describe_counter!("nsu_registrations_attempted_total", "Total registration handshakes attempted");
    describe_gauge!("nsu_pending_completion_buffer_size", "Current size of the pending-completion buffer");
    describe_gauge!("nsu_advertised_memory_mib", "Currently advertised total memory in MiB");
    describe_gauge!("nsu_advertised_v_cores", "Currently advertised total virtual cores");
}

pub async fn start_metrics_server(listen_addr: SocketAddr, metrics: Arc<NsuMetrics>) -> Result<()> {
    info!(metrics_addr = %listen_addr, "starting Prometheus metrics server");

    let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
    builder
        .with_http_listener(listen_addr)
        .install()
        .context("failed to install Prometheus exporter")?;

    initialize_metrics();
    info!(metrics_addr = %listen_addr, "Prometheus metrics server started");

    let mut interval = tokio::time::interval(Duration::from_secs(5));
    loop {
        interval.tick().await;
        gauge!("nsu_pending_completion_buffer_size", metrics.pending_completion_buffer_size.load(Ordering::Relaxed) as f64);
        gauge!("nsu_advertised_memory_mib", metrics.advertised_memory_mib.load(Ordering::Relaxed) as f64);
        gauge!("nsu_advertised_v_cores", metrics.advertised_v_cores.load(Ordering::Relaxed) as f64);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn metrics_start_at_zero() {
        let metrics = NsuMetrics::new();
        assert_eq!(metrics.heartbeats_sent.load(Ordering::Relaxed), 0);
        assert_eq!(metrics.pending_completion_buffer_size.load(Ordering::Relaxed), 0);
    }
}
