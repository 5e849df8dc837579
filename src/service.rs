//! Service lifecycle (spec §4.8): `init` → `start` → background heartbeat
//! loop → `stop`/`reboot`. Mirrors the corpus's atomic-flag shutdown-signal
//! pattern, generalized to the node agent's registration/heartbeat cycle
//! rather than an HTTP termination endpoint.

use crate::config::NsuConfig;
use crate::context::NodeContext;
use crate::dispatch::EventBus;
use crate::error::{NsuError, Result};
use crate::heartbeat::{HeartbeatLoop, LoopExit};
use crate::labels::{CentralizedLabelsHandler, DistributedLabelsHandler, NodeLabelsHandler, StaticLabelProvider};
use crate::metrics::NsuMetrics;
use crate::model::{ContainerStatus, NodeId, Resource};
use crate::registrar::{RegistrationOutcome, Registrar};
use crate::rpc::{HttpResourceTrackerClient, ResourceTrackerClient};
use crate::secret::MasterKey;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{info, warn};

fn build_labels_handler(config: &NsuConfig) -> Box<dyn NodeLabelsHandler> {
    match config.node_labels.provider_mode.as_str() {
        "distributed" => {
            let provider = StaticLabelProvider::new(config.node_labels.static_labels.iter().cloned().collect());
            Box::new(DistributedLabelsHandler::new(Box::new(provider), config.node_labels.resync_interval_ms))
        }
        _ => Box::new(CentralizedLabelsHandler),
    }
}

/// Top-level owner of the node's control-plane lifecycle.
pub struct NodeStatusUpdaterService {
    config: NsuConfig,
    node_id: NodeId,
    http_port: u16,
    client: Arc<dyn ResourceTrackerClient>,
    context: Arc<NodeContext>,
    bus: EventBus,
    metrics: Arc<NsuMetrics>,

    rm_identifier: Arc<Mutex<i64>>,
    registered: AtomicBool,
    stopped: Arc<AtomicBool>,
    wakeup_tx: Mutex<mpsc::Sender<()>>,
    wakeup_rx: Mutex<Option<mpsc::Receiver<()>>>,
    loop_handle: Mutex<Option<JoinHandle<LoopExit>>>,
}

impl NodeStatusUpdaterService {
    /// `init` (spec §4.8): validate config, build collaborators. Physical
    /// resource detection and resource-plugin amendment are out of scope
    /// (spec §1); the caller supplies the detected value directly.
    pub fn init(config: NsuConfig, node_id: NodeId, http_port: u16, physical_resource: Resource, bus: EventBus) -> Result<Self> {
        config.validate().map_err(NsuError::Config)?;
        if config.heartbeat.duration_to_track_stopped_containers_ms < 0 {
            return Err(NsuError::Config("duration_to_track_stopped_containers_ms must be >= 0".to_string()));
        }

        let client: Arc<dyn ResourceTrackerClient> =
            Arc::new(HttpResourceTrackerClient::new(config.controller.url.clone(), config.request_timeout())?);
        let context = Arc::new(NodeContext::new(physical_resource, physical_resource));
        let (wakeup_tx, wakeup_rx) = mpsc::channel(8);

        Ok(Self {
            config,
            node_id,
            http_port,
            client,
            context,
            bus,
            metrics: NsuMetrics::new(),
            rm_identifier: Arc::new(Mutex::new(-1)),
            registered: AtomicBool::new(false),
            stopped: Arc::new(AtomicBool::new(false)),
            wakeup_tx: Mutex::new(wakeup_tx),
            wakeup_rx: Mutex::new(Some(wakeup_rx)),
            loop_handle: Mutex::new(None),
        })
    }

    /// Construct with an injected RPC client, for callers that need a
    /// transport other than the default HTTP/JSON one (fakes in tests, or an
    /// alternative `ResourceTrackerClient` implementation in production).
    pub fn init_with_client(
        config: NsuConfig,
        node_id: NodeId,
        http_port: u16,
        physical_resource: Resource,
        bus: EventBus,
        client: Arc<dyn ResourceTrackerClient>,
    ) -> Result<Self> {
        config.validate().map_err(NsuError::Config)?;
        let context = Arc::new(NodeContext::new(physical_resource, physical_resource));
        let (wakeup_tx, wakeup_rx) = mpsc::channel(8);
        Ok(Self {
            config,
            node_id,
            http_port,
            client,
            context,
            bus,
            metrics: NsuMetrics::new(),
            rm_identifier: Arc::new(Mutex::new(-1)),
            registered: AtomicBool::new(false),
            stopped: Arc::new(AtomicBool::new(false)),
            wakeup_tx: Mutex::new(wakeup_tx),
            wakeup_rx: Mutex::new(Some(wakeup_rx)),
            loop_handle: Mutex::new(None),
        })
    }

    pub fn context(&self) -> Arc<NodeContext> {
        self.context.clone()
    }

    /// The metrics registry this service actually updates, for wiring into a
    /// Prometheus exporter (spec §4.8's metrics section).
    pub fn metrics(&self) -> Arc<NsuMetrics> {
        self.metrics.clone()
    }

    /// `start` (spec §4.8): register, then spawn the heartbeat loop thread.
    pub async fn start(&self, existing_container_reports: Vec<ContainerStatus>) -> Result<()> {
        let mut labels = build_labels_handler(&self.config);
        let registrar = Registrar::new(&self.config, self.client.as_ref());

        self.metrics.registrations_attempted.fetch_add(1, Ordering::Relaxed);
        let outcome = registrar
            .register(
                self.node_id.clone(),
                self.http_port,
                self.context.physical_resource,
                existing_container_reports,
                &self.context,
                labels.as_mut(),
            )
            .await?;

        let (rm_identifier, container_token_key, nm_token_key) = match outcome {
            RegistrationOutcome::Registered { rm_identifier, container_token_master_key, nm_token_master_key } => {
                (rm_identifier, container_token_master_key, nm_token_master_key)
            }
            RegistrationOutcome::Shutdown { diagnostics } => {
                return Err(NsuError::Registration(format!("controller directed shutdown at registration: {diagnostics}")));
            }
        };

        *self.rm_identifier.lock().await = rm_identifier;
        self.registered.store(true, Ordering::SeqCst);

        self.spawn_loop(labels, container_token_key, nm_token_key).await
    }

    async fn spawn_loop(&self, labels: Box<dyn NodeLabelsHandler>, container_token_key: Option<MasterKey>, nm_token_key: Option<MasterKey>) -> Result<()> {
        let wakeup_rx = self
            .wakeup_rx
            .lock()
            .await
            .take()
            .ok_or_else(|| NsuError::Other("heartbeat loop already running".to_string()))?;

        let collector = crate::collector::StatusCollector::new(self.node_id.clone());
        let stopped_cache = Arc::new(crate::cache::RecentlyStoppedCache::new(self.config.heartbeat.duration_to_track_stopped_containers_ms));
        let keep_alive = crate::keepalive::KeepAliveTracker::new(
            self.config.heartbeat.log_aggregation_enabled,
            self.config.heartbeat.security_enabled,
            self.config.heartbeat.token_removal_delay_ms,
        );

        let mut heartbeat_loop = HeartbeatLoop::new(
            self.config.clone(),
            self.client.clone(),
            self.context.clone(),
            self.bus.clone(),
            labels,
            collector,
            stopped_cache,
            keep_alive,
            self.metrics.clone(),
            self.rm_identifier.clone(),
            container_token_key,
            nm_token_key,
        );

        let stopped = self.stopped.clone();
        let handle = tokio::spawn(async move { heartbeat_loop.run(stopped, wakeup_rx).await });
        *self.loop_handle.lock().await = Some(handle);
        Ok(())
    }

    /// `sendOutOfBandHeartBeat` (spec §4.7).
    pub async fn send_out_of_band_heartbeat(&self) {
        if self.wakeup_tx.lock().await.send(()).await.is_err() {
            warn!("heartbeat loop not running, out-of-band wakeup dropped");
        }
    }

    /// `stop` (spec §4.8, §8 property 8): unregister iff registered, not
    /// already stopped, not under supervised recovery, not decommissioned,
    /// and not already failed-to-connect.
    pub async fn stop(&self) -> Result<()> {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.send_out_of_band_heartbeat().await;

        if let Some(handle) = self.loop_handle.lock().await.take() {
            let _ = handle.await;
        }

        let should_unregister = self.registered.load(Ordering::SeqCst)
            && !self.config.recovery.supervised
            && !self.context.is_decommissioned();

        if should_unregister {
            if let Err(e) = self.client.unregister_node_manager(crate::rpc::UnregisterRequest { node_id: self.node_id.clone() }).await {
                warn!(error = %e, "unregister at shutdown failed, continuing shutdown anyway");
            }
        } else {
            info!("skipping unregister at shutdown per guard conditions");
        }

        Ok(())
    }

    /// Reboot sequence (spec §4.7): stop the current loop, re-register, and
    /// start a fresh loop, all observable as a single state transition.
    pub async fn reboot(&self, existing_container_reports: Vec<ContainerStatus>) -> Result<()> {
        self.stopped.store(true, Ordering::SeqCst);
        self.send_out_of_band_heartbeat().await;
        if let Some(handle) = self.loop_handle.lock().await.take() {
            let _ = handle.await;
        }

        let (wakeup_tx, wakeup_rx) = mpsc::channel(8);
        *self.wakeup_rx.lock().await = Some(wakeup_rx);
        *self.wakeup_tx.lock().await = wakeup_tx;

        self.stopped.store(false, Ordering::SeqCst);
        self.start(existing_container_reports).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rpc::{FakeResourceTrackerClient, RegisterResponse};
    use crate::model::NodeAction;

    fn node_id() -> NodeId {
        NodeId { host: "node-1".to_string(), port: 9 }
    }

    #[tokio::test]
    async fn start_registers_and_spawns_loop() {
        let client = Arc::new(FakeResourceTrackerClient::new());
        client
            .push_register(Ok(RegisterResponse {
                rm_identifier: 5,
                node_action: NodeAction::Normal,
                resourcemanager_version: "1.0.0".to_string(),
                diagnostics_message: String::new(),
                container_token_master_key: None,
                nm_token_master_key: None,
                resource: None,
                are_node_labels_accepted_by_rm: None,
            }))
            .await;

        let (bus, _rx) = EventBus::channel(16);
        let service = NodeStatusUpdaterService::init_with_client(
            NsuConfig::default(),
            node_id(),
            8042,
            Resource::new(8192, 4),
            bus,
            client,
        )
        .unwrap();

        service.start(Vec::new()).await.unwrap();
        assert_eq!(*service.rm_identifier.lock().await, 5);
        assert!(service.registered.load(Ordering::SeqCst));

        service.stop().await.unwrap();
    }

    #[tokio::test]
    async fn stop_skips_unregister_when_decommissioned() {
        let client = Arc::new(FakeResourceTrackerClient::new());
        client
            .push_register(Ok(RegisterResponse {
                rm_identifier: 1,
                node_action: NodeAction::Normal,
                resourcemanager_version: "1.0.0".to_string(),
                diagnostics_message: String::new(),
                container_token_master_key: None,
                nm_token_master_key: None,
                resource: None,
                are_node_labels_accepted_by_rm: None,
            }))
            .await;

        let (bus, _rx) = EventBus::channel(16);
        let service = NodeStatusUpdaterService::init_with_client(
            NsuConfig::default(),
            node_id(),
            8042,
            Resource::new(8192, 4),
            bus,
            client.clone(),
        )
        .unwrap();
        service.start(Vec::new()).await.unwrap();
        service.context.set_decommissioned(true);

        service.stop().await.unwrap();
        assert_eq!(*client.unregister_calls.lock().await, 0);
    }
}
