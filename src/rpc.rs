//! The Controller ResourceTracker RPC surface (spec §6).
//!
//! `ResourceTrackerClient` is the "Consumed capability" boundary; the
//! controller-side scheduler and its protocol encoding are out of scope (spec
//! §1). `HttpResourceTrackerClient` is a concrete HTTP/JSON transport so the
//! crate is runnable end to end; `FakeResourceTrackerClient` is test-only
//! scaffolding for exercising the heartbeat state machine without a network.

use crate::context::{AppCollectorData, OpportunisticContainersSummary, Utilization};
use crate::error::{NsuError, Result};
use crate::model::{ApplicationId, ContainerId, ContainerStatus, NodeAction, NodeId, Resource};
use crate::secret::MasterKey;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

/// One `NodeStatus` snapshot per tick (spec §4.2).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeStatus {
    pub response_id: i64,
    pub node_id: NodeId,
    pub node_healthy: bool,
    pub health_report: String,
    pub health_report_time_ms: i64,
    pub container_statuses: Vec<ContainerStatus>,
    pub increased_containers: Vec<ContainerStatus>,
    pub utilization: Utilization,
    pub keep_alive_applications: Vec<ApplicationId>,
    pub opportunistic_containers_status: OpportunisticContainersSummary,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterRequest {
    pub node_id: NodeId,
    pub http_port: u16,
    pub total_resource: Resource,
    pub physical_resource: Resource,
    pub node_manager_version: String,
    pub existing_container_reports: Vec<ContainerStatus>,
    pub running_app_ids: Vec<ApplicationId>,
    pub node_labels: Option<HashSet<String>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterResponse {
    pub rm_identifier: i64,
    pub node_action: NodeAction,
    /// The controller's own version, compared against the configured minimum
    /// (spec §4.1 step 3).
    pub resourcemanager_version: String,
    pub diagnostics_message: String,
    pub container_token_master_key: Option<MasterKey>,
    pub nm_token_master_key: Option<MasterKey>,
    pub resource: Option<Resource>,
    pub are_node_labels_accepted_by_rm: Option<bool>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatRequest {
    pub node_status: NodeStatus,
    pub current_container_token_key_id: Option<i64>,
    pub current_node_token_key_id: Option<i64>,
    pub node_labels: Option<HashSet<String>>,
    pub registering_collectors: Vec<ApplicationId>,
    pub log_aggregation_reports: Option<Vec<String>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContainerQueuingLimit {
    pub max_queue_length: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct HeartbeatResponse {
    pub response_id: i64,
    pub next_heart_beat_interval_ms: i64,
    pub node_action: NodeAction,
    pub diagnostics_message: String,
    pub container_token_master_key: Option<MasterKey>,
    pub nm_token_master_key: Option<MasterKey>,
    pub are_node_labels_accepted_by_rm: Option<bool>,
    pub containers_to_cleanup: Vec<ContainerId>,
    pub applications_to_cleanup: Vec<ApplicationId>,
    pub containers_to_be_removed_from_nm: Vec<ContainerId>,
    pub containers_to_update: Vec<ContainerId>,
    pub containers_to_signal: Vec<ContainerId>,
    // Wire format is a list of pairs, not a map, so the (struct-valued)
    // ApplicationId key round-trips through JSON without a custom key codec.
    pub system_credentials_for_apps: Vec<(ApplicationId, MasterKey)>,
    pub app_collectors: Vec<(ApplicationId, AppCollectorData)>,
    pub container_queuing_limit: Option<ContainerQueuingLimit>,
    pub resource: Option<Resource>,
}

impl Default for NodeAction {
    fn default() -> Self {
        NodeAction::Normal
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UnregisterRequest {
    pub node_id: NodeId,
}

/// The "Consumed capability: Controller ResourceTracker" of spec §6.
#[async_trait]
pub trait ResourceTrackerClient: Send + Sync {
    async fn register_node_manager(&self, req: RegisterRequest) -> Result<RegisterResponse>;
    async fn node_heartbeat(&self, req: HeartbeatRequest) -> Result<HeartbeatResponse>;
    async fn unregister_node_manager(&self, req: UnregisterRequest) -> Result<()>;
}

/// HTTP/JSON transport, adapted from the corpus's `OrchestratorClient` HTTP
/// usage (timeouts via `Client::builder()`, `.json(&req)`, status check then
/// `.json().await`).
pub struct HttpResourceTrackerClient {
    http_client: reqwest::Client,
    base_url: String,
    request_timeout: Duration,
}

impl HttpResourceTrackerClient {
    pub fn new(base_url: String, request_timeout: Duration) -> Result<Self> {
        let http_client = reqwest::Client::builder()
            .timeout(request_timeout)
            .build()
            .map_err(NsuError::from)?;
        Ok(Self { http_client, base_url, request_timeout })
    }

    async fn post_json<Req: Serialize, Resp: for<'de> Deserialize<'de>>(
        &self,
        path: &str,
        body: &Req,
    ) -> Result<Resp> {
        let url = format!("{}{}", self.base_url, path);
        let response = self
            .http_client
            .post(&url)
            .json(body)
            .timeout(self.request_timeout)
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let text = response.text().await.unwrap_or_default();
            return Err(NsuError::Rpc {
                message: format!("{} returned {}: {}", path, status, text),
                transient: status.is_server_error(),
            });
        }

        Ok(response.json().await?)
    }
}

#[async_trait]
impl ResourceTrackerClient for HttpResourceTrackerClient {
    async fn register_node_manager(&self, req: RegisterRequest) -> Result<RegisterResponse> {
        self.post_json("/ws/v1/resourcetracker/register", &req).await
    }

    async fn node_heartbeat(&self, req: HeartbeatRequest) -> Result<HeartbeatResponse> {
        self.post_json("/ws/v1/resourcetracker/heartbeat", &req).await
    }

    async fn unregister_node_manager(&self, req: UnregisterRequest) -> Result<()> {
        let url = format!("{}/ws/v1/resourcetracker/unregister", self.base_url);
        let response = self
            .http_client
            .post(&url)
            .json(&req)
            .timeout(self.request_timeout)
            .send()
            .await?;
        if !response.status().is_success() {
            let status = response.status();
            return Err(NsuError::Rpc {
                message: format!("unregister returned {}", status),
                transient: false,
            });
        }
        Ok(())
    }
}

/// In-memory fake controller used by tests. Each call pops the next queued
/// response (or errs) so scenarios can script exact sequences (spec §8).
pub struct FakeResourceTrackerClient {
    register_responses: Mutex<Vec<Result<RegisterResponse>>>,
    heartbeat_responses: Mutex<Vec<Result<HeartbeatResponse>>>,
    pub unregister_calls: Arc<Mutex<u32>>,
}

impl FakeResourceTrackerClient {
    pub fn new() -> Self {
        Self {
            register_responses: Mutex::new(Vec::new()),
            heartbeat_responses: Mutex::new(Vec::new()),
            unregister_calls: Arc::new(Mutex::new(0)),
        }
    }

    pub async fn push_register(&self, resp: Result<RegisterResponse>) {
        self.register_responses.lock().await.push(resp);
    }

    pub async fn push_heartbeat(&self, resp: Result<HeartbeatResponse>) {
        self.heartbeat_responses.lock().await.push(resp);
    }
}

impl Default for FakeResourceTrackerClient {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ResourceTrackerClient for FakeResourceTrackerClient {
    async fn register_node_manager(&self, _req: RegisterRequest) -> Result<RegisterResponse> {
        let mut queue = self.register_responses.lock().await;
        if queue.is_empty() {
            return Err(NsuError::Rpc { message: "no scripted register response".into(), transient: false });
        }
        queue.remove(0)
    }

    async fn node_heartbeat(&self, _req: HeartbeatRequest) -> Result<HeartbeatResponse> {
        let mut queue = self.heartbeat_responses.lock().await;
        if queue.is_empty() {
            return Err(NsuError::Rpc { message: "no scripted heartbeat response".into(), transient: true });
        }
        queue.remove(0)
    }

    async fn unregister_node_manager(&self, _req: UnregisterRequest) -> Result<()> {
        *self.unregister_calls.lock().await += 1;
        Ok(())
    }
}
