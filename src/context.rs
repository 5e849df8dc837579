//! The containment-subsystem collaborators the NSU reads from and writes to
//! (spec §6, "Consumed: Context"). The containment subsystem itself — container
//! execution, monitoring, log aggregation — is out of scope (spec §1); this
//! module only defines the narrow surface the NSU needs from it.

use crate::model::{ApplicationId, ApplicationPhase, ContainerId, ContainerStatus, Resource};
use crate::rpc::ContainerQueuingLimit;
use crate::secret::MasterKey;
use dashmap::DashMap;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;

/// Health as reported by the node health checker.
#[derive(Debug, Clone)]
pub struct NodeHealthStatus {
    pub is_healthy: bool,
    pub health_report: String,
    pub last_report_time_ms: i64,
}

impl Default for NodeHealthStatus {
    fn default() -> Self {
        Self {
            is_healthy: true,
            health_report: "ok".to_string(),
            last_report_time_ms: 0,
        }
    }
}

/// Container-aggregate and whole-node utilization, as read from the resource
/// monitors (spec §4.2).
#[derive(Debug, Clone, Copy, Default, serde::Serialize, serde::Deserialize)]
pub struct Utilization {
    pub containers_cpu_percent: f32,
    pub containers_memory_mib: u64,
    pub node_cpu_percent: f32,
    pub node_memory_mib: u64,
}

/// Summary of opportunistic (best-effort, overcommitted) containers on the
/// node, attached verbatim to the outgoing `NodeStatus` (spec §4.2).
#[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize)]
pub struct OpportunisticContainersSummary {
    pub running: u32,
    pub queued: u32,
}

/// A cross-node collector address, compared with happens-before semantics
/// when merging controller updates (spec §4.5 step 8).
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct AppCollectorData {
    pub address: String,
    pub version: u64,
}

impl AppCollectorData {
    /// True if `incoming` happens-after `self` and should replace it.
    pub fn is_superseded_by(&self, incoming: &AppCollectorData) -> bool {
        incoming.version > self.version
    }
}

/// The `containerManager`/`nodeResourceMonitor` half of "Consumed: Context"
/// (spec §6): live utilization, opportunistic-container status, and the
/// queuing-limit sink. The containment subsystem computes these; the NSU only
/// reads (or, for the queuing limit, forwards) them once per tick.
pub trait ContainerRuntimeMonitor: Send + Sync {
    fn utilization(&self) -> Utilization;
    fn opportunistic_containers_status(&self) -> OpportunisticContainersSummary;
    fn update_queuing_limit(&self, limit: ContainerQueuingLimit);
}

/// Default monitor for deployments (and tests) with no opportunistic
/// scheduling or live utilization sampling wired in: zeroed readings, and the
/// queuing limit is accepted but not forwarded anywhere.
pub struct NullContainerRuntimeMonitor;

impl ContainerRuntimeMonitor for NullContainerRuntimeMonitor {
    fn utilization(&self) -> Utilization {
        Utilization::default()
    }

    fn opportunistic_containers_status(&self) -> OpportunisticContainersSummary {
        OpportunisticContainersSummary::default()
    }

    fn update_queuing_limit(&self, _limit: ContainerQueuingLimit) {}
}

/// The shared collaborators the NSU reads from and mutates under the
/// containment subsystem's own locking discipline (spec §5).
pub struct NodeContext {
    /// Owned by the containment subsystem; NSU mutations are confined to
    /// `remove` (spec §3 "Ownership").
    pub containers: Arc<DashMap<ContainerId, ContainerStatus>>,
    pub applications: Arc<DashMap<ApplicationId, ApplicationPhase>>,
    /// Read-and-remove each tick by the status collector (spec §4.2).
    pub increased_containers: Arc<DashMap<ContainerId, ContainerStatus>>,
    pub known_collectors: Arc<DashMap<ApplicationId, AppCollectorData>>,
    pub registering_collectors: Arc<DashMap<ApplicationId, ()>>,
    /// Per-app credentials installed from `systemCredentialsForApps` (spec
    /// §4.5 step 6); the `containerTokenSecretManager`/`nmTokenSecretManager`
    /// collaborator's per-application half (the node-wide keys live on the
    /// heartbeat loop instead, see `HeartbeatLoop::container_token_key`).
    pub system_credentials: Arc<DashMap<ApplicationId, MasterKey>>,

    pub health_status: Arc<Mutex<NodeHealthStatus>>,
    pub total_resource: Arc<Mutex<Resource>>,
    pub physical_resource: Resource,
    pub runtime_monitor: Arc<dyn ContainerRuntimeMonitor>,

    decommissioned: Arc<AtomicBool>,
}

impl NodeContext {
    pub fn new(physical_resource: Resource, initial_total: Resource) -> Self {
        Self {
            containers: Arc::new(DashMap::new()),
            applications: Arc::new(DashMap::new()),
            increased_containers: Arc::new(DashMap::new()),
            known_collectors: Arc::new(DashMap::new()),
            registering_collectors: Arc::new(DashMap::new()),
            system_credentials: Arc::new(DashMap::new()),
            health_status: Arc::new(Mutex::new(NodeHealthStatus::default())),
            total_resource: Arc::new(Mutex::new(initial_total)),
            physical_resource,
            runtime_monitor: Arc::new(NullContainerRuntimeMonitor),
            decommissioned: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Swap in a real `containerManager`/`nodeResourceMonitor` capability in
    /// place of the zeroed default.
    pub fn with_runtime_monitor(mut self, monitor: Arc<dyn ContainerRuntimeMonitor>) -> Self {
        self.runtime_monitor = monitor;
        self
    }

    pub fn is_decommissioned(&self) -> bool {
        self.decommissioned.load(Ordering::SeqCst)
    }

    pub fn set_decommissioned(&self, value: bool) {
        self.decommissioned.store(value, Ordering::SeqCst);
    }

    /// Install a per-app credential set from a heartbeat response's
    /// `systemCredentialsForApps` (spec §4.5 step 6).
    pub fn install_system_credentials(&self, app: ApplicationId, key: MasterKey) {
        self.system_credentials.insert(app, key);
    }

    /// Drain the increased-containers map (spec §4.2 "read-and-remove").
    pub fn drain_increased_containers(&self) -> Vec<ContainerStatus> {
        let ids: Vec<ContainerId> = self.increased_containers.iter().map(|e| e.key().clone()).collect();
        ids.into_iter()
            .filter_map(|id| self.increased_containers.remove(&id).map(|(_, v)| v))
            .collect()
    }

    /// Remove a container from the live map. The only mutation the NSU makes
    /// to the containment subsystem's container map (spec §3 "Ownership").
    pub fn remove_container(&self, id: &ContainerId) {
        self.containers.remove(id);
    }

    pub fn application_phase(&self, app: &ApplicationId) -> Option<ApplicationPhase> {
        self.applications.get(app).map(|e| *e.value())
    }

    pub fn live_application_ids(&self) -> Vec<ApplicationId> {
        self.applications
            .iter()
            .filter(|e| !e.value().is_terminal())
            .map(|e| e.key().clone())
            .collect()
    }
}

/// In-memory tombstone store standing in for the out-of-scope node state
/// store (spec §1 "does not persist the container catalogue... only
/// annotates a state store with completion-tracking tombstones").
#[derive(Default)]
pub struct StateStore {
    removed: HashMap<ContainerId, ()>,
}

impl StateStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mirrors `nmStateStore.removeContainer(id)` (spec §6). Failures here are
    /// logged and non-fatal (spec §7).
    pub fn remove_container(&mut self, id: &ContainerId) -> crate::error::Result<()> {
        self.removed.insert(id.clone(), ());
        Ok(())
    }

    pub fn is_tombstoned(&self, id: &ContainerId) -> bool {
        self.removed.contains_key(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::ApplicationId;

    #[test]
    fn collector_happens_before_comparison() {
        let old = AppCollectorData { address: "10.0.0.1:9".to_string(), version: 1 };
        let newer = AppCollectorData { address: "10.0.0.2:9".to_string(), version: 2 };
        let stale = AppCollectorData { address: "10.0.0.3:9".to_string(), version: 1 };
        assert!(old.is_superseded_by(&newer));
        assert!(!old.is_superseded_by(&stale));
    }

    #[test]
    fn decommission_flag_round_trips() {
        let ctx = NodeContext::new(Resource::new(8192, 4), Resource::new(8192, 4));
        assert!(!ctx.is_decommissioned());
        ctx.set_decommissioned(true);
        assert!(ctx.is_decommissioned());
    }

    #[test]
    fn install_system_credentials_stores_per_app_key() {
        let ctx = NodeContext::new(Resource::new(8192, 4), Resource::new(8192, 4));
        let app = ApplicationId { cluster_timestamp: 1, id: 1 };
        assert!(ctx.system_credentials.get(&app).is_none());
        ctx.install_system_credentials(app.clone(), crate::secret::MasterKey { key_id: 5, material: "tok".to_string().into() });
        let installed = ctx.system_credentials.get(&app).unwrap();
        assert_eq!(installed.key_id, 5);
    }

    #[test]
    fn null_runtime_monitor_reports_zeroed_readings() {
        let ctx = NodeContext::new(Resource::new(8192, 4), Resource::new(8192, 4));
        let utilization = ctx.runtime_monitor.utilization();
        assert_eq!(utilization.node_memory_mib, 0);
        let opportunistic = ctx.runtime_monitor.opportunistic_containers_status();
        assert_eq!(opportunistic.running, 0);
    }

    #[test]
    fn state_store_tombstones_removed_containers() {
        let mut store = StateStore::new();
        let id = ContainerId {
            application_attempt_id: ApplicationId { cluster_timestamp: 1, id: 1 },
            sequence: 1,
        };
        assert!(!store.is_tombstoned(&id));
        store.remove_container(&id).unwrap();
        assert!(store.is_tombstoned(&id));
    }
}
