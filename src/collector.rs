//! Status collector (spec §4.2).
//!
//! Builds one `NodeStatus` snapshot per heartbeat tick from the live container
//! map, the pending-completion buffer, the recently-stopped cache, and the
//! keep-alive tracker.

use crate::cache::RecentlyStoppedCache;
use crate::context::NodeContext;
use crate::keepalive::KeepAliveTracker;
use crate::model::{ApplicationPhase, ContainerState, NodeId};
use crate::pending::PendingCompletionBuffer;
use crate::rpc::NodeStatus;

pub struct StatusCollector {
    node_id: NodeId,
}

impl StatusCollector {
    pub fn new(node_id: NodeId) -> Self {
        Self { node_id }
    }

    /// Build the next outgoing `NodeStatus`. Mutates `pending`, `stopped_cache`,
    /// and `keep_alive` as a side effect, per spec §4.2.
    pub async fn collect(
        &self,
        last_heartbeat_id: i64,
        context: &NodeContext,
        pending: &mut PendingCompletionBuffer,
        stopped_cache: &RecentlyStoppedCache,
        keep_alive: &mut KeepAliveTracker,
    ) -> NodeStatus {
        let utilization = context.runtime_monitor.utilization();
        let opportunistic = context.runtime_monitor.opportunistic_containers_status();

        let health = context.health_status.lock().await.clone();

        let mut live_statuses = Vec::new();
        let container_ids: Vec<_> = context.containers.iter().map(|e| e.key().clone()).collect();
        for id in container_ids {
            let Some(entry) = context.containers.get(&id) else { continue };
            let status = entry.value().clone();
            drop(entry);

            if status.state == ContainerState::Complete {
                stopped_cache.remember(id.clone()).await;
                pending.insert(status);

                let app_terminal = context
                    .application_phase(&id.application_attempt_id)
                    .map(ApplicationPhase::is_terminal)
                    .unwrap_or(false);
                if app_terminal {
                    context.remove_container(&id);
                }
            } else {
                live_statuses.push(status);
            }
        }

        let mut outgoing = live_statuses;
        outgoing.extend(pending.snapshot());

        let increased_containers = context.drain_increased_containers();

        keep_alive.retain_live(context.live_application_ids().iter());
        let keep_alive_applications = keep_alive.due_applications();

        NodeStatus {
            response_id: last_heartbeat_id,
            node_id: self.node_id.clone(),
            node_healthy: health.is_healthy,
            health_report: health.health_report,
            health_report_time_ms: health.last_report_time_ms,
            container_statuses: outgoing,
            increased_containers,
            utilization,
            keep_alive_applications,
            opportunistic_containers_status: opportunistic,
        }
    }
}
