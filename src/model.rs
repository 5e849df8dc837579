//! Core data model shared by every NSU component (spec §3).

use serde::{Deserialize, Serialize};
use std::fmt;

/// Opaque stable identifier of this node (host + port). Created at start, immutable.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct NodeId {
    pub host: String,
    pub port: u16,
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// Advertised or detected node capacity.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct Resource {
    pub memory_mib: u64,
    pub v_cores: u32,
}

impl Resource {
    pub const fn new(memory_mib: u64, v_cores: u32) -> Self {
        Self { memory_mib, v_cores }
    }
}

/// Identifies an application attempt submitted to the controller.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ApplicationId {
    pub cluster_timestamp: i64,
    pub id: u32,
}

impl fmt::Display for ApplicationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "application_{}_{:04}", self.cluster_timestamp, self.id)
    }
}

/// Identifies a container including its owning application attempt and a
/// monotonic per-attempt sequence. Ordered comparable per spec §3.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ContainerId {
    pub application_attempt_id: ApplicationId,
    pub sequence: u64,
}

impl fmt::Display for ContainerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "container_{}_{:06}", self.application_attempt_id, self.sequence)
    }
}

/// Lifecycle state of a single container, as reported to the controller.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum ContainerState {
    New,
    Running,
    Complete,
}

/// A point-in-time status report for one container.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ContainerStatus {
    pub container_id: ContainerId,
    pub state: ContainerState,
    pub exit_code: i32,
    pub diagnostics: String,
    pub capabilities: Vec<String>,
}

impl ContainerStatus {
    pub fn is_complete(&self) -> bool {
        self.state == ContainerState::Complete
    }
}

/// Terminal phases of an application's lifecycle on this node (spec §4.2).
/// A container whose owning application has reached one of these phases is
/// eligible for removal from the live container map once it has also completed.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum ApplicationPhase {
    Running,
    FinishingContainersWait,
    ApplicationResourcesCleaningup,
    Finished,
}

impl ApplicationPhase {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            ApplicationPhase::FinishingContainersWait
                | ApplicationPhase::ApplicationResourcesCleaningup
                | ApplicationPhase::Finished
        )
    }
}

/// The directive a controller response may carry (spec §6).
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum NodeAction {
    Normal,
    Shutdown,
    Resync,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn container_id_orders_by_application_then_sequence() {
        let app = ApplicationId { cluster_timestamp: 1, id: 1 };
        let a = ContainerId { application_attempt_id: app.clone(), sequence: 1 };
        let b = ContainerId { application_attempt_id: app, sequence: 2 };
        assert!(a < b);
    }

    #[test]
    fn terminal_phase_classification() {
        assert!(ApplicationPhase::Finished.is_terminal());
        assert!(ApplicationPhase::FinishingContainersWait.is_terminal());
        assert!(!ApplicationPhase::Running.is_terminal());
    }
}
