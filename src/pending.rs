//! Pending-completion buffer (spec §3, §4.2, §5, §8 property 1 & 2).
//!
//! Holds completed container statuses that must be re-reported to the
//! controller until a successful heartbeat round acknowledges them.
//! Accessed only from the heartbeat loop thread and the status collector it
//! calls, so no internal lock is needed (spec §5).

use crate::model::{ContainerId, ContainerStatus};
use std::collections::HashMap;

#[derive(Default)]
pub struct PendingCompletionBuffer {
    pending: HashMap<ContainerId, ContainerStatus>,
}

impl PendingCompletionBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a freshly completed container's status. A key is present iff
    /// its COMPLETE status has not yet been acknowledged.
    pub fn insert(&mut self, status: ContainerStatus) {
        self.pending.insert(status.container_id.clone(), status);
    }

    /// All statuses still awaiting acknowledgement, for inclusion in the
    /// outgoing `NodeStatus`.
    pub fn snapshot(&self) -> Vec<ContainerStatus> {
        self.pending.values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Drop every pending completion. Called when a heartbeat round succeeds
    /// with `missed == false` (acknowledged) or on a RESYNC directive.
    pub fn clear(&mut self) {
        self.pending.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ApplicationId, ContainerState};

    fn status(seq: u64) -> ContainerStatus {
        ContainerStatus {
            container_id: ContainerId {
                application_attempt_id: ApplicationId { cluster_timestamp: 1, id: 1 },
                sequence: seq,
            },
            state: ContainerState::Complete,
            exit_code: 0,
            diagnostics: String::new(),
            capabilities: Vec::new(),
        }
    }

    #[test]
    fn insert_then_snapshot_contains_it() {
        let mut buf = PendingCompletionBuffer::new();
        buf.insert(status(1));
        assert_eq!(buf.snapshot().len(), 1);
    }

    #[test]
    fn clear_empties_buffer() {
        let mut buf = PendingCompletionBuffer::new();
        buf.insert(status(1));
        buf.insert(status(2));
        buf.clear();
        assert!(buf.is_empty());
    }

    #[test]
    fn reinserting_same_container_overwrites() {
        let mut buf = PendingCompletionBuffer::new();
        let mut s = status(1);
        buf.insert(s.clone());
        s.exit_code = 137;
        buf.insert(s);
        assert_eq!(buf.len(), 1);
        assert_eq!(buf.snapshot()[0].exit_code, 137);
    }
}
