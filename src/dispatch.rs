//! Directive dispatch (spec §4.5 step 8, §6).
//!
//! Translates a `HeartbeatResponse`'s directive fields into discrete events
//! and publishes them on an in-process bus, the way the containment
//! subsystem is expected to consume node-manager directives (spec §6
//! "Produced capability: directive events"). No external broker is in scope
//! here; `EventBus` is an `mpsc` channel, not a network publisher.

use crate::model::{ApplicationId, ContainerId};
use crate::rpc::HeartbeatResponse;
use tokio::sync::mpsc;
use tracing::warn;

/// A directive event produced from a single heartbeat round.
#[derive(Debug, Clone)]
pub enum NsuEvent {
    CompletedContainers(Vec<ContainerId>),
    CompletedApplications(Vec<ApplicationId>),
    ContainersToUpdate(Vec<ContainerId>),
    ContainersToSignal(Vec<ContainerId>),
    Shutdown { diagnostics: String },
    Resync,
}

/// In-process publish side of the directive bus. Cloneable; each clone shares
/// the same underlying channel.
#[derive(Clone)]
pub struct EventBus {
    sender: mpsc::Sender<NsuEvent>,
}

pub struct EventBusReceiver {
    receiver: mpsc::Receiver<NsuEvent>,
}

impl EventBus {
    pub fn channel(capacity: usize) -> (Self, EventBusReceiver) {
        let (sender, receiver) = mpsc::channel(capacity);
        (Self { sender }, EventBusReceiver { receiver })
    }

    async fn publish(&self, event: NsuEvent) {
        if self.sender.send(event).await.is_err() {
            warn!("directive event bus has no receiver, dropping event");
        }
    }

    pub async fn publish_shutdown(&self, diagnostics: &str) {
        self.publish(NsuEvent::Shutdown { diagnostics: diagnostics.to_string() }).await;
    }

    pub async fn publish_resync(&self) {
        self.publish(NsuEvent::Resync).await;
    }
}

impl EventBusReceiver {
    pub async fn recv(&mut self) -> Option<NsuEvent> {
        self.receiver.recv().await
    }
}

/// Emit events for every directive the controller asked for in one
/// heartbeat round, other than SHUTDOWN and RESYNC, which the heartbeat loop
/// handles directly and must never reach this function for (spec §9 decided
/// open question: SHUTDOWN preempts directive dispatch).
pub async fn dispatch_directives(bus: &EventBus, response: &HeartbeatResponse) {
    if !response.containers_to_cleanup.is_empty() {
        bus.publish(NsuEvent::CompletedContainers(response.containers_to_cleanup.clone())).await;
    }
    if !response.applications_to_cleanup.is_empty() {
        bus.publish(NsuEvent::CompletedApplications(response.applications_to_cleanup.clone())).await;
    }
    if !response.containers_to_update.is_empty() {
        bus.publish(NsuEvent::ContainersToUpdate(response.containers_to_update.clone())).await;
    }
    if !response.containers_to_signal.is_empty() {
        bus.publish(NsuEvent::ContainersToSignal(response.containers_to_signal.clone())).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::ApplicationId;

    fn cid(seq: u64) -> ContainerId {
        ContainerId { application_attempt_id: ApplicationId { cluster_timestamp: 1, id: 1 }, sequence: seq }
    }

    #[tokio::test]
    async fn dispatch_emits_one_event_per_populated_field() {
        let (bus, mut rx) = EventBus::channel(16);
        let response = HeartbeatResponse {
            containers_to_cleanup: vec![cid(1)],
            containers_to_update: vec![cid(2)],
            ..Default::default()
        };
        dispatch_directives(&bus, &response).await;
        drop(bus);

        let mut events = Vec::new();
        while let Some(event) = rx.recv().await {
            events.push(event);
        }
        assert_eq!(events.len(), 2);
        assert!(events.iter().any(|e| matches!(e, NsuEvent::CompletedContainers(ids) if ids.len() == 1)));
        assert!(events.iter().any(|e| matches!(e, NsuEvent::ContainersToUpdate(ids) if ids.len() == 1)));
    }

    #[tokio::test]
    async fn empty_response_emits_nothing() {
        let (bus, mut rx) = EventBus::channel(16);
        dispatch_directives(&bus, &HeartbeatResponse::default()).await;
        drop(bus);
        assert!(rx.recv().await.is_none());
    }
}
