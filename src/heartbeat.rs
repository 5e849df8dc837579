//! The heartbeat loop (spec §4.5): the background actor driving the
//! CONNECTED/MISSED/STOPPED/FAILED state machine, dispatching controller
//! directives, and rotating security material.

use crate::collector::StatusCollector;
use crate::config::NsuConfig;
use crate::context::{NodeContext, StateStore};
use crate::dispatch::{dispatch_directives, EventBus};
use crate::keepalive::KeepAliveTracker;
use crate::metrics::NsuMetrics;
use crate::model::{ApplicationPhase, NodeAction};
use crate::pending::PendingCompletionBuffer;
use crate::rpc::{HeartbeatRequest, ResourceTrackerClient};
use crate::secret::MasterKey;
use metrics::{counter, gauge};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, error, info, warn};

/// Why the loop returned control to its caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopExit {
    /// `stop()` was called; the caller should not re-register.
    Stopped,
    /// A RESYNC directive arrived; the caller must re-register and restart
    /// the loop (spec §9 decided open question).
    Resync,
    /// Connect retries were exhausted; liveness is lost.
    FailedToConnect,
    /// A SHUTDOWN directive arrived; the node is decommissioned.
    Shutdown,
}

enum TickOutcome {
    Continue,
    Shutdown,
    Resync,
    FailedToConnect,
}

/// Collaborators and mutable state private to the loop thread, per spec §5
/// ("the loop is the only mutator of lastHeartbeatId, missed, nextInterval,
/// rmIdentifier except during registration/reboot").
pub struct HeartbeatLoop {
    config: NsuConfig,
    client: Arc<dyn ResourceTrackerClient>,
    context: Arc<NodeContext>,
    state_store: Mutex<StateStore>,
    bus: EventBus,
    labels: Box<dyn crate::labels::NodeLabelsHandler>,
    collector: StatusCollector,
    pending: PendingCompletionBuffer,
    stopped_cache: Arc<crate::cache::RecentlyStoppedCache>,
    keep_alive: KeepAliveTracker,
    metrics: Arc<NsuMetrics>,

    last_heartbeat_id: i64,
    missed: bool,
    next_interval: Duration,
    rm_identifier: Arc<Mutex<i64>>,
    container_token_key: Option<MasterKey>,
    node_token_key: Option<MasterKey>,
    log_aggregation_queue: Mutex<Vec<String>>,
}

impl HeartbeatLoop {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: NsuConfig,
        client: Arc<dyn ResourceTrackerClient>,
        context: Arc<NodeContext>,
        bus: EventBus,
        labels: Box<dyn crate::labels::NodeLabelsHandler>,
        collector: StatusCollector,
        stopped_cache: Arc<crate::cache::RecentlyStoppedCache>,
        keep_alive: KeepAliveTracker,
        metrics: Arc<NsuMetrics>,
        rm_identifier: Arc<Mutex<i64>>,
        container_token_key: Option<MasterKey>,
        node_token_key: Option<MasterKey>,
    ) -> Self {
        let next_interval = config.initial_heartbeat_interval();
        Self {
            config,
            client,
            context,
            state_store: Mutex::new(StateStore::new()),
            bus,
            labels,
            collector,
            pending: PendingCompletionBuffer::new(),
            stopped_cache,
            keep_alive,
            metrics,
            last_heartbeat_id: 0,
            missed: false,
            next_interval,
            rm_identifier,
            container_token_key,
            node_token_key,
        }
    }

    /// Queue a log-aggregation report batch entry for the next heartbeat
    /// (spec §4.5 step 1). No-op if log aggregation is disabled.
    pub async fn queue_log_aggregation_report(&self, report: String) {
        if self.config.heartbeat.log_aggregation_enabled {
            self.log_aggregation_queue.lock().await.push(report);
        }
    }

    pub fn last_heartbeat_id(&self) -> i64 {
        self.last_heartbeat_id
    }

    pub fn next_interval(&self) -> Duration {
        self.next_interval
    }

    /// Drive the state machine until stopped, a directive ends it, or
    /// liveness is lost. `stopped` is polled cooperatively (spec §5
    /// "Cancellation"); `wakeup_rx` implements `sendOutOfBandHeartBeat`
    /// (spec §4.7): a buffered signalling channel that wakes the interval
    /// wait early and otherwise is swallowed as a spurious wake-up.
    pub async fn run(&mut self, stopped: Arc<AtomicBool>, mut wakeup_rx: mpsc::Receiver<()>) -> LoopExit {
        loop {
            if stopped.load(Ordering::SeqCst) {
                return LoopExit::Stopped;
            }

            match self.tick().await {
                TickOutcome::Continue => {}
                TickOutcome::Shutdown => return LoopExit::Shutdown,
                TickOutcome::Resync => return LoopExit::Resync,
                TickOutcome::FailedToConnect => return LoopExit::FailedToConnect,
            }

            if stopped.load(Ordering::SeqCst) {
                return LoopExit::Stopped;
            }

            tokio::select! {
                _ = tokio::time::sleep(self.next_interval) => {}
                _ = wakeup_rx.recv() => {
                    debug!("heartbeat monitor woken out of band");
                }
            }
        }
    }

    async fn tick(&mut self) -> TickOutcome {
        let node_status = self
            .collector
            .collect(self.last_heartbeat_id, &self.context, &mut self.pending, &self.stopped_cache, &mut self.keep_alive)
            .await;

        self.metrics.pending_completion_buffer_size.store(self.pending.len() as i64, Ordering::Relaxed);
        gauge!("nsu_pending_completion_buffer_size", self.pending.len() as f64);

        let log_aggregation_reports = {
            let mut queue = self.log_aggregation_queue.lock().await;
            if queue.is_empty() {
                None
            } else {
                Some(std::mem::take(&mut *queue))
            }
        };

        let request = HeartbeatRequest {
            node_status,
            current_container_token_key_id: self.container_token_key.as_ref().map(|k| k.key_id),
            current_node_token_key_id: self.node_token_key.as_ref().map(|k| k.key_id),
            node_labels: self.labels.labels_for_heartbeat(),
            registering_collectors: self.context.registering_collectors.iter().map(|e| e.key().clone()).collect(),
            log_aggregation_reports,
        };

        self.metrics.heartbeats_sent.fetch_add(1, Ordering::Relaxed);
        counter!("nsu_heartbeats_sent_total", 1);

        let response = match self.client.node_heartbeat(request).await {
            Ok(response) => response,
            Err(e) if e.is_transient() => {
                warn!(error = %e, "heartbeat round failed, keeping pending completions for retry");
                self.missed = true;
                self.metrics.heartbeats_missed.fetch_add(1, Ordering::Relaxed);
                counter!("nsu_heartbeats_missed_total", 1);
                return TickOutcome::Continue;
            }
            Err(e) => {
                error!(error = %e, "controller unreachable after connect retries, treating as liveness loss");
                self.context.set_decommissioned(true);
                self.bus.publish_shutdown("connect exhaustion").await;
                return TickOutcome::FailedToConnect;
            }
        };

        self.next_interval = if response.next_heart_beat_interval_ms > 0 {
            self.config.clamp_heartbeat_interval(response.next_heart_beat_interval_ms)
        } else {
            self.config.initial_heartbeat_interval()
        };

        if let Some(key) = &response.container_token_master_key {
            self.container_token_key = Some(key.clone());
            info!(key_id = key.key_id, "rotated container-token master key");
        }
        if let Some(key) = &response.nm_token_master_key {
            self.node_token_key = Some(key.clone());
            info!(key_id = key.key_id, "rotated node-token master key");
        }

        // SHUTDOWN and RESYNC consume the response here and return before any
        // further directive or key-rotation side effects below are applied,
        // even though key rotation above already ran (spec §9: SHUTDOWN
        // preempts directive dispatch from the same response, not the keys
        // already installed two steps earlier in §4.5).
        if response.node_action == NodeAction::Shutdown {
            self.context.set_decommissioned(true);
            self.bus.publish_shutdown(&response.diagnostics_message).await;
            return TickOutcome::Shutdown;
        }

        if response.node_action == NodeAction::Resync {
            *self.rm_identifier.lock().await = -1;
            self.bus.publish_resync().await;
            self.pending.clear();
            return TickOutcome::Resync;
        }

        self.labels.verify_heartbeat_ack(response.are_node_labels_accepted_by_rm, &response.diagnostics_message);

        {
            let mut state_store = self.state_store.lock().await;
            for id in &response.containers_to_be_removed_from_nm {
                self.context.remove_container(id);
                if let Err(e) = state_store.remove_container(id) {
                    warn!(error = %e, container = %id, "failed to tombstone container in state store");
                }
            }
        }

        let context = &self.context;
        self.stopped_cache
            .gc(|id| {
                context.containers.contains_key(id)
                    && !context.application_phase(&id.application_attempt_id).map(ApplicationPhase::is_terminal).unwrap_or(false)
            })
            .await;

        // Clearing is deferred one round past a miss: the round immediately
        // following a failed tick resets the flag but leaves the buffer
        // populated, per spec §4.5 step 5.
        if self.missed {
            info!("recovered from missed heartbeat, deferring pending-completion clear one more round");
            self.missed = false;
        } else {
            self.pending.clear();
        }
        self.last_heartbeat_id = response.response_id;

        for app in &response.applications_to_cleanup {
            self.keep_alive.track(app.clone());
        }
        dispatch_directives(&self.bus, &response).await;

        for (app, key) in &response.system_credentials_for_apps {
            self.context.install_system_credentials(app.clone(), key.clone());
        }

        if let Some(limit) = &response.container_queuing_limit {
            debug!(max_queue_length = limit.max_queue_length, "forwarding queuing limit to containment subsystem");
            self.context.runtime_monitor.update_queuing_limit(limit.clone());
        }

        for (app, incoming) in &response.app_collectors {
            let accept = match self.context.known_collectors.get(app) {
                Some(existing) => existing.is_superseded_by(incoming),
                None => true,
            };
            if accept {
                self.context.known_collectors.insert(app.clone(), incoming.clone());
                self.context.registering_collectors.remove(app);
            }
        }

        if let Some(resource) = response.resource {
            let mut total = self.context.total_resource.lock().await;
            *total = resource;
            self.metrics.advertised_memory_mib.store(resource.memory_mib as i64, Ordering::Relaxed);
            self.metrics.advertised_v_cores.store(resource.v_cores as i64, Ordering::Relaxed);
            info!(?resource, "applied controller resource override from heartbeat");
        }

        TickOutcome::Continue
    }
}
