use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::info;

/// Root configuration for the node status updater.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NsuConfig {
    pub controller: ControllerConfig,
    pub heartbeat: HeartbeatConfig,
    pub node_labels: NodeLabelsConfig,
    pub recovery: RecoveryConfig,
    pub metrics: MetricsConfig,
    pub logging: LoggingConfig,
}

/// Controller connection and version-gate configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControllerConfig {
    /// Base URL of the controller's ResourceTracker service.
    pub url: String,
    /// Per-RPC request timeout.
    pub request_timeout_ms: u64,
    /// Minimum controller version this node will register against: "NONE",
    /// "EqualToNM", or an explicit semver string (spec §4.1).
    pub resourcemanager_minimum_version: String,
    /// This node's own version, advertised at registration and compared
    /// against the minimum when it is "EqualToNM".
    pub node_manager_version: String,
}

/// Heartbeat cadence and retention configuration (spec §4.2, §4.5).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatConfig {
    /// Floor below which the controller-advertised interval is never allowed
    /// to push the heartbeat loop (spec §4.5 invariant).
    pub interval_floor_ms: i64,
    /// Initial interval used before the first heartbeat response arrives.
    pub initial_interval_ms: i64,
    /// How long a completed container's ID is remembered to suppress
    /// duplicate cleanup directives (spec §3, §4.2).
    pub duration_to_track_stopped_containers_ms: i64,
    /// Ratio applied when deriving virtual memory limits from physical
    /// memory (spec §4.1 "Resource override").
    pub vmem_pmem_ratio: f64,
    /// How often the node-manager's own liveness expires if no heartbeat is
    /// delivered, used to size connect-retry budgets (spec §4.5).
    pub nm_expiry_interval_ms: i64,
    /// Whether log-aggregation reports are attached to heartbeats (spec §4.3).
    pub log_aggregation_enabled: bool,
    /// Whether container-token security (and therefore keep-alive) is active.
    pub security_enabled: bool,
    /// Delay after which an application's credentials are evicted absent a
    /// keep-alive; drives the keep-alive jitter window (spec §4.3).
    pub token_removal_delay_ms: i64,
}

/// Node-labels subsystem configuration (spec §4.4).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeLabelsConfig {
    /// "centralized" or "distributed".
    pub provider_mode: String,
    /// Resync interval for the distributed variant.
    pub resync_interval_ms: i64,
    /// Statically configured labels, used by the distributed variant's
    /// default label provider.
    pub static_labels: Vec<String>,
}

/// Recovery-on-restart configuration (spec §4.1 "Recovery").
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecoveryConfig {
    /// Whether this node attempts to re-register previously known containers
    /// across a node-agent restart rather than starting clean.
    pub enabled: bool,
    /// Whether the controller is expected to tolerate a recovering node
    /// (suppresses unregister-on-stop so in-flight containers survive).
    pub supervised: bool,
}

/// Prometheus metrics surface configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsConfig {
    pub enabled: bool,
    pub listen_address: String,
    pub listen_port: u16,
}

/// Structured logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    pub level: String,
    pub json: bool,
}

impl NsuConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.controller.request_timeout_ms)
    }

    pub fn initial_heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat.initial_interval_ms.max(self.heartbeat.interval_floor_ms) as u64)
    }

    /// Clamp a controller-advertised interval to the configured floor (spec
    /// §4.5: "next interval is never allowed below the floor").
    pub fn clamp_heartbeat_interval(&self, advertised_ms: i64) -> Duration {
        Duration::from_millis(advertised_ms.max(self.heartbeat.interval_floor_ms) as u64)
    }
}

impl Default for NsuConfig {
    fn default() -> Self {
        Self {
            controller: ControllerConfig {
                url: "http://127.0.0.1:8050".to_string(),
                request_timeout_ms: 10_000,
                resourcemanager_minimum_version: "NONE".to_string(),
                node_manager_version: env!("CARGO_PKG_VERSION").to_string(),
            },
            heartbeat: HeartbeatConfig {
                interval_floor_ms: 1_000,
                initial_interval_ms: 1_000,
                duration_to_track_stopped_containers_ms: 600_000,
                vmem_pmem_ratio: 2.1,
                nm_expiry_interval_ms: 600_000,
                log_aggregation_enabled: false,
                security_enabled: true,
                token_removal_delay_ms: 120_000,
            },
            node_labels: NodeLabelsConfig {
                provider_mode: "centralized".to_string(),
                resync_interval_ms: 600_000,
                static_labels: Vec::new(),
            },
            recovery: RecoveryConfig {
                enabled: false,
                supervised: false,
            },
            metrics: MetricsConfig {
                enabled: true,
                listen_address: "127.0.0.1".to_string(),
                listen_port: 9050,
            },
            logging: LoggingConfig {
                level: "info".to_string(),
                json: false,
            },
        }
    }
}

impl NsuConfig {
    /// Load configuration from file, layering an `NSU`-prefixed environment
    /// override on top (spec §10.1).
    pub fn from_file(path: &str) -> Result<Self, config::ConfigError> {
        let settings = config::Config::builder()
            .add_source(config::File::with_name(path))
            .add_source(config::Environment::with_prefix("NSU").separator("__"))
            .build()?;

        settings.try_deserialize()
    }

    /// Validate configuration invariants not expressible in the type system.
    pub fn validate(&self) -> Result<(), String> {
        if self.heartbeat.interval_floor_ms <= 0 {
            return Err("heartbeat.interval_floor_ms must be positive".to_string());
        }
        if self.heartbeat.initial_interval_ms <= 0 {
            return Err("heartbeat.initial_interval_ms must be positive".to_string());
        }
        if self.heartbeat.duration_to_track_stopped_containers_ms < 0 {
            return Err("heartbeat.duration_to_track_stopped_containers_ms cannot be negative".to_string());
        }
        if self.heartbeat.vmem_pmem_ratio <= 0.0 {
            return Err("heartbeat.vmem_pmem_ratio must be positive".to_string());
        }
        if self.heartbeat.token_removal_delay_ms < 0 {
            return Err("heartbeat.token_removal_delay_ms cannot be negative".to_string());
        }
        if self.controller.url.is_empty() {
            return Err("controller.url cannot be empty".to_string());
        }
        match self.node_labels.provider_mode.as_str() {
            "centralized" | "distributed" => {}
            other => return Err(format!("node_labels.provider_mode must be centralized or distributed, got {other}")),
        }
        if self.node_labels.provider_mode == "distributed" && self.node_labels.resync_interval_ms <= 0 {
            return Err("node_labels.resync_interval_ms must be positive in distributed mode".to_string());
        }
        match self.controller.resourcemanager_minimum_version.as_str() {
            "NONE" | "EqualToNM" => {}
            version => {
                semver::Version::parse(version)
                    .map_err(|e| format!("controller.resourcemanager_minimum_version is not NONE, EqualToNM, or a valid semver: {e}"))?;
            }
        }
        Ok(())
    }
}

/// Runtime configuration manager supporting hot-reload.
pub struct ConfigManager {
    current: Arc<RwLock<NsuConfig>>,
    config_path: String,
    watchers: Vec<tokio::sync::broadcast::Sender<NsuConfig>>,
}

impl ConfigManager {
    pub fn new(config: NsuConfig, config_path: String) -> Self {
        Self {
            current: Arc::new(RwLock::new(config)),
            config_path,
            watchers: Vec::new(),
        }
    }

    pub async fn get_config(&self) -> NsuConfig {
        self.current.read().await.clone()
    }

    pub async fn reload_config(&mut self) -> Result<(), String> {
        info!(path = %self.config_path, "reloading configuration");

        let new_config = NsuConfig::from_file(&self.config_path).map_err(|e| format!("failed to load config: {e}"))?;
        new_config.validate().map_err(|e| format!("invalid config: {e}"))?;

        {
            let mut current = self.current.write().await;
            *current = new_config.clone();
        }

        for sender in &self.watchers {
            let _ = sender.send(new_config.clone());
        }

        info!("configuration reloaded successfully");
        Ok(())
    }

    pub fn subscribe(&mut self) -> tokio::sync::broadcast::Receiver<NsuConfig> {
        let (sender, receiver) = tokio::sync::broadcast::channel(10);
        self.watchers.push(sender);
        receiver
    }
}
