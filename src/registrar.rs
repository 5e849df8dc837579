//! Registration handshake (spec §4.1).
//!
//! A one-shot exchange that establishes the node with the controller, gates
//! on minimum controller version, installs the initial master keys, and may
//! apply a controller-dictated resource override.

use crate::config::NsuConfig;
use crate::context::NodeContext;
use crate::error::{NsuError, Result};
use crate::labels::NodeLabelsHandler;
use crate::model::{ContainerStatus, NodeAction, NodeId, Resource};
use crate::rpc::{RegisterRequest, RegisterResponse, ResourceTrackerClient};
use crate::secret::MasterKey;
use tracing::{info, warn};

/// Outcome of a successful registration. A `Shutdown` outcome means the
/// controller told this node to shut down during the handshake itself; the
/// caller must not proceed to the heartbeat loop (spec §4.1 edge case).
pub enum RegistrationOutcome {
    Registered {
        rm_identifier: i64,
        container_token_master_key: Option<MasterKey>,
        nm_token_master_key: Option<MasterKey>,
    },
    Shutdown {
        diagnostics: String,
    },
}

pub struct Registrar<'a> {
    config: &'a NsuConfig,
    client: &'a dyn ResourceTrackerClient,
}

impl<'a> Registrar<'a> {
    pub fn new(config: &'a NsuConfig, client: &'a dyn ResourceTrackerClient) -> Self {
        Self { config, client }
    }

    /// Check the controller's advertised version against the configured
    /// minimum (spec §4.1). `NONE` never gates; `EqualToNM` requires an exact
    /// match with this node's own version; otherwise an explicit semver floor.
    pub fn check_version(&self, controller_version: &str) -> Result<()> {
        match self.config.controller.resourcemanager_minimum_version.as_str() {
            "NONE" => Ok(()),
            "EqualToNM" => {
                if controller_version == self.config.controller.node_manager_version {
                    Ok(())
                } else {
                    Err(NsuError::Registration(format!(
                        "controller version {} does not match required EqualToNM version {}",
                        controller_version, self.config.controller.node_manager_version
                    )))
                }
            }
            minimum => {
                let min = semver::Version::parse(minimum)
                    .map_err(|e| NsuError::Config(format!("invalid minimum version {minimum}: {e}")))?;
                let actual = semver::Version::parse(controller_version)
                    .map_err(|e| NsuError::Registration(format!("controller reported unparseable version {controller_version}: {e}")))?;
                if actual >= min {
                    Ok(())
                } else {
                    Err(NsuError::Registration(format!(
                        "controller version {actual} is below required minimum {min}"
                    )))
                }
            }
        }
    }

    /// Run the handshake once. Retries are the caller's responsibility; this
    /// method performs exactly one RPC attempt.
    pub async fn register(
        &self,
        node_id: NodeId,
        http_port: u16,
        physical_resource: Resource,
        existing_container_reports: Vec<ContainerStatus>,
        context: &NodeContext,
        labels: &mut dyn NodeLabelsHandler,
    ) -> Result<RegistrationOutcome> {
        let running_app_ids = context.live_application_ids();
        let node_labels = labels.labels_for_registration();

        let request = RegisterRequest {
            node_id: node_id.clone(),
            http_port,
            total_resource: physical_resource,
            physical_resource,
            node_manager_version: self.config.controller.node_manager_version.clone(),
            existing_container_reports,
            running_app_ids,
            node_labels,
        };

        let response: RegisterResponse = self.client.register_node_manager(request).await?;

        labels.verify_registration_ack(response.are_node_labels_accepted_by_rm, &response.diagnostics_message);

        if response.node_action == NodeAction::Shutdown {
            warn!(diagnostics = %response.diagnostics_message, "controller directed shutdown during registration");
            return Ok(RegistrationOutcome::Shutdown { diagnostics: response.diagnostics_message });
        }

        self.check_version(&response.resourcemanager_version)?;

        if let Some(resource) = response.resource {
            let mut total = context.total_resource.lock().await;
            *total = resource;
            info!(?resource, "applied controller resource override at registration");
        }

        info!(rm_identifier = response.rm_identifier, node_id = %node_id, "registered with controller");

        Ok(RegistrationOutcome::Registered {
            rm_identifier: response.rm_identifier,
            container_token_master_key: response.container_token_master_key,
            nm_token_master_key: response.nm_token_master_key,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::labels::CentralizedLabelsHandler;
    use crate::rpc::FakeResourceTrackerClient;

    fn node_id() -> NodeId {
        NodeId { host: "node-1".to_string(), port: 9 }
    }

    #[test]
    fn version_gate_none_always_passes() {
        let config = NsuConfig::default();
        let client = FakeResourceTrackerClient::new();
        let registrar = Registrar::new(&config, &client);
        assert!(registrar.check_version("0.0.1").is_ok());
    }

    #[test]
    fn version_gate_explicit_minimum_rejects_older() {
        let mut config = NsuConfig::default();
        config.controller.resourcemanager_minimum_version = "3.0.0".to_string();
        let client = FakeResourceTrackerClient::new();
        let registrar = Registrar::new(&config, &client);
        assert!(registrar.check_version("2.9.9").is_err());
        assert!(registrar.check_version("3.0.0").is_ok());
    }

    #[test]
    fn version_gate_equal_to_nm_requires_exact_match() {
        let mut config = NsuConfig::default();
        config.controller.resourcemanager_minimum_version = "EqualToNM".to_string();
        config.controller.node_manager_version = "1.2.3".to_string();
        let client = FakeResourceTrackerClient::new();
        let registrar = Registrar::new(&config, &client);
        assert!(registrar.check_version("1.2.3").is_ok());
        assert!(registrar.check_version("1.2.4").is_err());
    }

    #[tokio::test]
    async fn registration_installs_keys_and_applies_resource_override() {
        let config = NsuConfig::default();
        let client = FakeResourceTrackerClient::new();
        client
            .push_register(Ok(RegisterResponse {
                rm_identifier: 42,
                node_action: NodeAction::Normal,
                resourcemanager_version: "1.0.0".to_string(),
                diagnostics_message: String::new(),
                container_token_master_key: Some(MasterKey { key_id: 1, material: "ctk".to_string().into() }),
                nm_token_master_key: Some(MasterKey { key_id: 1, material: "ntk".to_string().into() }),
                resource: Some(Resource::new(4096, 2)),
                are_node_labels_accepted_by_rm: None,
            }))
            .await;

        let context = NodeContext::new(Resource::new(8192, 4), Resource::new(8192, 4));
        let registrar = Registrar::new(&config, &client);
        let mut labels = CentralizedLabelsHandler;

        let outcome = registrar
            .register(node_id(), 8042, Resource::new(8192, 4), Vec::new(), &context, &mut labels)
            .await
            .unwrap();

        match outcome {
            RegistrationOutcome::Registered { rm_identifier, container_token_master_key, .. } => {
                assert_eq!(rm_identifier, 42);
                assert!(container_token_master_key.is_some());
            }
            RegistrationOutcome::Shutdown { .. } => panic!("expected Registered"),
        }
        assert_eq!(context.total_resource.lock().await.v_cores, 2);
    }

    #[tokio::test]
    async fn register_rejects_controller_below_configured_minimum() {
        let mut config = NsuConfig::default();
        config.controller.resourcemanager_minimum_version = "2.0.0".to_string();
        let client = FakeResourceTrackerClient::new();
        client
            .push_register(Ok(RegisterResponse {
                rm_identifier: 1,
                node_action: NodeAction::Normal,
                resourcemanager_version: "1.9.0".to_string(),
                diagnostics_message: String::new(),
                container_token_master_key: None,
                nm_token_master_key: None,
                resource: None,
                are_node_labels_accepted_by_rm: None,
            }))
            .await;

        let context = NodeContext::new(Resource::new(8192, 4), Resource::new(8192, 4));
        let registrar = Registrar::new(&config, &client);
        let mut labels = CentralizedLabelsHandler;

        let result = registrar.register(node_id(), 8042, Resource::new(8192, 4), Vec::new(), &context, &mut labels).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn shutdown_at_registration_is_surfaced_not_an_error() {
        let config = NsuConfig::default();
        let client = FakeResourceTrackerClient::new();
        client
            .push_register(Ok(RegisterResponse {
                rm_identifier: 0,
                node_action: NodeAction::Shutdown,
                resourcemanager_version: "1.0.0".to_string(),
                diagnostics_message: "decommissioning".to_string(),
                container_token_master_key: None,
                nm_token_master_key: None,
                resource: None,
                are_node_labels_accepted_by_rm: None,
            }))
            .await;

        let context = NodeContext::new(Resource::new(8192, 4), Resource::new(8192, 4));
        let registrar = Registrar::new(&config, &client);
        let mut labels = CentralizedLabelsHandler;

        let outcome = registrar
            .register(node_id(), 8042, Resource::new(8192, 4), Vec::new(), &context, &mut labels)
            .await
            .unwrap();

        assert!(matches!(outcome, RegistrationOutcome::Shutdown { .. }));
    }
}
