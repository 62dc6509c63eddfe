//! Provisioning contract.
//!
//! The orchestrator drives a [`Provisioner`]; the Azure CLI implementation
//! lives in `logfwd-deploy`, and tests supply scripted fakes.

use std::collections::BTreeMap;
use std::path::PathBuf;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::config::{DeploymentConfig, EventHubConnection, Secret};
use crate::error::ProvisionError;
use crate::naming::{role_assignment_id, ResourceNames};
use crate::retry::AttemptError;

/// A user-assigned managed identity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdentityRef {
    pub name: String,
    pub resource_id: String,
    pub principal_id: String,
    pub client_id: String,
}

/// One role assignment, keyed by a deterministic GUID.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoleBinding {
    pub assignment_id: Uuid,
    pub principal_id: String,
    pub role_definition_id: String,
    pub scope: String,
}

impl RoleBinding {
    pub fn new(
        principal_id: impl Into<String>,
        role_definition_id: impl Into<String>,
        scope: impl Into<String>,
    ) -> Self {
        let principal_id = principal_id.into();
        let role_definition_id = role_definition_id.into();
        let scope = scope.into();
        Self {
            assignment_id: role_assignment_id(&scope, &principal_id, &role_definition_id),
            principal_id,
            role_definition_id,
            scope,
        }
    }
}

/// Inputs for the network, storage and Function App.
#[derive(Debug, Clone)]
pub struct CorePlan {
    pub resource_group: String,
    pub location: String,
    pub names: ResourceNames,
    /// Existing subnet for the Function App; a new vnet is created when absent.
    pub function_subnet_id: Option<String>,
    /// Existing subnet for the ActiveGate container, if any.
    pub activegate_subnet_id: Option<String>,
    /// Whether the ActiveGate subnet must be created alongside the vnet.
    pub needs_activegate_subnet: bool,
    /// Attach this user-assigned identity at creation time.
    pub identity: Option<IdentityRef>,
    pub app_settings: AppSettings,
}

/// What the core step created.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CoreResources {
    pub function_app_name: String,
    pub function_app_id: String,
    pub function_hostname: String,
    /// System-assigned identity of the Function App.
    pub function_principal_id: Option<String>,
    pub storage_account_id: String,
    pub virtual_network_id: Option<String>,
    pub activegate_subnet_id: Option<String>,
}

/// Inputs for the ActiveGate container.
#[derive(Debug, Clone)]
pub struct ActiveGatePlan {
    pub resource_group: String,
    pub location: String,
    pub container_name: String,
    pub environment_url: String,
    pub environment_id: String,
    pub paas_token: Secret,
    pub subnet_id: Option<String>,
}

/// What the ActiveGate step created.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActiveGateRef {
    pub container_group_id: String,
    pub ip_address: String,
    /// Ingest URL the forwarder should send to.
    pub endpoint_url: String,
}

/// A downloaded forwarder package.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PackageArtifact {
    pub path: PathBuf,
    pub size_bytes: u64,
    pub sha256: String,
}

/// Function App settings. Values that hold secrets are kept as [`Secret`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AppSettings {
    plain: BTreeMap<String, String>,
    secret: BTreeMap<String, Secret>,
}

impl AppSettings {
    pub fn set(&mut self, key: &str, value: impl Into<String>) {
        self.plain.insert(key.to_string(), value.into());
    }

    pub fn set_secret(&mut self, key: &str, value: Secret) {
        self.secret.insert(key.to_string(), value);
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.plain
            .get(key)
            .map(String::as_str)
            .or_else(|| self.secret.get(key).map(Secret::expose))
    }

    /// All settings as `KEY=value` pairs, sorted by key.
    pub fn to_pairs(&self) -> Vec<String> {
        let mut pairs: BTreeMap<&str, &str> = BTreeMap::new();
        for (k, v) in &self.plain {
            pairs.insert(k, v);
        }
        for (k, v) in &self.secret {
            pairs.insert(k, v.expose());
        }
        pairs.into_iter().map(|(k, v)| format!("{k}={v}")).collect()
    }

    /// Keys whose values must not be echoed.
    pub fn secret_keys(&self) -> impl Iterator<Item = &str> {
        self.secret.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.plain.len() + self.secret.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Settings the forwarder reads at runtime.
    pub fn for_forwarder(config: &DeploymentConfig, dynatrace_url: &str) -> Self {
        let mut settings = AppSettings::default();
        settings.set("FUNCTIONS_WORKER_RUNTIME", "python");
        settings.set("FUNCTIONS_EXTENSION_VERSION", "~4");
        settings.set("DYNATRACE_URL", dynatrace_url);
        settings.set_secret("DYNATRACE_ACCESS_KEY", config.api_token.clone());
        settings.set(
            "REQUIRE_VALID_CERTIFICATE",
            config.require_valid_certificate.to_string(),
        );
        settings.set(
            "SELF_MONITORING_ENABLED",
            config.self_monitoring_enabled.to_string(),
        );
        settings.set("RESOURCE_GROUP", config.resource_group.as_str());
        settings.set("REGION", config.location.as_str());
        if let Some(filter) = &config.filter_config {
            settings.set("FILTER_CONFIG", filter.as_str());
        }

        match &config.event_hub {
            EventHubConnection::ConnectionString(conn) => {
                settings.set_secret("EVENTHUB_CONNECTION_STRING", conn.clone());
                if let Some(hub) = conn
                    .expose()
                    .split(';')
                    .find_map(|p| p.trim().strip_prefix("EntityPath="))
                {
                    settings.set("EVENTHUB_NAME", hub);
                }
            }
            EventHubConnection::ManagedIdentity {
                event_hub_name,
                client_id,
                fully_qualified_namespace,
                ..
            } => {
                settings.set("EVENTHUB_NAME", event_hub_name.as_str());
                settings.set(
                    "EVENTHUB_CONNECTION_STRING__fullyQualifiedNamespace",
                    fully_qualified_namespace.as_str(),
                );
                settings.set("EVENTHUB_CONNECTION_STRING__clientId", client_id.as_str());
                settings.set("EVENTHUB_CONNECTION_STRING__credential", "managedidentity");
            }
        }
        settings
    }
}

/// Cloud operations the orchestrator sequences.
///
/// Creation methods must be idempotent: called twice with the same inputs
/// they converge on the same resources.
#[async_trait]
pub trait Provisioner: Send + Sync {
    /// Create or fetch the named user-assigned identity.
    async fn ensure_identity(
        &self,
        resource_group: &str,
        location: &str,
        name: &str,
    ) -> Result<IdentityRef, ProvisionError>;

    /// Resource ID of the Event Hub namespace behind a
    /// `<ns>.servicebus.windows.net` host name.
    async fn resolve_event_hub_namespace(
        &self,
        fully_qualified_namespace: &str,
    ) -> Result<String, ProvisionError>;

    async fn assign_role(&self, binding: &RoleBinding) -> Result<(), ProvisionError>;

    async fn provision_core(&self, plan: &CorePlan) -> Result<CoreResources, ProvisionError>;

    async fn provision_activegate(
        &self,
        plan: &ActiveGatePlan,
    ) -> Result<ActiveGateRef, ProvisionError>;

    async fn update_app_settings(
        &self,
        resource_group: &str,
        function_app: &str,
        settings: &AppSettings,
    ) -> Result<(), ProvisionError>;

    /// One download attempt.
    async fn download_package(&self, url: &str, attempt: u32)
        -> Result<PackageArtifact, AttemptError>;

    /// One deployment attempt.
    async fn deploy_package(
        &self,
        resource_group: &str,
        function_app: &str,
        artifact: &PackageArtifact,
        attempt: u32,
    ) -> Result<(), AttemptError>;

    async fn attach_identity(
        &self,
        resource_group: &str,
        function_app: &str,
        identity: &IdentityRef,
    ) -> Result<(), ProvisionError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{fields, Parameters};

    fn config() -> DeploymentConfig {
        let params = Parameters::new()
            .with(fields::DEPLOYMENT_NAME, "dtlogs01")
            .with(fields::RESOURCE_GROUP, "rg-logs")
            .with(fields::LOCATION, "westeurope")
            .with(fields::TARGET_URL, "https://abc12345.live.dynatrace.com")
            .with(fields::TARGET_API_TOKEN, "dt0c01.api")
            .with(fields::FILTER_CONFIG, "FILTER.GLOBAL.MIN_LOG_LEVEL=Warning")
            .with(
                fields::EVENT_HUB_CONNECTION_STRING,
                "Endpoint=sb://ns.servicebus.windows.net/;EntityPath=insights",
            );
        DeploymentConfig::from_parameters(&params).unwrap()
    }

    #[test]
    fn test_role_binding_id_matches_naming() {
        let binding = RoleBinding::new("p-1", "role-1", "/scope");
        assert_eq!(
            binding.assignment_id,
            role_assignment_id("/scope", "p-1", "role-1")
        );
    }

    #[test]
    fn test_forwarder_settings_connection_string_mode() {
        let settings = AppSettings::for_forwarder(&config(), "https://abc12345.live.dynatrace.com");
        assert_eq!(settings.get("EVENTHUB_NAME"), Some("insights"));
        assert_eq!(
            settings.get("FILTER_CONFIG"),
            Some("FILTER.GLOBAL.MIN_LOG_LEVEL=Warning")
        );
        assert_eq!(settings.get("DYNATRACE_ACCESS_KEY"), Some("dt0c01.api"));

        let secret_keys: Vec<&str> = settings.secret_keys().collect();
        assert!(secret_keys.contains(&"DYNATRACE_ACCESS_KEY"));
        assert!(secret_keys.contains(&"EVENTHUB_CONNECTION_STRING"));
    }

    #[test]
    fn test_settings_pairs_are_sorted() {
        let mut settings = AppSettings::default();
        settings.set("B", "2");
        settings.set_secret("A", Secret::new("1"));
        assert_eq!(settings.to_pairs(), vec!["A=1".to_string(), "B=2".to_string()]);
        assert_eq!(settings.len(), 2);
    }
}
