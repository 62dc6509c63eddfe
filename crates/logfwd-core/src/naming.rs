//! Deterministic resource names and idempotency keys.
//!
//! Every name is a pure function of the deployment inputs, so a re-run with
//! the same inputs addresses the same resources instead of creating new ones.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

/// Built-in role: Azure Event Hubs Data Receiver.
pub const EVENT_HUBS_DATA_RECEIVER_ROLE: &str = "a638d3c7-ab3a-418d-83e6-5f17a39d4fde";

/// Built-in role: Monitoring Metrics Publisher.
pub const MONITORING_METRICS_PUBLISHER_ROLE: &str = "3913510d-42f4-4e42-8a64-420c390055eb";

/// Names of the resources one deployment owns.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceNames {
    pub function_app: String,
    pub app_service_plan: String,
    pub storage_account: String,
    pub virtual_network: String,
    pub function_subnet: String,
    pub activegate_subnet: String,
    pub activegate_container: String,
    pub identity: String,
}

impl ResourceNames {
    /// Derive names from the deployment name. The storage account gets a
    /// short hash suffix because its name is global across Azure.
    pub fn derive(deployment_name: &str, resource_group: &str) -> Self {
        let suffix = &content_digest(&[resource_group, deployment_name])[..4];
        Self {
            function_app: format!("{deployment_name}-function"),
            app_service_plan: format!("{deployment_name}-plan"),
            storage_account: format!("{deployment_name}{suffix}"),
            virtual_network: format!("{deployment_name}-vnet"),
            function_subnet: "functionapp".to_string(),
            activegate_subnet: "activegate".to_string(),
            activegate_container: format!("{deployment_name}-activegate"),
            identity: format!("{deployment_name}-identity"),
        }
    }

    /// Use an existing identity name instead of the derived one.
    pub fn with_identity(mut self, identity: impl Into<String>) -> Self {
        self.identity = identity.into();
        self
    }
}

/// Hex SHA-256 of the parts, each terminated by a NUL byte so that
/// `["ab", "c"]` and `["a", "bc"]` differ.
pub fn content_digest(parts: &[&str]) -> String {
    let mut hasher = Sha256::new();
    for part in parts {
        hasher.update(part.as_bytes());
        hasher.update(b"\0");
    }
    hex::encode(hasher.finalize())
}

/// Role assignment name for (scope, principal, role).
///
/// Azure requires assignment names to be GUIDs; a v5 UUID over the
/// lowercased triple yields the same GUID on every run, so repeating the
/// assignment is a no-op rather than a duplicate.
pub fn role_assignment_id(scope: &str, principal_id: &str, role_definition_id: &str) -> Uuid {
    let key = format!(
        "{}|{}|{}",
        scope.to_ascii_lowercase(),
        principal_id.to_ascii_lowercase(),
        role_definition_id.to_ascii_lowercase()
    );
    Uuid::new_v5(&Uuid::NAMESPACE_URL, key.as_bytes())
}
