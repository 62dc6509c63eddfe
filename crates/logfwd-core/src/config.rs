//! Deployment configuration.
//!
//! Raw parameters arrive as strings (flags, environment, or an ARM
//! parameters file). They are validated once and turned into an immutable
//! [`DeploymentConfig`], which every later step borrows.

use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use crate::error::{ForwarderError, Result};
use crate::validation::{self, RuleContext};

/// Parameter names, identical to the environment variables that carry them.
pub mod fields {
    pub const DEPLOYMENT_NAME: &str = "DEPLOYMENT_NAME";
    pub const RESOURCE_GROUP: &str = "RESOURCE_GROUP";
    pub const LOCATION: &str = "LOCATION";
    pub const TARGET_URL: &str = "TARGET_URL";
    pub const TARGET_API_TOKEN: &str = "TARGET_API_TOKEN";
    pub const TARGET_PAAS_TOKEN: &str = "TARGET_PAAS_TOKEN";
    pub const EVENT_HUB_CONNECTION_STRING: &str = "EVENT_HUB_CONNECTION_STRING";
    pub const EVENT_HUB_NAME: &str = "EVENT_HUB_NAME";
    pub const EVENTHUB_CONNECTION_CLIENT_ID: &str = "EVENTHUB_CONNECTION_CLIENT_ID";
    pub const MANAGED_IDENTITY_RESOURCE_NAME: &str = "MANAGED_IDENTITY_RESOURCE_NAME";
    pub const EVENTHUB_CONNECTION_FULLY_QUALIFIED_NAMESPACE: &str =
        "EVENTHUB_CONNECTION_FULLY_QUALIFIED_NAMESPACE";
    pub const FILTER_CONFIG: &str = "FILTER_CONFIG";
    pub const EXISTING_FUNCTION_SUBNET_ID: &str = "EXISTING_FUNCTION_SUBNET_ID";
    pub const EXISTING_ACTIVEGATE_SUBNET_ID: &str = "EXISTING_ACTIVEGATE_SUBNET_ID";
    pub const FUNCTION_PACKAGE_URL: &str = "FUNCTION_PACKAGE_URL";

    pub const DEPLOY_ACTIVEGATE: &str = "DEPLOY_ACTIVEGATE";
    pub const SELF_MONITORING_ENABLED: &str = "SELF_MONITORING_ENABLED";
    pub const REQUIRE_VALID_CERTIFICATE: &str = "REQUIRE_VALID_CERTIFICATE";
    pub const ENABLE_USER_ASSIGNED_MANAGED_IDENTITY: &str = "ENABLE_USER_ASSIGNED_MANAGED_IDENTITY";
    pub const SKIP_CONNECTIVITY_CHECK: &str = "SKIP_CONNECTIVITY_CHECK";

    /// Boolean switches.
    pub const FLAGS: [&str; 5] = [
        DEPLOY_ACTIVEGATE,
        SELF_MONITORING_ENABLED,
        REQUIRE_VALID_CERTIFICATE,
        ENABLE_USER_ASSIGNED_MANAGED_IDENTITY,
        SKIP_CONNECTIVITY_CHECK,
    ];
}

/// Released forwarder package.
pub const DEFAULT_FUNCTION_PACKAGE_URL: &str = "https://github.com/dynatrace-oss/dynatrace-azure-log-forwarder/releases/latest/download/dynatrace-azure-log-forwarder.zip";

/// ARM template parameter names mapped to field names.
const ARM_PARAMETER_NAMES: &[(&str, &str)] = &[
    ("forwarderName", fields::DEPLOYMENT_NAME),
    ("resourceGroup", fields::RESOURCE_GROUP),
    ("location", fields::LOCATION),
    ("targetUrl", fields::TARGET_URL),
    ("targetAPIToken", fields::TARGET_API_TOKEN),
    ("targetPaasToken", fields::TARGET_PAAS_TOKEN),
    ("eventHubConnectionString", fields::EVENT_HUB_CONNECTION_STRING),
    ("eventHubName", fields::EVENT_HUB_NAME),
    ("eventhubConnectionClientId", fields::EVENTHUB_CONNECTION_CLIENT_ID),
    ("managedIdentityResourceName", fields::MANAGED_IDENTITY_RESOURCE_NAME),
    (
        "eventhubConnectionFullyQualifiedNamespace",
        fields::EVENTHUB_CONNECTION_FULLY_QUALIFIED_NAMESPACE,
    ),
    ("filterConfig", fields::FILTER_CONFIG),
    ("existingFunctionSubnetId", fields::EXISTING_FUNCTION_SUBNET_ID),
    ("existingActiveGateSubnetId", fields::EXISTING_ACTIVEGATE_SUBNET_ID),
    ("functionPackageUrl", fields::FUNCTION_PACKAGE_URL),
    ("deployActiveGateContainer", fields::DEPLOY_ACTIVEGATE),
    ("selfMonitoringEnabled", fields::SELF_MONITORING_ENABLED),
    ("requireValidCertificate", fields::REQUIRE_VALID_CERTIFICATE),
    (
        "enableUserAssignedManagedIdentity",
        fields::ENABLE_USER_ASSIGNED_MANAGED_IDENTITY,
    ),
];

/// A secret string. Never printed.
#[derive(Clone, PartialEq, Eq)]
pub struct Secret(String);

impl Secret {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Secret(***)")
    }
}

/// Raw, unvalidated string parameters keyed by field name.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Parameters(BTreeMap<String, String>);

impl Parameters {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&mut self, field: &str, value: impl Into<String>) {
        self.0.insert(field.to_string(), value.into());
    }

    pub fn with(mut self, field: &str, value: impl Into<String>) -> Self {
        self.set(field, value);
        self
    }

    pub fn get(&self, field: &str) -> Option<&str> {
        self.0
            .get(field)
            .map(String::as_str)
            .filter(|v| !v.trim().is_empty())
    }

    pub fn as_map(&self) -> &BTreeMap<String, String> {
        &self.0
    }

    /// Overlay `other` on top of `self`; non-empty values in `other` win.
    pub fn merge(mut self, other: &Parameters) -> Self {
        for (k, v) in &other.0 {
            if !v.trim().is_empty() {
                self.0.insert(k.clone(), v.clone());
            }
        }
        self
    }

    /// Parse an ARM deployment parameters document:
    /// `{"parameters": {"targetUrl": {"value": "..."}}}`.
    ///
    /// Unknown parameter names are ignored; booleans and numbers are
    /// stringified.
    pub fn from_arm_json(document: &Value) -> Result<Self> {
        let mut params = Parameters::new();
        let Some(entries) = document.get("parameters").and_then(Value::as_object) else {
            return Ok(params);
        };

        for (arm_name, field) in ARM_PARAMETER_NAMES {
            let Some(value) = entries.get(*arm_name).and_then(|e| e.get("value")) else {
                continue;
            };
            let text = match value {
                Value::String(s) => s.clone(),
                Value::Bool(b) => b.to_string(),
                Value::Number(n) => n.to_string(),
                Value::Null => continue,
                other => serde_json::to_string(other)?,
            };
            params.set(field, text);
        }
        debug!(count = params.0.len(), "loaded ARM parameters");
        Ok(params)
    }

    pub fn from_arm_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let document: Value = serde_json::from_str(&content)?;
        Self::from_arm_json(&document)
    }

    fn flag(&self, field: &str) -> Option<bool> {
        self.get(field).and_then(parse_bool)
    }

    fn rule_context(&self) -> RuleContext {
        RuleContext {
            deploy_activegate: self.flag(fields::DEPLOY_ACTIVEGATE).unwrap_or(false),
            managed_identity: self
                .flag(fields::ENABLE_USER_ASSIGNED_MANAGED_IDENTITY)
                .unwrap_or(false),
        }
    }
}

/// `true`/`false`, case-insensitive.
pub fn parse_bool(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "true" => Some(true),
        "false" => Some(false),
        _ => None,
    }
}

/// How the forwarder authenticates to the source Event Hub.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventHubConnection {
    ConnectionString(Secret),
    ManagedIdentity {
        event_hub_name: String,
        client_id: String,
        identity_name: String,
        fully_qualified_namespace: String,
    },
}

impl EventHubConnection {
    /// `namespace/hub` when it can be determined, for summaries and logs.
    pub fn describe(&self) -> String {
        match self {
            EventHubConnection::ConnectionString(secret) => {
                let raw = secret.expose();
                let namespace = raw
                    .split(';')
                    .find_map(|part| part.trim().strip_prefix("Endpoint=sb://"))
                    .map(|ns| ns.trim_end_matches('/'))
                    .unwrap_or("unknown");
                let hub = raw
                    .split(';')
                    .find_map(|part| part.trim().strip_prefix("EntityPath="))
                    .unwrap_or("unknown");
                format!("{namespace}/{hub}")
            }
            EventHubConnection::ManagedIdentity {
                event_hub_name,
                fully_qualified_namespace,
                ..
            } => format!("{fully_qualified_namespace}/{event_hub_name}"),
        }
    }

    pub fn uses_managed_identity(&self) -> bool {
        matches!(self, EventHubConnection::ManagedIdentity { .. })
    }
}

/// Bring-your-own network settings.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkConfig {
    pub function_subnet_id: Option<String>,
    pub activegate_subnet_id: Option<String>,
}

/// Validated, immutable deployment configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeploymentConfig {
    pub deployment_name: String,
    pub resource_group: String,
    pub location: String,
    pub target_url: String,
    pub api_token: Secret,
    pub paas_token: Option<Secret>,
    pub event_hub: EventHubConnection,
    pub filter_config: Option<String>,
    pub deploy_activegate: bool,
    pub self_monitoring_enabled: bool,
    pub require_valid_certificate: bool,
    pub skip_connectivity_check: bool,
    pub network: NetworkConfig,
    pub package_url: String,
}

impl DeploymentConfig {
    /// Validate `params` and build the configuration.
    ///
    /// Every rule violation is reported in one
    /// [`ForwarderError::Configuration`].
    pub fn from_parameters(params: &Parameters) -> Result<Self> {
        let result = validate_parameters(params)?;
        if !result.passed() {
            return Err(ForwarderError::Configuration(result));
        }

        let owned = |field: &str| params.get(field).map(str::to_string);
        let required = |field: &str| owned(field).unwrap_or_default();
        let flag = |field: &str, default: bool| params.flag(field).unwrap_or(default);

        let managed_identity = flag(fields::ENABLE_USER_ASSIGNED_MANAGED_IDENTITY, false);
        let event_hub = if managed_identity {
            EventHubConnection::ManagedIdentity {
                event_hub_name: required(fields::EVENT_HUB_NAME),
                client_id: required(fields::EVENTHUB_CONNECTION_CLIENT_ID),
                identity_name: required(fields::MANAGED_IDENTITY_RESOURCE_NAME),
                fully_qualified_namespace: required(
                    fields::EVENTHUB_CONNECTION_FULLY_QUALIFIED_NAMESPACE,
                ),
            }
        } else {
            EventHubConnection::ConnectionString(Secret::new(required(
                fields::EVENT_HUB_CONNECTION_STRING,
            )))
        };

        let deploy_activegate = flag(fields::DEPLOY_ACTIVEGATE, false);

        Ok(Self {
            deployment_name: required(fields::DEPLOYMENT_NAME),
            resource_group: required(fields::RESOURCE_GROUP),
            location: required(fields::LOCATION),
            target_url: required(fields::TARGET_URL).trim_end_matches('/').to_string(),
            api_token: Secret::new(required(fields::TARGET_API_TOKEN)),
            paas_token: if deploy_activegate {
                owned(fields::TARGET_PAAS_TOKEN).map(Secret::new)
            } else {
                None
            },
            event_hub,
            filter_config: owned(fields::FILTER_CONFIG),
            deploy_activegate,
            self_monitoring_enabled: flag(fields::SELF_MONITORING_ENABLED, false),
            require_valid_certificate: flag(fields::REQUIRE_VALID_CERTIFICATE, true),
            skip_connectivity_check: flag(fields::SKIP_CONNECTIVITY_CHECK, false),
            network: NetworkConfig {
                function_subnet_id: owned(fields::EXISTING_FUNCTION_SUBNET_ID),
                activegate_subnet_id: owned(fields::EXISTING_ACTIVEGATE_SUBNET_ID),
            },
            package_url: owned(fields::FUNCTION_PACKAGE_URL)
                .unwrap_or_else(|| DEFAULT_FUNCTION_PACKAGE_URL.to_string()),
        })
    }

    /// Environment identifier taken from the target URL: the `/e/<id>`
    /// segment if present, else the first host label.
    pub fn environment_id(&self) -> String {
        if let Some((_, rest)) = self.target_url.split_once("/e/") {
            return rest.split('/').next().unwrap_or(rest).to_string();
        }
        let host = self
            .target_url
            .split_once("://")
            .map(|(_, rest)| rest)
            .unwrap_or(&self.target_url);
        host.split(['.', ':', '/']).next().unwrap_or(host).to_string()
    }

    /// URL of the Dynatrace web UI, when the target is an environment
    /// rather than an ActiveGate.
    pub fn environment_ui_url(&self) -> Option<String> {
        if self.target_url.contains("/e/") && !self.deploy_activegate {
            None
        } else {
            Some(self.target_url.clone())
        }
    }
}

/// Run the standard rule set for the mode the parameters select.
pub fn validate_parameters(params: &Parameters) -> Result<validation::ValidationResult> {
    let rules = validation::standard_rules(params.rule_context())?;
    Ok(validation::validate(params.as_map(), &rules))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn base_params() -> Parameters {
        Parameters::new()
            .with(fields::DEPLOYMENT_NAME, "dtlogs01")
            .with(fields::RESOURCE_GROUP, "rg-logs")
            .with(fields::LOCATION, "westeurope")
            .with(fields::TARGET_URL, "https://abc12345.live.dynatrace.com/")
            .with(fields::TARGET_API_TOKEN, "dt0c01.api")
            .with(
                fields::EVENT_HUB_CONNECTION_STRING,
                "Endpoint=sb://ns-logs.servicebus.windows.net/;SharedAccessKeyName=listen;SharedAccessKey=k=;EntityPath=insights",
            )
    }

    #[test]
    fn test_config_from_valid_parameters() {
        let config = DeploymentConfig::from_parameters(&base_params()).unwrap();
        assert_eq!(config.deployment_name, "dtlogs01");
        assert_eq!(config.target_url, "https://abc12345.live.dynatrace.com");
        assert!(!config.deploy_activegate);
        assert!(config.require_valid_certificate);
        assert!(config.paas_token.is_none());
        assert_eq!(config.package_url, DEFAULT_FUNCTION_PACKAGE_URL);
        assert_eq!(
            config.event_hub.describe(),
            "ns-logs.servicebus.windows.net/insights"
        );
    }

    #[test]
    fn test_config_rejects_invalid_parameters() {
        let params = base_params().with(fields::DEPLOYMENT_NAME, "AB");
        match DeploymentConfig::from_parameters(&params) {
            Err(ForwarderError::Configuration(result)) => {
                assert!(result.has_failure_for(fields::DEPLOYMENT_NAME));
            }
            other => panic!("expected configuration error, got {other:?}"),
        }
    }

    #[test]
    fn test_string_flags_parse_once() {
        let params = base_params()
            .with(fields::SELF_MONITORING_ENABLED, "TRUE")
            .with(fields::REQUIRE_VALID_CERTIFICATE, "false");
        let config = DeploymentConfig::from_parameters(&params).unwrap();
        assert!(config.self_monitoring_enabled);
        assert!(!config.require_valid_certificate);
    }

    #[test]
    fn test_malformed_flag_is_validation_failure() {
        let params = base_params().with(fields::SKIP_CONNECTIVITY_CHECK, "yes");
        let result = validate_parameters(&params).unwrap();
        assert!(result.has_failure_for(fields::SKIP_CONNECTIVITY_CHECK));
    }

    #[test]
    fn test_managed_identity_mode() {
        let params = base_params()
            .with(fields::ENABLE_USER_ASSIGNED_MANAGED_IDENTITY, "true")
            .with(fields::EVENT_HUB_NAME, "insights")
            .with(
                fields::EVENTHUB_CONNECTION_CLIENT_ID,
                "0f0e0d0c-0b0a-0908-0706-050403020100",
            )
            .with(fields::MANAGED_IDENTITY_RESOURCE_NAME, "dtlogs-identity")
            .with(
                fields::EVENTHUB_CONNECTION_FULLY_QUALIFIED_NAMESPACE,
                "ns-logs.servicebus.windows.net",
            );
        let config = DeploymentConfig::from_parameters(&params).unwrap();
        assert!(config.event_hub.uses_managed_identity());
        assert_eq!(
            config.event_hub.describe(),
            "ns-logs.servicebus.windows.net/insights"
        );
    }

    #[test]
    fn test_environment_id_extraction() {
        let config = DeploymentConfig::from_parameters(&base_params()).unwrap();
        assert_eq!(config.environment_id(), "abc12345");
        assert_eq!(
            config.environment_ui_url().as_deref(),
            Some("https://abc12345.live.dynatrace.com")
        );

        let params = base_params().with(fields::TARGET_URL, "https://10.0.0.4:9999/e/abc12345");
        let config = DeploymentConfig::from_parameters(&params).unwrap();
        assert_eq!(config.environment_id(), "abc12345");
        assert!(config.environment_ui_url().is_none());
    }

    #[test]
    fn test_secret_debug_is_redacted() {
        let config = DeploymentConfig::from_parameters(&base_params()).unwrap();
        let rendered = format!("{config:?}");
        assert!(!rendered.contains("dt0c01.api"));
        assert!(!rendered.contains("SharedAccessKey"));
    }

    #[test]
    fn test_arm_parameters_document() {
        let document = json!({
            "$schema": "https://schema.management.azure.com/schemas/2019-04-01/deploymentParameters.json#",
            "parameters": {
                "forwarderName": { "value": "dtlogs01" },
                "targetUrl": { "value": "https://abc12345.live.dynatrace.com" },
                "deployActiveGateContainer": { "value": false },
                "unrelated": { "value": "ignored" }
            }
        });
        let params = Parameters::from_arm_json(&document).unwrap();
        assert_eq!(params.get(fields::DEPLOYMENT_NAME), Some("dtlogs01"));
        assert_eq!(params.get(fields::DEPLOY_ACTIVEGATE), Some("false"));
        assert_eq!(params.as_map().len(), 3);
    }

    #[test]
    fn test_merge_prefers_non_empty_overrides() {
        let file = Parameters::new()
            .with(fields::DEPLOYMENT_NAME, "fromfile")
            .with(fields::LOCATION, "westeurope");
        let cli = Parameters::new()
            .with(fields::DEPLOYMENT_NAME, "fromcli")
            .with(fields::LOCATION, "");
        let merged = file.merge(&cli);
        assert_eq!(merged.get(fields::DEPLOYMENT_NAME), Some("fromcli"));
        assert_eq!(merged.get(fields::LOCATION), Some("westeurope"));
    }
}
