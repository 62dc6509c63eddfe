//! Deployment summary and next steps.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::config::DeploymentConfig;
use crate::provision::{ActiveGateRef, CoreResources, IdentityRef};

pub const DOCUMENTATION_URL: &str =
    "https://www.dynatrace.com/support/help/shortlink/azure-log-fwd";
pub const TROUBLESHOOTING_URL: &str =
    "https://github.com/dynatrace-oss/dynatrace-azure-log-forwarder#troubleshooting";

const LOG_VIEWER_QUERY: &str = "/ui/log-monitoring?query=cloud.provider%3D%22azure%22";

/// What was deployed and where to look next.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeploymentSummary {
    pub deployment_name: String,
    pub resource_group: String,
    pub function_app_id: String,
    pub function_app_url: String,
    pub event_hub: String,
    pub storage_account_id: String,
    pub virtual_network_id: Option<String>,
    pub identity_id: Option<String>,
    pub activegate: Option<ActiveGateRef>,
    pub log_viewer_url: Option<String>,
    pub documentation: Vec<String>,
}

impl DeploymentSummary {
    pub fn new(
        config: &DeploymentConfig,
        core: &CoreResources,
        identity: Option<&IdentityRef>,
        activegate: Option<&ActiveGateRef>,
    ) -> Self {
        Self {
            deployment_name: config.deployment_name.clone(),
            resource_group: config.resource_group.clone(),
            function_app_id: core.function_app_id.clone(),
            function_app_url: format!("https://{}", core.function_hostname),
            event_hub: config.event_hub.describe(),
            storage_account_id: core.storage_account_id.clone(),
            virtual_network_id: core.virtual_network_id.clone(),
            identity_id: identity.map(|i| i.resource_id.clone()),
            activegate: activegate.cloned(),
            log_viewer_url: config
                .environment_ui_url()
                .map(|base| format!("{base}{LOG_VIEWER_QUERY}")),
            documentation: vec![DOCUMENTATION_URL.to_string(), TROUBLESHOOTING_URL.to_string()],
        }
    }
}

impl fmt::Display for DeploymentSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Deployment '{}' completed", self.deployment_name)?;
        writeln!(f)?;
        writeln!(f, "Resource group: {}", self.resource_group)?;
        writeln!(f, "Function App:   {}", self.function_app_id)?;
        writeln!(f, "Function URL:   {}", self.function_app_url)?;
        writeln!(f, "Event Hub:      {}", self.event_hub)?;
        writeln!(f, "Storage:        {}", self.storage_account_id)?;
        if let Some(vnet) = &self.virtual_network_id {
            writeln!(f, "Network:        {vnet}")?;
        }
        if let Some(identity) = &self.identity_id {
            writeln!(f, "Identity:       {identity}")?;
        }
        if let Some(ag) = &self.activegate {
            writeln!(f, "ActiveGate:     {} ({})", ag.container_group_id, ag.endpoint_url)?;
        }
        writeln!(f)?;
        writeln!(f, "Next steps:")?;
        match &self.log_viewer_url {
            Some(url) => writeln!(
                f,
                "  - Logs should appear within a few minutes in the log viewer: {url}"
            )?,
            None => writeln!(
                f,
                "  - Open the log viewer of your Dynatrace environment and filter on cloud.provider = \"azure\""
            )?,
        }
        writeln!(
            f,
            "  - Configure Azure diagnostic settings to stream logs into {}",
            self.event_hub
        )?;
        for link in &self.documentation {
            writeln!(f, "  - {link}")?;
        }
        Ok(())
    }
}
