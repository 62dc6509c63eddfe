//! [`Provisioner`] backed by the Azure CLI.
//!
//! In [`ExecutionMode::DryRun`] commands are recorded but never executed,
//! and resource IDs are placeholders derived from the planned names.

use std::sync::{Mutex, PoisonError};

use async_trait::async_trait;
use logfwd_core::{
    ActiveGatePlan, ActiveGateRef, AppSettings, AttemptError, CorePlan, CoreResources,
    IdentityRef, PackageArtifact, ProvisionError, Provisioner, RoleBinding,
};
use serde_json::Value;
use tempfile::TempDir;
use tracing::{info, warn};

use crate::classify::FailureClassifier;
use crate::command::{AzCommand, ACTIVEGATE_PORT, ACTIVEGATE_SUBNET_PREFIX, FUNCTION_SUBNET_PREFIX};
use crate::error::{DeployError, Result};
use crate::package::{sha256_hex, PackageDownloader};
use crate::runner::CommandRunner;

const FUNCTION_SUBNET_DELEGATION: &str = "Microsoft.Web/serverFarms";
const ACTIVEGATE_SUBNET_DELEGATION: &str = "Microsoft.ContainerInstance/containerGroups";
const ROLE_ASSIGNMENT_EXISTS: &str = "RoleAssignmentExists";
const PLACEHOLDER_SUBSCRIPTION: &str = "00000000-0000-0000-0000-000000000000";

/// Whether commands are executed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ExecutionMode {
    #[default]
    Live,
    DryRun,
}

/// Azure CLI provisioner.
pub struct AzCliProvisioner {
    runner: CommandRunner,
    mode: ExecutionMode,
    classifier: FailureClassifier,
    downloader: PackageDownloader,
    issued: Mutex<Vec<AzCommand>>,
    _workdir: TempDir,
}

impl AzCliProvisioner {
    pub fn new(runner: CommandRunner, mode: ExecutionMode) -> Result<Self> {
        let workdir = tempfile::Builder::new().prefix("logfwd-").tempdir()?;
        let classifier = FailureClassifier::new()?;
        let downloader = PackageDownloader::new(workdir.path(), classifier.clone())?;
        Ok(Self {
            runner,
            mode,
            classifier,
            downloader,
            issued: Mutex::new(Vec::new()),
            _workdir: workdir,
        })
    }

    pub fn live(program: &str) -> Result<Self> {
        Self::new(CommandRunner::new(program), ExecutionMode::Live)
    }

    pub fn dry_run() -> Result<Self> {
        Self::new(CommandRunner::default(), ExecutionMode::DryRun)
    }

    /// Commands issued (or, in dry-run, planned) so far, in order.
    pub fn issued(&self) -> Vec<AzCommand> {
        self.issued
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn record(&self, command: &AzCommand) {
        self.issued
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(command.clone());
    }

    /// Run `command` and parse its JSON output. `None` in dry-run.
    async fn run_json(&self, command: AzCommand) -> Result<Option<Value>> {
        self.record(&command);
        match self.mode {
            ExecutionMode::DryRun => {
                info!(line = %command.display(), "dry-run");
                Ok(None)
            }
            ExecutionMode::Live => Ok(Some(self.runner.execute_json(&command).await?)),
        }
    }

    async fn set_app_settings(
        &self,
        resource_group: &str,
        function_app: &str,
        settings: &AppSettings,
    ) -> Result<()> {
        let secrets: Vec<&str> = settings
            .secret_keys()
            .filter_map(|k| settings.get(k))
            .collect();
        let command = AzCommand::functionapp_appsettings_set(
            resource_group,
            function_app,
            settings.to_pairs(),
            &secrets,
        );
        self.run_json(command).await?;
        info!(function_app, count = settings.len(), "App settings applied");
        Ok(())
    }
}

fn placeholder_id(resource_group: &str, provider: &str, name: &str) -> String {
    format!("/subscriptions/{PLACEHOLDER_SUBSCRIPTION}/resourceGroups/{resource_group}/providers/{provider}/{name}")
}

/// String at a JSON pointer, or a [`DeployError::MissingField`].
fn string_at(value: &Value, command: &str, pointer: &str) -> Result<String> {
    value
        .pointer(pointer)
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| DeployError::MissingField {
            name: command.to_string(),
            field: pointer.trim_start_matches('/').replace('/', "."),
        })
}

/// Virtual network ID that contains `subnet_id`.
fn vnet_of_subnet(subnet_id: &str) -> &str {
    subnet_id
        .split_once("/subnets/")
        .map(|(vnet, _)| vnet)
        .unwrap_or(subnet_id)
}

/// Registry host of the environment, e.g. `abc12345.live.dynatrace.com`.
fn registry_host(environment_url: &str) -> &str {
    let rest = environment_url
        .split_once("://")
        .map(|(_, rest)| rest)
        .unwrap_or(environment_url);
    rest.split('/').next().unwrap_or(rest)
}

#[async_trait]
impl Provisioner for AzCliProvisioner {
    async fn ensure_identity(
        &self,
        resource_group: &str,
        location: &str,
        name: &str,
    ) -> std::result::Result<IdentityRef, ProvisionError> {
        let command = AzCommand::identity_create(resource_group, location, name);
        let cmd_name = command.name.clone();
        let identity = match self.run_json(command).await? {
            Some(json) => IdentityRef {
                name: name.to_string(),
                resource_id: string_at(&json, &cmd_name, "/id")?,
                principal_id: string_at(&json, &cmd_name, "/principalId")?,
                client_id: string_at(&json, &cmd_name, "/clientId")?,
            },
            None => IdentityRef {
                name: name.to_string(),
                resource_id: placeholder_id(
                    resource_group,
                    "Microsoft.ManagedIdentity/userAssignedIdentities",
                    name,
                ),
                principal_id: "<principal-id>".to_string(),
                client_id: "<client-id>".to_string(),
            },
        };
        Ok(identity)
    }

    async fn resolve_event_hub_namespace(
        &self,
        fully_qualified_namespace: &str,
    ) -> std::result::Result<String, ProvisionError> {
        let namespace = fully_qualified_namespace
            .split('.')
            .next()
            .unwrap_or(fully_qualified_namespace);
        let command = AzCommand::event_hub_namespace_list(namespace);
        let cmd_name = command.name.clone();
        match self.run_json(command).await? {
            Some(json) => {
                let first = json
                    .as_array()
                    .and_then(|items| items.first())
                    .ok_or_else(|| ProvisionError::NotFound(format!("Event Hub namespace {namespace}")))?;
                Ok(string_at(first, &cmd_name, "/id")?)
            }
            None => Ok(placeholder_id(
                "<event-hub-resource-group>",
                "Microsoft.EventHub/namespaces",
                namespace,
            )),
        }
    }

    async fn assign_role(&self, binding: &RoleBinding) -> std::result::Result<(), ProvisionError> {
        let command = AzCommand::role_assignment_create(
            &binding.assignment_id.to_string(),
            &binding.principal_id,
            &binding.role_definition_id,
            &binding.scope,
        );
        match self.run_json(command).await {
            Ok(_) => Ok(()),
            Err(err) if err.output().contains(ROLE_ASSIGNMENT_EXISTS) => {
                info!(assignment = %binding.assignment_id, "Role assignment already exists");
                Ok(())
            }
            Err(err) => Err(err.into()),
        }
    }

    async fn provision_core(
        &self,
        plan: &CorePlan,
    ) -> std::result::Result<CoreResources, ProvisionError> {
        let rg = plan.resource_group.as_str();
        let names = &plan.names;

        let command = AzCommand::storage_account_create(rg, &plan.location, &names.storage_account);
        let cmd_name = command.name.clone();
        let storage_account_id = match self.run_json(command).await? {
            Some(json) => string_at(&json, &cmd_name, "/id")?,
            None => placeholder_id(rg, "Microsoft.Storage/storageAccounts", &names.storage_account),
        };

        let (virtual_network_id, function_subnet_id, activegate_subnet_id) =
            match &plan.function_subnet_id {
                Some(existing) => {
                    if plan.needs_activegate_subnet {
                        warn!(
                            "Existing network given without an ActiveGate subnet; the ActiveGate will get a public address"
                        );
                    }
                    (
                        vnet_of_subnet(existing).to_string(),
                        existing.clone(),
                        plan.activegate_subnet_id.clone(),
                    )
                }
                None => {
                    let command = AzCommand::vnet_create(rg, &plan.location, &names.virtual_network);
                    let cmd_name = command.name.clone();
                    let vnet_id = match self.run_json(command).await? {
                        Some(json) => string_at(&json, &cmd_name, "/newVNet/id")?,
                        None => placeholder_id(
                            rg,
                            "Microsoft.Network/virtualNetworks",
                            &names.virtual_network,
                        ),
                    };
                    let function_subnet = self
                        .create_subnet(
                            rg,
                            &vnet_id,
                            &names.virtual_network,
                            &names.function_subnet,
                            FUNCTION_SUBNET_PREFIX,
                            FUNCTION_SUBNET_DELEGATION,
                        )
                        .await?;
                    let activegate_subnet = if plan.needs_activegate_subnet {
                        Some(
                            self.create_subnet(
                                rg,
                                &vnet_id,
                                &names.virtual_network,
                                &names.activegate_subnet,
                                ACTIVEGATE_SUBNET_PREFIX,
                                ACTIVEGATE_SUBNET_DELEGATION,
                            )
                            .await?,
                        )
                    } else {
                        plan.activegate_subnet_id.clone()
                    };
                    (vnet_id, function_subnet, activegate_subnet)
                }
            };

        self.run_json(AzCommand::functionapp_plan_create(
            rg,
            &plan.location,
            &names.app_service_plan,
        ))
        .await?;

        let command = AzCommand::functionapp_create(
            rg,
            &names.function_app,
            &names.app_service_plan,
            &names.storage_account,
            plan.identity.as_ref().map(|i| i.resource_id.as_str()),
        );
        let cmd_name = command.name.clone();
        let (function_app_id, function_hostname, function_principal_id) =
            match self.run_json(command).await? {
                Some(json) => (
                    string_at(&json, &cmd_name, "/id")?,
                    string_at(&json, &cmd_name, "/defaultHostName")?,
                    string_at(&json, &cmd_name, "/identity/principalId").ok(),
                ),
                None => (
                    placeholder_id(rg, "Microsoft.Web/sites", &names.function_app),
                    format!("{}.azurewebsites.net", names.function_app),
                    Some("<function-principal-id>".to_string()),
                ),
            };

        self.run_json(AzCommand::functionapp_vnet_integration(
            rg,
            &names.function_app,
            &virtual_network_id,
            &function_subnet_id,
        ))
        .await?;

        self.set_app_settings(rg, &names.function_app, &plan.app_settings)
            .await?;

        Ok(CoreResources {
            function_app_name: names.function_app.clone(),
            function_app_id,
            function_hostname,
            function_principal_id,
            storage_account_id,
            virtual_network_id: Some(virtual_network_id),
            activegate_subnet_id,
        })
    }

    async fn provision_activegate(
        &self,
        plan: &ActiveGatePlan,
    ) -> std::result::Result<ActiveGateRef, ProvisionError> {
        let command = AzCommand::activegate_container_create(
            &plan.resource_group,
            &plan.location,
            &plan.container_name,
            registry_host(&plan.environment_url),
            &plan.environment_id,
            &plan.environment_url,
            plan.paas_token.expose(),
            plan.subnet_id.as_deref(),
        );
        let cmd_name = command.name.clone();
        let (container_group_id, ip_address) = match self.run_json(command).await? {
            Some(json) => (
                string_at(&json, &cmd_name, "/id")?,
                string_at(&json, &cmd_name, "/ipAddress/ip")?,
            ),
            None => (
                placeholder_id(
                    &plan.resource_group,
                    "Microsoft.ContainerInstance/containerGroups",
                    &plan.container_name,
                ),
                "<activegate-ip>".to_string(),
            ),
        };
        Ok(ActiveGateRef {
            endpoint_url: format!(
                "https://{ip_address}:{ACTIVEGATE_PORT}/e/{}",
                plan.environment_id
            ),
            container_group_id,
            ip_address,
        })
    }

    async fn update_app_settings(
        &self,
        resource_group: &str,
        function_app: &str,
        settings: &AppSettings,
    ) -> std::result::Result<(), ProvisionError> {
        Ok(self
            .set_app_settings(resource_group, function_app, settings)
            .await?)
    }

    async fn download_package(
        &self,
        url: &str,
        attempt: u32,
    ) -> std::result::Result<PackageArtifact, AttemptError> {
        match self.mode {
            ExecutionMode::DryRun => {
                info!(url, "dry-run: package download skipped");
                Ok(PackageArtifact {
                    path: self.downloader.target_path(),
                    size_bytes: 0,
                    sha256: sha256_hex(b""),
                })
            }
            ExecutionMode::Live => self.downloader.download(url, attempt).await,
        }
    }

    async fn deploy_package(
        &self,
        resource_group: &str,
        function_app: &str,
        artifact: &PackageArtifact,
        attempt: u32,
    ) -> std::result::Result<(), AttemptError> {
        let command = AzCommand::functionapp_zip_deploy(
            resource_group,
            function_app,
            &artifact.path.display().to_string(),
        );
        self.record(&command);
        if self.mode == ExecutionMode::DryRun {
            info!(line = %command.display(), "dry-run");
            return Ok(());
        }

        info!(function_app, attempt, "Deploying forwarder package");
        match self.runner.execute(&command).await {
            Ok(output) if output.passed() => Ok(()),
            Ok(output) => {
                let combined = output.combined();
                Err(AttemptError::new(
                    self.classifier.classify_output(&combined),
                    format!("zip deployment exited with code {}", output.exit_code),
                    combined,
                ))
            }
            Err(err) => Err(deploy_failure(&command, err)),
        }
    }

    async fn attach_identity(
        &self,
        resource_group: &str,
        function_app: &str,
        identity: &IdentityRef,
    ) -> std::result::Result<(), ProvisionError> {
        self.run_json(AzCommand::functionapp_identity_assign(
            resource_group,
            function_app,
            &identity.resource_id,
        ))
        .await?;
        Ok(())
    }
}

/// A deploy attempt that produced no exit status. Only a command that
/// cannot start is final; the command line is kept as the attempt's output
/// so an exhausted loop still shows what was run.
fn deploy_failure(command: &AzCommand, err: DeployError) -> AttemptError {
    match err {
        DeployError::Spawn { .. } | DeployError::EmptyCommand(_) => {
            AttemptError::terminal(err.to_string(), command.display())
        }
        other => AttemptError::transient(
            other.to_string(),
            format!("{}\n{other}", command.display()),
        ),
    }
}

impl AzCliProvisioner {
    async fn create_subnet(
        &self,
        resource_group: &str,
        vnet_id: &str,
        vnet_name: &str,
        subnet_name: &str,
        prefix: &str,
        delegation: &str,
    ) -> Result<String> {
        let command =
            AzCommand::subnet_create(resource_group, vnet_name, subnet_name, prefix, delegation);
        let cmd_name = command.name.clone();
        match self.run_json(command).await? {
            Some(json) => string_at(&json, &cmd_name, "/id"),
            None => Ok(format!("{vnet_id}/subnets/{subnet_name}")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use logfwd_core::FailureKind;

    fn zip_deploy() -> AzCommand {
        AzCommand::functionapp_zip_deploy("rg", "app", "/tmp/pkg.zip")
    }

    #[test]
    fn test_timed_out_deploy_keeps_command_line() {
        let err = deploy_failure(
            &zip_deploy(),
            DeployError::Timeout {
                name: "functionapp_zip_deploy".to_string(),
                timeout_secs: 960,
            },
        );
        assert_eq!(err.kind, FailureKind::Transient);
        assert!(err.output.starts_with("az functionapp deployment"));
        assert!(err.output.contains("timed out after 960 seconds"));
    }

    #[test]
    fn test_missing_az_is_final() {
        let err = deploy_failure(
            &zip_deploy(),
            DeployError::Spawn {
                program: "az".to_string(),
                source: std::io::Error::new(std::io::ErrorKind::NotFound, "not found"),
            },
        );
        assert_eq!(err.kind, FailureKind::Terminal);
        assert!(!err.output.is_empty());
    }

    #[test]
    fn test_vnet_of_subnet() {
        assert_eq!(
            vnet_of_subnet("/subscriptions/s/resourceGroups/rg/providers/Microsoft.Network/virtualNetworks/v/subnets/fn"),
            "/subscriptions/s/resourceGroups/rg/providers/Microsoft.Network/virtualNetworks/v"
        );
    }

    #[test]
    fn test_registry_host() {
        assert_eq!(
            registry_host("https://abc12345.live.dynatrace.com"),
            "abc12345.live.dynatrace.com"
        );
        assert_eq!(
            registry_host("https://managed.example.com/e/abc"),
            "managed.example.com"
        );
    }

    #[test]
    fn test_string_at_reports_missing_field() {
        let json = serde_json::json!({"identity": {}});
        let err = string_at(&json, "functionapp_create", "/identity/principalId").unwrap_err();
        match err {
            DeployError::MissingField { name, field } => {
                assert_eq!(name, "functionapp_create");
                assert_eq!(field, "identity.principalId");
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_dry_run_records_without_executing() {
        let provisioner = AzCliProvisioner::dry_run().unwrap();
        let identity = provisioner
            .ensure_identity("rg-logs", "westeurope", "dtlogs-identity")
            .await
            .unwrap();
        assert!(identity.resource_id.ends_with("/userAssignedIdentities/dtlogs-identity"));

        let issued = provisioner.issued();
        assert_eq!(issued.len(), 1);
        assert_eq!(issued[0].name, "identity_create");
    }
}
