//! `az` command definitions.
//!
//! Each builder returns the argument vector for one Azure CLI call. Values
//! that must never reach a log line are listed in `secret_values` and
//! masked by [`AzCommand::display`].

use serde::{Deserialize, Serialize};

/// Default per-command timeout.
pub const DEFAULT_COMMAND_TIMEOUT_SECS: u64 = 20 * 60;

/// Timeout for a zip deployment, which the service itself caps at 15 minutes.
pub const ZIP_DEPLOY_TIMEOUT_SECS: u64 = 15 * 60;

/// Address space of a vnet created for the forwarder.
pub const VNET_ADDRESS_PREFIX: &str = "172.0.0.0/22";
pub const FUNCTION_SUBNET_PREFIX: &str = "172.0.0.0/24";
pub const ACTIVEGATE_SUBNET_PREFIX: &str = "172.0.1.0/24";

/// Python runtime of the forwarder function.
pub const PYTHON_VERSION: &str = "3.11";

/// ActiveGate ingest port.
pub const ACTIVEGATE_PORT: u16 = 9999;

const MASK: &str = "***";

/// One Azure CLI invocation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AzCommand {
    /// Short operation name used in logs and errors.
    pub name: String,

    /// Arguments after the `az` executable.
    pub args: Vec<String>,

    /// Timeout in seconds.
    pub timeout_secs: u64,

    /// Argument substrings to mask when displayed.
    #[serde(skip)]
    pub secret_values: Vec<String>,
}

fn args(parts: &[&str]) -> Vec<String> {
    parts.iter().map(|s| s.to_string()).collect()
}

impl AzCommand {
    pub fn new(name: &str, args: Vec<String>) -> Self {
        Self {
            name: name.to_string(),
            args,
            timeout_secs: DEFAULT_COMMAND_TIMEOUT_SECS,
            secret_values: Vec::new(),
        }
    }

    pub fn with_timeout(mut self, timeout_secs: u64) -> Self {
        self.timeout_secs = timeout_secs;
        self
    }

    pub fn with_secret(mut self, value: &str) -> Self {
        if !value.is_empty() {
            self.secret_values.push(value.to_string());
        }
        self
    }

    /// Printable command line with secrets masked.
    pub fn display(&self) -> String {
        let mut line = String::from("az");
        for arg in &self.args {
            let mut shown = arg.clone();
            for secret in &self.secret_values {
                shown = shown.replace(secret.as_str(), MASK);
            }
            line.push(' ');
            if shown.contains(char::is_whitespace) {
                line.push_str(&format!("'{shown}'"));
            } else {
                line.push_str(&shown);
            }
        }
        line
    }

    /// `az identity create`; returns the identity when it already exists.
    pub fn identity_create(resource_group: &str, location: &str, name: &str) -> Self {
        Self::new(
            "identity_create",
            args(&[
                "identity", "create", "-g", resource_group, "-n", name, "-l", location, "-o",
                "json",
            ]),
        )
    }

    /// `az resource list` filtered to one Event Hub namespace.
    pub fn event_hub_namespace_list(namespace: &str) -> Self {
        Self::new(
            "eventhub_namespace_list",
            args(&[
                "resource",
                "list",
                "--resource-type",
                "Microsoft.EventHub/namespaces",
                "--name",
                namespace,
                "-o",
                "json",
            ]),
        )
    }

    /// `az role assignment create` with a fixed assignment name.
    pub fn role_assignment_create(
        assignment_id: &str,
        principal_id: &str,
        role_definition_id: &str,
        scope: &str,
    ) -> Self {
        Self::new(
            "role_assignment_create",
            args(&[
                "role",
                "assignment",
                "create",
                "--name",
                assignment_id,
                "--assignee-object-id",
                principal_id,
                "--assignee-principal-type",
                "ServicePrincipal",
                "--role",
                role_definition_id,
                "--scope",
                scope,
                "-o",
                "json",
            ]),
        )
    }

    pub fn storage_account_create(resource_group: &str, location: &str, name: &str) -> Self {
        Self::new(
            "storage_account_create",
            args(&[
                "storage",
                "account",
                "create",
                "-g",
                resource_group,
                "-n",
                name,
                "-l",
                location,
                "--sku",
                "Standard_LRS",
                "--kind",
                "StorageV2",
                "--min-tls-version",
                "TLS1_2",
                "--allow-blob-public-access",
                "false",
                "-o",
                "json",
            ]),
        )
    }

    pub fn vnet_create(resource_group: &str, location: &str, name: &str) -> Self {
        Self::new(
            "vnet_create",
            args(&[
                "network",
                "vnet",
                "create",
                "-g",
                resource_group,
                "-n",
                name,
                "-l",
                location,
                "--address-prefixes",
                VNET_ADDRESS_PREFIX,
                "-o",
                "json",
            ]),
        )
    }

    /// `az network vnet subnet create` delegated to `delegation`.
    pub fn subnet_create(
        resource_group: &str,
        vnet: &str,
        name: &str,
        prefix: &str,
        delegation: &str,
    ) -> Self {
        Self::new(
            "subnet_create",
            args(&[
                "network",
                "vnet",
                "subnet",
                "create",
                "-g",
                resource_group,
                "--vnet-name",
                vnet,
                "-n",
                name,
                "--address-prefixes",
                prefix,
                "--delegations",
                delegation,
                "-o",
                "json",
            ]),
        )
    }

    pub fn functionapp_plan_create(resource_group: &str, location: &str, name: &str) -> Self {
        Self::new(
            "functionapp_plan_create",
            args(&[
                "functionapp",
                "plan",
                "create",
                "-g",
                resource_group,
                "-n",
                name,
                "-l",
                location,
                "--sku",
                "S1",
                "--is-linux",
                "-o",
                "json",
            ]),
        )
    }

    /// `az functionapp create` with a system identity, plus `identity` when
    /// given.
    pub fn functionapp_create(
        resource_group: &str,
        name: &str,
        plan: &str,
        storage_account: &str,
        identity: Option<&str>,
    ) -> Self {
        let mut parts = args(&[
            "functionapp",
            "create",
            "-g",
            resource_group,
            "-n",
            name,
            "--plan",
            plan,
            "--storage-account",
            storage_account,
            "--os-type",
            "Linux",
            "--runtime",
            "python",
            "--runtime-version",
            PYTHON_VERSION,
            "--functions-version",
            "4",
            "--https-only",
            "true",
            "--assign-identity",
            "[system]",
        ]);
        if let Some(identity) = identity {
            parts.push(identity.to_string());
        }
        parts.extend(args(&["-o", "json"]));
        Self::new("functionapp_create", parts)
    }

    pub fn functionapp_vnet_integration(
        resource_group: &str,
        name: &str,
        vnet_id: &str,
        subnet_id: &str,
    ) -> Self {
        Self::new(
            "functionapp_vnet_integration",
            args(&[
                "functionapp",
                "vnet-integration",
                "add",
                "-g",
                resource_group,
                "-n",
                name,
                "--vnet",
                vnet_id,
                "--subnet",
                subnet_id,
                "-o",
                "json",
            ]),
        )
    }

    /// `az functionapp config appsettings set`; every value in
    /// `secret_values` is masked in logs.
    pub fn functionapp_appsettings_set(
        resource_group: &str,
        name: &str,
        settings: Vec<String>,
        secret_values: &[&str],
    ) -> Self {
        let mut parts = args(&[
            "functionapp",
            "config",
            "appsettings",
            "set",
            "-g",
            resource_group,
            "-n",
            name,
            "--settings",
        ]);
        parts.extend(settings);
        parts.extend(args(&["-o", "none"]));
        secret_values
            .iter()
            .fold(Self::new("functionapp_appsettings_set", parts), |cmd, s| {
                cmd.with_secret(s)
            })
    }

    /// ActiveGate container pulled from the environment's own registry with
    /// the PaaS token.
    #[allow(clippy::too_many_arguments)]
    pub fn activegate_container_create(
        resource_group: &str,
        location: &str,
        name: &str,
        registry: &str,
        environment_id: &str,
        environment_url: &str,
        paas_token: &str,
        subnet_id: Option<&str>,
    ) -> Self {
        let image = format!("{registry}/linux/activegate:latest");
        let port = ACTIVEGATE_PORT.to_string();
        let mut parts = args(&[
            "container",
            "create",
            "-g",
            resource_group,
            "-n",
            name,
            "-l",
            location,
            "--image",
            &image,
            "--registry-login-server",
            registry,
            "--registry-username",
            environment_id,
            "--registry-password",
            paas_token,
            "--os-type",
            "Linux",
            "--cpu",
            "1",
            "--memory",
            "2",
            "--ports",
            &port,
            "--environment-variables",
            "DT_CAPABILITIES=log_analytics_collector,generic_ingest_enabled",
            "DT_ID_SKIP_HOSTNAME=true",
            &format!("DT_TENANT={environment_id}"),
            &format!("DT_SERVER={environment_url}/communication"),
            "--secure-environment-variables",
            &format!("DT_TENANTTOKEN={paas_token}"),
        ]);
        match subnet_id {
            Some(subnet) => parts.extend(args(&["--ip-address", "Private", "--subnet", subnet])),
            None => parts.extend(args(&["--ip-address", "Public"])),
        }
        parts.extend(args(&["-o", "json"]));
        Self::new("activegate_container_create", parts).with_secret(paas_token)
    }

    pub fn functionapp_identity_assign(
        resource_group: &str,
        name: &str,
        identity_id: &str,
    ) -> Self {
        Self::new(
            "functionapp_identity_assign",
            args(&[
                "functionapp",
                "identity",
                "assign",
                "-g",
                resource_group,
                "-n",
                name,
                "--identities",
                identity_id,
                "-o",
                "json",
            ]),
        )
    }

    /// Zip deployment of the forwarder package.
    pub fn functionapp_zip_deploy(resource_group: &str, name: &str, src: &str) -> Self {
        let timeout = ZIP_DEPLOY_TIMEOUT_SECS.to_string();
        Self::new(
            "functionapp_zip_deploy",
            args(&[
                "functionapp",
                "deployment",
                "source",
                "config-zip",
                "-g",
                resource_group,
                "-n",
                name,
                "--src",
                src,
                "--timeout",
                &timeout,
                "-o",
                "json",
            ]),
        )
        .with_timeout(ZIP_DEPLOY_TIMEOUT_SECS + 60)
    }
}
