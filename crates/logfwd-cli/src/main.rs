//! logfwd - deployer for the Dynatrace Azure log forwarder
//!
//! Validates the deployment parameters, probes the Dynatrace target and
//! provisions the forwarder with the Azure CLI.
//!
//! ## Commands
//!
//! - `validate`: check parameters only
//! - `check-connectivity`: validate, then probe the target
//! - `deploy`: the full ordered deployment (`--dry-run` prints the `az` commands)
//! - `names`: print the resource names a deployment would use
//!
//! Every parameter can come from a flag, from its environment variable, or
//! from an ARM parameters file; flags and environment win over the file.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use logfwd_core::{
    fields, init_tracing, parse_bool, probe_target, validate_parameters, DeploymentConfig,
    ForwarderError, LogFormat, Orchestrator, OrchestratorSettings, Parameters, ResourceNames,
    RetryPolicy, StatusFile, StatusMarker,
};
use logfwd_deploy::{AzCliProvisioner, CommandRunner, ExecutionMode};
use logfwd_probe::{ReqwestTransport, TransportConfig};
use tracing::{error, info, Level};

#[derive(Parser)]
#[command(name = "logfwd")]
#[command(author = "Stevedores Org")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Deploy the Dynatrace Azure log forwarder", long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Emit JSON-formatted log lines
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Validate deployment parameters without touching Azure
    Validate {
        #[command(flatten)]
        params: DeploymentArgs,

        /// Print the result as JSON
        #[arg(long)]
        json_output: bool,

        /// Append status markers to this file
        #[arg(long, env = "AZ_SCRIPTS_OUTPUT_PATH")]
        status_file: Option<PathBuf>,
    },

    /// Validate parameters and probe the Dynatrace target
    CheckConnectivity {
        #[command(flatten)]
        params: DeploymentArgs,

        /// Print the report as JSON
        #[arg(long)]
        json_output: bool,
    },

    /// Deploy the forwarder
    Deploy {
        #[command(flatten)]
        params: DeploymentArgs,

        /// Print the az commands instead of running them
        #[arg(long)]
        dry_run: bool,

        /// Print the summary as JSON
        #[arg(long)]
        json_output: bool,

        /// Append status markers to this file
        #[arg(long, env = "AZ_SCRIPTS_OUTPUT_PATH")]
        status_file: Option<PathBuf>,

        /// Azure CLI executable
        #[arg(long, env = "AZ_CLI_PATH", default_value = "az")]
        az_path: PathBuf,
    },

    /// Print the resource names derived from a deployment name
    Names {
        /// Deployment name
        #[arg(long, env = "DEPLOYMENT_NAME")]
        deployment_name: String,

        /// Resource group
        #[arg(long, env = "RESOURCE_GROUP")]
        resource_group: String,

        /// Print the names as JSON
        #[arg(long)]
        json_output: bool,
    },
}

/// Deployment parameters. Booleans stay strings here so that malformed
/// values are reported by validation like any other field.
#[derive(Args, Debug, Clone, Default)]
struct DeploymentArgs {
    /// ARM deployment parameters file (JSON)
    #[arg(long, env = "PARAMETERS_FILE")]
    parameters_file: Option<PathBuf>,

    /// Deployment name, 3-20 lowercase letters and digits
    #[arg(long, env = "DEPLOYMENT_NAME")]
    deployment_name: Option<String>,

    /// Target resource group
    #[arg(long, env = "RESOURCE_GROUP")]
    resource_group: Option<String>,

    /// Azure region
    #[arg(long, env = "LOCATION")]
    location: Option<String>,

    /// Dynatrace environment or ActiveGate URL
    #[arg(long, env = "TARGET_URL")]
    target_url: Option<String>,

    /// Dynatrace API token with logs.ingest
    #[arg(long, env = "TARGET_API_TOKEN", hide_env_values = true)]
    target_api_token: Option<String>,

    /// Dynatrace PaaS token, needed for a new ActiveGate
    #[arg(long, env = "TARGET_PAAS_TOKEN", hide_env_values = true)]
    target_paas_token: Option<String>,

    /// Event Hub connection string
    #[arg(long, env = "EVENT_HUB_CONNECTION_STRING", hide_env_values = true)]
    event_hub_connection_string: Option<String>,

    /// Event Hub name (managed-identity mode)
    #[arg(long, env = "EVENT_HUB_NAME")]
    event_hub_name: Option<String>,

    /// Client ID of the managed identity
    #[arg(long, env = "EVENTHUB_CONNECTION_CLIENT_ID")]
    eventhub_connection_client_id: Option<String>,

    /// Name of the user-assigned managed identity
    #[arg(long, env = "MANAGED_IDENTITY_RESOURCE_NAME")]
    managed_identity_resource_name: Option<String>,

    /// Event Hub namespace host, <ns>.servicebus.windows.net
    #[arg(long, env = "EVENTHUB_CONNECTION_FULLY_QUALIFIED_NAMESPACE")]
    eventhub_connection_fully_qualified_namespace: Option<String>,

    /// Log filter, key=value pairs separated by ';'
    #[arg(long, env = "FILTER_CONFIG")]
    filter_config: Option<String>,

    /// Existing subnet for the Function App
    #[arg(long, env = "EXISTING_FUNCTION_SUBNET_ID")]
    existing_function_subnet_id: Option<String>,

    /// Existing subnet for the ActiveGate container
    #[arg(long, env = "EXISTING_ACTIVEGATE_SUBNET_ID")]
    existing_activegate_subnet_id: Option<String>,

    /// Forwarder code package URL
    #[arg(long, env = "FUNCTION_PACKAGE_URL")]
    function_package_url: Option<String>,

    /// Deploy a new ActiveGate container (true/false)
    #[arg(long, env = "DEPLOY_ACTIVEGATE")]
    deploy_activegate: Option<String>,

    /// Enable forwarder self-monitoring (true/false)
    #[arg(long, env = "SELF_MONITORING_ENABLED")]
    self_monitoring_enabled: Option<String>,

    /// Require a valid TLS certificate on the target (true/false)
    #[arg(long, env = "REQUIRE_VALID_CERTIFICATE")]
    require_valid_certificate: Option<String>,

    /// Read the Event Hub with a user-assigned identity (true/false)
    #[arg(long, env = "ENABLE_USER_ASSIGNED_MANAGED_IDENTITY")]
    enable_user_assigned_managed_identity: Option<String>,

    /// Skip the connectivity check (true/false)
    #[arg(long, env = "SKIP_CONNECTIVITY_CHECK")]
    skip_connectivity_check: Option<String>,
}

impl DeploymentArgs {
    fn explicit(&self) -> Parameters {
        let values = [
            (fields::DEPLOYMENT_NAME, &self.deployment_name),
            (fields::RESOURCE_GROUP, &self.resource_group),
            (fields::LOCATION, &self.location),
            (fields::TARGET_URL, &self.target_url),
            (fields::TARGET_API_TOKEN, &self.target_api_token),
            (fields::TARGET_PAAS_TOKEN, &self.target_paas_token),
            (
                fields::EVENT_HUB_CONNECTION_STRING,
                &self.event_hub_connection_string,
            ),
            (fields::EVENT_HUB_NAME, &self.event_hub_name),
            (
                fields::EVENTHUB_CONNECTION_CLIENT_ID,
                &self.eventhub_connection_client_id,
            ),
            (
                fields::MANAGED_IDENTITY_RESOURCE_NAME,
                &self.managed_identity_resource_name,
            ),
            (
                fields::EVENTHUB_CONNECTION_FULLY_QUALIFIED_NAMESPACE,
                &self.eventhub_connection_fully_qualified_namespace,
            ),
            (fields::FILTER_CONFIG, &self.filter_config),
            (
                fields::EXISTING_FUNCTION_SUBNET_ID,
                &self.existing_function_subnet_id,
            ),
            (
                fields::EXISTING_ACTIVEGATE_SUBNET_ID,
                &self.existing_activegate_subnet_id,
            ),
            (fields::FUNCTION_PACKAGE_URL, &self.function_package_url),
            (fields::DEPLOY_ACTIVEGATE, &self.deploy_activegate),
            (fields::SELF_MONITORING_ENABLED, &self.self_monitoring_enabled),
            (
                fields::REQUIRE_VALID_CERTIFICATE,
                &self.require_valid_certificate,
            ),
            (
                fields::ENABLE_USER_ASSIGNED_MANAGED_IDENTITY,
                &self.enable_user_assigned_managed_identity,
            ),
            (fields::SKIP_CONNECTIVITY_CHECK, &self.skip_connectivity_check),
        ];

        let mut params = Parameters::new();
        for (field, value) in values {
            if let Some(value) = value {
                params.set(field, value.as_str());
            }
        }
        params
    }

    /// Parameters file (if any) overlaid with flags and environment.
    fn to_parameters(&self) -> Result<Parameters> {
        let base = match &self.parameters_file {
            Some(path) => Parameters::from_arm_file(path)
                .with_context(|| format!("Failed to read parameters file {}", path.display()))?,
            None => Parameters::new(),
        };
        Ok(base.merge(&self.explicit()))
    }
}

fn transport_for(params: &Parameters) -> Result<ReqwestTransport> {
    let require_valid_certificate = params
        .get(fields::REQUIRE_VALID_CERTIFICATE)
        .and_then(parse_bool)
        .unwrap_or(true);
    let config = TransportConfig {
        require_valid_certificate,
        ..TransportConfig::default()
    };
    ReqwestTransport::new(&config).context("Failed to build HTTP client")
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };
    let format = if cli.json {
        LogFormat::Json
    } else {
        LogFormat::Text
    };
    init_tracing(format, level);

    match cli.command {
        Commands::Validate {
            params,
            json_output,
            status_file,
        } => cmd_validate(&params, json_output, status_file.as_deref()),
        Commands::CheckConnectivity {
            params,
            json_output,
        } => cmd_check_connectivity(&params, json_output).await,
        Commands::Deploy {
            params,
            dry_run,
            json_output,
            status_file,
            az_path,
        } => {
            cmd_deploy(
                &params,
                dry_run,
                json_output,
                status_file.as_deref(),
                &az_path,
            )
            .await
        }
        Commands::Names {
            deployment_name,
            resource_group,
            json_output,
        } => cmd_names(&deployment_name, &resource_group, json_output),
    }
}

fn cmd_validate(args: &DeploymentArgs, json_output: bool, status_file: Option<&Path>) -> Result<()> {
    let params = args.to_parameters()?;
    let result = validate_parameters(&params).context("Failed to build validation rules")?;

    if json_output {
        println!("{}", serde_json::to_string_pretty(&result)?);
    }

    if !result.passed() {
        for failure in &result.failures {
            error!(field = %failure.field, "{}", failure.message);
        }
        anyhow::bail!("{} parameter(s) failed validation", result.failures.len());
    }

    if let Some(path) = status_file {
        StatusFile::new(path)
            .write(StatusMarker::Validation)
            .context("Failed to write status file")?;
    }
    if !json_output {
        println!("All parameters valid");
    }
    info!("Validation passed");
    Ok(())
}

async fn cmd_check_connectivity(args: &DeploymentArgs, json_output: bool) -> Result<()> {
    let params = args.to_parameters()?;
    let config = DeploymentConfig::from_parameters(&params)?;
    let transport = transport_for(&params)?;

    let report = probe_target(transport, &config)
        .await
        .context("Connectivity check failed")?;

    if json_output {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        for check in &report.passed {
            println!("ok: {check}");
        }
        if let Some(health) = report.health.as_ref().filter(|h| !h.is_ok()) {
            println!("warning: ActiveGate health {health:?}");
        }
    }
    Ok(())
}

async fn cmd_deploy(
    args: &DeploymentArgs,
    dry_run: bool,
    json_output: bool,
    status_file: Option<&Path>,
    az_path: &Path,
) -> Result<()> {
    let params = args.to_parameters()?;
    let transport = transport_for(&params)?;

    let mode = if dry_run {
        ExecutionMode::DryRun
    } else {
        ExecutionMode::Live
    };
    let provisioner = AzCliProvisioner::new(CommandRunner::new(az_path), mode)
        .context("Failed to prepare Azure CLI provisioner")?;

    let settings = deploy_settings(dry_run, status_file);
    let orchestrator = Orchestrator::new(provisioner, transport, settings);

    let outcome = match orchestrator.run(&params).await {
        Ok(outcome) => outcome,
        Err(err) => {
            if let Some(output) = err.diagnostic_output().filter(|o| !o.is_empty()) {
                eprintln!("{output}");
            }
            return Err(report_failure(err));
        }
    };

    if dry_run {
        for command in orchestrator.provisioner().issued() {
            println!("{}", command.display());
        }
    }

    if json_output {
        println!("{}", serde_json::to_string_pretty(&outcome.summary)?);
    } else {
        println!("{}", outcome.summary);
    }
    Ok(())
}

/// A dry run executes nothing, so it gets no warm-up and no retries.
fn deploy_settings(dry_run: bool, status_file: Option<&Path>) -> OrchestratorSettings {
    let mut settings = OrchestratorSettings {
        status_file: status_file.map(StatusFile::new),
        ..OrchestratorSettings::default()
    };
    if dry_run {
        settings.download_policy = RetryPolicy::new(1, Duration::ZERO);
        settings.deploy_policy = RetryPolicy::new(1, Duration::ZERO);
    }
    settings
}

fn report_failure(err: ForwarderError) -> anyhow::Error {
    let context = match &err {
        ForwarderError::Configuration(_) => "Deployment parameters are invalid",
        ForwarderError::Connectivity(_) => "Dynatrace target is not usable",
        ForwarderError::StepTimeout { .. } => "Deployment step timed out",
        _ => "Deployment failed",
    };
    anyhow::Error::new(err).context(context)
}

fn cmd_names(deployment_name: &str, resource_group: &str, json_output: bool) -> Result<()> {
    let names = ResourceNames::derive(deployment_name, resource_group);
    if json_output {
        println!("{}", serde_json::to_string_pretty(&names)?);
    } else {
        println!("Function App:       {}", names.function_app);
        println!("App Service plan:   {}", names.app_service_plan);
        println!("Storage account:    {}", names.storage_account);
        println!("Virtual network:    {}", names.virtual_network);
        println!("Function subnet:    {}", names.function_subnet);
        println!("ActiveGate subnet:  {}", names.activegate_subnet);
        println!("ActiveGate:         {}", names.activegate_container);
        println!("Managed identity:   {}", names.identity);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn deploy_args(cli: Cli) -> (DeploymentArgs, bool) {
        match cli.command {
            Commands::Deploy {
                params, dry_run, ..
            } => (params, dry_run),
            _ => panic!("expected deploy"),
        }
    }

    #[test]
    fn test_deploy_flags_parse() {
        let cli = Cli::try_parse_from([
            "logfwd",
            "-v",
            "deploy",
            "--dry-run",
            "--deployment-name",
            "dtlogs01",
            "--target-url",
            "https://ag.example.com:9999/e/abc12345",
            "--deploy-activegate",
            "false",
        ])
        .unwrap();
        assert!(cli.verbose);

        let (args, dry_run) = deploy_args(cli);
        assert!(dry_run);
        let params = args.to_parameters().unwrap();
        assert_eq!(params.get(fields::DEPLOYMENT_NAME), Some("dtlogs01"));
        assert_eq!(params.get(fields::DEPLOY_ACTIVEGATE), Some("false"));
    }

    #[test]
    fn test_flags_override_parameters_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("parameters.json");
        std::fs::write(
            &path,
            r#"{"parameters": {
                "forwarderName": {"value": "fromfile"},
                "location": {"value": "westeurope"},
                "deployActiveGateContainer": {"value": false}
            }}"#,
        )
        .unwrap();

        let args = DeploymentArgs {
            parameters_file: Some(path),
            deployment_name: Some("fromflag".to_string()),
            ..DeploymentArgs::default()
        };
        let params = args.to_parameters().unwrap();

        assert_eq!(params.get(fields::DEPLOYMENT_NAME), Some("fromflag"));
        assert_eq!(params.get(fields::LOCATION), Some("westeurope"));
        assert_eq!(params.get(fields::DEPLOY_ACTIVEGATE), Some("false"));
    }

    #[test]
    fn test_missing_parameters_file_is_an_error() {
        let args = DeploymentArgs {
            parameters_file: Some(PathBuf::from("/nonexistent/parameters.json")),
            ..DeploymentArgs::default()
        };
        let err = args.to_parameters().unwrap_err();
        assert!(err.to_string().contains("Failed to read parameters file"));
    }

    #[test]
    fn test_validate_reports_failures() {
        let args = DeploymentArgs {
            deployment_name: Some("AB".to_string()),
            ..DeploymentArgs::default()
        };
        assert!(cmd_validate(&args, false, None).is_err());
    }

    #[test]
    fn test_validate_writes_status_marker() {
        let dir = tempfile::tempdir().unwrap();
        let status = dir.path().join("outputs");
        let args = DeploymentArgs {
            deployment_name: Some("dtlogs01".to_string()),
            resource_group: Some("rg-logs".to_string()),
            location: Some("westeurope".to_string()),
            target_url: Some("https://abc12345.live.dynatrace.com".to_string()),
            target_api_token: Some("dt0c01.api".to_string()),
            event_hub_connection_string: Some(
                "Endpoint=sb://ns.servicebus.windows.net/;EntityPath=insights".to_string(),
            ),
            ..DeploymentArgs::default()
        };

        cmd_validate(&args, true, Some(&status)).unwrap();

        assert_eq!(
            std::fs::read_to_string(&status).unwrap(),
            "VALIDATION_STATUS=SUCCESS\n"
        );
    }

    #[test]
    fn test_names_subcommand() {
        let cli = Cli::try_parse_from([
            "logfwd",
            "names",
            "--deployment-name",
            "dtlogs01",
            "--resource-group",
            "rg-logs",
        ])
        .unwrap();
        match cli.command {
            Commands::Names {
                deployment_name,
                resource_group,
                json_output,
            } => {
                assert!(!json_output);
                assert!(cmd_names(&deployment_name, &resource_group, true).is_ok());
            }
            _ => panic!("expected names"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_dry_run_deploy_succeeds_without_az() {
        let dir = tempfile::tempdir().unwrap();
        let status = dir.path().join("outputs");
        let args = DeploymentArgs {
            deployment_name: Some("dtlogs01".to_string()),
            resource_group: Some("rg-logs".to_string()),
            location: Some("westeurope".to_string()),
            target_url: Some("https://ag.example.com:9999/e/abc12345".to_string()),
            target_api_token: Some("dt0c01.api".to_string()),
            event_hub_connection_string: Some(
                "Endpoint=sb://ns.servicebus.windows.net/;EntityPath=insights".to_string(),
            ),
            skip_connectivity_check: Some("true".to_string()),
            ..DeploymentArgs::default()
        };

        cmd_deploy(
            &args,
            true,
            true,
            Some(&status),
            Path::new("/nonexistent/az"),
        )
        .await
        .unwrap();

        assert_eq!(
            std::fs::read_to_string(&status).unwrap(),
            "VALIDATION_STATUS=SUCCESS\nDEPLOYMENT_STATUS=SUCCESS\n"
        );
    }

    #[test]
    fn test_dry_run_settings_skip_waits() {
        let settings = deploy_settings(true, None);
        assert_eq!(settings.deploy_policy.warmup, None);
        assert_eq!(settings.deploy_policy.max_attempts, 1);
        assert_eq!(settings.download_policy.delay, Duration::ZERO);

        let live = deploy_settings(false, None);
        assert_eq!(live.deploy_policy, RetryPolicy::package_deploy());
    }

    #[tokio::test]
    async fn test_dry_run_deploy_returns_promptly() {
        let args = DeploymentArgs {
            deployment_name: Some("dtlogs01".to_string()),
            resource_group: Some("rg-logs".to_string()),
            location: Some("westeurope".to_string()),
            target_url: Some("https://ag.example.com:9999/e/abc12345".to_string()),
            target_api_token: Some("dt0c01.api".to_string()),
            event_hub_connection_string: Some(
                "Endpoint=sb://ns.servicebus.windows.net/;EntityPath=insights".to_string(),
            ),
            skip_connectivity_check: Some("true".to_string()),
            ..DeploymentArgs::default()
        };

        let run = cmd_deploy(&args, true, false, None, Path::new("/nonexistent/az"));
        tokio::time::timeout(Duration::from_secs(10), run)
            .await
            .expect("dry run should not wait")
            .unwrap();
    }

    #[test]
    fn test_report_failure_adds_context() {
        let err = report_failure(ForwarderError::StepTimeout {
            step: "deploy_package".to_string(),
            timeout: Duration::from_secs(1800),
        });
        assert_eq!(err.to_string(), "Deployment step timed out");
        assert!(format!("{err:#}").contains("deploy_package"));
    }
}
