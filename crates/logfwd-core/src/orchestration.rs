//! Ordered provisioning of the forwarder.
//!
//! Steps run strictly one after another; each consumes what the previous one
//! produced, and the first hard failure ends the run. Nothing is rolled back.
//!
//! 1. validate parameters
//! 2. probe the target (unless skipped)
//! 3. identity and Event Hub role binding (managed-identity mode)
//! 4. network, storage and Function App
//! 5. ActiveGate container (when requested)
//! 6. download and deploy the code package, retried
//! 7. post-deployment identity attachment and role bindings

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use logfwd_probe::{
    ConnectivityProber, HealthStatus, HttpTransport, TargetEndpoint, INSTALLER_DOWNLOAD_SCOPE,
    LOGS_INGEST_SCOPE,
};
use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};

use crate::config::{fields, DeploymentConfig, EventHubConnection, Parameters};
use crate::error::{ForwarderError, Result};
use crate::naming::{
    ResourceNames, EVENT_HUBS_DATA_RECEIVER_ROLE, MONITORING_METRICS_PUBLISHER_ROLE,
};
use crate::provision::{
    ActiveGatePlan, ActiveGateRef, AppSettings, CorePlan, CoreResources, IdentityRef,
    Provisioner, RoleBinding,
};
use crate::retry::{Attempt, RetryExecutor, RetryPolicy};
use crate::status::{StatusFile, StatusMarker};
use crate::summary::DeploymentSummary;
use crate::validation::{FieldFailure, ValidationResult};

/// Budget for validation and connectivity probing.
pub const VALIDATION_TIMEOUT: Duration = Duration::from_secs(10 * 60);

/// Budget for each provisioning step.
pub const PROVISIONING_TIMEOUT: Duration = Duration::from_secs(30 * 60);

/// Orchestration steps, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Step {
    Validate,
    CheckConnectivity,
    Identity,
    CoreResources,
    ActiveGate,
    DownloadPackage,
    DeployPackage,
    PostDeploymentRoles,
}

impl Step {
    pub fn name(&self) -> &'static str {
        match self {
            Step::Validate => "validate",
            Step::CheckConnectivity => "check_connectivity",
            Step::Identity => "identity",
            Step::CoreResources => "core_resources",
            Step::ActiveGate => "activegate",
            Step::DownloadPackage => "download_package",
            Step::DeployPackage => "deploy_package",
            Step::PostDeploymentRoles => "post_deployment_roles",
        }
    }
}

impl fmt::Display for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Completed,
    Skipped,
}

/// One executed (or skipped) step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepRecord {
    pub step: Step,
    pub status: StepStatus,
    pub duration_ms: u64,
}

/// Result of the probe step. Health problems are warnings, kept here.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectivityReport {
    pub health: Option<HealthStatus>,
    pub passed: Vec<String>,
}

impl ConnectivityReport {
    pub fn has_warnings(&self) -> bool {
        self.health.as_ref().is_some_and(|h| !h.is_ok())
    }
}

/// Tunables for a run.
#[derive(Debug, Clone)]
pub struct OrchestratorSettings {
    pub validation_timeout: Duration,
    pub step_timeout: Duration,
    pub download_policy: RetryPolicy,
    pub deploy_policy: RetryPolicy,
    pub status_file: Option<StatusFile>,
}

impl Default for OrchestratorSettings {
    fn default() -> Self {
        Self {
            validation_timeout: VALIDATION_TIMEOUT,
            step_timeout: PROVISIONING_TIMEOUT,
            download_policy: RetryPolicy::package_download(),
            deploy_policy: RetryPolicy::package_deploy(),
            status_file: None,
        }
    }
}

/// Everything a successful run produced.
#[derive(Debug, Clone)]
pub struct DeploymentOutcome {
    pub summary: DeploymentSummary,
    pub connectivity: Option<ConnectivityReport>,
    pub steps: Vec<StepRecord>,
    pub download_attempts: Vec<Attempt>,
    pub deploy_attempts: Vec<Attempt>,
}

impl DeploymentOutcome {
    pub fn completed(&self) -> impl Iterator<Item = Step> + '_ {
        self.steps
            .iter()
            .filter(|r| r.status == StepStatus::Completed)
            .map(|r| r.step)
    }
}

/// Sequences validator, prober, provisioner and retry executor.
pub struct Orchestrator<P: Provisioner, T: HttpTransport> {
    provisioner: P,
    transport: Arc<T>,
    settings: OrchestratorSettings,
}

impl<P: Provisioner, T: HttpTransport> Orchestrator<P, T> {
    pub fn new(provisioner: P, transport: T, settings: OrchestratorSettings) -> Self {
        Self {
            provisioner,
            transport: Arc::new(transport),
            settings,
        }
    }

    pub fn provisioner(&self) -> &P {
        &self.provisioner
    }

    /// Step 1: validate and build the configuration.
    pub fn validate(&self, params: &Parameters) -> Result<DeploymentConfig> {
        match DeploymentConfig::from_parameters(params) {
            Ok(config) => {
                info!(deployment = %config.deployment_name, "Parameters validated");
                Ok(config)
            }
            Err(ForwarderError::Configuration(result)) => {
                for failure in &result.failures {
                    error!(field = %failure.field, "{}", failure.message);
                }
                Err(ForwarderError::Configuration(result))
            }
            Err(other) => Err(other),
        }
    }

    /// Retried steps get the step budget per attempt rather than for the
    /// whole loop, so the final attempt always runs and reports its output.
    fn attempt_bounded(&self, policy: &RetryPolicy) -> RetryPolicy {
        let mut policy = policy.clone();
        if policy.attempt_timeout.is_none() {
            policy.attempt_timeout = Some(self.settings.step_timeout);
        }
        policy
    }

    /// Step 2: probe the target.
    pub async fn check_connectivity(&self, config: &DeploymentConfig) -> Result<ConnectivityReport> {
        probe_target(self.transport.clone(), config).await
    }

    /// Run the whole sequence.
    pub async fn run(&self, params: &Parameters) -> Result<DeploymentOutcome> {
        let mut steps = Vec::new();

        let started = Instant::now();
        let config = self.validate(params)?;
        record(&mut steps, Step::Validate, StepStatus::Completed, started);

        let started = Instant::now();
        let connectivity = if config.skip_connectivity_check {
            info!("Connectivity check skipped");
            record(&mut steps, Step::CheckConnectivity, StepStatus::Skipped, started);
            None
        } else {
            let report = timed(
                Step::CheckConnectivity,
                self.settings.validation_timeout,
                self.check_connectivity(&config),
            )
            .await?;
            record(&mut steps, Step::CheckConnectivity, StepStatus::Completed, started);
            Some(report)
        };

        if let Some(status) = &self.settings.status_file {
            status.write(StatusMarker::Validation)?;
        }

        let mut names = ResourceNames::derive(&config.deployment_name, &config.resource_group);

        let started = Instant::now();
        let identity = match &config.event_hub {
            EventHubConnection::ManagedIdentity {
                identity_name,
                fully_qualified_namespace,
                ..
            } => {
                names = names.with_identity(identity_name.as_str());
                let identity = timed(
                    Step::Identity,
                    self.settings.step_timeout,
                    self.bind_identity(&config, identity_name, fully_qualified_namespace),
                )
                .await?;
                record(&mut steps, Step::Identity, StepStatus::Completed, started);
                Some(identity)
            }
            EventHubConnection::ConnectionString(_) => {
                record(&mut steps, Step::Identity, StepStatus::Skipped, started);
                None
            }
        };

        let started = Instant::now();
        let plan = CorePlan {
            resource_group: config.resource_group.clone(),
            location: config.location.clone(),
            names: names.clone(),
            function_subnet_id: config.network.function_subnet_id.clone(),
            activegate_subnet_id: config.network.activegate_subnet_id.clone(),
            needs_activegate_subnet: config.deploy_activegate
                && config.network.activegate_subnet_id.is_none(),
            identity: identity.clone(),
            app_settings: AppSettings::for_forwarder(&config, &config.target_url),
        };
        let core = timed(Step::CoreResources, self.settings.step_timeout, async {
            self.provisioner
                .provision_core(&plan)
                .await
                .map_err(|e| ForwarderError::provisioning(Step::CoreResources.name(), e))
        })
        .await?;
        info!(function_app = %core.function_app_id, "Core resources ready");
        record(&mut steps, Step::CoreResources, StepStatus::Completed, started);

        let started = Instant::now();
        let activegate = if config.deploy_activegate {
            let ag = timed(
                Step::ActiveGate,
                self.settings.step_timeout,
                self.deploy_activegate(&config, &names, &core),
            )
            .await?;
            record(&mut steps, Step::ActiveGate, StepStatus::Completed, started);
            Some(ag)
        } else {
            record(&mut steps, Step::ActiveGate, StepStatus::Skipped, started);
            None
        };

        let started = Instant::now();
        let provisioner = &self.provisioner;
        let package_url = config.package_url.as_str();
        let download = RetryExecutor::new(self.attempt_bounded(&self.settings.download_policy))
            .run(Step::DownloadPackage.name(), move |attempt| {
                provisioner.download_package(package_url, attempt)
            })
            .await?;
        info!(
            bytes = download.value.size_bytes,
            sha256 = %download.value.sha256,
            "Package downloaded"
        );
        record(&mut steps, Step::DownloadPackage, StepStatus::Completed, started);

        let started = Instant::now();
        let artifact = &download.value;
        let resource_group = config.resource_group.as_str();
        let function_app = core.function_app_name.as_str();
        let deploy = RetryExecutor::new(self.attempt_bounded(&self.settings.deploy_policy))
            .run(Step::DeployPackage.name(), move |attempt| {
                provisioner.deploy_package(resource_group, function_app, artifact, attempt)
            })
            .await?;
        info!(function_app, "Package deployed");
        record(&mut steps, Step::DeployPackage, StepStatus::Completed, started);

        let started = Instant::now();
        let bound = timed(
            Step::PostDeploymentRoles,
            self.settings.step_timeout,
            self.bind_post_deployment(&config, &core, identity.as_ref()),
        )
        .await?;
        let status = if bound {
            StepStatus::Completed
        } else {
            StepStatus::Skipped
        };
        record(&mut steps, Step::PostDeploymentRoles, status, started);

        if let Some(status) = &self.settings.status_file {
            status.write(StatusMarker::Deployment)?;
        }

        let summary = DeploymentSummary::new(&config, &core, identity.as_ref(), activegate.as_ref());
        info!(deployment = %config.deployment_name, "Deployment finished");

        Ok(DeploymentOutcome {
            summary,
            connectivity,
            steps,
            download_attempts: download.attempts,
            deploy_attempts: deploy.attempts,
        })
    }

    async fn bind_identity(
        &self,
        config: &DeploymentConfig,
        identity_name: &str,
        fully_qualified_namespace: &str,
    ) -> Result<IdentityRef> {
        let fail = |e| ForwarderError::provisioning(Step::Identity.name(), e);

        let identity = self
            .provisioner
            .ensure_identity(&config.resource_group, &config.location, identity_name)
            .await
            .map_err(fail)?;
        info!(identity = %identity.resource_id, "Managed identity ready");

        let namespace_id = self
            .provisioner
            .resolve_event_hub_namespace(fully_qualified_namespace)
            .await
            .map_err(fail)?;

        let binding = RoleBinding::new(
            identity.principal_id.as_str(),
            EVENT_HUBS_DATA_RECEIVER_ROLE,
            namespace_id,
        );
        self.provisioner.assign_role(&binding).await.map_err(fail)?;
        info!(assignment = %binding.assignment_id, scope = %binding.scope, "Event Hub role bound");

        Ok(identity)
    }

    async fn deploy_activegate(
        &self,
        config: &DeploymentConfig,
        names: &ResourceNames,
        core: &CoreResources,
    ) -> Result<ActiveGateRef> {
        let paas_token = config.paas_token.clone().ok_or_else(|| {
            ForwarderError::Configuration(ValidationResult {
                failures: vec![FieldFailure {
                    field: fields::TARGET_PAAS_TOKEN.to_string(),
                    message: format!("{} is required", fields::TARGET_PAAS_TOKEN),
                }],
            })
        })?;
        let fail = |e| ForwarderError::provisioning(Step::ActiveGate.name(), e);

        let plan = ActiveGatePlan {
            resource_group: config.resource_group.clone(),
            location: config.location.clone(),
            container_name: names.activegate_container.clone(),
            environment_url: config.target_url.clone(),
            environment_id: config.environment_id(),
            paas_token,
            subnet_id: config
                .network
                .activegate_subnet_id
                .clone()
                .or_else(|| core.activegate_subnet_id.clone()),
        };
        let ag = self
            .provisioner
            .provision_activegate(&plan)
            .await
            .map_err(fail)?;
        info!(activegate = %ag.container_group_id, endpoint = %ag.endpoint_url, "ActiveGate ready");

        let mut settings = AppSettings::default();
        settings.set("DYNATRACE_URL", ag.endpoint_url.as_str());
        self.provisioner
            .update_app_settings(&config.resource_group, &core.function_app_name, &settings)
            .await
            .map_err(fail)?;

        Ok(ag)
    }

    /// Returns whether anything was bound.
    async fn bind_post_deployment(
        &self,
        config: &DeploymentConfig,
        core: &CoreResources,
        identity: Option<&IdentityRef>,
    ) -> Result<bool> {
        let fail = |e| ForwarderError::provisioning(Step::PostDeploymentRoles.name(), e);
        let mut bound = false;

        if let Some(identity) = identity {
            self.provisioner
                .attach_identity(&config.resource_group, &core.function_app_name, identity)
                .await
                .map_err(fail)?;
            info!(identity = %identity.name, "Identity attached to Function App");
            bound = true;
        }

        if config.self_monitoring_enabled {
            match &core.function_principal_id {
                Some(principal) => {
                    let binding = RoleBinding::new(
                        principal.as_str(),
                        MONITORING_METRICS_PUBLISHER_ROLE,
                        core.function_app_id.as_str(),
                    );
                    self.provisioner.assign_role(&binding).await.map_err(fail)?;
                    info!(assignment = %binding.assignment_id, "Self-monitoring role bound");
                    bound = true;
                }
                None => warn!(
                    function_app = %core.function_app_name,
                    "Function App has no system-assigned identity; self-monitoring role not bound"
                ),
            }
        }

        if !bound {
            warn!("No post-deployment role bindings required");
        }
        Ok(bound)
    }
}

/// Probe the target of `config`.
///
/// With a new ActiveGate only the tokens can be checked against the
/// environment; otherwise the ActiveGate health (soft), the API token and
/// the ingest endpoint are checked.
pub async fn probe_target<T: HttpTransport>(
    transport: T,
    config: &DeploymentConfig,
) -> Result<ConnectivityReport> {
    let endpoint = TargetEndpoint::parse(&config.target_url)?;
    let prober = ConnectivityProber::new(transport, endpoint);
    let api_token = config.api_token.expose();
    let mut report = ConnectivityReport::default();

    if config.deploy_activegate {
        prober.check_token_scope(api_token, LOGS_INGEST_SCOPE).await?;
        report.passed.push(format!("api token has {LOGS_INGEST_SCOPE}"));

        if let Some(paas) = &config.paas_token {
            prober
                .check_token_scope(paas.expose(), INSTALLER_DOWNLOAD_SCOPE)
                .await?;
            report
                .passed
                .push(format!("paas token has {INSTALLER_DOWNLOAD_SCOPE}"));
        }
        return Ok(report);
    }

    report.health = Some(prober.check_health().await);

    prober.check_token_scope(api_token, LOGS_INGEST_SCOPE).await?;
    report.passed.push(format!("api token has {LOGS_INGEST_SCOPE}"));

    prober.send_ingest_probe(api_token).await?;
    report.passed.push("log ingest accepted".to_string());

    Ok(report)
}

fn record(steps: &mut Vec<StepRecord>, step: Step, status: StepStatus, started: Instant) {
    let duration_ms = started.elapsed().as_millis() as u64;
    match status {
        StepStatus::Completed => info!(step = %step, duration_ms, "Step completed"),
        StepStatus::Skipped => info!(step = %step, "Step skipped"),
    }
    steps.push(StepRecord {
        step,
        status,
        duration_ms,
    });
}

/// Apply a wall-clock budget to a step.
async fn timed<F, R>(step: Step, timeout: Duration, fut: F) -> Result<R>
where
    F: Future<Output = Result<R>>,
{
    match tokio::time::timeout(timeout, fut).await {
        Ok(result) => result,
        Err(_) => {
            error!(step = %step, timeout_secs = timeout.as_secs(), "Step timed out");
            Err(ForwarderError::StepTimeout {
                step: step.name().to_string(),
                timeout,
            })
        }
    }
}
