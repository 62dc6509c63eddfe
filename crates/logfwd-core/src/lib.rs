//! logfwd-core: validation, retries and orchestration for the log forwarder deployer
//!
//! Ties the parameter validator, the connectivity prober and the retry
//! executor into one ordered provisioning run. Cloud calls go through the
//! [`Provisioner`] trait so the sequence can be driven by the Azure CLI or
//! by a scripted fake.

pub mod config;
pub mod error;
pub mod naming;
pub mod orchestration;
pub mod provision;
pub mod retry;
pub mod status;
pub mod summary;
pub mod telemetry;
pub mod validation;

pub use config::{
    fields, parse_bool, validate_parameters, DeploymentConfig, EventHubConnection, NetworkConfig,
    Parameters, Secret, DEFAULT_FUNCTION_PACKAGE_URL,
};
pub use error::{ForwarderError, ProvisionError, Result};
pub use naming::{
    content_digest, role_assignment_id, ResourceNames, EVENT_HUBS_DATA_RECEIVER_ROLE,
    MONITORING_METRICS_PUBLISHER_ROLE,
};
pub use orchestration::{
    probe_target, ConnectivityReport, DeploymentOutcome, Orchestrator, OrchestratorSettings, Step,
    StepRecord, StepStatus, PROVISIONING_TIMEOUT, VALIDATION_TIMEOUT,
};
pub use provision::{
    ActiveGatePlan, ActiveGateRef, AppSettings, CorePlan, CoreResources, IdentityRef,
    PackageArtifact, Provisioner, RoleBinding,
};
pub use retry::{
    Attempt, AttemptError, AttemptOutcome, FailureKind, RetryError, RetryExecutor, RetryPolicy,
    RetryReport, DEFAULT_MAX_ATTEMPTS, DEFAULT_RETRY_DELAY, DEPLOY_WARMUP,
};
pub use status::{StatusFile, StatusMarker};
pub use summary::DeploymentSummary;
pub use telemetry::{init_tracing, LogFormat};
pub use validation::{FieldFailure, RuleContext, ValidationResult, ValidationRule};
