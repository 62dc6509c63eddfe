//! Error taxonomy for the deployer.
//!
//! - configuration errors: the parameters failed validation
//! - connectivity errors: a hard probe failure (token or ingest)
//! - provisioning errors: a cloud command failed or returned garbage
//! - retry errors: a retried operation ran out of attempts or hit a terminal failure
//! - step timeouts: a step exceeded its wall-clock budget

use std::time::Duration;

use logfwd_probe::ProbeError;

use crate::retry::RetryError;
use crate::validation::ValidationResult;

/// Failure of a single provisioning call.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProvisionError {
    #[error("{operation} failed: {message}")]
    CommandFailed {
        operation: String,
        message: String,
        output: String,
    },

    #[error("{operation} returned unexpected output: {message}")]
    UnexpectedOutput { operation: String, message: String },

    #[error("{0} not found")]
    NotFound(String),
}

/// Deployer errors.
#[derive(Debug, thiserror::Error)]
pub enum ForwarderError {
    #[error("invalid deployment parameters:\n{0}")]
    Configuration(ValidationResult),

    #[error("connectivity check failed: {0}")]
    Connectivity(#[from] ProbeError),

    #[error("step '{step}' failed: {source}")]
    Provisioning {
        step: String,
        #[source]
        source: ProvisionError,
    },

    #[error(transparent)]
    Retry(#[from] RetryError),

    #[error("step '{step}' timed out after {}s", .timeout.as_secs())]
    StepTimeout { step: String, timeout: Duration },

    #[error("invalid validation pattern: {0}")]
    Pattern(#[from] regex::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl ForwarderError {
    pub fn provisioning(step: impl Into<String>, source: ProvisionError) -> Self {
        ForwarderError::Provisioning {
            step: step.into(),
            source,
        }
    }

    /// Raw diagnostic output attached to the failure, if any.
    pub fn diagnostic_output(&self) -> Option<&str> {
        match self {
            ForwarderError::Retry(err) => Some(err.last_output()),
            ForwarderError::Provisioning {
                source: ProvisionError::CommandFailed { output, .. },
                ..
            } => Some(output.as_str()),
            ForwarderError::Connectivity(
                ProbeError::TokenRejected { body, .. }
                | ProbeError::MissingPermission { body, .. }
                | ProbeError::IngestRejected { body, .. },
            ) => Some(body.as_str()),
            _ => None,
        }
    }
}

/// Result type for deployer operations.
pub type Result<T> = std::result::Result<T, ForwarderError>;
