//! Error types for logfwd-deploy

use logfwd_core::ProvisionError;
use thiserror::Error;

/// Errors raised while issuing `az` commands or fetching the package.
#[derive(Error, Debug)]
pub enum DeployError {
    /// Command had no arguments
    #[error("command {0} has no arguments")]
    EmptyCommand(String),

    /// The `az` executable could not be started
    #[error("failed to start {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    /// Command ran past its timeout and was killed
    #[error("{name} timed out after {timeout_secs} seconds")]
    Timeout { name: String, timeout_secs: u64 },

    /// Command exited non-zero
    #[error("{name} exited with code {exit_code}")]
    CommandFailed {
        name: String,
        exit_code: i32,
        output: String,
    },

    /// Command output lacked an expected field
    #[error("{name} output has no '{field}'")]
    MissingField { name: String, field: String },

    /// HTTP error while downloading
    #[error("HTTP error: {0}")]
    Http(String),

    /// Invalid failure signature pattern
    #[error("invalid pattern: {0}")]
    Pattern(#[from] regex::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON parsing error
    #[error("JSON parsing error: {0}")]
    Json(#[from] serde_json::Error),
}

impl From<reqwest::Error> for DeployError {
    fn from(err: reqwest::Error) -> Self {
        DeployError::Http(err.to_string())
    }
}

impl DeployError {
    /// Captured command output, if any.
    pub fn output(&self) -> &str {
        match self {
            DeployError::CommandFailed { output, .. } => output,
            _ => "",
        }
    }
}

impl From<DeployError> for ProvisionError {
    fn from(err: DeployError) -> Self {
        match err {
            DeployError::CommandFailed {
                name,
                exit_code,
                output,
            } => ProvisionError::CommandFailed {
                operation: name,
                message: format!("exit code {exit_code}"),
                output,
            },
            DeployError::MissingField { name, field } => ProvisionError::UnexpectedOutput {
                operation: name,
                message: format!("missing '{field}'"),
            },
            DeployError::Json(e) => ProvisionError::UnexpectedOutput {
                operation: "az".to_string(),
                message: e.to_string(),
            },
            other => ProvisionError::CommandFailed {
                operation: "az".to_string(),
                message: other.to_string(),
                output: String::new(),
            },
        }
    }
}

/// Result type for deploy operations
pub type Result<T> = std::result::Result<T, DeployError>;
