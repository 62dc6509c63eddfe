//! Error types for logfwd-probe

use thiserror::Error;

/// Hard failures raised by target probes.
///
/// Soft outcomes (an unhealthy or unreachable health endpoint) are not
/// errors; they are reported through [`crate::HealthStatus`].
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProbeError {
    /// Target URL could not be turned into an endpoint
    #[error("Invalid target URL: {0}")]
    InvalidTarget(String),

    /// Token lookup answered with a non-success status
    #[error("Token lookup rejected with HTTP {status}: {body}")]
    TokenRejected { status: u16, body: String },

    /// Token is valid but lacks a required scope
    #[error("Token is missing the '{scope}' permission")]
    MissingPermission { scope: String, body: String },

    /// Ingest endpoint refused the smoke-test record
    #[error("Log ingest rejected with HTTP {status}: {body}")]
    IngestRejected { status: u16, body: String },

    /// Request never produced a response
    #[error("Request to {url} failed: {message}")]
    Unreachable { url: String, message: String },

}

/// Transport-level failure, before any HTTP status is available.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{message}")]
pub struct TransportError {
    pub message: String,
    pub timed_out: bool,
}

impl TransportError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            timed_out: false,
        }
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            timed_out: true,
        }
    }

    /// Message for logs and reports, flagging timeouts.
    pub fn describe(&self) -> String {
        if self.timed_out {
            format!("timed out: {}", self.message)
        } else {
            self.message.clone()
        }
    }
}

impl From<reqwest::Error> for TransportError {
    fn from(err: reqwest::Error) -> Self {
        TransportError {
            timed_out: err.is_timeout(),
            message: err.to_string(),
        }
    }
}
