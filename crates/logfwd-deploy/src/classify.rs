//! Failure classification for retried operations.
//!
//! Every remote failure is retried up to the policy's cap. The 504
//! signature only changes how an attempt is reported: the zip upload may
//! still complete server-side.

use logfwd_core::FailureKind;
use regex::Regex;

/// Signature of an HTTP 504 in a deployment log. A bare `504` is not
/// enough; it has to appear as a status or next to "gateway".
pub const GATEWAY_TIMEOUT_SIGNATURE: &str =
    r"(?i)status( code)?:?\s*'?504\b|\b504 gateway|gateway[\s-]?time-?out";

/// Labels command output and HTTP statuses with a [`FailureKind`].
#[derive(Debug, Clone)]
pub struct FailureClassifier {
    gateway_timeout: Regex,
}

impl FailureClassifier {
    pub fn new() -> Result<Self, regex::Error> {
        Ok(Self {
            gateway_timeout: Regex::new(GATEWAY_TIMEOUT_SIGNATURE)?,
        })
    }

    /// Classify the output of a failed command.
    pub fn classify_output(&self, output: &str) -> FailureKind {
        if self.gateway_timeout.is_match(output) {
            FailureKind::GatewayTimeout
        } else {
            FailureKind::Transient
        }
    }

    /// Classify an HTTP status from the package host.
    pub fn classify_status(&self, status: u16) -> FailureKind {
        match status {
            504 => FailureKind::GatewayTimeout,
            _ => FailureKind::Transient,
        }
    }
}
