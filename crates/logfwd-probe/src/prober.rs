//! Connectivity prober for the Dynatrace target.
//!
//! Three one-shot checks, none of them retried:
//! - health of an existing ActiveGate (soft: warnings only)
//! - token permission lookup (hard)
//! - log ingest smoke test (hard)

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{info, warn};

use crate::error::ProbeError;
use crate::transport::HttpTransport;
use crate::Result;

pub const HEALTH_PATH: &str = "/rest/health";
pub const TOKEN_LOOKUP_PATH: &str = "/api/v2/apiTokens/lookup";
pub const LOG_INGEST_PATH: &str = "/api/v2/logs/ingest";

/// Scope an API token needs to push logs.
pub const LOGS_INGEST_SCOPE: &str = "logs.ingest";

/// Scope a PaaS token needs to pull the ActiveGate installer.
pub const INSTALLER_DOWNLOAD_SCOPE: &str = "InstallerDownload";

const HEALTHY_TOKEN: &str = "RUNNING";

/// Outcome of the health check. Never an error.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum HealthStatus {
    Ok,
    UnexpectedResponse { status: u16, body: String },
    Unreachable { reason: String },
}

impl HealthStatus {
    pub fn is_ok(&self) -> bool {
        matches!(self, HealthStatus::Ok)
    }
}

/// Normalized base URL of a Dynatrace environment or ActiveGate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TargetEndpoint {
    base: String,
}

impl TargetEndpoint {
    pub fn parse(url: &str) -> Result<Self> {
        let trimmed = url.trim();
        if !(trimmed.starts_with("https://") || trimmed.starts_with("http://")) {
            return Err(ProbeError::InvalidTarget(format!(
                "'{trimmed}' must start with http:// or https://"
            )));
        }
        let base = trimmed.trim_end_matches('/');
        if base.ends_with(':') || base.ends_with("//") {
            return Err(ProbeError::InvalidTarget(format!("'{trimmed}' has no host")));
        }
        Ok(Self {
            base: base.to_string(),
        })
    }

    pub fn as_str(&self) -> &str {
        &self.base
    }

    pub fn url(&self, path: &str) -> String {
        format!("{}{}", self.base, path)
    }
}

impl std::fmt::Display for TargetEndpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.base)
    }
}

/// Runs the probes against one endpoint.
pub struct ConnectivityProber<T: HttpTransport> {
    transport: T,
    endpoint: TargetEndpoint,
}

impl<T: HttpTransport> ConnectivityProber<T> {
    pub fn new(transport: T, endpoint: TargetEndpoint) -> Self {
        Self {
            transport,
            endpoint,
        }
    }

    /// Check the ActiveGate health endpoint.
    ///
    /// The endpoint may deliberately deny public access, so anything other
    /// than `RUNNING` is logged as a warning and returned, never raised.
    pub async fn check_health(&self) -> HealthStatus {
        let url = self.endpoint.url(HEALTH_PATH);
        let status = match self.transport.get(&url, None).await {
            Ok(response) if response.is_accepted() && is_running(&response.body) => {
                HealthStatus::Ok
            }
            Ok(response) => HealthStatus::UnexpectedResponse {
                status: response.status,
                body: response.body,
            },
            Err(err) => HealthStatus::Unreachable {
                reason: err.describe(),
            },
        };

        match &status {
            HealthStatus::Ok => info!(url = %url, "ActiveGate health check passed"),
            HealthStatus::UnexpectedResponse { status, body } => warn!(
                url = %url,
                status,
                body = %body,
                "ActiveGate health check returned an unexpected response; public access may be restricted"
            ),
            HealthStatus::Unreachable { reason } => warn!(
                url = %url,
                reason = %reason,
                "ActiveGate is not reachable; public access may be restricted"
            ),
        }
        status
    }

    /// Look up `token` and require `scope` to be among its permissions.
    pub async fn check_token_scope(&self, token: &str, scope: &str) -> Result<()> {
        let url = self.endpoint.url(TOKEN_LOOKUP_PATH);
        let body = json!({ "token": token });
        let response = self
            .transport
            .post_json(&url, Some(token), &body)
            .await
            .map_err(|e| ProbeError::Unreachable {
                url: url.clone(),
                message: e.describe(),
            })?;

        if !response.is_accepted() {
            return Err(ProbeError::TokenRejected {
                status: response.status,
                body: response.body,
            });
        }

        if !response.body.contains(scope) {
            return Err(ProbeError::MissingPermission {
                scope: scope.to_string(),
                body: response.body,
            });
        }

        info!(url = %url, scope, "Token permission check passed");
        Ok(())
    }

    /// Push one synthetic record to the ingest endpoint.
    pub async fn send_ingest_probe(&self, token: &str) -> Result<()> {
        self.send_ingest_probe_at(token, Utc::now()).await
    }

    /// Same as [`Self::send_ingest_probe`] with a fixed timestamp.
    pub async fn send_ingest_probe_at(&self, token: &str, now: DateTime<Utc>) -> Result<()> {
        let url = self.endpoint.url(LOG_INGEST_PATH);
        let body = ingest_probe_record(now);
        let response = self
            .transport
            .post_json(&url, Some(token), &body)
            .await
            .map_err(|e| ProbeError::Unreachable {
                url: url.clone(),
                message: e.describe(),
            })?;

        if !response.is_accepted() {
            return Err(ProbeError::IngestRejected {
                status: response.status,
                body: response.body,
            });
        }

        info!(url = %url, status = response.status, "Log ingest smoke test passed");
        Ok(())
    }
}

fn is_running(body: &str) -> bool {
    let trimmed = body.trim();
    trimmed == HEALTHY_TOKEN || trimmed.trim_matches('"') == HEALTHY_TOKEN
}

/// Synthetic log record sent by the ingest smoke test.
pub fn ingest_probe_record(now: DateTime<Utc>) -> Value {
    json!([{
        "timestamp": now.to_rfc3339_opts(SecondsFormat::Millis, true),
        "cloud.provider": "azure",
        "content": "Connectivity check from the Azure log forwarder deployment",
        "severity": "INFO",
    }])
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_endpoint_strips_trailing_slash() {
        let endpoint = TargetEndpoint::parse("https://ag.example.com:9999/e/abc/").unwrap();
        assert_eq!(endpoint.as_str(), "https://ag.example.com:9999/e/abc");
        assert_eq!(
            endpoint.url(HEALTH_PATH),
            "https://ag.example.com:9999/e/abc/rest/health"
        );
    }

    #[test]
    fn test_endpoint_rejects_missing_scheme() {
        assert!(matches!(
            TargetEndpoint::parse("ag.example.com"),
            Err(ProbeError::InvalidTarget(_))
        ));
        assert!(TargetEndpoint::parse("https://").is_err());
    }

    #[test]
    fn test_running_token_plain_and_quoted() {
        assert!(is_running("RUNNING"));
        assert!(is_running("\"RUNNING\"\n"));
        assert!(!is_running("STARTING"));
        assert!(!is_running("NOT RUNNING"));
    }

    #[test]
    fn test_health_status_json_round_trip() {
        let statuses = [
            HealthStatus::Ok,
            HealthStatus::UnexpectedResponse {
                status: 503,
                body: "STARTING".to_string(),
            },
            HealthStatus::Unreachable {
                reason: "timed out: no response".to_string(),
            },
        ];
        for status in statuses {
            let json = serde_json::to_value(&status).unwrap();
            assert!(json.get("state").is_some(), "{json}");
            let back: HealthStatus = serde_json::from_value(json).unwrap();
            assert_eq!(back, status);
        }

        let json = serde_json::to_value(HealthStatus::UnexpectedResponse {
            status: 503,
            body: String::new(),
        })
        .unwrap();
        assert_eq!(json["state"], "unexpected_response");
        assert_eq!(json["status"], 503);
    }

    #[test]
    fn test_ingest_record_fields() {
        let now = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap();
        let record = ingest_probe_record(now);
        let entry = &record[0];
        assert_eq!(entry["cloud.provider"], "azure");
        assert_eq!(entry["severity"], "INFO");
        assert_eq!(entry["timestamp"], "2024-05-01T12:00:00.000Z");
        assert!(entry["content"].as_str().unwrap().contains("Connectivity"));
    }
}
