//! HTTP transport used by the prober.
//!
//! The prober only needs two verbs and the response status/body, so the
//! transport is a narrow trait. [`ReqwestTransport`] is the production
//! implementation; tests script their own.

use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tracing::debug;

use crate::error::TransportError;

/// Connect timeout applied to every probe request.
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(20);

/// Total timeout applied to every probe request.
pub const TOTAL_TIMEOUT: Duration = Duration::from_secs(30);

/// Status and body of a completed request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpResponse {
    pub status: u16,
    pub body: String,
}

impl HttpResponse {
    pub fn new(status: u16, body: impl Into<String>) -> Self {
        Self {
            status,
            body: body.into(),
        }
    }

    /// Statuses of 300 and above are treated as rejections.
    pub fn is_accepted(&self) -> bool {
        self.status < 300
    }
}

/// Minimal HTTP client contract for probes.
#[async_trait]
pub trait HttpTransport: Send + Sync {
    /// `GET url`, optionally authenticated with an API token.
    async fn get(&self, url: &str, token: Option<&str>) -> Result<HttpResponse, TransportError>;

    /// `POST url` with a JSON body, optionally authenticated with an API token.
    async fn post_json(
        &self,
        url: &str,
        token: Option<&str>,
        body: &Value,
    ) -> Result<HttpResponse, TransportError>;
}

#[async_trait]
impl<T: HttpTransport + ?Sized> HttpTransport for std::sync::Arc<T> {
    async fn get(&self, url: &str, token: Option<&str>) -> Result<HttpResponse, TransportError> {
        (**self).get(url, token).await
    }

    async fn post_json(
        &self,
        url: &str,
        token: Option<&str>,
        body: &Value,
    ) -> Result<HttpResponse, TransportError> {
        (**self).post_json(url, token, body).await
    }
}

/// Transport settings.
#[derive(Debug, Clone)]
pub struct TransportConfig {
    pub connect_timeout: Duration,
    pub total_timeout: Duration,
    /// When false, self-signed ActiveGate certificates are accepted.
    pub require_valid_certificate: bool,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            connect_timeout: CONNECT_TIMEOUT,
            total_timeout: TOTAL_TIMEOUT,
            require_valid_certificate: true,
        }
    }
}

/// reqwest-backed transport.
pub struct ReqwestTransport {
    client: reqwest::Client,
}

impl ReqwestTransport {
    pub fn new(config: &TransportConfig) -> Result<Self, TransportError> {
        let client = reqwest::Client::builder()
            .user_agent(concat!("logfwd-probe/", env!("CARGO_PKG_VERSION")))
            .connect_timeout(config.connect_timeout)
            .timeout(config.total_timeout)
            .danger_accept_invalid_certs(!config.require_valid_certificate)
            .build()?;

        Ok(Self { client })
    }

    async fn finish(request: reqwest::RequestBuilder) -> Result<HttpResponse, TransportError> {
        let response = request.send().await?;
        let status = response.status().as_u16();
        let body = response.text().await?;
        debug!(status, "probe response received");
        Ok(HttpResponse { status, body })
    }
}

fn authorize(request: reqwest::RequestBuilder, token: Option<&str>) -> reqwest::RequestBuilder {
    match token {
        Some(token) => request.header(reqwest::header::AUTHORIZATION, format!("Api-Token {token}")),
        None => request,
    }
}

#[async_trait]
impl HttpTransport for ReqwestTransport {
    async fn get(&self, url: &str, token: Option<&str>) -> Result<HttpResponse, TransportError> {
        let request = authorize(self.client.get(url), token);
        Self::finish(request).await
    }

    async fn post_json(
        &self,
        url: &str,
        token: Option<&str>,
        body: &Value,
    ) -> Result<HttpResponse, TransportError> {
        let request = authorize(self.client.post(url), token).json(body);
        Self::finish(request).await
    }
}
