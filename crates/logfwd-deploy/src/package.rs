//! Forwarder code package download.

use std::path::{Path, PathBuf};
use std::time::Duration;

use logfwd_core::{AttemptError, FailureKind, PackageArtifact};
use sha2::{Digest, Sha256};
use tracing::{info, warn};

use crate::classify::FailureClassifier;
use crate::error::Result;

/// File name the package is stored under.
pub const PACKAGE_FILE_NAME: &str = "dynatrace-azure-log-forwarder.zip";

/// Timeout for one download attempt.
pub const DOWNLOAD_TIMEOUT: Duration = Duration::from_secs(5 * 60);

const ZIP_MAGIC: &[u8] = b"PK\x03\x04";

/// Downloads the package into a working directory.
pub struct PackageDownloader {
    client: reqwest::Client,
    dir: PathBuf,
    classifier: FailureClassifier,
}

impl PackageDownloader {
    pub fn new(dir: impl Into<PathBuf>, classifier: FailureClassifier) -> Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(concat!("logfwd-deploy/", env!("CARGO_PKG_VERSION")))
            .timeout(DOWNLOAD_TIMEOUT)
            .build()?;
        Ok(Self {
            client,
            dir: dir.into(),
            classifier,
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Path the package lands at.
    pub fn target_path(&self) -> PathBuf {
        self.dir.join(PACKAGE_FILE_NAME)
    }

    /// One download attempt.
    pub async fn download(
        &self,
        url: &str,
        attempt: u32,
    ) -> std::result::Result<PackageArtifact, AttemptError> {
        info!(url, attempt, "Downloading forwarder package");

        // Only a request that cannot even be built is final; anything the
        // remote side answers gets another attempt.
        let response = self.client.get(url).send().await.map_err(|e| {
            let kind = if e.is_builder() {
                FailureKind::Terminal
            } else {
                FailureKind::Transient
            };
            AttemptError::new(kind, format!("request to {url} failed"), e.to_string())
        })?;

        let status = response.status().as_u16();
        if !response.status().is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(AttemptError::new(
                self.classifier.classify_status(status),
                format!("package host answered {status}"),
                body,
            ));
        }

        let bytes = response
            .bytes()
            .await
            .map_err(|e| AttemptError::transient("reading package body failed", e.to_string()))?;

        if !bytes.starts_with(ZIP_MAGIC) {
            warn!(url, size = bytes.len(), "Downloaded file is not a zip archive");
            return Err(AttemptError::transient(
                "downloaded file is not a zip archive",
                String::from_utf8_lossy(&bytes[..bytes.len().min(512)]).to_string(),
            ));
        }

        let path = self.target_path();
        tokio::fs::write(&path, &bytes)
            .await
            .map_err(|e| AttemptError::transient("writing package failed", e.to_string()))?;

        let artifact = PackageArtifact {
            path,
            size_bytes: bytes.len() as u64,
            sha256: sha256_hex(&bytes),
        };
        info!(
            path = %artifact.path.display(),
            bytes = artifact.size_bytes,
            sha256 = %artifact.sha256,
            "Package stored"
        );
        Ok(artifact)
    }
}

/// Hex SHA-256 of `bytes`.
pub fn sha256_hex(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}
