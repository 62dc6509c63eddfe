//! logfwd-probe: connectivity checks against a Dynatrace target
//!
//! Used by the deployer before anything is provisioned, to catch a wrong
//! URL or an under-scoped token early.
//!
//! - health check of an existing ActiveGate (warning only)
//! - API/PaaS token permission lookup (hard failure)
//! - log ingest smoke test (hard failure)

pub mod error;
pub mod prober;
pub mod transport;

pub use error::{ProbeError, TransportError};
pub use prober::{
    ingest_probe_record, ConnectivityProber, HealthStatus, TargetEndpoint, HEALTH_PATH,
    INSTALLER_DOWNLOAD_SCOPE, LOGS_INGEST_SCOPE, LOG_INGEST_PATH, TOKEN_LOOKUP_PATH,
};
pub use transport::{
    HttpResponse, HttpTransport, ReqwestTransport, TransportConfig, CONNECT_TIMEOUT,
    TOTAL_TIMEOUT,
};

/// Result type for probe operations
pub type Result<T> = std::result::Result<T, ProbeError>;
