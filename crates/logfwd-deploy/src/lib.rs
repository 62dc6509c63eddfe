//! logfwd-deploy: Azure CLI provisioning for the log forwarder
//!
//! Implements [`logfwd_core::Provisioner`] by shelling out to `az`, one
//! command per resource, each with its own timeout. A dry-run mode records
//! the commands without executing them.

pub mod azcli;
pub mod classify;
pub mod command;
pub mod error;
pub mod package;
pub mod runner;

pub use azcli::{AzCliProvisioner, ExecutionMode};
pub use classify::{FailureClassifier, GATEWAY_TIMEOUT_SIGNATURE};
pub use command::{AzCommand, DEFAULT_COMMAND_TIMEOUT_SECS, ZIP_DEPLOY_TIMEOUT_SECS};
pub use error::{DeployError, Result};
pub use package::{sha256_hex, PackageDownloader, PACKAGE_FILE_NAME};
pub use runner::{CommandOutput, CommandRunner};
