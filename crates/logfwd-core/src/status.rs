//! Success markers for the hosting deployment script.

use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};

use tracing::debug;

use crate::error::Result;

/// Phase that completed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusMarker {
    Validation,
    Deployment,
}

impl StatusMarker {
    pub fn line(&self) -> &'static str {
        match self {
            StatusMarker::Validation => "VALIDATION_STATUS=SUCCESS",
            StatusMarker::Deployment => "DEPLOYMENT_STATUS=SUCCESS",
        }
    }
}

/// Append-only status file.
#[derive(Debug, Clone)]
pub struct StatusFile {
    path: PathBuf,
}

impl StatusFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn write(&self, marker: StatusMarker) -> Result<()> {
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        writeln!(file, "{}", marker.line())?;
        debug!(path = %self.path.display(), marker = marker.line(), "status marker written");
        Ok(())
    }
}
