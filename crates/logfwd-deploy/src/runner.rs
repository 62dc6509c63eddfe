//! `az` subprocess execution.

use std::path::PathBuf;
use std::process::Stdio;
use std::time::{Duration, Instant};

use serde_json::Value;
use tokio::process::Command;
use tracing::{debug, info, warn};

use crate::command::AzCommand;
use crate::error::{DeployError, Result};

/// Result of one command execution.
#[derive(Debug, Clone)]
pub struct CommandOutput {
    /// Command name.
    pub name: String,

    /// Exit code (0 = success).
    pub exit_code: i32,

    /// Captured stdout.
    pub stdout: String,

    /// Captured stderr.
    pub stderr: String,

    /// Duration in milliseconds.
    pub duration_ms: u64,
}

impl CommandOutput {
    /// Whether the command exited with code 0.
    pub fn passed(&self) -> bool {
        self.exit_code == 0
    }

    /// stdout followed by stderr, for diagnostics.
    pub fn combined(&self) -> String {
        match (self.stdout.trim().is_empty(), self.stderr.trim().is_empty()) {
            (true, _) => self.stderr.clone(),
            (_, true) => self.stdout.clone(),
            _ => format!("{}\n{}", self.stdout, self.stderr),
        }
    }

    /// Parse stdout as JSON, failing with the captured output on non-zero exit.
    pub fn json(&self) -> Result<Value> {
        if !self.passed() {
            return Err(self.failure());
        }
        if self.stdout.trim().is_empty() {
            return Ok(Value::Null);
        }
        Ok(serde_json::from_str(&self.stdout)?)
    }

    pub fn failure(&self) -> DeployError {
        DeployError::CommandFailed {
            name: self.name.clone(),
            exit_code: self.exit_code,
            output: self.combined(),
        }
    }
}

/// Runs [`AzCommand`]s against an `az` executable.
#[derive(Debug, Clone)]
pub struct CommandRunner {
    program: PathBuf,
}

impl Default for CommandRunner {
    fn default() -> Self {
        Self::new("az")
    }
}

impl CommandRunner {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
        }
    }

    /// Execute `command`, killing it when its timeout elapses.
    ///
    /// A non-zero exit is not an error here; callers inspect the output.
    pub async fn execute(&self, command: &AzCommand) -> Result<CommandOutput> {
        if command.args.is_empty() {
            return Err(DeployError::EmptyCommand(command.name.clone()));
        }

        let start = Instant::now();
        info!(command = %command.name, line = %command.display(), "Running az command");

        let child = Command::new(&self.program)
            .args(&command.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| DeployError::Spawn {
                program: self.program.display().to_string(),
                source,
            })?;

        let output = if command.timeout_secs > 0 {
            tokio::time::timeout(
                Duration::from_secs(command.timeout_secs),
                child.wait_with_output(),
            )
            .await
            .map_err(|_| {
                warn!(command = %command.name, timeout_secs = command.timeout_secs, "az command timed out");
                DeployError::Timeout {
                    name: command.name.clone(),
                    timeout_secs: command.timeout_secs,
                }
            })??
        } else {
            child.wait_with_output().await?
        };

        let result = CommandOutput {
            name: command.name.clone(),
            exit_code: output.status.code().unwrap_or(-1),
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
            duration_ms: start.elapsed().as_millis() as u64,
        };
        debug!(
            command = %result.name,
            exit_code = result.exit_code,
            duration_ms = result.duration_ms,
            "az command finished"
        );
        Ok(result)
    }

    /// Execute and parse stdout as JSON.
    pub async fn execute_json(&self, command: &AzCommand) -> Result<Value> {
        self.execute(command).await?.json()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn output(exit_code: i32, stdout: &str, stderr: &str) -> CommandOutput {
        CommandOutput {
            name: "identity_create".to_string(),
            exit_code,
            stdout: stdout.to_string(),
            stderr: stderr.to_string(),
            duration_ms: 10,
        }
    }

    #[test]
    fn test_output_json_on_success() {
        let value = output(0, r#"{"id":"/ids/mi"}"#, "").json().unwrap();
        assert_eq!(value["id"], "/ids/mi");
        assert_eq!(output(0, "  \n", "").json().unwrap(), Value::Null);
    }

    #[test]
    fn test_output_json_on_failure_carries_stderr() {
        let err = output(1, "", "ERROR: AuthorizationFailed").json().unwrap_err();
        assert_eq!(err.output(), "ERROR: AuthorizationFailed");
    }

    #[test]
    fn test_combined_output() {
        assert_eq!(output(1, "out", "err").combined(), "out\nerr");
        assert_eq!(output(1, "out", "").combined(), "out");
    }

    #[tokio::test]
    async fn test_missing_program_is_spawn_error() {
        let runner = CommandRunner::new("/nonexistent/az-cli");
        let cmd = AzCommand::new("noop", vec!["version".to_string()]);
        let err = runner.execute(&cmd).await.unwrap_err();
        assert!(matches!(err, DeployError::Spawn { .. }));
    }

    #[tokio::test]
    async fn test_empty_command_rejected() {
        let runner = CommandRunner::default();
        let err = runner
            .execute(&AzCommand::new("empty", Vec::new()))
            .await
            .unwrap_err();
        assert!(matches!(err, DeployError::EmptyCommand(_)));
    }
}
