//! Bounded retry with fixed backoff.
//!
//! An action reports each failure with a [`FailureKind`]. Remote failures,
//! whatever their cause, are retried until the policy's attempt cap; only a
//! local failure that no later attempt can change stops the loop at once.
//! When the loop gives up, the last attempt's captured output is logged in
//! full and carried in the returned [`RetryError`].

use std::future::Future;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};

/// Attempts used for package download and deployment.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

/// Pause between attempts.
pub const DEFAULT_RETRY_DELAY: Duration = Duration::from_secs(10);

/// Wait before the first deployment attempt so a new Function App can start.
pub const DEPLOY_WARMUP: Duration = Duration::from_secs(180);

/// Why an attempt failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// Any remote failure: network errors, error statuses, non-zero exits.
    Transient,
    /// The upstream answered 504; the operation may still be in flight.
    /// Retried like `Transient`, logged differently.
    GatewayTimeout,
    /// A local input no attempt can change, such as a malformed URL or a
    /// missing executable.
    Terminal,
}

impl FailureKind {
    pub fn is_retryable(&self) -> bool {
        !matches!(self, FailureKind::Terminal)
    }
}

/// Failure returned by one attempt of an action.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{message}")]
pub struct AttemptError {
    pub kind: FailureKind,
    pub message: String,
    /// Raw diagnostic output: command log, response body.
    pub output: String,
}

impl AttemptError {
    pub fn new(kind: FailureKind, message: impl Into<String>, output: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            output: output.into(),
        }
    }

    pub fn transient(message: impl Into<String>, output: impl Into<String>) -> Self {
        Self::new(FailureKind::Transient, message, output)
    }

    pub fn gateway_timeout(message: impl Into<String>, output: impl Into<String>) -> Self {
        Self::new(FailureKind::GatewayTimeout, message, output)
    }

    pub fn terminal(message: impl Into<String>, output: impl Into<String>) -> Self {
        Self::new(FailureKind::Terminal, message, output)
    }
}

/// Outcome of a single attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttemptOutcome {
    Success,
    TransientFailure,
    TerminalFailure,
}

/// Record of one attempt, in sequence order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attempt {
    pub seq: u32,
    pub outcome: AttemptOutcome,
    pub failure: Option<FailureKind>,
    pub output: String,
}

impl Attempt {
    fn success(seq: u32) -> Self {
        Self {
            seq,
            outcome: AttemptOutcome::Success,
            failure: None,
            output: String::new(),
        }
    }

    fn failed(seq: u32, err: &AttemptError) -> Self {
        let outcome = if err.kind.is_retryable() {
            AttemptOutcome::TransientFailure
        } else {
            AttemptOutcome::TerminalFailure
        };
        Self {
            seq,
            outcome,
            failure: Some(err.kind),
            output: err.output.clone(),
        }
    }
}

/// How often and how patiently to retry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub delay: Duration,
    /// One-time wait before the first attempt.
    pub warmup: Option<Duration>,
    /// Wall-clock cap on a single attempt. An attempt that runs past it
    /// counts as a transient failure.
    pub attempt_timeout: Option<Duration>,
}

impl RetryPolicy {
    /// `max_attempts` is clamped to at least one.
    pub fn new(max_attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            delay,
            warmup: None,
            attempt_timeout: None,
        }
    }

    pub fn with_warmup(mut self, warmup: Duration) -> Self {
        self.warmup = Some(warmup);
        self
    }

    pub fn with_attempt_timeout(mut self, timeout: Duration) -> Self {
        self.attempt_timeout = Some(timeout);
        self
    }

    /// Upper bound on the whole loop when every attempt hits its timeout.
    pub fn worst_case(&self) -> Option<Duration> {
        let attempt = self.attempt_timeout?;
        let attempts = self.max_attempts.max(1);
        Some(self.warmup.unwrap_or_default() + attempt * attempts + self.delay * (attempts - 1))
    }

    /// Code package download.
    pub fn package_download() -> Self {
        Self::new(DEFAULT_MAX_ATTEMPTS, DEFAULT_RETRY_DELAY)
    }

    /// Code package deployment onto a freshly created Function App.
    pub fn package_deploy() -> Self {
        Self::new(DEFAULT_MAX_ATTEMPTS, DEFAULT_RETRY_DELAY).with_warmup(DEPLOY_WARMUP)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_ATTEMPTS, DEFAULT_RETRY_DELAY)
    }
}

/// Successful result plus the attempt history.
#[derive(Debug, Clone)]
pub struct RetryReport<T> {
    pub value: T,
    pub attempts: Vec<Attempt>,
}

/// The retried operation did not succeed.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{operation} failed after {} attempt(s): {}", .attempts.len(), .last.message)]
pub struct RetryError {
    pub operation: String,
    pub attempts: Vec<Attempt>,
    pub last: AttemptError,
}

impl RetryError {
    /// Captured output of the final attempt.
    pub fn last_output(&self) -> &str {
        &self.last.output
    }

    /// Whether the loop stopped early on a terminal failure.
    pub fn is_terminal(&self) -> bool {
        self.last.kind == FailureKind::Terminal
    }
}

/// Runs actions under a [`RetryPolicy`].
#[derive(Debug, Clone, Default)]
pub struct RetryExecutor {
    policy: RetryPolicy,
}

impl RetryExecutor {
    pub fn new(policy: RetryPolicy) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Run `action` until it succeeds, fails terminally, or the attempt cap
    /// is reached. The action receives the 1-based attempt number.
    pub async fn run<T, F, Fut>(
        &self,
        operation: &str,
        mut action: F,
    ) -> Result<RetryReport<T>, RetryError>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, AttemptError>>,
    {
        if let Some(warmup) = self.policy.warmup {
            info!(
                operation,
                warmup_secs = warmup.as_secs(),
                "Waiting before first attempt"
            );
            tokio::time::sleep(warmup).await;
        }

        let max = self.policy.max_attempts.max(1);
        let mut attempts = Vec::with_capacity(max as usize);
        let mut seq = 0u32;

        loop {
            seq += 1;
            info!(operation, attempt = seq, max_attempts = max, "Starting attempt");

            let result = match self.policy.attempt_timeout {
                Some(limit) => match tokio::time::timeout(limit, action(seq)).await {
                    Ok(result) => result,
                    Err(_) => Err(AttemptError::transient(
                        format!("attempt timed out after {}s", limit.as_secs()),
                        format!(
                            "{operation} attempt {seq} produced no result within {}s",
                            limit.as_secs()
                        ),
                    )),
                },
                None => action(seq).await,
            };

            let err = match result {
                Ok(value) => {
                    attempts.push(Attempt::success(seq));
                    info!(operation, attempt = seq, "Attempt succeeded");
                    return Ok(RetryReport { value, attempts });
                }
                Err(err) => err,
            };

            attempts.push(Attempt::failed(seq, &err));

            match err.kind {
                FailureKind::Terminal => {
                    error!(
                        operation,
                        attempt = seq,
                        error = %err.message,
                        output = %err.output,
                        "Attempt failed on a local error; retrying cannot help"
                    );
                    return Err(RetryError {
                        operation: operation.to_string(),
                        attempts,
                        last: err,
                    });
                }
                FailureKind::GatewayTimeout => warn!(
                    operation,
                    attempt = seq,
                    "Gateway timeout reported; the operation may still complete, retrying"
                ),
                FailureKind::Transient => warn!(
                    operation,
                    attempt = seq,
                    error = %err.message,
                    "Attempt failed"
                ),
            }

            if seq >= max {
                error!(
                    operation,
                    attempts = seq,
                    output = %err.output,
                    "All attempts failed"
                );
                return Err(RetryError {
                    operation: operation.to_string(),
                    attempts,
                    last: err,
                });
            }

            tokio::time::sleep(self.policy.delay).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;
    use tokio::time::Instant;

    fn executor(max_attempts: u32) -> RetryExecutor {
        RetryExecutor::new(RetryPolicy::new(max_attempts, Duration::from_secs(10)))
    }

    #[test]
    fn test_policy_clamps_attempts() {
        assert_eq!(RetryPolicy::new(0, Duration::ZERO).max_attempts, 1);
    }

    #[test]
    fn test_standard_policies() {
        let download = RetryPolicy::package_download();
        assert_eq!(download.max_attempts, 3);
        assert_eq!(download.delay, Duration::from_secs(10));
        assert!(download.warmup.is_none());

        let deploy = RetryPolicy::package_deploy();
        assert_eq!(deploy.max_attempts, 3);
        assert_eq!(deploy.warmup, Some(Duration::from_secs(180)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_success_on_attempt_k_stops_there() {
        for k in 1..=3u32 {
            let calls = Arc::new(AtomicU32::new(0));
            let counter = calls.clone();
            let start = Instant::now();

            let report = executor(3)
                .run("download", move |attempt| {
                    let counter = counter.clone();
                    async move {
                        counter.fetch_add(1, Ordering::SeqCst);
                        if attempt < k {
                            Err(AttemptError::transient("network error", format!("try {attempt}")))
                        } else {
                            Ok(attempt)
                        }
                    }
                })
                .await
                .expect("should succeed");

            assert_eq!(report.value, k);
            assert_eq!(calls.load(Ordering::SeqCst), k);
            assert_eq!(report.attempts.len() as u32, k);
            assert_eq!(
                report.attempts.last().unwrap().outcome,
                AttemptOutcome::Success
            );
            assert_eq!(start.elapsed(), Duration::from_secs(10 * (k as u64 - 1)));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_always_failing_exhausts_attempts_with_last_output() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();

        let err = executor(3)
            .run("deploy", move |attempt| {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Err::<(), _>(AttemptError::transient(
                        "exit code 1",
                        format!("deployment log {attempt}"),
                    ))
                }
            })
            .await
            .unwrap_err();

        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(err.attempts.len(), 3);
        assert_eq!(err.last_output(), "deployment log 3");
        assert!(!err.is_terminal());
        assert!(err.to_string().contains("3 attempt(s)"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_gateway_timeout_keeps_retrying() {
        let err = executor(2)
            .run("deploy", |_| async {
                Err::<(), _>(AttemptError::gateway_timeout(
                    "504 from Kudu",
                    "Status Code: 504, Gateway Timeout",
                ))
            })
            .await
            .unwrap_err();

        assert_eq!(err.attempts.len(), 2);
        assert!(err
            .attempts
            .iter()
            .all(|a| a.outcome == AttemptOutcome::TransientFailure
                && a.failure == Some(FailureKind::GatewayTimeout)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_terminal_failure_stops_immediately() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let start = Instant::now();

        let err = executor(3)
            .run("deploy", move |_| {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Err::<(), _>(AttemptError::terminal("invalid package URL", "relative URL without a base"))
                }
            })
            .await
            .unwrap_err();

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(err.is_terminal());
        assert_eq!(err.attempts[0].outcome, AttemptOutcome::TerminalFailure);
        assert_eq!(start.elapsed(), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn test_warmup_runs_once_before_first_attempt() {
        let policy = RetryPolicy::new(2, Duration::from_secs(10)).with_warmup(DEPLOY_WARMUP);
        let start = Instant::now();

        let err = RetryExecutor::new(policy)
            .run("deploy", |_| async {
                Err::<(), _>(AttemptError::transient("failed", ""))
            })
            .await
            .unwrap_err();

        assert_eq!(err.attempts.len(), 2);
        assert_eq!(start.elapsed(), Duration::from_secs(180 + 10));
    }

    #[tokio::test(start_paused = true)]
    async fn test_hung_attempt_is_cut_and_retried() {
        let policy = RetryPolicy::new(3, Duration::from_secs(10))
            .with_attempt_timeout(Duration::from_secs(60));
        let start = Instant::now();

        let report = RetryExecutor::new(policy)
            .run("deploy", |attempt| async move {
                if attempt < 3 {
                    tokio::time::sleep(Duration::from_secs(3600)).await;
                }
                Ok::<_, AttemptError>(attempt)
            })
            .await
            .unwrap();

        assert_eq!(report.value, 3);
        assert_eq!(report.attempts[0].failure, Some(FailureKind::Transient));
        assert!(report.attempts[0].output.contains("attempt 1 produced no result within 60s"));
        assert_eq!(start.elapsed(), Duration::from_secs(60 + 10 + 60 + 10));
    }

    #[tokio::test(start_paused = true)]
    async fn test_every_attempt_hanging_still_reports_last_output() {
        let policy = RetryPolicy::new(3, Duration::from_secs(10))
            .with_warmup(DEPLOY_WARMUP)
            .with_attempt_timeout(Duration::from_secs(960));
        let budget = policy.worst_case().unwrap();
        let start = Instant::now();

        let err = RetryExecutor::new(policy)
            .run("deploy", |_| async {
                tokio::time::sleep(Duration::from_secs(7200)).await;
                Ok::<(), AttemptError>(())
            })
            .await
            .unwrap_err();

        assert_eq!(err.attempts.len(), 3);
        assert!(err.last_output().contains("attempt 3"));
        assert_eq!(start.elapsed(), budget);
    }

    #[test]
    fn test_worst_case_needs_attempt_timeout() {
        assert!(RetryPolicy::package_deploy().worst_case().is_none());
        let policy = RetryPolicy::package_deploy().with_attempt_timeout(Duration::from_secs(960));
        assert_eq!(policy.worst_case(), Some(Duration::from_secs(180 + 3 * 960 + 2 * 10)));
    }
}
