//! Timeouts and bounded retries for daemon calls.

use std::future::Future;
use std::time::Duration;

use log::{debug, warn};

use crate::config::RuntimeSettings;
use crate::runtime::{RuntimeError, RuntimeResult};

/// How daemon calls are bounded and retried.
#[derive(Debug, Clone, Copy)]
pub struct DaemonPolicy {
    /// Upper bound for a single call.
    pub call_timeout: Duration,
    /// Total attempts for transient failures (1 = no retry).
    pub attempts: u32,
    /// Delay before the second attempt; doubled for each further attempt.
    pub base_delay: Duration,
}

impl Default for DaemonPolicy {
    fn default() -> Self {
        Self {
            call_timeout: Duration::from_secs(30),
            attempts: 3,
            base_delay: Duration::from_millis(200),
        }
    }
}

impl From<&RuntimeSettings> for DaemonPolicy {
    fn from(settings: &RuntimeSettings) -> Self {
        Self {
            call_timeout: Duration::from_secs(settings.call_timeout_secs.max(1)),
            attempts: settings.retry_attempts.max(1),
            base_delay: Duration::from_millis(settings.retry_base_delay_ms),
        }
    }
}

impl DaemonPolicy {
    /// Run a single daemon call under the call timeout, without retries.
    pub async fn once<T, Fut>(&self, command: &str, fut: Fut) -> RuntimeResult<T>
    where
        Fut: Future<Output = RuntimeResult<T>>,
    {
        match tokio::time::timeout(self.call_timeout, fut).await {
            Ok(result) => result,
            Err(_) => Err(RuntimeError::Timeout {
                command: command.to_string(),
                after: self.call_timeout,
            }),
        }
    }

    /// Backoff before the next attempt after attempt number `attempt`
    /// (1-based) failed with `err`; `None` when the failure is final.
    ///
    /// Callers that hold a lock across a single attempt use this to release
    /// it while waiting.
    pub fn retry_delay(
        &self,
        command: &str,
        attempt: u32,
        err: &RuntimeError,
    ) -> Option<Duration> {
        if !err.is_transient() {
            return None;
        }
        if attempt >= self.attempts {
            debug!(
                "container runtime {} still failing after {} attempts",
                command, attempt
            );
            return None;
        }
        let backoff = self.base_delay * 2u32.saturating_pow(attempt - 1);
        warn!(
            "container runtime {} failed (attempt {}/{}), retrying in {:?}: {}",
            command, attempt, self.attempts, backoff, err
        );
        Some(backoff)
    }

    /// Run a daemon call, retrying transient failures with exponential backoff.
    ///
    /// Non-transient failures are returned immediately.
    pub async fn call<T, F, Fut>(&self, command: &str, mut f: F) -> RuntimeResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = RuntimeResult<T>>,
    {
        let mut attempt: u32 = 0;
        loop {
            attempt += 1;
            match self.once(command, f()).await {
                Ok(value) => return Ok(value),
                Err(err) => match self.retry_delay(command, attempt, &err) {
                    Some(backoff) => tokio::time::sleep(backoff).await,
                    None => return Err(err),
                },
            }
        }
    }
}
