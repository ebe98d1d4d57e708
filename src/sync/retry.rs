//! Bounded retry with per-attempt timeouts and exponential backoff.
//!
//! This is the single retry/backoff mechanism in the crate: every remote
//! call site goes through [`RetryExecutor::run`] (or `run_with` when it
//! needs a custom predicate) and nothing else sleeps-and-loops on its own.
use std::future::Future;
use std::time::Duration;

use crate::error::SyncError;

/// Knobs for one retried operation.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Total attempts, including the first. Minimum 1.
    pub attempts: u32,
    /// Time box for a single attempt; expiry counts as an ordinary
    /// attempt failure.
    pub attempt_timeout: Duration,
    /// Sleep before the second attempt.
    pub initial_backoff: Duration,
    /// Ceiling for the grown backoff.
    pub max_backoff: Duration,
    /// Growth factor applied after each failed attempt.
    pub backoff_multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 2,
            attempt_timeout: Duration::from_secs(10),
            initial_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(5),
            backoff_multiplier: 2.0,
        }
    }
}

/// Final result of a retried operation.
#[derive(Debug)]
pub enum RetryOutcome<T> {
    Success(T),
    /// One recorded error per attempt made; the last entry is the error
    /// that ended the run. Never empty.
    Failure { attempt_errors: Vec<SyncError> },
}

impl<T> RetryOutcome<T> {
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success(_))
    }

    /// Collapse to a plain `Result`, keeping only the final error.
    pub fn into_result(self) -> Result<T, SyncError> {
        match self {
            Self::Success(value) => Ok(value),
            Self::Failure { mut attempt_errors } => Err(attempt_errors
                .pop()
                .unwrap_or(SyncError::Protocol("retry run recorded no error".into()))),
        }
    }
}

/// Runs operations under a [`RetryPolicy`].
#[derive(Debug, Clone)]
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

    /// Run with the default predicate: retry anything except
    /// cancellation.
    pub async fn run<T, F, Fut>(&self, op: F) -> RetryOutcome<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, SyncError>>,
    {
        self.run_with(op, |e| !e.is_cancelled(), |_, _| {}).await
    }

    /// Run with a custom retry predicate and a per-retry callback.
    ///
    /// `should_retry` is consulted after every failed non-final attempt;
    /// `on_retry(attempt, error)` fires just before the backoff sleep.
    pub async fn run_with<T, F, Fut>(
        &self,
        mut op: F,
        should_retry: impl Fn(&SyncError) -> bool,
        mut on_retry: impl FnMut(u32, &SyncError),
    ) -> RetryOutcome<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, SyncError>>,
    {
        let attempts = self.policy.attempts.max(1);
        let mut attempt_errors = Vec::new();
        let mut backoff = self.policy.initial_backoff;

        for attempt in 1..=attempts {
            let err = match tokio::time::timeout(self.policy.attempt_timeout, op()).await {
                Ok(Ok(value)) => return RetryOutcome::Success(value),
                Ok(Err(e)) => e,
                Err(_) => SyncError::Timeout(self.policy.attempt_timeout),
            };

            let will_retry = attempt < attempts && should_retry(&err);
            tracing::warn!(
                attempt = attempt,
                of = attempts,
                error = %err,
                will_retry = will_retry,
                "sync attempt failed"
            );

            if !will_retry {
                attempt_errors.push(err);
                return RetryOutcome::Failure { attempt_errors };
            }

            on_retry(attempt, &err);
            attempt_errors.push(err);
            tokio::time::sleep(backoff).await;
            backoff = grow_backoff(backoff, self.policy.backoff_multiplier, self.policy.max_backoff);
        }

        // Unreachable in practice: the final iteration always returns.
        RetryOutcome::Failure { attempt_errors }
    }
}

fn grow_backoff(current: Duration, multiplier: f64, max: Duration) -> Duration {
    current.mul_f64(multiplier.max(1.0)).min(max)
}

// ============================================================================
// Tests
// ============================================================================
