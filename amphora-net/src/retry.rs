//! Bounded exponential-backoff executor.
//!
//! Network-mutating steps wrap their driver call in a [`Retrier`]. Transient
//! failures are retried with a capped exponential wait; definite failures
//! (see [`NetworkError::is_transient`]) end the loop at once. When the budget
//! runs out the caller either gets the last error back or, in passive mode,
//! an [`RetryOutcome::Abandoned`] after a best-effort cleanup action.

use std::future::Future;
use std::time::Duration;

use tracing::{debug, error, warn};

use crate::config::NetworkingConfig;
use crate::error::{NetworkError, Result};
use crate::step::StepContext;

/// How often and how patiently to retry.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub backoff_multiplier: f64,
    pub min_wait: Duration,
    pub max_wait: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&NetworkingConfig::default())
    }
}

impl RetryPolicy {
    pub fn from_config(config: &NetworkingConfig) -> Self {
        Self {
            max_attempts: config.max_retries,
            backoff_multiplier: config.retry_backoff,
            min_wait: config.retry_interval(),
            max_wait: config.retry_max(),
        }
    }

    /// Wait after the given failed attempt (1-based):
    /// `multiplier * 2^(attempt - 1)` seconds, clamped to `[min_wait, max_wait]`.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(63) as i32;
        let secs = self.backoff_multiplier * 2f64.powi(exp);
        let wait = if secs.is_finite() && secs > 0.0 {
            Duration::try_from_secs_f64(secs).unwrap_or(self.max_wait)
        } else {
            Duration::ZERO
        };
        wait.clamp(self.min_wait, self.max_wait.max(self.min_wait))
    }

    fn attempts(&self) -> u32 {
        self.max_attempts.max(1)
    }
}

/// Result of a passive-failure run.
#[derive(Debug)]
pub enum RetryOutcome<T> {
    Completed(T),
    /// The budget ran out; the resource was left behind. Carries the last
    /// error for reporting.
    Abandoned(NetworkError),
}

impl<T> RetryOutcome<T> {
    pub fn is_abandoned(&self) -> bool {
        matches!(self, RetryOutcome::Abandoned(_))
    }
}

enum Failure {
    /// Every attempt failed with a transient error.
    Exhausted(NetworkError),
    /// A definite error, or the wait itself was cut short.
    Fatal(NetworkError),
}

/// Executes an operation under a [`RetryPolicy`].
#[derive(Debug, Clone, Default)]
pub struct Retrier {
    policy: RetryPolicy,
}

impl Retrier {
    pub fn new(policy: RetryPolicy) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    async fn attempt<T, F, Fut>(
        &self,
        ctx: &StepContext,
        what: &str,
        mut op: F,
    ) -> std::result::Result<T, Failure>
    where
        F: FnMut(u32) -> Fut + Send,
        Fut: Future<Output = Result<T>> + Send,
        T: Send,
    {
        let max = self.policy.attempts();
        let mut attempt = 1;
        loop {
            ctx.report_progress(attempt as f32 / max as f32);
            match op(attempt).await {
                Ok(value) => {
                    if attempt > 1 {
                        debug!("{} succeeded on attempt {}/{}", what, attempt, max);
                    }
                    return Ok(value);
                }
                Err(e) if !e.is_transient() => return Err(Failure::Fatal(e)),
                Err(e) if attempt >= max => return Err(Failure::Exhausted(e)),
                Err(e) => {
                    let wait = self.policy.backoff(attempt);
                    warn!(
                        "{} failed on attempt {}/{}, retrying in {:?}: {}",
                        what, attempt, max, wait, e
                    );
                    ctx.sleep(wait).await.map_err(Failure::Fatal)?;
                    attempt += 1;
                }
            }
        }
    }

    /// Retry `op` until it succeeds; the last error is returned once the
    /// budget is spent. `op` receives the 1-based attempt number.
    pub async fn run<T, F, Fut>(&self, ctx: &StepContext, what: &str, op: F) -> Result<T>
    where
        F: FnMut(u32) -> Fut + Send,
        Fut: Future<Output = Result<T>> + Send,
        T: Send,
    {
        match self.attempt(ctx, what, op).await {
            Ok(value) => Ok(value),
            Err(Failure::Exhausted(e)) => {
                error!(
                    "{} failed after {} attempts, not recoverable: {}",
                    what,
                    self.policy.attempts(),
                    e
                );
                Err(e)
            }
            Err(Failure::Fatal(e)) => Err(e),
        }
    }

    /// Like [`run`](Self::run), but an exhausted budget runs `abandon` (its
    /// failure is logged and swallowed) and reports
    /// [`RetryOutcome::Abandoned`] instead of failing.
    pub async fn run_passive<T, F, Fut, A, AFut>(
        &self,
        ctx: &StepContext,
        what: &str,
        op: F,
        abandon: A,
    ) -> Result<RetryOutcome<T>>
    where
        F: FnMut(u32) -> Fut + Send,
        Fut: Future<Output = Result<T>> + Send,
        T: Send,
        A: FnOnce() -> AFut + Send,
        AFut: Future<Output = Result<()>> + Send,
    {
        match self.attempt(ctx, what, op).await {
            Ok(value) => Ok(RetryOutcome::Completed(value)),
            Err(Failure::Exhausted(e)) => {
                warn!(
                    "{} failed after {} attempts, abandoning the resource: {}",
                    what,
                    self.policy.attempts(),
                    e
                );
                if let Err(cleanup) = abandon().await {
                    warn!("Cleanup of abandoned {} failed: {}", what, cleanup);
                }
                Ok(RetryOutcome::Abandoned(e))
            }
            Err(Failure::Fatal(e)) => Err(e),
        }
    }
}
