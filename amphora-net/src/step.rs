//! Saga step contract consumed by an external orchestrator.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::error::{NetworkError, Result};

type ProgressFn = Arc<dyn Fn(f32) + Send + Sync>;

/// Per-invocation context handed to a step by the orchestrator.
///
/// Carries the progress callback and bounds every wait a step performs:
/// sleeps end early with [`NetworkError::Cancelled`] when the token fires
/// and with [`NetworkError::TimedOut`] once the deadline would be crossed.
#[derive(Clone, Default)]
pub struct StepContext {
    progress: Option<ProgressFn>,
    cancel: CancellationToken,
    deadline: Option<(Instant, Duration)>,
}

impl fmt::Debug for StepContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StepContext")
            .field("progress", &self.progress.is_some())
            .field("cancelled", &self.cancel.is_cancelled())
            .field("deadline", &self.deadline)
            .finish()
    }
}

impl StepContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_progress<F>(mut self, progress: F) -> Self
    where
        F: Fn(f32) + Send + Sync + 'static,
    {
        self.progress = Some(Arc::new(progress));
        self
    }

    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    /// Bound the total time this context may spend waiting.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.deadline = Some((Instant::now() + timeout, timeout));
        self
    }

    pub fn report_progress(&self, fraction: f32) {
        if let Some(progress) = &self.progress {
            progress(fraction);
        }
    }

    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Sleep for `duration` unless cancelled or past the deadline.
    pub async fn sleep(&self, duration: Duration) -> Result<()> {
        if self.cancel.is_cancelled() {
            return Err(NetworkError::Cancelled);
        }
        let wake = Instant::now() + duration;
        let (until, expired) = match self.deadline {
            Some((deadline, timeout)) if wake > deadline => (deadline, Some(timeout)),
            _ => (wake, None),
        };

        tokio::select! {
            _ = self.cancel.cancelled() => Err(NetworkError::Cancelled),
            _ = tokio::time::sleep_until(until) => match expired {
                Some(timeout) => Err(NetworkError::TimedOut(timeout)),
                None => Ok(()),
            },
        }
    }
}

/// A unit of work with a compensating action.
///
/// `revert` runs only after `execute` succeeded and a later step of the same
/// flow failed. It receives the output of the paired `execute` call and must
/// not fail: errors are logged and swallowed inside.
#[async_trait]
pub trait Step: Send + Sync {
    type Input: Send + Sync;
    type Output: Send + Sync;

    /// Stable name used in logs.
    fn name(&self) -> &'static str;

    async fn execute(&self, ctx: &StepContext, input: &Self::Input) -> Result<Self::Output>;

    async fn revert(&self, _ctx: &StepContext, _input: &Self::Input, _output: &Self::Output) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[tokio::test(start_paused = true)]
    async fn test_sleep_completes() {
        let ctx = StepContext::new();
        let start = Instant::now();
        ctx.sleep(Duration::from_secs(3)).await.unwrap();
        assert!(start.elapsed() >= Duration::from_secs(3));
    }

    #[tokio::test(start_paused = true)]
    async fn test_sleep_cancelled() {
        let token = CancellationToken::new();
        let ctx = StepContext::new().with_cancellation(token.clone());

        let waiter = tokio::spawn(async move { ctx.sleep(Duration::from_secs(60)).await });
        tokio::time::sleep(Duration::from_secs(1)).await;
        token.cancel();

        let res = waiter.await.unwrap();
        assert!(matches!(res, Err(NetworkError::Cancelled)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_sleep_past_deadline() {
        let ctx = StepContext::new().with_timeout(Duration::from_secs(5));
        ctx.sleep(Duration::from_secs(2)).await.unwrap();

        let start = Instant::now();
        let res = ctx.sleep(Duration::from_secs(10)).await;
        assert!(matches!(res, Err(NetworkError::TimedOut(t)) if t == Duration::from_secs(5)));
        assert!(start.elapsed() <= Duration::from_secs(3));
    }

    #[test]
    fn test_progress_callback() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let ctx = StepContext::new().with_progress(move |p| sink.lock().unwrap().push(p));

        ctx.report_progress(0.5);
        ctx.report_progress(1.0);
        assert_eq!(*seen.lock().unwrap(), vec![0.5, 1.0]);
    }
}
