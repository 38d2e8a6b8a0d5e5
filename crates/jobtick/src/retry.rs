//! Retry policies and the context bridge handed to them.
//!
//! The scheduler only depends on the [`RetryPolicy`] trait; definitions
//! without a policy get a single attempt. [`BackoffRetry`] is a reference
//! implementation driven by a [`RetryStrategy`] delay calculator.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::future::BoxFuture;
use rand::Rng;
use tracing::debug;

use crate::definition::JobDefinition;
use crate::execution::JobExecution;
use crate::{JobError, JobResult};

/// One attempt of the user workload. Policies call this zero-argument
/// action one or more times and either succeed or re-surface the terminal
/// failure.
pub type RetryAction<'a> = &'a (dyn Fn() -> BoxFuture<'static, JobResult<()>> + Send + Sync);

/// What a policy gets to look at while it drives attempts: the current
/// execution and the definition it belongs to.
pub struct RetryContext {
    execution: Arc<JobExecution>,
    definition: Arc<dyn JobDefinition>,
}

impl RetryContext {
    pub(crate) fn new(execution: Arc<JobExecution>) -> Self {
        let definition = execution.definition().clone();
        Self {
            execution,
            definition,
        }
    }

    /// The execution currently being driven.
    pub fn execution(&self) -> &Arc<JobExecution> {
        &self.execution
    }

    /// The definition the execution belongs to.
    pub fn definition(&self) -> &Arc<dyn JobDefinition> {
        &self.definition
    }
}

/// Drives the attempts of one execution.
#[async_trait]
pub trait RetryPolicy: Send + Sync {
    async fn run(&self, ctx: &RetryContext, action: RetryAction<'_>) -> JobResult<()>;
}

/// Run `action` under `policy`, falling back to a single attempt when no
/// policy is configured.
pub(crate) async fn run_with_policy(
    policy: Option<Arc<dyn RetryPolicy>>,
    ctx: &RetryContext,
    action: RetryAction<'_>,
) -> JobResult<()> {
    match policy {
        Some(policy) => policy.run(ctx, action).await,
        None => NoRetry.run(ctx, action).await,
    }
}

/// Policy that makes exactly one attempt.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoRetry;

#[async_trait]
impl RetryPolicy for NoRetry {
    async fn run(&self, _ctx: &RetryContext, action: RetryAction<'_>) -> JobResult<()> {
        action().await
    }
}

/// Delay calculator for [`BackoffRetry`].
///
/// `max_attempts` counts total attempts, the first one included.
#[derive(Debug, Clone)]
pub enum RetryStrategy {
    /// Fixed delay between attempts
    Fixed { delay: Duration, max_attempts: u32 },
    /// Exponential backoff with optional ±25% jitter
    Exponential {
        initial_delay: Duration,
        multiplier: f64,
        max_delay: Duration,
        max_attempts: u32,
        jitter: bool,
    },
    /// Linearly growing delay
    Linear {
        initial_delay: Duration,
        increment: Duration,
        max_delay: Duration,
        max_attempts: u32,
    },
    /// Explicit delay table; its length bounds the retries
    Custom { delays: Vec<Duration> },
}

impl Default for RetryStrategy {
    fn default() -> Self {
        RetryStrategy::Exponential {
            initial_delay: Duration::from_secs(1),
            multiplier: 2.0,
            max_delay: Duration::from_secs(300),
            max_attempts: 3,
            jitter: true,
        }
    }
}

impl RetryStrategy {
    /// Delay to observe before making attempt number `attempt` (1-based),
    /// or `None` when the strategy is out of attempts.
    pub fn backoff(&self, attempt: u32) -> Option<Duration> {
        if attempt < 2 {
            return None;
        }
        let retry_index = attempt - 2;
        match self {
            RetryStrategy::Fixed {
                delay,
                max_attempts,
            } => (attempt <= *max_attempts).then_some(*delay),
            RetryStrategy::Exponential {
                initial_delay,
                multiplier,
                max_delay,
                max_attempts,
                jitter,
            } => {
                if attempt > *max_attempts {
                    return None;
                }
                let mut delay = initial_delay.as_secs_f64() * multiplier.powi(retry_index as i32);
                delay = delay.min(max_delay.as_secs_f64());
                if *jitter {
                    delay *= rand::thread_rng().gen_range(0.75..1.25);
                }
                Some(Duration::from_secs_f64(delay))
            }
            RetryStrategy::Linear {
                initial_delay,
                increment,
                max_delay,
                max_attempts,
            } => {
                if attempt > *max_attempts {
                    return None;
                }
                let delay = *initial_delay + *increment * retry_index;
                Some(delay.min(*max_delay))
            }
            RetryStrategy::Custom { delays } => delays.get(retry_index as usize).copied(),
        }
    }

    /// Total number of attempts this strategy allows.
    pub fn max_attempts(&self) -> u32 {
        match self {
            RetryStrategy::Fixed { max_attempts, .. }
            | RetryStrategy::Exponential { max_attempts, .. }
            | RetryStrategy::Linear { max_attempts, .. } => *max_attempts,
            RetryStrategy::Custom { delays } => delays.len() as u32 + 1,
        }
    }
}

/// Policy that retries failed attempts per a [`RetryStrategy`], honoring
/// cancellation while it waits between attempts.
#[derive(Debug, Clone)]
pub struct BackoffRetry {
    strategy: RetryStrategy,
}

impl BackoffRetry {
    pub fn new(strategy: RetryStrategy) -> Self {
        Self { strategy }
    }

    /// Fixed-delay policy allowing `max_attempts` total attempts.
    pub fn attempts(max_attempts: u32, delay: Duration) -> Self {
        Self::new(RetryStrategy::Fixed {
            delay,
            max_attempts,
        })
    }
}

#[async_trait]
impl RetryPolicy for BackoffRetry {
    async fn run(&self, ctx: &RetryContext, action: RetryAction<'_>) -> JobResult<()> {
        let cancel = ctx.execution().cancellation_token();
        let mut attempt = 1u32;
        loop {
            match action().await {
                Ok(()) => return Ok(()),
                Err(error) => {
                    attempt += 1;
                    let Some(delay) = self.strategy.backoff(attempt) else {
                        return Err(error);
                    };
                    debug!(
                        job = ctx.definition().id(),
                        attempt, "attempt failed ({}), retrying in {:?}", error, delay
                    );
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = cancel.cancelled() => return Err(JobError::Cancelled),
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::definition::ActionJob;
    use chrono::Utc;
    use std::sync::atomic::{AtomicU32, Ordering};
    use tokio_util::sync::CancellationToken;

    fn context() -> RetryContext {
        let definition: Arc<dyn JobDefinition> =
            Arc::new(ActionJob::new("ctx", "Context", |_, _, _| async { Ok(()) }));
        let execution = JobExecution::new(definition, Utc::now(), CancellationToken::new());
        RetryContext::new(execution)
    }

    #[test]
    fn fixed_strategy_bounds_total_attempts() {
        let strategy = RetryStrategy::Fixed {
            delay: Duration::from_millis(10),
            max_attempts: 3,
        };
        assert_eq!(strategy.backoff(2), Some(Duration::from_millis(10)));
        assert_eq!(strategy.backoff(3), Some(Duration::from_millis(10)));
        assert_eq!(strategy.backoff(4), None);
        assert_eq!(strategy.max_attempts(), 3);
    }

    #[test]
    fn exponential_strategy_doubles_and_caps() {
        let strategy = RetryStrategy::Exponential {
            initial_delay: Duration::from_secs(1),
            multiplier: 2.0,
            max_delay: Duration::from_secs(3),
            max_attempts: 5,
            jitter: false,
        };
        assert_eq!(strategy.backoff(2), Some(Duration::from_secs(1)));
        assert_eq!(strategy.backoff(3), Some(Duration::from_secs(2)));
        assert_eq!(strategy.backoff(4), Some(Duration::from_secs(3)));
        assert_eq!(strategy.backoff(5), Some(Duration::from_secs(3)));
        assert_eq!(strategy.backoff(6), None);
    }

    #[test]
    fn linear_strategy_grows_by_the_increment() {
        let strategy = RetryStrategy::Linear {
            initial_delay: Duration::from_secs(5),
            increment: Duration::from_secs(10),
            max_delay: Duration::from_secs(60),
            max_attempts: 4,
        };
        assert_eq!(strategy.backoff(2), Some(Duration::from_secs(5)));
        assert_eq!(strategy.backoff(3), Some(Duration::from_secs(15)));
        assert_eq!(strategy.backoff(4), Some(Duration::from_secs(25)));
        assert_eq!(strategy.backoff(5), None);
    }

    #[test]
    fn custom_strategy_follows_its_table() {
        let strategy = RetryStrategy::Custom {
            delays: vec![Duration::from_secs(1), Duration::from_secs(7)],
        };
        assert_eq!(strategy.backoff(2), Some(Duration::from_secs(1)));
        assert_eq!(strategy.backoff(3), Some(Duration::from_secs(7)));
        assert_eq!(strategy.backoff(4), None);
        assert_eq!(strategy.max_attempts(), 3);
    }

    #[tokio::test]
    async fn no_retry_makes_a_single_attempt() {
        let calls = Arc::new(AtomicU32::new(0));
        let ctx = context();
        let action = {
            let calls = calls.clone();
            move || -> BoxFuture<'static, JobResult<()>> {
                let calls = calls.clone();
                Box::pin(async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err(JobError::msg("always fails"))
                })
            }
        };

        let result = NoRetry.run(&ctx, &action).await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn backoff_retry_stops_after_success() {
        let calls = Arc::new(AtomicU32::new(0));
        let ctx = context();
        let action = {
            let calls = calls.clone();
            move || -> BoxFuture<'static, JobResult<()>> {
                let calls = calls.clone();
                Box::pin(async move {
                    if calls.fetch_add(1, Ordering::SeqCst) + 1 < 3 {
                        Err(JobError::msg("not yet"))
                    } else {
                        Ok(())
                    }
                })
            }
        };

        let policy = BackoffRetry::attempts(5, Duration::from_millis(1));
        policy.run(&ctx, &action).await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn backoff_retry_surfaces_the_terminal_failure() {
        let calls = Arc::new(AtomicU32::new(0));
        let ctx = context();
        let action = {
            let calls = calls.clone();
            move || -> BoxFuture<'static, JobResult<()>> {
                let calls = calls.clone();
                Box::pin(async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err(JobError::msg("broken"))
                })
            }
        };

        let policy = BackoffRetry::attempts(3, Duration::from_millis(1));
        let error = policy.run(&ctx, &action).await.unwrap_err();
        assert_eq!(error.to_string(), "broken");
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn backoff_retry_aborts_the_wait_on_cancellation() {
        let ctx = context();
        ctx.execution().cancel();
        let action = move || -> BoxFuture<'static, JobResult<()>> {
            Box::pin(async { Err(JobError::msg("fails")) })
        };

        let policy = BackoffRetry::attempts(3, Duration::from_secs(60));
        let error = policy.run(&ctx, &action).await.unwrap_err();
        assert!(error.is_cancelled());
    }
}
