use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use serde::{Deserialize, Serialize};

use taskloom_core::config::RetryDefaults;
use taskloom_core::{Error, Task, TaskContext, TaskError, TaskErrorKind, TaskStatus};

use crate::{resolve_checked, Resolver};

/// Backoff strategy for the delay between attempts.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum BackoffStrategy {
    Constant,
    Linear,
    Exponential,
    Fibonacci,
    /// Exponential with uniform random jitter applied.
    Jittered,
}

impl FromStr for BackoffStrategy {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "constant" => Ok(BackoffStrategy::Constant),
            "linear" => Ok(BackoffStrategy::Linear),
            "exponential" => Ok(BackoffStrategy::Exponential),
            "fibonacci" => Ok(BackoffStrategy::Fibonacci),
            "jittered" => Ok(BackoffStrategy::Jittered),
            other => Err(Error::Config(format!("unknown backoff strategy '{}'", other))),
        }
    }
}

type RetryPredicate = Arc<dyn Fn(TaskErrorKind) -> bool + Send + Sync>;

/// Bounded retry policy with pluggable backoff.
#[derive(Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub strategy: BackoffStrategy,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub jitter_factor: f64,
    retry_on: Option<RetryPredicate>,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, strategy: BackoffStrategy) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            strategy,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            jitter_factor: 0.1,
            retry_on: None,
        }
    }

    pub fn from_defaults(defaults: &RetryDefaults) -> taskloom_core::Result<Self> {
        let strategy = defaults.strategy.parse()?;
        Ok(Self::new(defaults.max_attempts, strategy)
            .with_base_delay(Duration::from_millis(defaults.base_delay_ms))
            .with_max_delay(Duration::from_millis(defaults.max_delay_ms))
            .with_jitter_factor(defaults.jitter_factor))
    }

    pub fn with_base_delay(mut self, delay: Duration) -> Self {
        self.base_delay = delay;
        self
    }

    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    pub fn with_jitter_factor(mut self, factor: f64) -> Self {
        self.jitter_factor = factor.clamp(0.0, 1.0);
        self
    }

    /// Override the retryability decision per error kind.
    pub fn with_retry_on(
        mut self,
        predicate: impl Fn(TaskErrorKind) -> bool + Send + Sync + 'static,
    ) -> Self {
        self.retry_on = Some(Arc::new(predicate));
        self
    }

    pub fn is_retryable(&self, error: &TaskError) -> bool {
        match &self.retry_on {
            Some(predicate) => predicate(error.kind),
            None => error.retryable,
        }
    }

    /// Delay after the given (1-based) failed attempt, clamped to
    /// `max_delay`. A zero base delay makes every retry immediate.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let attempt = attempt.max(1);
        let base_ms = self.base_delay.as_millis();
        let raw_ms: u128 = match self.strategy {
            BackoffStrategy::Constant => base_ms,
            BackoffStrategy::Linear => base_ms.saturating_mul(attempt as u128),
            BackoffStrategy::Exponential => exponential_ms(base_ms, attempt),
            BackoffStrategy::Fibonacci => base_ms.saturating_mul(fibonacci(attempt)),
            BackoffStrategy::Jittered => {
                let exp = exponential_ms(base_ms, attempt) as f64;
                let jitter = exp * self.jitter_factor * jitter_unit();
                (exp + jitter).max(0.0) as u128
            }
        };
        let clamped = raw_ms.min(self.max_delay.as_millis());
        Duration::from_millis(clamped.min(u64::MAX as u128) as u64)
    }
}

impl std::fmt::Debug for RetryPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RetryPolicy")
            .field("max_attempts", &self.max_attempts)
            .field("strategy", &self.strategy)
            .field("base_delay", &self.base_delay)
            .field("max_delay", &self.max_delay)
            .field("jitter_factor", &self.jitter_factor)
            .field("retry_on", &self.retry_on.as_ref().map(|_| "<custom>"))
            .finish()
    }
}

fn exponential_ms(base_ms: u128, attempt: u32) -> u128 {
    let shift = (attempt - 1).min(63);
    base_ms.saturating_mul(1u128 << shift)
}

/// fib(1) = 1, fib(2) = 1, fib(3) = 2, ...
fn fibonacci(n: u32) -> u128 {
    let (mut a, mut b): (u128, u128) = (0, 1);
    for _ in 0..n {
        let next = a.saturating_add(b);
        a = b;
        b = next;
    }
    a
}

/// Uniform value in [-1.0, 1.0] from a hasher over time + pid. Good enough
/// for backoff spreading; not a general-purpose RNG.
fn jitter_unit() -> f64 {
    use std::collections::hash_map::DefaultHasher;
    use std::hash::{Hash, Hasher};
    let mut h = DefaultHasher::new();
    std::time::SystemTime::now().hash(&mut h);
    std::process::id().hash(&mut h);
    (h.finish() as f64 / u64::MAX as f64) * 2.0 - 1.0
}

/// Drives a fallible call through a bounded retry loop.
pub struct RetryEngine;

impl RetryEngine {
    /// Run `f` under `policy`. Attempt 1 runs immediately; a non-retryable
    /// error returns at once; cancellation wins over success when both race
    /// at a suspension point; panics inside `f` surface as a non-retryable
    /// `Internal` error. The final error carries the attempt count.
    pub async fn call<T, F, Fut>(
        ctx: &TaskContext,
        policy: &RetryPolicy,
        mut f: F,
    ) -> Result<T, TaskError>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, TaskError>>,
    {
        let max = policy.max_attempts.max(1);
        for attempt in 1..=max {
            if let Some(err) = interruption(ctx, attempt) {
                return Err(err);
            }

            let outcome = {
                let fut = AssertUnwindSafe(f(attempt)).catch_unwind();
                tokio::select! {
                    biased;
                    _ = ctx.cancelled() => {
                        return Err(TaskError::cancelled().with_attempts(attempt));
                    }
                    outcome = fut => outcome,
                }
            };

            let err = match outcome {
                Ok(Ok(value)) => return Ok(value),
                Ok(Err(err)) => err,
                Err(panic) => {
                    let message = panic_message(&panic);
                    tracing::error!(attempt, message = %message, "Call panicked inside retry loop");
                    return Err(TaskError::new(
                        TaskErrorKind::Internal,
                        format!("panic: {}", message),
                    )
                    .with_retryable(false)
                    .with_attempts(attempt));
                }
            };

            if !policy.is_retryable(&err) || attempt == max {
                return Err(err.with_attempts(attempt));
            }

            let delay = policy.delay_for(attempt);
            tracing::debug!(
                attempt,
                delay_ms = delay.as_millis() as u64,
                kind = %err.kind,
                "Retrying after failure"
            );
            if !delay.is_zero() {
                tokio::select! {
                    biased;
                    _ = ctx.cancelled() => {
                        return Err(TaskError::cancelled().with_attempts(attempt));
                    }
                    _ = tokio::time::sleep(delay) => {}
                }
            }
        }
        unreachable!("retry loop always returns inside the final attempt")
    }

    /// Drive a resolver call through the retry loop. The input task is
    /// re-cloned for each attempt so a failed attempt never leaks partial
    /// state into the next one.
    pub async fn resolve_task(
        ctx: &TaskContext,
        policy: &RetryPolicy,
        resolver: &dyn Resolver,
        task: Task,
    ) -> Task {
        let template = task;
        let outcome = Self::call(ctx, policy, |_attempt| {
            let fresh = template.clone();
            async move {
                let resolved = resolve_checked(resolver, ctx, fresh).await;
                match resolved.status {
                    TaskStatus::Completed => Ok(resolved),
                    TaskStatus::Cancelled => Err(TaskError::cancelled()),
                    _ => Err(resolved.error.unwrap_or_else(|| {
                        TaskError::new(
                            TaskErrorKind::Internal,
                            "resolver returned a non-terminal task",
                        )
                    })),
                }
            }
        })
        .await;

        match outcome {
            Ok(resolved) => resolved,
            Err(err) => {
                let mut failed = template;
                failed.update_status(TaskStatus::InProgress);
                if err.kind == TaskErrorKind::Cancelled {
                    failed.cancel();
                } else {
                    failed.fail(err);
                }
                failed
            }
        }
    }
}

/// Cancellation or deadline expiry observed between suspension points.
fn interruption(ctx: &TaskContext, attempt: u32) -> Option<TaskError> {
    if ctx.deadline_elapsed() {
        return Some(
            TaskError::timeout("deadline elapsed before attempt").with_attempts(attempt.saturating_sub(1).max(1)),
        );
    }
    if ctx.is_cancelled() {
        return Some(TaskError::cancelled().with_attempts(attempt.saturating_sub(1).max(1)));
    }
    None
}

fn panic_message(panic: &Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
