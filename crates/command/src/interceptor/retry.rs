//! Optimistic-conflict retry.
//!
//! [`RetryInterceptor`] re-runs the rest of the chain when an attempt fails
//! with a write conflict. Every attempt starts from scratch: the inner
//! interceptors open a fresh transaction and a fresh Command Context.
//!
//! # Backoff Strategy
//!
//! - Base delay doubles with each retry: `initial_backoff * 2^retry`
//! - Delay is capped at `max_backoff`
//! - Random jitter of 0–50% of the computed delay is added
//!
//! A zero `initial_backoff` retries immediately.

use std::{fmt, sync::Arc, time::Duration};

use async_trait::async_trait;
use fail::fail_point;
use rand::Rng;

use super::{CommandInterceptor, Invocation, Next};
use crate::{
    command::{CommandOutput, DynCommand},
    config::{ConflictPredicate, RetryConfig},
    error::PipelineResult,
    metrics::PipelineMetrics,
};

/// Re-runs top-level commands that failed with a write conflict.
///
/// Nested invocations and commands whose
/// [`is_retryable`](crate::Command::is_retryable) returns `false` pass
/// straight through. After the last allowed attempt the failure is returned
/// unchanged: it is not re-classified, so its [`kind`](crate::PipelineError::kind)
/// may still be [`ErrorKind::Conflict`](crate::ErrorKind::Conflict). Callers that
/// need to tell an exhausted retry apart check
/// [`is_conflict`](crate::PipelineError::is_conflict) on the returned error.
#[derive(Clone)]
pub struct RetryInterceptor {
    config: RetryConfig,
    is_conflict: ConflictPredicate,
    metrics: Arc<PipelineMetrics>,
}

impl fmt::Debug for RetryInterceptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RetryInterceptor").field("config", &self.config).finish_non_exhaustive()
    }
}

impl RetryInterceptor {
    /// Creates a retry interceptor recognising conflicts with `is_conflict`.
    pub fn new(
        config: RetryConfig,
        is_conflict: ConflictPredicate,
        metrics: Arc<PipelineMetrics>,
    ) -> Self {
        Self { config, is_conflict, metrics }
    }
}

#[async_trait]
impl CommandInterceptor for RetryInterceptor {
    #[tracing::instrument(
        name = "command_retry",
        skip_all,
        fields(max_attempts = self.config.max_attempts())
    )]
    async fn execute(
        &self,
        invocation: &mut Invocation<'_>,
        command: &dyn DynCommand,
        next: Next<'_>,
    ) -> PipelineResult<CommandOutput> {
        if invocation.is_nested() || !command.is_retryable() {
            return next.run(invocation, command).await;
        }

        let max_attempts = self.config.max_attempts();
        let mut attempt = 1;
        loop {
            match next.run(invocation, command).await {
                Ok(output) => {
                    if attempt > 1 {
                        tracing::debug!(
                            command = command.name(),
                            attempt,
                            "command succeeded after conflict retry",
                        );
                    }
                    return Ok(output);
                },
                Err(err) if (self.is_conflict)(&err) && attempt < max_attempts => {
                    self.metrics.record_retry();
                    let delay = compute_backoff(&self.config, attempt - 1);
                    tracing::debug!(
                        command = command.name(),
                        attempt,
                        max_attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "write conflict, retrying command",
                    );
                    fail_point!("command-retry-before-sleep", |_| {
                        Err(crate::error::PipelineError::command(
                            "injected failure before retry backoff"
                        ))
                    });
                    if !delay.is_zero() {
                        tokio::time::sleep(delay).await;
                    }
                    attempt += 1;
                },
                Err(err) => {
                    if (self.is_conflict)(&err) {
                        self.metrics.record_retry_exhausted();
                        tracing::warn!(
                            command = command.name(),
                            attempts = attempt,
                            error = %err,
                            "write conflict persisted after last attempt",
                        );
                    }
                    return Err(err);
                },
            }
        }
    }

    fn name(&self) -> &'static str {
        "retry"
    }
}

/// Computes the backoff before retry number `retry` (zero-based).
fn compute_backoff(config: &RetryConfig, retry: u32) -> Duration {
    let base = config.initial_backoff().saturating_mul(1u32.checked_shl(retry).unwrap_or(u32::MAX));
    let capped = base.min(config.max_backoff());

    let jitter_range = capped.as_millis() as u64 / 2;
    if jitter_range > 0 {
        let jitter = rand::rng().random_range(0..=jitter_range);
        capped + Duration::from_millis(jitter)
    } else {
        capped
    }
}
