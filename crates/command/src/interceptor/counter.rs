//! In-flight command counting.

use std::sync::{
    Arc,
    atomic::{AtomicUsize, Ordering},
};

use async_trait::async_trait;

use super::{CommandInterceptor, Invocation, Next};
use crate::{
    command::{CommandOutput, DynCommand},
    error::PipelineResult,
    metrics::PipelineMetrics,
};

/// Number of commands currently executing, nested ones included.
#[derive(Debug, Default)]
pub struct CommandCounter {
    in_flight: AtomicUsize,
}

impl CommandCounter {
    /// Creates a counter at zero.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a counter at zero behind an [`Arc`].
    #[must_use]
    pub fn shared() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Commands currently inside a chain.
    #[must_use]
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::Acquire)
    }

    /// Returns `true` while any command is executing.
    #[must_use]
    pub fn is_executing(&self) -> bool {
        self.in_flight() > 0
    }

    fn enter(&self) -> CounterGuard<'_> {
        self.in_flight.fetch_add(1, Ordering::AcqRel);
        CounterGuard { counter: self }
    }
}

struct CounterGuard<'a> {
    counter: &'a CommandCounter,
}

impl Drop for CounterGuard<'_> {
    fn drop(&mut self) {
        self.counter.in_flight.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Tracks in-flight commands and records command metrics.
#[derive(Debug, Clone)]
pub struct CounterInterceptor {
    counter: Arc<CommandCounter>,
    metrics: Arc<PipelineMetrics>,
}

impl CounterInterceptor {
    /// Creates an interceptor updating `counter` and `metrics`.
    pub fn new(counter: Arc<CommandCounter>, metrics: Arc<PipelineMetrics>) -> Self {
        Self { counter, metrics }
    }
}

#[async_trait]
impl CommandInterceptor for CounterInterceptor {
    async fn execute(
        &self,
        invocation: &mut Invocation<'_>,
        command: &dyn DynCommand,
        next: Next<'_>,
    ) -> PipelineResult<CommandOutput> {
        let _guard = self.counter.enter();
        self.metrics.record_command();
        let result = next.run(invocation, command).await;
        if result.is_err() {
            self.metrics.record_command_failure();
        }
        result
    }

    fn name(&self) -> &'static str {
        "counter"
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::panic)]
mod tests {
    use super::*;

    #[test]
    fn test_guard_decrements_on_drop() {
        let counter = CommandCounter::new();
        {
            let _outer = counter.enter();
            let _inner = counter.enter();
            assert_eq!(counter.in_flight(), 2);
        }
        assert_eq!(counter.in_flight(), 0);
        assert!(!counter.is_executing());
    }
}
