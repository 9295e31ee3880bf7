//! Pipeline metrics.
//!
//! [`PipelineMetrics`] counts what the pipeline did: commands executed and
//! failed, command contexts opened and joined, transactions begun, committed
//! and rolled back, and conflict retries.
//!
//! # Memory Ordering Strategy
//!
//! All atomic operations use `Ordering::Relaxed`. Each counter is independent
//! and monotonically increasing; [`snapshot`](PipelineMetrics::snapshot)
//! reads them one after another, so counters may be slightly inconsistent
//! relative to each other. Nothing in the pipeline reads these counters for
//! correctness.
//!
//! # Usage
//!
//! ```
//! use process_engine_command::metrics::PipelineMetrics;
//!
//! let metrics = PipelineMetrics::new();
//! metrics.record_command();
//! metrics.record_commit();
//!
//! let snapshot = metrics.snapshot();
//! assert_eq!(snapshot.commands, 1);
//! assert_eq!(snapshot.commits, 1);
//! ```

use std::sync::{
    Arc,
    atomic::{AtomicU64, Ordering},
};

/// Shared pipeline counters.
#[derive(Debug, Default)]
pub struct PipelineMetrics {
    commands: AtomicU64,
    command_failures: AtomicU64,
    contexts_opened: AtomicU64,
    contexts_joined: AtomicU64,
    transactions_begun: AtomicU64,
    commits: AtomicU64,
    rollbacks: AtomicU64,
    retries: AtomicU64,
    retries_exhausted: AtomicU64,
}

/// Point-in-time copy of [`PipelineMetrics`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MetricsSnapshot {
    /// Commands that entered a chain, nested ones included.
    pub commands: u64,
    /// Commands whose chain returned an error.
    pub command_failures: u64,
    /// Command contexts created.
    pub contexts_opened: u64,
    /// Nested invocations that joined an already open command context.
    pub contexts_joined: u64,
    /// Transactions begun by a transaction boundary or a schema chain.
    pub transactions_begun: u64,
    /// Transactions committed.
    pub commits: u64,
    /// Transactions rolled back, including failed commits.
    pub rollbacks: u64,
    /// Conflict retries performed.
    pub retries: u64,
    /// Invocations that still conflicted after the last allowed attempt.
    pub retries_exhausted: u64,
}

impl PipelineMetrics {
    /// Creates a new, zeroed set of counters.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a new, zeroed set of counters behind an [`Arc`].
    #[must_use]
    pub fn shared() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Records a command entering a chain.
    pub fn record_command(&self) {
        self.commands.fetch_add(1, Ordering::Relaxed);
    }

    /// Records a command whose chain failed.
    pub fn record_command_failure(&self) {
        self.command_failures.fetch_add(1, Ordering::Relaxed);
    }

    /// Records a new command context.
    pub fn record_context_opened(&self) {
        self.contexts_opened.fetch_add(1, Ordering::Relaxed);
    }

    /// Records a nested invocation joining an open command context.
    pub fn record_context_joined(&self) {
        self.contexts_joined.fetch_add(1, Ordering::Relaxed);
    }

    /// Records a transaction begun.
    pub fn record_transaction_begun(&self) {
        self.transactions_begun.fetch_add(1, Ordering::Relaxed);
    }

    /// Records a successful commit.
    pub fn record_commit(&self) {
        self.commits.fetch_add(1, Ordering::Relaxed);
    }

    /// Records a rollback.
    pub fn record_rollback(&self) {
        self.rollbacks.fetch_add(1, Ordering::Relaxed);
    }

    /// Records a conflict retry.
    pub fn record_retry(&self) {
        self.retries.fetch_add(1, Ordering::Relaxed);
    }

    /// Records a conflict that exhausted the configured attempts.
    pub fn record_retry_exhausted(&self) {
        self.retries_exhausted.fetch_add(1, Ordering::Relaxed);
    }

    /// Returns a snapshot of all counters.
    #[must_use]
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            commands: self.commands.load(Ordering::Relaxed),
            command_failures: self.command_failures.load(Ordering::Relaxed),
            contexts_opened: self.contexts_opened.load(Ordering::Relaxed),
            contexts_joined: self.contexts_joined.load(Ordering::Relaxed),
            transactions_begun: self.transactions_begun.load(Ordering::Relaxed),
            commits: self.commits.load(Ordering::Relaxed),
            rollbacks: self.rollbacks.load(Ordering::Relaxed),
            retries: self.retries.load(Ordering::Relaxed),
            retries_exhausted: self.retries_exhausted.load(Ordering::Relaxed),
        }
    }

    /// Resets all counters to zero.
    ///
    /// A concurrent increment racing with the reset may be lost.
    pub fn reset(&self) {
        for counter in [
            &self.commands,
            &self.command_failures,
            &self.contexts_opened,
            &self.contexts_joined,
            &self.transactions_begun,
            &self.commits,
            &self.rollbacks,
            &self.retries,
            &self.retries_exhausted,
        ] {
            counter.store(0, Ordering::Relaxed);
        }
    }
}

impl MetricsSnapshot {
    /// Fraction of commands that failed, or `0.0` when nothing ran.
    #[must_use]
    pub fn failure_rate(&self) -> f64 {
        if self.commands == 0 {
            return 0.0;
        }
        self.command_failures as f64 / self.commands as f64
    }
}
