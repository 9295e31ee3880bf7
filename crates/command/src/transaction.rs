//! Transaction context abstraction.
//!
//! A [`TransactionContext`] wraps the lifecycle of exactly one transactional
//! resource for the duration of one unit of work. It is created by a
//! [`TransactionContextFactory`] when a transaction boundary begins, shared
//! with the [`CommandContext`](crate::CommandContext) and its sessions, and
//! discarded after commit or rollback.
//!
//! # Lifecycle
//!
//! ```text
//!            commit()                      rollback()
//! Active ──────────────→ Committing     Active ──────────────→ RollingBack
//!                           │                                      │
//!          listeners ok,    │  listener or resource                │
//!          resource ok      │  failure                             ▼
//!                           ▼──────────→ RollingBack ──────→  RolledBack
//!                       Committed
//! ```
//!
//! `commit` and `rollback` are terminal: a second call, or one after the
//! other, fails with [`PipelineError::IllegalTransactionState`].
//!
//! # Listeners
//!
//! Listeners registered for a [`TransactionState`] fire in registration order
//! when that state is reached, on the calling task. A failing listener does
//! not prevent the remaining listeners from running; failures are collected
//! into a single [`PipelineError::TransactionListener`].
//!
//! # Implementations
//!
//! | Factory | Context | Resource |
//! |---------|---------|----------|
//! | [`StandaloneTransactionContextFactory`] | [`StandaloneTransactionContext`] | none |
//! | [`ManagedTransactionContextFactory`] | [`ManagedTransactionContext`] | [`TransactionManager`] handed over directly |
//! | [`LocatedTransactionContextFactory`] | [`ManagedTransactionContext`] | [`TransactionManager`] looked up by name |

mod managed;
mod standalone;

use std::{fmt, sync::Arc};

use async_trait::async_trait;
use fail::fail_point;
use parking_lot::Mutex;

pub use self::{
    managed::{
        LocatedTransactionContextFactory, ManagedTransactionContext,
        ManagedTransactionContextFactory, ResourceStatus, TransactionId, TransactionManager,
        TransactionManagerLocator, TransactionManagerRegistry,
    },
    standalone::{StandaloneTransactionContext, StandaloneTransactionContextFactory},
};
use crate::{
    error::{PipelineError, PipelineResult, TransactionOperation},
    metrics::PipelineMetrics,
};

/// Lifecycle states a transaction passes through on completion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransactionState {
    /// Commit has been requested; the resource has not committed yet.
    Committing,
    /// The resource committed.
    Committed,
    /// Rollback has been requested; the resource has not rolled back yet.
    RollingBack,
    /// The resource rolled back.
    RolledBack,
}

impl fmt::Display for TransactionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Committing => write!(f, "committing"),
            Self::Committed => write!(f, "committed"),
            Self::RollingBack => write!(f, "rolling_back"),
            Self::RolledBack => write!(f, "rolled_back"),
        }
    }
}

/// Callback fired when a transaction reaches a [`TransactionState`].
///
/// Any `Fn(TransactionState) -> PipelineResult<()>` closure is a listener;
/// use [`listener_fn`] to get one as a trait object.
#[async_trait]
pub trait TransactionListener: Send + Sync {
    /// Runs the listener for the reached state.
    async fn execute(&self, state: TransactionState) -> PipelineResult<()>;
}

#[async_trait]
impl<F> TransactionListener for F
where
    F: Fn(TransactionState) -> PipelineResult<()> + Send + Sync,
{
    async fn execute(&self, state: TransactionState) -> PipelineResult<()> {
        self(state)
    }
}

/// Wraps a closure as a shareable [`TransactionListener`].
///
/// # Example
///
/// ```
/// use process_engine_command::transaction::{TransactionState, listener_fn};
///
/// let listener = listener_fn(|state| {
///     assert_eq!(state, TransactionState::Committed);
///     Ok(())
/// });
/// # drop(listener);
/// ```
pub fn listener_fn<F>(listener: F) -> Arc<dyn TransactionListener>
where
    F: Fn(TransactionState) -> PipelineResult<()> + Send + Sync + 'static,
{
    Arc::new(listener)
}

/// Lifecycle of one transactional resource.
///
/// Implementations are shared behind an [`Arc`] between the transaction
/// boundary, the command context and the sessions opened in it, so every
/// method takes `&self`.
#[async_trait]
pub trait TransactionContext: Send + Sync + fmt::Debug {
    /// Commits the transaction, firing `Committing` and `Committed` listeners.
    ///
    /// # Errors
    ///
    /// - [`PipelineError::IllegalTransactionState`] if the transaction already completed
    /// - [`PipelineError::TransactionInteraction`] if a `Committing` listener or the resource
    ///   failed; the transaction is rolled back in that case
    /// - [`PipelineError::TransactionListener`] if a `Committed` listener failed
    async fn commit(&self) -> PipelineResult<()>;

    /// Rolls the transaction back, firing `RollingBack` and `RolledBack` listeners.
    ///
    /// # Errors
    ///
    /// - [`PipelineError::IllegalTransactionState`] if the transaction already completed
    /// - The first listener or resource failure; all listeners still run
    async fn rollback(&self) -> PipelineResult<()>;

    /// Registers a listener for `state`.
    fn add_transaction_listener(
        &self,
        state: TransactionState,
        listener: Arc<dyn TransactionListener>,
    );

    /// Returns `true` while the transaction can still be joined.
    fn is_transaction_active(&self) -> bool;

    /// Marks the transaction so that the boundary rolls it back instead of
    /// committing.
    fn set_rollback_only(&self);

    /// Returns `true` if the transaction was marked rollback-only.
    fn is_rollback_only(&self) -> bool;

    /// Detaches the transaction while a `RequiresNew` invocation runs.
    async fn suspend(&self) -> PipelineResult<()> {
        Ok(())
    }

    /// Re-attaches the transaction after a `RequiresNew` invocation returned.
    async fn resume(&self) -> PipelineResult<()> {
        Ok(())
    }
}

/// Creates one [`TransactionContext`] per transaction boundary.
#[async_trait]
pub trait TransactionContextFactory: Send + Sync + fmt::Debug {
    /// Begins a new transaction.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::TransactionInteraction`] if the resource
    /// cannot be located or begun.
    async fn create(&self) -> PipelineResult<Arc<dyn TransactionContext>>;
}

/// Commits or rolls back `transaction` according to `outcome`.
///
/// Commits only when the outcome is `Ok` and the transaction is not marked
/// rollback-only. A rollback failure following a command failure is logged
/// and the command failure is returned.
pub(crate) async fn complete<T>(
    transaction: &dyn TransactionContext,
    outcome: PipelineResult<T>,
    metrics: &PipelineMetrics,
) -> PipelineResult<T> {
    match outcome {
        Ok(value) if !transaction.is_rollback_only() => match transaction.commit().await {
            Ok(()) => {
                metrics.record_commit();
                Ok(value)
            },
            Err(err) => {
                if matches!(
                    err,
                    PipelineError::TransactionListener { state: TransactionState::Committed, .. }
                ) {
                    metrics.record_commit();
                } else {
                    metrics.record_rollback();
                }
                Err(err)
            },
        },
        Ok(value) => {
            tracing::debug!(?transaction, "transaction marked rollback-only, rolling back");
            metrics.record_rollback();
            transaction.rollback().await?;
            Ok(value)
        },
        Err(err) => {
            metrics.record_rollback();
            if let Err(rollback_err) = transaction.rollback().await {
                tracing::warn!(
                    error = %rollback_err,
                    cause = %err,
                    "rollback failed after command failure",
                );
            }
            Err(err)
        },
    }
}

/// Internal lifecycle phase, a superset of the externally visible states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Phase {
    Active,
    Committing,
    Committed,
    RollingBack,
    RolledBack,
}

impl Phase {
    fn name(self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Committing => "committing",
            Self::Committed => "committed",
            Self::RollingBack => "rolling_back",
            Self::RolledBack => "rolled_back",
        }
    }
}

struct CoreState {
    phase: Phase,
    rollback_only: bool,
    listeners: Vec<(TransactionState, Arc<dyn TransactionListener>)>,
}

/// Phase tracking, rollback-only flag and listener registry shared by the
/// context implementations.
///
/// The mutex is never held across an `.await`: listeners are cloned out
/// before they run, so a listener may register further listeners.
pub(crate) struct TransactionCore {
    state: Mutex<CoreState>,
}

impl fmt::Debug for TransactionCore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("TransactionCore")
            .field("phase", &state.phase)
            .field("rollback_only", &state.rollback_only)
            .field("listeners", &state.listeners.len())
            .finish()
    }
}

impl TransactionCore {
    pub(crate) fn new() -> Self {
        Self {
            state: Mutex::new(CoreState {
                phase: Phase::Active,
                rollback_only: false,
                listeners: Vec::new(),
            }),
        }
    }

    pub(crate) fn phase(&self) -> Phase {
        self.state.lock().phase
    }

    /// Moves an active transaction into `to`, rejecting a second completion.
    pub(crate) fn begin_completion(
        &self,
        operation: TransactionOperation,
        to: Phase,
    ) -> PipelineResult<()> {
        let mut state = self.state.lock();
        if state.phase != Phase::Active {
            return Err(PipelineError::IllegalTransactionState {
                operation,
                phase: state.phase.name(),
            });
        }
        state.phase = to;
        Ok(())
    }

    pub(crate) fn set_phase(&self, phase: Phase) {
        self.state.lock().phase = phase;
    }

    pub(crate) fn add_listener(&self, state: TransactionState, listener: Arc<dyn TransactionListener>) {
        self.state.lock().listeners.push((state, listener));
    }

    pub(crate) fn set_rollback_only(&self) {
        self.state.lock().rollback_only = true;
    }

    pub(crate) fn is_rollback_only(&self) -> bool {
        self.state.lock().rollback_only
    }

    /// Fires every listener registered for `state`, in registration order.
    pub(crate) async fn fire(&self, state: TransactionState) -> PipelineResult<()> {
        let listeners: Vec<Arc<dyn TransactionListener>> = self
            .state
            .lock()
            .listeners
            .iter()
            .filter(|(registered, _)| *registered == state)
            .map(|(_, listener)| Arc::clone(listener))
            .collect();

        let mut failures = Vec::new();
        for listener in listeners {
            if let Err(err) = listener.execute(state).await {
                tracing::warn!(%state, error = %err, "transaction listener failed");
                failures.push(err);
            }
        }

        let mut failures = failures.into_iter();
        match failures.next() {
            None => Ok(()),
            Some(first) => Err(PipelineError::TransactionListener {
                state,
                source: Box::new(first),
                suppressed: failures.collect(),
            }),
        }
    }

    /// Rolls back listeners after a commit attempt failed part-way.
    ///
    /// Failures here are logged; the commit failure is what the caller sees.
    pub(crate) async fn abort_commit(&self) {
        self.set_phase(Phase::RollingBack);
        if let Err(err) = self.fire(TransactionState::RollingBack).await {
            tracing::warn!(error = %err, "listener failed while aborting commit");
        }
        self.set_phase(Phase::RolledBack);
        if let Err(err) = self.fire(TransactionState::RolledBack).await {
            tracing::warn!(error = %err, "listener failed while aborting commit");
        }
    }

    /// Fires the `RollingBack` and `RolledBack` listeners around `resource`,
    /// returning the first failure after everything ran.
    pub(crate) async fn rollback_with<F>(&self, resource: F) -> PipelineResult<()>
    where
        F: std::future::Future<Output = PipelineResult<()>> + Send,
    {
        self.begin_completion(TransactionOperation::Rollback, Phase::RollingBack)?;
        let mut first = self.fire(TransactionState::RollingBack).await.err();
        if let Err(err) = resource.await {
            first.get_or_insert(PipelineError::transaction_failed(TransactionOperation::Rollback, err));
        }
        self.set_phase(Phase::RolledBack);
        if let Err(err) = self.fire(TransactionState::RolledBack).await {
            first.get_or_insert(err);
        }
        first.map_or(Ok(()), Err)
    }
}

/// Fail point evaluated between the `Committing` listeners and the resource
/// commit.
pub(crate) fn before_commit_failpoint() -> PipelineResult<()> {
    fail_point!("transaction-before-commit", |_| {
        Err(PipelineError::transaction(TransactionOperation::Commit, "injected commit failure"))
    });
    Ok(())
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::panic)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    #[tokio::test]
    async fn test_fire_runs_all_listeners_in_order() {
        let core = TransactionCore::new();
        let order = Arc::new(Mutex::new(Vec::new()));
        for name in ["l1", "l2", "l3"] {
            let order = Arc::clone(&order);
            core.add_listener(
                TransactionState::Committed,
                listener_fn(move |_| {
                    order.lock().push(name);
                    if name == "l2" {
                        return Err(PipelineError::command("l2 failed"));
                    }
                    Ok(())
                }),
            );
        }

        let result = core.fire(TransactionState::Committed).await;

        assert_eq!(*order.lock(), vec!["l1", "l2", "l3"]);
        match result {
            Err(PipelineError::TransactionListener { state, source, suppressed }) => {
                assert_eq!(state, TransactionState::Committed);
                assert_eq!(source.to_string(), "Command failed: l2 failed");
                assert!(suppressed.is_empty());
            },
            other => panic!("expected listener failure, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_fire_only_matching_state() {
        let core = TransactionCore::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        core.add_listener(
            TransactionState::RolledBack,
            listener_fn(move |_| {
                counter.fetch_add(1, Ordering::Relaxed);
                Ok(())
            }),
        );

        core.fire(TransactionState::Committed).await.unwrap();
        assert_eq!(calls.load(Ordering::Relaxed), 0);

        core.fire(TransactionState::RolledBack).await.unwrap();
        assert_eq!(calls.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn test_second_completion_rejected() {
        let core = TransactionCore::new();
        core.begin_completion(TransactionOperation::Commit, Phase::Committing).unwrap();
        core.set_phase(Phase::Committed);

        let err = core.begin_completion(TransactionOperation::Rollback, Phase::RollingBack);
        assert!(matches!(
            err,
            Err(PipelineError::IllegalTransactionState {
                operation: TransactionOperation::Rollback,
                phase: "committed",
            })
        ));
    }

    #[tokio::test]
    async fn test_rollback_with_reports_resource_failure_after_listeners() {
        let core = TransactionCore::new();
        let fired = Arc::new(Mutex::new(Vec::new()));
        for state in [TransactionState::RollingBack, TransactionState::RolledBack] {
            let fired = Arc::clone(&fired);
            core.add_listener(
                state,
                listener_fn(move |s| {
                    fired.lock().push(s);
                    Ok(())
                }),
            );
        }

        let result = core
            .rollback_with(async { Err(PipelineError::command("resource unavailable")) })
            .await;

        assert_eq!(
            *fired.lock(),
            vec![TransactionState::RollingBack, TransactionState::RolledBack]
        );
        assert!(matches!(
            result,
            Err(PipelineError::TransactionInteraction {
                operation: TransactionOperation::Rollback,
                ..
            })
        ));
        assert_eq!(core.phase(), Phase::RolledBack);
    }
}
