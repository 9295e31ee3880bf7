//! Transaction context without an external transactional resource.
//!
//! Used when the engine owns its persistence connections itself. Commit and
//! rollback only drive the listener protocol; sessions that hold a local
//! resource register `Committing` / `RollingBack` listeners to commit or
//! roll it back.

use std::{
    fmt,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
};

use async_trait::async_trait;

use super::{
    Phase, TransactionContext, TransactionContextFactory, TransactionCore, TransactionListener,
    TransactionState, before_commit_failpoint,
};
use crate::error::{PipelineError, PipelineResult, TransactionOperation};

static NEXT_STANDALONE_ID: AtomicU64 = AtomicU64::new(1);

/// [`TransactionContext`] that manages no external resource.
pub struct StandaloneTransactionContext {
    id: u64,
    core: TransactionCore,
}

impl fmt::Debug for StandaloneTransactionContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StandaloneTransactionContext")
            .field("id", &self.id)
            .field("core", &self.core)
            .finish()
    }
}

impl StandaloneTransactionContext {
    /// Creates a new, active transaction context.
    #[must_use]
    pub fn new() -> Self {
        Self { id: NEXT_STANDALONE_ID.fetch_add(1, Ordering::Relaxed), core: TransactionCore::new() }
    }

    /// Returns the process-unique identifier of this context.
    #[must_use]
    pub fn id(&self) -> u64 {
        self.id
    }
}

impl Default for StandaloneTransactionContext {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TransactionContext for StandaloneTransactionContext {
    #[tracing::instrument(name = "commit", skip(self), fields(transaction = self.id))]
    async fn commit(&self) -> PipelineResult<()> {
        self.core.begin_completion(TransactionOperation::Commit, Phase::Committing)?;

        let prepared = match self.core.fire(TransactionState::Committing).await {
            Ok(()) => before_commit_failpoint(),
            Err(err) => Err(PipelineError::transaction_failed(TransactionOperation::Commit, err)),
        };
        if let Err(err) = prepared {
            self.core.abort_commit().await;
            return Err(err);
        }

        self.core.set_phase(Phase::Committed);
        tracing::debug!("transaction committed");
        self.core.fire(TransactionState::Committed).await
    }

    #[tracing::instrument(name = "rollback", skip(self), fields(transaction = self.id))]
    async fn rollback(&self) -> PipelineResult<()> {
        let result = self.core.rollback_with(async { Ok(()) }).await;
        tracing::debug!("transaction rolled back");
        result
    }

    fn add_transaction_listener(
        &self,
        state: TransactionState,
        listener: Arc<dyn TransactionListener>,
    ) {
        self.core.add_listener(state, listener);
    }

    fn is_transaction_active(&self) -> bool {
        self.core.phase() == Phase::Active
    }

    fn set_rollback_only(&self) {
        self.core.set_rollback_only();
    }

    fn is_rollback_only(&self) -> bool {
        self.core.is_rollback_only()
    }
}

/// Factory for [`StandaloneTransactionContext`].
#[derive(Debug, Clone, Copy, Default)]
pub struct StandaloneTransactionContextFactory;

#[async_trait]
impl TransactionContextFactory for StandaloneTransactionContextFactory {
    async fn create(&self) -> PipelineResult<Arc<dyn TransactionContext>> {
        Ok(Arc::new(StandaloneTransactionContext::new()))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::panic)]
mod tests {
    use parking_lot::Mutex;

    use super::*;
    use crate::transaction::listener_fn;

    fn recording(ctx: &StandaloneTransactionContext) -> Arc<Mutex<Vec<TransactionState>>> {
        let fired = Arc::new(Mutex::new(Vec::new()));
        for state in [
            TransactionState::Committing,
            TransactionState::Committed,
            TransactionState::RollingBack,
            TransactionState::RolledBack,
        ] {
            let fired = Arc::clone(&fired);
            ctx.add_transaction_listener(
                state,
                listener_fn(move |s| {
                    fired.lock().push(s);
                    Ok(())
                }),
            );
        }
        fired
    }

    #[tokio::test]
    async fn test_commit_fires_committing_then_committed() {
        let ctx = StandaloneTransactionContext::new();
        let fired = recording(&ctx);

        ctx.commit().await.unwrap();

        assert_eq!(*fired.lock(), vec![TransactionState::Committing, TransactionState::Committed]);
        assert!(!ctx.is_transaction_active());
    }

    #[tokio::test]
    async fn test_rollback_fires_rolling_back_then_rolled_back() {
        let ctx = StandaloneTransactionContext::new();
        let fired = recording(&ctx);

        ctx.rollback().await.unwrap();

        assert_eq!(
            *fired.lock(),
            vec![TransactionState::RollingBack, TransactionState::RolledBack]
        );
    }

    #[tokio::test]
    async fn test_commit_twice_is_rejected() {
        let ctx = StandaloneTransactionContext::new();
        ctx.commit().await.unwrap();

        let second = ctx.commit().await;
        assert!(matches!(second, Err(PipelineError::IllegalTransactionState { .. })));
        let rollback = ctx.rollback().await;
        assert!(matches!(rollback, Err(PipelineError::IllegalTransactionState { .. })));
    }

    #[tokio::test]
    async fn test_failing_committing_listener_rolls_back() {
        let ctx = StandaloneTransactionContext::new();
        ctx.add_transaction_listener(
            TransactionState::Committing,
            listener_fn(|_| Err(PipelineError::conflict("stale row"))),
        );
        let fired = recording(&ctx);

        let err = ctx.commit().await.unwrap_err();

        assert!(matches!(
            err,
            PipelineError::TransactionInteraction { operation: TransactionOperation::Commit, .. }
        ));
        assert!(err.is_conflict(), "a conflict raised while committing stays retryable");
        assert_eq!(
            *fired.lock(),
            vec![
                TransactionState::Committing,
                TransactionState::RollingBack,
                TransactionState::RolledBack,
            ]
        );
    }

    #[tokio::test]
    async fn test_factory_creates_distinct_contexts() {
        let factory = StandaloneTransactionContextFactory;
        let first = factory.create().await.unwrap();
        let second = factory.create().await.unwrap();

        first.commit().await.unwrap();
        assert!(second.is_transaction_active());
    }
}
