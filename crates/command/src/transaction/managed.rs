//! Transaction contexts driven by an externally managed resource.
//!
//! The engine does not own the transaction here: an external
//! [`TransactionManager`] begins, suspends, resumes and completes it. Two
//! factories differ only in how the manager is obtained:
//!
//! - [`ManagedTransactionContextFactory`] is handed the manager at
//!   configuration time;
//! - [`LocatedTransactionContextFactory`] looks the manager up by name through
//!   a [`TransactionManagerLocator`] each time a transaction begins, so the
//!   manager can be registered after the engine was configured.

use std::{collections::HashMap, fmt, sync::Arc};

use async_trait::async_trait;
use parking_lot::RwLock;

use super::{
    Phase, TransactionContext, TransactionContextFactory, TransactionCore, TransactionListener,
    TransactionState, before_commit_failpoint,
};
use crate::error::{PipelineError, PipelineResult, TransactionOperation};

/// Identifier of a transaction owned by a [`TransactionManager`].
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TransactionId(pub u64);

impl From<u64> for TransactionId {
    fn from(value: u64) -> Self {
        Self(value)
    }
}

impl fmt::Display for TransactionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Status of a transaction as reported by its [`TransactionManager`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceStatus {
    /// Running and joinable.
    Active,
    /// Running, but can only be rolled back.
    MarkedRollback,
    /// Committed.
    Committed,
    /// Rolled back.
    RolledBack,
    /// The manager does not know the transaction.
    Unknown,
}

/// External transaction coordinator.
///
/// Implementations wrap whatever owns the real resource (a connection pool
/// with its own transaction API, a distributed coordinator, ...). Errors
/// returned here are wrapped into [`PipelineError::TransactionInteraction`];
/// return [`PipelineError::Conflict`] when the resource rejected a commit
/// because of a write conflict so that the retry interceptor recognises it.
#[async_trait]
pub trait TransactionManager: Send + Sync + fmt::Debug {
    /// Begins a new transaction.
    async fn begin(&self) -> PipelineResult<TransactionId>;

    /// Commits the transaction.
    async fn commit(&self, id: TransactionId) -> PipelineResult<()>;

    /// Rolls the transaction back.
    async fn rollback(&self, id: TransactionId) -> PipelineResult<()>;

    /// Detaches the transaction from the current execution.
    async fn suspend(&self, id: TransactionId) -> PipelineResult<()>;

    /// Re-attaches a suspended transaction.
    async fn resume(&self, id: TransactionId) -> PipelineResult<()>;

    /// Marks the transaction rollback-only.
    fn set_rollback_only(&self, id: TransactionId) -> PipelineResult<()>;

    /// Reports the current status of the transaction.
    fn status(&self, id: TransactionId) -> ResourceStatus;
}

/// [`TransactionContext`] over one transaction of a [`TransactionManager`].
pub struct ManagedTransactionContext {
    manager: Arc<dyn TransactionManager>,
    id: TransactionId,
    core: TransactionCore,
}

impl fmt::Debug for ManagedTransactionContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ManagedTransactionContext")
            .field("manager", &self.manager)
            .field("id", &self.id)
            .field("core", &self.core)
            .finish()
    }
}

impl ManagedTransactionContext {
    /// Begins a transaction on `manager` and wraps it.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::TransactionInteraction`] if the manager
    /// fails to begin.
    pub async fn begin(manager: Arc<dyn TransactionManager>) -> PipelineResult<Self> {
        let id = manager
            .begin()
            .await
            .map_err(|err| PipelineError::transaction_failed(TransactionOperation::Begin, err))?;
        tracing::debug!(transaction = %id, "managed transaction begun");
        Ok(Self { manager, id, core: TransactionCore::new() })
    }

    /// Returns the manager's identifier for this transaction.
    #[must_use]
    pub fn id(&self) -> TransactionId {
        self.id
    }
}

#[async_trait]
impl TransactionContext for ManagedTransactionContext {
    #[tracing::instrument(name = "commit", skip(self), fields(transaction = %self.id))]
    async fn commit(&self) -> PipelineResult<()> {
        self.core.begin_completion(TransactionOperation::Commit, Phase::Committing)?;

        let prepared = match self.core.fire(TransactionState::Committing).await {
            Ok(()) => before_commit_failpoint(),
            Err(err) => Err(PipelineError::transaction_failed(TransactionOperation::Commit, err)),
        };
        if let Err(err) = prepared {
            if let Err(rollback_err) = self.manager.rollback(self.id).await {
                tracing::warn!(error = %rollback_err, "resource rollback failed after aborted commit");
            }
            self.core.abort_commit().await;
            return Err(err);
        }

        if let Err(err) = self.manager.commit(self.id).await {
            self.core.abort_commit().await;
            return Err(PipelineError::transaction_failed(TransactionOperation::Commit, err));
        }

        self.core.set_phase(Phase::Committed);
        tracing::debug!("managed transaction committed");
        self.core.fire(TransactionState::Committed).await
    }

    #[tracing::instrument(name = "rollback", skip(self), fields(transaction = %self.id))]
    async fn rollback(&self) -> PipelineResult<()> {
        let result = self.core.rollback_with(self.manager.rollback(self.id)).await;
        tracing::debug!("managed transaction rolled back");
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
            && matches!(
                self.manager.status(self.id),
                ResourceStatus::Active | ResourceStatus::MarkedRollback
            )
    }

    fn set_rollback_only(&self) {
        self.core.set_rollback_only();
        if let Err(err) = self.manager.set_rollback_only(self.id) {
            tracing::warn!(transaction = %self.id, error = %err, "could not mark resource rollback-only");
        }
    }

    fn is_rollback_only(&self) -> bool {
        self.core.is_rollback_only()
            || self.manager.status(self.id) == ResourceStatus::MarkedRollback
    }

    async fn suspend(&self) -> PipelineResult<()> {
        tracing::debug!(transaction = %self.id, "suspending managed transaction");
        self.manager
            .suspend(self.id)
            .await
            .map_err(|err| PipelineError::transaction_failed(TransactionOperation::Suspend, err))
    }

    async fn resume(&self) -> PipelineResult<()> {
        tracing::debug!(transaction = %self.id, "resuming managed transaction");
        self.manager
            .resume(self.id)
            .await
            .map_err(|err| PipelineError::transaction_failed(TransactionOperation::Resume, err))
    }
}

/// Factory creating [`ManagedTransactionContext`]s on a fixed manager.
#[derive(Debug, Clone)]
pub struct ManagedTransactionContextFactory {
    manager: Arc<dyn TransactionManager>,
}

impl ManagedTransactionContextFactory {
    /// Creates a factory beginning transactions on `manager`.
    pub fn new(manager: Arc<dyn TransactionManager>) -> Self {
        Self { manager }
    }
}

#[async_trait]
impl TransactionContextFactory for ManagedTransactionContextFactory {
    async fn create(&self) -> PipelineResult<Arc<dyn TransactionContext>> {
        let context = ManagedTransactionContext::begin(Arc::clone(&self.manager)).await?;
        Ok(Arc::new(context))
    }
}

/// Resolves a [`TransactionManager`] by name.
pub trait TransactionManagerLocator: Send + Sync + fmt::Debug {
    /// Returns the manager registered under `name`, if any.
    fn locate(&self, name: &str) -> Option<Arc<dyn TransactionManager>>;
}

/// In-process [`TransactionManagerLocator`] backed by a name → manager map.
#[derive(Debug, Default)]
pub struct TransactionManagerRegistry {
    managers: RwLock<HashMap<String, Arc<dyn TransactionManager>>>,
}

impl TransactionManagerRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `manager` under `name`, replacing any previous registration.
    pub fn register(&self, name: impl Into<String>, manager: Arc<dyn TransactionManager>) {
        self.managers.write().insert(name.into(), manager);
    }

    /// Removes the manager registered under `name`.
    pub fn unregister(&self, name: &str) -> Option<Arc<dyn TransactionManager>> {
        self.managers.write().remove(name)
    }
}

impl TransactionManagerLocator for TransactionManagerRegistry {
    fn locate(&self, name: &str) -> Option<Arc<dyn TransactionManager>> {
        self.managers.read().get(name).cloned()
    }
}

/// Factory looking its [`TransactionManager`] up by name on every begin.
#[derive(Debug, Clone)]
pub struct LocatedTransactionContextFactory {
    locator: Arc<dyn TransactionManagerLocator>,
    name: String,
}

impl LocatedTransactionContextFactory {
    /// Creates a factory resolving `name` through `locator`.
    pub fn new(locator: Arc<dyn TransactionManagerLocator>, name: impl Into<String>) -> Self {
        Self { locator, name: name.into() }
    }

    /// Returns the name the manager is looked up under.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }
}

#[async_trait]
impl TransactionContextFactory for LocatedTransactionContextFactory {
    async fn create(&self) -> PipelineResult<Arc<dyn TransactionContext>> {
        let manager = self.locator.locate(&self.name).ok_or_else(|| {
            PipelineError::transaction(
                TransactionOperation::Begin,
                format!("no transaction manager registered under '{}'", self.name),
            )
        })?;
        let context = ManagedTransactionContext::begin(manager).await?;
        Ok(Arc::new(context))
    }
}
