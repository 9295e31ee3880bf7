//! Transaction boundary.

use std::sync::Arc;

use async_trait::async_trait;

use super::{CommandInterceptor, Invocation, Next};
use crate::{
    command::{CommandOutput, DynCommand},
    error::{PipelineError, PipelineResult, TransactionOperation},
    metrics::PipelineMetrics,
    transaction::{self, TransactionContextFactory},
};

/// How a transaction boundary relates to the caller's transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Propagation {
    /// Join the caller's active transaction, or begin one if there is none.
    Required,
    /// Suspend the caller's transaction and always begin a new one.
    RequiresNew,
}

/// Begins, joins or suspends transactions around the rest of the chain.
///
/// A transaction begun here is completed here, after the Command Context
/// inside it closed: committed on success unless marked rollback-only,
/// rolled back otherwise. A joined transaction is left to its owner.
#[derive(Debug, Clone)]
pub struct TransactionBoundaryInterceptor {
    propagation: Propagation,
    factory: Arc<dyn TransactionContextFactory>,
    metrics: Arc<PipelineMetrics>,
}

impl TransactionBoundaryInterceptor {
    /// Creates a boundary beginning transactions through `factory`.
    pub fn new(
        propagation: Propagation,
        factory: Arc<dyn TransactionContextFactory>,
        metrics: Arc<PipelineMetrics>,
    ) -> Self {
        Self { propagation, factory, metrics }
    }

    /// The propagation this boundary applies.
    #[must_use]
    pub fn propagation(&self) -> Propagation {
        self.propagation
    }

    async fn run_in_new_transaction(
        &self,
        invocation: &mut Invocation<'_>,
        command: &dyn DynCommand,
        next: Next<'_>,
    ) -> PipelineResult<CommandOutput> {
        let transaction = self.factory.create().await?;
        self.metrics.record_transaction_begun();
        tracing::debug!(?transaction, propagation = ?self.propagation, "transaction begun");

        let previous = invocation.transaction.replace(Arc::clone(&transaction));
        let result = next.run(invocation, command).await;
        invocation.transaction = previous;

        transaction::complete(transaction.as_ref(), result, &self.metrics).await
    }
}

#[async_trait]
impl CommandInterceptor for TransactionBoundaryInterceptor {
    async fn execute(
        &self,
        invocation: &mut Invocation<'_>,
        command: &dyn DynCommand,
        next: Next<'_>,
    ) -> PipelineResult<CommandOutput> {
        let active = invocation
            .active_transaction()
            .filter(|transaction| transaction.is_transaction_active())
            .cloned();

        match (self.propagation, active) {
            (Propagation::Required, Some(active)) => {
                let previous = invocation.transaction.replace(active);
                let result = next.run(invocation, command).await;
                invocation.transaction = previous;
                result
            },
            (Propagation::Required, None) | (Propagation::RequiresNew, None) => {
                self.run_in_new_transaction(invocation, command, next).await
            },
            (Propagation::RequiresNew, Some(suspended)) => {
                suspended
                    .suspend()
                    .await
                    .map_err(|err| PipelineError::transaction_failed(TransactionOperation::Suspend, err))?;
                tracing::debug!(?suspended, "transaction suspended");

                let result = self.run_in_new_transaction(invocation, command, next).await;

                match suspended.resume().await {
                    Ok(()) => result,
                    Err(err) => {
                        let err = PipelineError::transaction_failed(TransactionOperation::Resume, err);
                        match result {
                            Ok(_) => Err(err),
                            Err(cause) => {
                                tracing::warn!(error = %err, cause = %cause, "resume failed after inner failure");
                                Err(cause)
                            },
                        }
                    },
                }
            },
        }
    }

    fn name(&self) -> &'static str {
        "transaction_boundary"
    }
}
