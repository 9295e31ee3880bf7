//! Command Context opening and joining.

use std::sync::Arc;

use async_trait::async_trait;

use super::{CommandInterceptor, Invocation, Next};
use crate::{
    command::{CommandOutput, DynCommand},
    context::CommandContext,
    error::{PipelineError, PipelineResult},
    metrics::PipelineMetrics,
    session::SessionFactories,
    transaction::{self, TransactionContextFactory},
};

/// Opens a Command Context for the call, or joins the caller's.
///
/// A nested call joins the caller's context when it runs in the caller's
/// transaction; only the acquisition that opened a context closes it.
/// With `always_new` every call opens its own context.
///
/// When no transaction boundary ran ahead of this interceptor, a transaction
/// is begun through the local factory and completed after the context
/// closed.
#[derive(Debug, Clone)]
pub struct CommandContextInterceptor {
    always_new: bool,
    session_factories: Arc<SessionFactories>,
    local_transactions: Option<Arc<dyn TransactionContextFactory>>,
    metrics: Arc<PipelineMetrics>,
}

#[bon::bon]
impl CommandContextInterceptor {
    /// Creates the interceptor.
    #[builder]
    pub fn new(
        #[builder(default)] always_new: bool,
        session_factories: Arc<SessionFactories>,
        local_transactions: Option<Arc<dyn TransactionContextFactory>>,
        metrics: Arc<PipelineMetrics>,
    ) -> Self {
        Self { always_new, session_factories, local_transactions, metrics }
    }

    fn can_join(&self, invocation: &Invocation<'_>) -> bool {
        if self.always_new {
            return false;
        }
        let Some(outer) = invocation.outer_context() else {
            return false;
        };
        invocation
            .transaction
            .as_ref()
            .is_none_or(|transaction| Arc::ptr_eq(transaction, outer.transaction()))
    }

    async fn join(
        &self,
        invocation: &mut Invocation<'_>,
        command: &dyn DynCommand,
        next: Next<'_>,
    ) -> PipelineResult<CommandOutput> {
        let application = invocation.application.clone();
        let Some(outer) = invocation.outer.as_deref_mut() else {
            return Err(PipelineError::invalid_chain("no command context to join"));
        };
        let previous = outer.enter_nested(application);
        self.metrics.record_context_joined();
        tracing::trace!(context = outer.id(), depth = outer.nesting_depth(), "joined command context");

        invocation.joined = true;
        let result = next.run(invocation, command).await;
        invocation.joined = false;

        if let Some(outer) = invocation.outer.as_deref_mut() {
            outer.leave_nested(previous);
        }
        result
    }

    async fn open(
        &self,
        invocation: &mut Invocation<'_>,
        command: &dyn DynCommand,
        next: Next<'_>,
    ) -> PipelineResult<CommandOutput> {
        let (transaction, owned) = match invocation.transaction.clone() {
            Some(transaction) => (transaction, false),
            None => {
                let Some(factory) = &self.local_transactions else {
                    return Err(PipelineError::invalid_chain(
                        "command context opened without a transaction boundary or local factory",
                    ));
                };
                let transaction = factory.create().await?;
                self.metrics.record_transaction_begun();
                (transaction, true)
            },
        };

        let context = CommandContext::new(
            Arc::clone(&transaction),
            Arc::clone(&self.session_factories),
            invocation.application.clone(),
        );
        self.metrics.record_context_opened();
        tracing::trace!(context = context.id(), "opened command context");

        let previous = invocation.current.replace(context);
        let result = next.run(invocation, command).await;
        let Some(context) = std::mem::replace(&mut invocation.current, previous) else {
            return Err(PipelineError::invalid_chain("command context removed while executing"));
        };

        let failure = result.as_ref().err();
        let closed = context.close(failure).await;
        let result = match (result, closed) {
            (Ok(output), Ok(())) => Ok(output),
            (Ok(_), Err(teardown)) => Err(teardown),
            (Err(err), _) => Err(err),
        };

        if owned {
            transaction::complete(transaction.as_ref(), result, &self.metrics).await
        } else {
            result
        }
    }
}

#[async_trait]
impl CommandInterceptor for CommandContextInterceptor {
    async fn execute(
        &self,
        invocation: &mut Invocation<'_>,
        command: &dyn DynCommand,
        next: Next<'_>,
    ) -> PipelineResult<CommandOutput> {
        if self.can_join(invocation) {
            self.join(invocation, command, next).await
        } else {
            self.open(invocation, command, next).await
        }
    }

    fn name(&self) -> &'static str {
        "command_context"
    }
}
