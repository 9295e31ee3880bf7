//! Context establishment: switches the application context for the call.

use async_trait::async_trait;

use super::{CommandInterceptor, Invocation, Next};
use crate::{
    command::{CommandOutput, DynCommand},
    error::PipelineResult,
};

/// Runs a command in the application context it asks for and restores the
/// previous one afterwards, on failure too.
#[derive(Debug, Default, Clone, Copy)]
pub struct ApplicationContextInterceptor;

#[async_trait]
impl CommandInterceptor for ApplicationContextInterceptor {
    async fn execute(
        &self,
        invocation: &mut Invocation<'_>,
        command: &dyn DynCommand,
        next: Next<'_>,
    ) -> PipelineResult<CommandOutput> {
        let Some(application) = command.application() else {
            return next.run(invocation, command).await;
        };

        tracing::trace!(%application, "switching application context");
        let previous = invocation.application.replace(application);
        let result = next.run(invocation, command).await;
        invocation.application = previous;
        result
    }

    fn name(&self) -> &'static str {
        "application_context"
    }
}
