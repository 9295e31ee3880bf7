//! Command logging.

use async_trait::async_trait;

use super::{CommandInterceptor, Invocation, Next};
use crate::{
    command::{CommandOutput, DynCommand},
    error::PipelineResult,
};

/// Opens a `command` span around the rest of the chain.
///
/// The span carries the command name and whether the call is nested;
/// failures are logged at `debug` since the caller decides their severity.
#[derive(Debug, Default, Clone, Copy)]
pub struct LoggingInterceptor;

#[async_trait]
impl CommandInterceptor for LoggingInterceptor {
    #[tracing::instrument(
        name = "command",
        skip_all,
        fields(command = command.name(), nested = invocation.is_nested())
    )]
    async fn execute(
        &self,
        invocation: &mut Invocation<'_>,
        command: &dyn DynCommand,
        next: Next<'_>,
    ) -> PipelineResult<CommandOutput> {
        tracing::debug!("executing command");
        let result = next.run(invocation, command).await;
        match &result {
            Ok(_) => tracing::debug!("command finished"),
            Err(err) => tracing::debug!(error = %err, kind = %err.kind(), "command failed"),
        }
        result
    }

    fn name(&self) -> &'static str {
        "logging"
    }
}
