//! Commands: the units of work executed through the pipeline.
//!
//! A [`Command`] is a stateless value describing one engine operation. The
//! pipeline hands it the open [`CommandContext`] and returns its typed
//! output. Interceptors only ever see the type-erased [`DynCommand`] view, so
//! one immutable chain serves every command type.

use std::{
    any::{Any, type_name},
    fmt,
    sync::Arc,
};

use async_trait::async_trait;

use crate::{context::CommandContext, error::PipelineResult};

/// Type-erased command output passed back through the interceptor chain.
pub type CommandOutput = Box<dyn Any + Send>;

/// Identity of the application a command runs on behalf of.
///
/// Switched in and out by the context-establishment interceptor and exposed
/// through [`CommandContext::application`].
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ApplicationContext {
    name: Arc<str>,
}

impl ApplicationContext {
    /// Creates an application context with the given name.
    pub fn new(name: impl Into<Arc<str>>) -> Self {
        Self { name: name.into() }
    }

    /// Returns the application name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }
}

impl fmt::Display for ApplicationContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)
    }
}

/// One engine operation.
///
/// # Retries
///
/// When the conflict retry interceptor is configured, a command may be
/// executed more than once. Each attempt gets a fresh command context and a
/// fresh transaction. Commands with effects outside the transaction should
/// return `false` from [`is_retryable`](Command::is_retryable).
///
/// # Example
///
/// ```
/// use async_trait::async_trait;
/// use process_engine_command::{Command, CommandContext, PipelineResult};
///
/// struct CountOpenSessions;
///
/// #[async_trait]
/// impl Command for CountOpenSessions {
///     type Output = usize;
///
///     async fn execute(&self, context: &mut CommandContext) -> PipelineResult<usize> {
///         Ok(context.open_session_count())
///     }
/// }
/// ```
#[async_trait]
pub trait Command: Send + Sync {
    /// Value produced by a successful execution.
    type Output: Send + 'static;

    /// Runs the command body against the open unit of work.
    async fn execute(&self, context: &mut CommandContext) -> PipelineResult<Self::Output>;

    /// Diagnostic name used in logs and spans.
    fn name(&self) -> &'static str {
        type_name::<Self>()
    }

    /// Whether the conflict retry interceptor may re-run this command.
    fn is_retryable(&self) -> bool {
        true
    }

    /// Application context the command must run in, if any.
    fn application(&self) -> Option<ApplicationContext> {
        None
    }
}

/// Object-safe view of a [`Command`], as seen by interceptors.
///
/// Implemented for every [`Command`]; there is no need to implement it by
/// hand.
#[async_trait]
pub trait DynCommand: Send + Sync {
    /// See [`Command::name`].
    fn name(&self) -> &'static str;

    /// See [`Command::is_retryable`].
    fn is_retryable(&self) -> bool;

    /// See [`Command::application`].
    fn application(&self) -> Option<ApplicationContext>;

    /// Runs the command body and boxes its output.
    async fn execute_dyn(&self, context: &mut CommandContext) -> PipelineResult<CommandOutput>;
}

#[async_trait]
impl<C: Command> DynCommand for C {
    fn name(&self) -> &'static str {
        Command::name(self)
    }

    fn is_retryable(&self) -> bool {
        Command::is_retryable(self)
    }

    fn application(&self) -> Option<ApplicationContext> {
        Command::application(self)
    }

    async fn execute_dyn(&self, context: &mut CommandContext) -> PipelineResult<CommandOutput> {
        let output = Command::execute(self, context).await?;
        Ok(Box::new(output))
    }
}
