//! Command interceptors and the immutable chain linking them.
//!
//! An [`InterceptorChain`] is an ordered, immutable list of
//! [`CommandInterceptor`]s ending in the terminal [`CommandInvoker`]. Each
//! interceptor performs its concern and forwards to the rest of the chain
//! through [`Next`]. Per-call state never lives in an interceptor: it is
//! carried by the [`Invocation`] handle threaded through the chain.
//!
//! # Default Order
//!
//! ```text
//! Retry → ErrorCode → Logging → Counter → ApplicationContext
//!       → TransactionBoundary → CommandContext → CommandInvoker
//! ```
//!
//! Custom interceptors are inserted before and after the core sequence; see
//! [`PipelineConfig`](crate::config::PipelineConfig).

mod application;
mod boundary;
mod command_context;
mod counter;
mod error_code;
mod logging;
mod retry;

use std::{fmt, sync::Arc};

use async_trait::async_trait;

pub use self::{
    application::ApplicationContextInterceptor,
    boundary::{Propagation, TransactionBoundaryInterceptor},
    command_context::CommandContextInterceptor,
    counter::{CommandCounter, CounterInterceptor},
    error_code::{
        ErrorCodeInterceptor, ErrorCodeProvider, FALLBACK_ERROR_CODE, MAX_CUSTOM_ERROR_CODE,
        MIN_CUSTOM_ERROR_CODE, OPTIMISTIC_LOCKING_ERROR_CODE,
    },
    logging::LoggingInterceptor,
    retry::RetryInterceptor,
};
use crate::{
    command::{ApplicationContext, CommandOutput, DynCommand},
    context::CommandContext,
    error::{ConfigError, PipelineError, PipelineResult},
    transaction::TransactionContext,
};

/// One node of an [`InterceptorChain`].
///
/// Interceptors are shared between all concurrent invocations and must keep
/// per-call state in the [`Invocation`].
#[async_trait]
pub trait CommandInterceptor: Send + Sync + fmt::Debug {
    /// Performs this interceptor's concern and forwards to `next`.
    async fn execute(
        &self,
        invocation: &mut Invocation<'_>,
        command: &dyn DynCommand,
        next: Next<'_>,
    ) -> PipelineResult<CommandOutput>;

    /// Short name used in diagnostics.
    fn name(&self) -> &'static str {
        std::any::type_name::<Self>()
    }

    /// Returns `true` for the interceptor that runs the command body.
    ///
    /// A chain must end in exactly one terminal interceptor.
    fn is_terminal(&self) -> bool {
        false
    }
}

/// The remainder of the chain after the current interceptor.
///
/// `Next` is `Copy`: the retry interceptor runs it once per attempt.
#[derive(Clone, Copy)]
pub struct Next<'a> {
    rest: &'a [Arc<dyn CommandInterceptor>],
}

impl fmt::Debug for Next<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.rest.iter().map(|interceptor| interceptor.name())).finish()
    }
}

impl Next<'_> {
    /// Runs the rest of the chain.
    ///
    /// # Errors
    ///
    /// Returns a configuration error if the chain is exhausted without
    /// reaching a terminal interceptor, otherwise whatever the rest of the
    /// chain returns.
    pub async fn run(
        self,
        invocation: &mut Invocation<'_>,
        command: &dyn DynCommand,
    ) -> PipelineResult<CommandOutput> {
        match self.rest.split_first() {
            Some((head, rest)) => head.execute(invocation, command, Next { rest }).await,
            None => Err(PipelineError::invalid_chain(
                "chain exhausted without reaching the command invoker",
            )),
        }
    }
}

/// Per-call state threaded through the chain.
///
/// Replaces ambient per-thread stacks: nesting, the Command Context opened by
/// this call, the active transaction and the current application context are
/// all explicit here.
pub struct Invocation<'a> {
    outer: Option<&'a mut CommandContext>,
    current: Option<CommandContext>,
    joined: bool,
    transaction: Option<Arc<dyn TransactionContext>>,
    application: Option<ApplicationContext>,
}

impl fmt::Debug for Invocation<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Invocation")
            .field("outer", &self.outer.as_ref().map(|ctx| ctx.id()))
            .field("current", &self.current.as_ref().map(CommandContext::id))
            .field("joined", &self.joined)
            .field("transaction", &self.transaction)
            .field("application", &self.application)
            .finish()
    }
}

impl<'a> Invocation<'a> {
    /// Invocation of a command issued outside any command body.
    pub(crate) fn top_level() -> Self {
        Self { outer: None, current: None, joined: false, transaction: None, application: None }
    }

    /// Invocation of a command issued from inside the body of another one.
    pub(crate) fn nested(outer: &'a mut CommandContext) -> Self {
        let application = outer.application().cloned();
        Self { outer: Some(outer), current: None, joined: false, transaction: None, application }
    }

    /// Returns `true` if this call runs inside another command's body.
    #[must_use]
    pub fn is_nested(&self) -> bool {
        self.outer.is_some()
    }

    /// The caller's open Command Context, if this call is nested.
    #[must_use]
    pub fn outer_context(&self) -> Option<&CommandContext> {
        self.outer.as_deref()
    }

    /// The Command Context the command body runs in, once one was opened or
    /// joined.
    pub fn command_context_mut(&mut self) -> Option<&mut CommandContext> {
        if self.current.is_some() {
            self.current.as_mut()
        } else if self.joined {
            self.outer.as_deref_mut()
        } else {
            None
        }
    }

    /// The transaction established for this call, falling back to the
    /// caller's.
    #[must_use]
    pub fn active_transaction(&self) -> Option<&Arc<dyn TransactionContext>> {
        self.transaction.as_ref().or_else(|| self.outer.as_ref().map(|ctx| ctx.transaction()))
    }

    /// The application context the command runs in.
    #[must_use]
    pub fn application(&self) -> Option<&ApplicationContext> {
        self.application.as_ref()
    }
}

/// Immutable, assembled chain of interceptors.
///
/// Cheap to clone; all clones share the same nodes.
#[derive(Clone)]
pub struct InterceptorChain {
    interceptors: Arc<[Arc<dyn CommandInterceptor>]>,
}

impl fmt::Debug for InterceptorChain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.names()).finish()
    }
}

impl InterceptorChain {
    /// Links `interceptors` into a chain.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::InvalidChain`] if the list is empty, does not
    /// end in a terminal interceptor, or contains a terminal interceptor
    /// anywhere else.
    pub fn new(interceptors: Vec<Arc<dyn CommandInterceptor>>) -> Result<Self, ConfigError> {
        let Some((last, head)) = interceptors.split_last() else {
            return Err(ConfigError::InvalidChain { reason: "interceptor list is empty".into() });
        };
        if !last.is_terminal() {
            return Err(ConfigError::InvalidChain {
                reason: format!("last interceptor {} is not terminal", last.name()),
            });
        }
        if let Some(position) = head.iter().position(|interceptor| interceptor.is_terminal()) {
            return Err(ConfigError::InvalidChain {
                reason: format!(
                    "terminal interceptor {} at position {position} is not last",
                    head[position].name()
                ),
            });
        }
        Ok(Self { interceptors: interceptors.into() })
    }

    /// Names of the interceptors, head first.
    #[must_use]
    pub fn names(&self) -> Vec<&'static str> {
        self.interceptors.iter().map(|interceptor| interceptor.name()).collect()
    }

    /// Number of interceptors, the terminal one included.
    #[must_use]
    pub fn len(&self) -> usize {
        self.interceptors.len()
    }

    /// Always `false`: an assembled chain holds at least the terminal
    /// interceptor.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.interceptors.is_empty()
    }

    /// Runs `command` through the whole chain.
    pub(crate) async fn invoke(
        &self,
        invocation: &mut Invocation<'_>,
        command: &dyn DynCommand,
    ) -> PipelineResult<CommandOutput> {
        Next { rest: &self.interceptors }.run(invocation, command).await
    }
}

/// Terminal interceptor: runs the command body against the open Command
/// Context.
#[derive(Debug, Default, Clone, Copy)]
pub struct CommandInvoker;

#[async_trait]
impl CommandInterceptor for CommandInvoker {
    async fn execute(
        &self,
        invocation: &mut Invocation<'_>,
        command: &dyn DynCommand,
        _next: Next<'_>,
    ) -> PipelineResult<CommandOutput> {
        let context = invocation.command_context_mut().ok_or_else(|| {
            PipelineError::invalid_chain("command invoker reached without an open command context")
        })?;
        command.execute_dyn(context).await
    }

    fn name(&self) -> &'static str {
        "command_invoker"
    }

    fn is_terminal(&self) -> bool {
        true
    }
}
