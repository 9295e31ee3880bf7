//! Command executors: the assembled chains commands are run through.
//!
//! [`CommandExecutors::new`] assembles three chains from one
//! [`PipelineConfig`]:
//!
//! | Executor | Transaction | Command Context |
//! |----------|-------------|-----------------|
//! | [`tx_required`](CommandExecutors::tx_required) | joins or begins | joins or opens |
//! | [`tx_requires_new`](CommandExecutors::tx_requires_new) | suspends and begins | always opens |
//! | [`schema_operations`](CommandExecutors::schema_operations) | own standalone | always opens |
//!
//! Chain order is computed by [`default_interceptors`], a pure function of
//! the configured features.

use std::{any::type_name, sync::Arc};

use crate::{
    command::Command,
    config::PipelineConfig,
    context::CommandContext,
    error::{ConfigError, PipelineError, PipelineResult},
    interceptor::{
        ApplicationContextInterceptor, CommandContextInterceptor, CommandInterceptor,
        CommandInvoker, CounterInterceptor, ErrorCodeInterceptor, InterceptorChain, Invocation,
        LoggingInterceptor, Propagation, RetryInterceptor, TransactionBoundaryInterceptor,
    },
    transaction::{StandaloneTransactionContextFactory, TransactionContextFactory},
};

/// Which of the three chains is being assembled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChainMode {
    /// Join the caller's transaction and Command Context when nested.
    TxRequired,
    /// Always run in a new transaction and a new Command Context.
    TxRequiresNew,
    /// Minimal chain for schema and bootstrap operations.
    SchemaOperations,
}

/// Optional features of the core sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ChainFlags {
    /// Include the conflict retry interceptor.
    pub retry: bool,
    /// Include the error-code interceptor.
    pub error_codes: bool,
}

impl ChainFlags {
    /// Flags enabled by `config`.
    #[must_use]
    pub fn from_config(config: &PipelineConfig) -> Self {
        Self { retry: config.retry().is_some(), error_codes: config.error_codes() }
    }
}

/// One core interceptor, before it is instantiated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum InterceptorKind {
    /// [`RetryInterceptor`].
    Retry,
    /// [`ErrorCodeInterceptor`].
    ErrorCode,
    /// [`LoggingInterceptor`].
    Logging,
    /// [`CounterInterceptor`].
    Counter,
    /// [`ApplicationContextInterceptor`].
    ApplicationContext,
    /// [`TransactionBoundaryInterceptor`].
    TransactionBoundary(Propagation),
    /// [`CommandContextInterceptor`].
    CommandContext {
        /// Never join the caller's Command Context.
        always_new: bool,
    },
}

/// The core interceptor sequence of a chain, outermost first.
///
/// Custom interceptors and the terminal invoker are not part of the core
/// sequence.
#[must_use]
pub fn default_interceptors(flags: ChainFlags, mode: ChainMode) -> Vec<InterceptorKind> {
    let propagation = match mode {
        ChainMode::TxRequired => Propagation::Required,
        ChainMode::TxRequiresNew => Propagation::RequiresNew,
        ChainMode::SchemaOperations => {
            return vec![
                InterceptorKind::Logging,
                InterceptorKind::Counter,
                InterceptorKind::CommandContext { always_new: true },
            ];
        },
    };

    let mut kinds = Vec::with_capacity(7);
    if flags.retry {
        kinds.push(InterceptorKind::Retry);
    }
    if flags.error_codes {
        kinds.push(InterceptorKind::ErrorCode);
    }
    kinds.extend([
        InterceptorKind::Logging,
        InterceptorKind::Counter,
        InterceptorKind::ApplicationContext,
        InterceptorKind::TransactionBoundary(propagation),
        InterceptorKind::CommandContext { always_new: propagation == Propagation::RequiresNew },
    ]);
    kinds
}

fn instantiate(
    kind: InterceptorKind,
    mode: ChainMode,
    config: &PipelineConfig,
) -> Result<Arc<dyn CommandInterceptor>, ConfigError> {
    let metrics = Arc::clone(config.metrics());
    let interceptor: Arc<dyn CommandInterceptor> = match kind {
        InterceptorKind::Retry => {
            let Some(retry) = config.retry() else {
                return Err(ConfigError::InvalidChain {
                    reason: "retry interceptor requested without a retry configuration".into(),
                });
            };
            Arc::new(RetryInterceptor::new(*retry, Arc::clone(config.conflict_predicate()), metrics))
        },
        InterceptorKind::ErrorCode => Arc::new(match config.error_code_provider() {
            Some(provider) => ErrorCodeInterceptor::with_provider(Arc::clone(provider)),
            None => ErrorCodeInterceptor::new(),
        }),
        InterceptorKind::Logging => Arc::new(LoggingInterceptor),
        InterceptorKind::Counter => {
            Arc::new(CounterInterceptor::new(Arc::clone(config.counter()), metrics))
        },
        InterceptorKind::ApplicationContext => Arc::new(ApplicationContextInterceptor),
        InterceptorKind::TransactionBoundary(propagation) => Arc::new(
            TransactionBoundaryInterceptor::new(
                propagation,
                config.transaction_strategy().factory(),
                metrics,
            ),
        ),
        InterceptorKind::CommandContext { always_new } => Arc::new(
            CommandContextInterceptor::builder()
                .always_new(always_new)
                .session_factories(Arc::clone(config.session_factories()))
                .maybe_local_transactions(
                    (mode == ChainMode::SchemaOperations)
                        .then(|| {
                            Arc::new(StandaloneTransactionContextFactory)
                                as Arc<dyn TransactionContextFactory>
                        }),
                )
                .metrics(metrics)
                .build(),
        ),
    };
    Ok(interceptor)
}

/// Assembles the chain for `mode`: custom pre, core, custom post, invoker.
fn assemble(config: &PipelineConfig, mode: ChainMode) -> Result<InterceptorChain, ConfigError> {
    let (pre, post): (&[_], &[_]) = match mode {
        ChainMode::TxRequired => config.custom_interceptors(),
        ChainMode::TxRequiresNew => config.requires_new_custom_interceptors(),
        ChainMode::SchemaOperations => (&[], &[]),
    };

    let mut interceptors = pre.to_vec();
    for kind in default_interceptors(ChainFlags::from_config(config), mode) {
        interceptors.push(instantiate(kind, mode, config)?);
    }
    interceptors.extend_from_slice(post);
    interceptors.push(Arc::new(CommandInvoker));

    InterceptorChain::new(interceptors)
}

/// Entry point running commands through one assembled chain.
#[derive(Debug, Clone)]
pub struct CommandExecutor {
    chain: InterceptorChain,
}

impl CommandExecutor {
    /// Creates an executor over an already assembled chain.
    #[must_use]
    pub fn new(chain: InterceptorChain) -> Self {
        Self { chain }
    }

    /// The chain this executor runs.
    #[must_use]
    pub fn chain(&self) -> &InterceptorChain {
        &self.chain
    }

    /// Executes `command` as a top-level invocation.
    ///
    /// # Errors
    ///
    /// Returns whatever the chain returns: the command's own failure, a
    /// conflict left after the last retry, a commit failure or a teardown
    /// failure.
    pub async fn execute<C: Command>(&self, command: C) -> PipelineResult<C::Output> {
        let mut invocation = Invocation::top_level();
        let output = self.chain.invoke(&mut invocation, &command).await?;
        downcast::<C>(output)
    }

    /// Executes `command` from inside the body of another command running in
    /// `context`.
    ///
    /// Through a `TxRequired` executor the call joins `context` and its
    /// transaction; through a `TxRequiresNew` executor it runs in its own
    /// transaction and Command Context while `context` stays untouched.
    ///
    /// # Errors
    ///
    /// See [`execute`](Self::execute).
    pub async fn execute_within<C: Command>(
        &self,
        context: &mut CommandContext,
        command: C,
    ) -> PipelineResult<C::Output> {
        let mut invocation = Invocation::nested(context);
        let output = self.chain.invoke(&mut invocation, &command).await?;
        downcast::<C>(output)
    }
}

fn downcast<C: Command>(output: Box<dyn std::any::Any + Send>) -> PipelineResult<C::Output> {
    output.downcast::<C::Output>().map(|output| *output).map_err(|_| {
        PipelineError::invalid_chain(format!(
            "interceptor replaced the output of {}",
            type_name::<C>()
        ))
    })
}

/// The three executors assembled from one configuration.
#[derive(Debug, Clone)]
pub struct CommandExecutors {
    tx_required: CommandExecutor,
    tx_requires_new: CommandExecutor,
    schema_operations: CommandExecutor,
}

impl CommandExecutors {
    /// Assembles all chains from `config`.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if a chain cannot be assembled.
    pub fn new(config: &PipelineConfig) -> Result<Self, ConfigError> {
        let executors = Self {
            tx_required: CommandExecutor::new(assemble(config, ChainMode::TxRequired)?),
            tx_requires_new: CommandExecutor::new(assemble(config, ChainMode::TxRequiresNew)?),
            schema_operations: CommandExecutor::new(assemble(
                config,
                ChainMode::SchemaOperations,
            )?),
        };
        tracing::debug!(
            tx_required = ?executors.tx_required.chain(),
            tx_requires_new = ?executors.tx_requires_new.chain(),
            "command executors assembled",
        );
        Ok(executors)
    }

    /// Executor joining the caller's transaction.
    #[must_use]
    pub fn tx_required(&self) -> &CommandExecutor {
        &self.tx_required
    }

    /// Executor always running in a new transaction.
    #[must_use]
    pub fn tx_requires_new(&self) -> &CommandExecutor {
        &self.tx_requires_new
    }

    /// Executor for schema and bootstrap operations.
    #[must_use]
    pub fn schema_operations(&self) -> &CommandExecutor {
        &self.schema_operations
    }
}
