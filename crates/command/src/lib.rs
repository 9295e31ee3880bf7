//! Command execution and transaction pipeline for a process engine.
//!
//! Every externally visible engine operation is a [`Command`] executed
//! through an immutable chain of interceptors that ends in a unit of work,
//! the [`CommandContext`]. The context owns the sessions the command opens
//! and is bound to exactly one [`TransactionContext`], which is committed or
//! rolled back once per top-level call.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                 CommandExecutor::execute                    │
//! ├─────────────────────────────────────────────────────────────┤
//! │  Retry → ErrorCode → Logging → Counter → ApplicationContext │
//! │          (custom pre / post interceptors around the core)   │
//! ├─────────────────────────────────────────────────────────────┤
//! │                  TransactionBoundary                        │
//! │     Required: join or begin │ RequiresNew: suspend, begin   │
//! ├─────────────────────────────────────────────────────────────┤
//! │              CommandContext (open or join)                  │
//! │        sessions │ close listeners │ nesting depth           │
//! ├─────────────────────────────────────────────────────────────┤
//! │                    CommandInvoker                           │
//! │                  Command::execute                           │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! On the way out the Command Context flushes and closes its sessions, then
//! the transaction boundary commits or rolls back, firing transaction
//! listeners for every state reached.
//!
//! # Quick Start
//!
//! ```
//! use async_trait::async_trait;
//! use process_engine_command::{
//!     Command, CommandContext, CommandExecutors, PipelineConfig, PipelineResult,
//! };
//!
//! struct Greet(&'static str);
//!
//! #[async_trait]
//! impl Command for Greet {
//!     type Output = String;
//!
//!     async fn execute(&self, _context: &mut CommandContext) -> PipelineResult<String> {
//!         Ok(format!("hello {}", self.0))
//!     }
//! }
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = PipelineConfig::builder().build()?;
//!     let executors = CommandExecutors::new(&config)?;
//!
//!     let greeting = executors.tx_required().execute(Greet("world")).await?;
//!     assert_eq!(greeting, "hello world");
//!     assert_eq!(config.metrics().snapshot().commits, 1);
//!     Ok(())
//! }
//! ```
//!
//! # Nested Commands
//!
//! A command body may run further commands through
//! [`CommandExecutor::execute_within`]. Through the `TxRequired` executor
//! the nested command joins the caller's Command Context and transaction;
//! nothing is committed until the outermost command returns. Through the
//! `TxRequiresNew` executor it runs and commits independently.
//!
//! # Error Handling
//!
//! All operations return [`PipelineResult<T>`]. Every [`PipelineError`]
//! carries an [`ErrorKind`]; write conflicts are recognised by
//! [`PipelineError::is_conflict`] and retried by the optional retry
//! interceptor.
//!
//! # Feature Flags
//!
//! - **`testutil`**: Enables the `testutil` module with shared test helpers (recording transaction
//!   manager, recording sessions, listener recorder, assertion macros). Enable this in
//!   `[dev-dependencies]` for integration tests.
//! - **`failpoints`**: Enables the `transaction-before-commit`, `session-before-flush` and
//!   `command-retry-before-sleep` fail points.

#![deny(unsafe_code)]

pub mod command;
pub mod config;
pub mod context;
pub mod error;
pub mod executor;
pub mod interceptor;
pub mod metrics;
pub mod session;
#[cfg(any(test, feature = "testutil"))]
#[allow(clippy::expect_used)]
pub mod testutil;
pub mod transaction;

// Re-export primary types at crate root for convenience
pub use command::{ApplicationContext, Command, CommandOutput, DynCommand};
pub use config::{
    ConflictPredicate, DEFAULT_INITIAL_BACKOFF, DEFAULT_MAX_ATTEMPTS, DEFAULT_MAX_BACKOFF,
    PipelineConfig, RetryConfig, TransactionStrategy,
};
pub use context::{CloseListenerScope, CommandContext};
pub use error::{BoxError, ConfigError, ErrorKind, PipelineError, PipelineResult, TransactionOperation};
pub use executor::{ChainFlags, ChainMode, CommandExecutor, CommandExecutors, InterceptorKind};
pub use interceptor::{CommandInterceptor, InterceptorChain, Invocation, Next, Propagation};
pub use metrics::{MetricsSnapshot, PipelineMetrics};
pub use session::{Session, SessionFactories, SessionFactory};
pub use transaction::{
    TransactionContext, TransactionContextFactory, TransactionListener, TransactionState,
};
