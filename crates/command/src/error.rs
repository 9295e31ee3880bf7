//! Pipeline error types and result alias.
//!
//! Every failure leaving a [`CommandExecutor`](crate::CommandExecutor) is a
//! [`PipelineError`]. Each variant maps to exactly one [`ErrorKind`], which
//! is what the retry interceptor and callers branch on instead of inspecting
//! the error graph.
//!
//! # Error Kinds
//!
//! - [`ErrorKind::Configuration`] - Invalid chain or missing collaborator; never retried
//! - [`ErrorKind::Command`] - The command body itself failed
//! - [`ErrorKind::Conflict`] - Storage-detected write conflict; candidate for retry
//! - [`ErrorKind::TransactionInteraction`] - Begin, commit, rollback or a transaction listener
//!   failed
//! - [`ErrorKind::Teardown`] - A close listener or session close failed
//!
//! # Example
//!
//! ```
//! use process_engine_command::{ErrorKind, PipelineError, PipelineResult};
//!
//! fn load(id: &str) -> PipelineResult<()> {
//!     Err(PipelineError::command(format!("task {id} is suspended")))
//! }
//!
//! assert_eq!(load("t-1").unwrap_err().kind(), ErrorKind::Command);
//! ```

use std::{fmt, sync::Arc};

use thiserror::Error;

use crate::transaction::TransactionState;

/// A boxed error type for source chain tracking.
pub type BoxError = Arc<dyn std::error::Error + Send + Sync>;

/// Result type alias for pipeline operations.
pub type PipelineResult<T> = Result<T, PipelineError>;

/// Classification of a [`PipelineError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Invalid configuration; surfaced at startup or on first use.
    Configuration,
    /// The business operation failed.
    Command,
    /// Optimistic concurrency conflict reported by storage.
    Conflict,
    /// Begin, commit, rollback, suspend or resume of the transactional resource failed.
    TransactionInteraction,
    /// Unit-of-work teardown failed.
    Teardown,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Configuration => write!(f, "configuration"),
            Self::Command => write!(f, "command"),
            Self::Conflict => write!(f, "conflict"),
            Self::TransactionInteraction => write!(f, "transaction_interaction"),
            Self::Teardown => write!(f, "teardown"),
        }
    }
}

/// The operation being performed on a transactional resource when it failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransactionOperation {
    /// Starting a new transaction.
    Begin,
    /// Committing.
    Commit,
    /// Rolling back.
    Rollback,
    /// Detaching the transaction from the current execution.
    Suspend,
    /// Re-attaching a previously suspended transaction.
    Resume,
}

impl fmt::Display for TransactionOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Begin => write!(f, "begin"),
            Self::Commit => write!(f, "commit"),
            Self::Rollback => write!(f, "rollback"),
            Self::Suspend => write!(f, "suspend"),
            Self::Resume => write!(f, "resume"),
        }
    }
}

/// Configuration validation errors.
///
/// Returned by the `bon` builders in [`config`](crate::config) and by
/// [`InterceptorChain::new`](crate::InterceptorChain::new).
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[non_exhaustive]
pub enum ConfigError {
    /// A numeric field is below its allowed minimum.
    #[error("{field} must be at least {min}, got {value}")]
    BelowMinimum {
        /// Name of the offending field.
        field: &'static str,
        /// Smallest accepted value.
        min: String,
        /// Value that was supplied.
        value: String,
    },

    /// Two related fields are inconsistent with each other.
    #[error("{field} must not exceed {limit_field} ({value} > {limit})")]
    ExceedsLimit {
        /// Name of the offending field.
        field: &'static str,
        /// Value that was supplied.
        value: String,
        /// Name of the field bounding it.
        limit_field: &'static str,
        /// Value of the bounding field.
        limit: String,
    },

    /// A required text field is empty.
    #[error("{field} must not be empty")]
    Empty {
        /// Name of the offending field.
        field: &'static str,
    },

    /// The interceptor chain definition is unusable.
    #[error("invalid command interceptor chain: {reason}")]
    InvalidChain {
        /// Why the chain was rejected.
        reason: String,
    },
}

/// Errors produced while executing a command through the pipeline.
///
/// Errors preserve their source chain via the `#[source]` attribute.
///
/// # Non-exhaustive
///
/// New variants may be added in minor releases. Match on [`kind`](Self::kind)
/// when only the classification matters.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum PipelineError {
    /// Invalid configuration.
    #[error("Configuration error: {0}")]
    Configuration(#[from] ConfigError),

    /// A session type was requested that has no registered factory.
    #[error("No session factory registered for {session_type}")]
    MissingSessionFactory {
        /// Rust type name of the requested session.
        session_type: &'static str,
    },

    /// The command body failed.
    #[error("Command failed: {message}")]
    Command {
        /// Description of the failure.
        message: String,
        /// The underlying error, if any.
        #[source]
        source: Option<BoxError>,
    },

    /// Optimistic concurrency conflict.
    ///
    /// Another writer modified the same state first. The whole unit of work
    /// is safe to retry from the top.
    #[error("Optimistic conflict: {message}")]
    Conflict {
        /// Description of the conflicting write.
        message: String,
        /// The underlying storage error, if any.
        #[source]
        source: Option<BoxError>,
    },

    /// Interacting with the transactional resource failed.
    #[error("Transaction {operation} failed: {message}")]
    TransactionInteraction {
        /// The operation that failed.
        operation: TransactionOperation,
        /// Description of the failure.
        message: String,
        /// Whether the resource reported the failure as a write conflict.
        conflict: bool,
        /// The underlying error, if any.
        #[source]
        source: Option<BoxError>,
    },

    /// One or more transaction listeners failed while a state was fired.
    ///
    /// All listeners registered for `state` ran; `source` is the first
    /// failure and `suppressed` holds the rest in firing order.
    #[error("{} transaction listener(s) failed on {state}", suppressed.len() + 1)]
    TransactionListener {
        /// State whose listeners were fired.
        state: TransactionState,
        /// First listener failure.
        #[source]
        source: Box<PipelineError>,
        /// Remaining listener failures.
        suppressed: Vec<PipelineError>,
    },

    /// `commit` or `rollback` was called on a transaction that already
    /// completed or is completing.
    #[error("Cannot {operation} transaction in phase {phase}")]
    IllegalTransactionState {
        /// The rejected operation.
        operation: TransactionOperation,
        /// Lifecycle phase the transaction was in.
        phase: &'static str,
    },

    /// A close listener or session close failed during unit-of-work teardown.
    #[error("Teardown of {stage} failed: {source}")]
    Teardown {
        /// Teardown stage (`close listener`, `session close`).
        stage: &'static str,
        /// The failure raised by the stage.
        #[source]
        source: Box<PipelineError>,
    },

    /// A failure decorated with a stable diagnostic code.
    #[error("{source}")]
    Coded {
        /// The diagnostic code.
        code: u32,
        /// The decorated failure.
        #[source]
        source: Box<PipelineError>,
    },
}

impl PipelineError {
    /// Creates a new `Configuration` error describing an invalid chain.
    #[must_use]
    pub fn invalid_chain(reason: impl Into<String>) -> Self {
        Self::Configuration(ConfigError::InvalidChain { reason: reason.into() })
    }

    /// Creates a new `Command` error with the given message.
    #[must_use]
    pub fn command(message: impl Into<String>) -> Self {
        Self::Command { message: message.into(), source: None }
    }

    /// Creates a new `Command` error with a message and source error.
    #[must_use]
    pub fn command_with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Command { message: message.into(), source: Some(Arc::new(source)) }
    }

    /// Creates a new `Conflict` error.
    #[must_use]
    pub fn conflict(message: impl Into<String>) -> Self {
        Self::Conflict { message: message.into(), source: None }
    }

    /// Creates a new `Conflict` error with a message and source error.
    #[must_use]
    pub fn conflict_with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Conflict { message: message.into(), source: Some(Arc::new(source)) }
    }

    /// Creates a new `TransactionInteraction` error with the given message.
    #[must_use]
    pub fn transaction(operation: TransactionOperation, message: impl Into<String>) -> Self {
        Self::TransactionInteraction {
            operation,
            message: message.into(),
            conflict: false,
            source: None,
        }
    }

    /// Wraps a failure raised while interacting with a transactional resource.
    ///
    /// The conflict flag is carried over so that a commit rejected because of
    /// a write conflict stays eligible for retry.
    #[must_use]
    pub fn transaction_failed(operation: TransactionOperation, cause: PipelineError) -> Self {
        if let Self::TransactionInteraction { .. } = cause {
            return cause;
        }
        Self::TransactionInteraction {
            operation,
            message: cause.to_string(),
            conflict: cause.is_conflict(),
            source: Some(Arc::new(cause)),
        }
    }

    /// Wraps a failure raised during unit-of-work teardown.
    #[must_use]
    pub fn teardown(stage: &'static str, cause: PipelineError) -> Self {
        Self::Teardown { stage, source: Box::new(cause) }
    }

    /// Attaches a diagnostic code to this error.
    ///
    /// Codes outside the custom range are replaced by the error-code
    /// interceptor.
    #[must_use]
    pub fn with_code(self, code: u32) -> Self {
        match self {
            Self::Coded { source, .. } => Self::Coded { code, source },
            other => Self::Coded { code, source: Box::new(other) },
        }
    }

    /// Returns the classification of this error.
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Configuration(_) | Self::MissingSessionFactory { .. } => ErrorKind::Configuration,
            Self::Command { .. } => ErrorKind::Command,
            Self::Conflict { .. } => ErrorKind::Conflict,
            Self::TransactionInteraction { .. }
            | Self::TransactionListener { .. }
            | Self::IllegalTransactionState { .. } => ErrorKind::TransactionInteraction,
            Self::Teardown { .. } => ErrorKind::Teardown,
            Self::Coded { source, .. } => source.kind(),
        }
    }

    /// Returns `true` if this error signals a write conflict.
    ///
    /// Covers a conflict raised by the command body or a session flush, a
    /// `Committing` listener that hit a conflict, and a commit the resource
    /// rejected because of a conflict. Listener failures in any later state
    /// are never conflicts: the resource outcome is already final.
    #[must_use]
    pub fn is_conflict(&self) -> bool {
        match self {
            Self::Conflict { .. } => true,
            Self::TransactionInteraction { conflict, .. } => *conflict,
            Self::TransactionListener { state: TransactionState::Committing, source, suppressed } => {
                source.is_conflict() || suppressed.iter().any(PipelineError::is_conflict)
            },
            Self::Coded { source, .. } => source.is_conflict(),
            _ => false,
        }
    }

    /// Returns the diagnostic code, if one was attached.
    #[must_use]
    pub fn code(&self) -> Option<u32> {
        match self {
            Self::Coded { code, .. } => Some(*code),
            _ => None,
        }
    }

    /// Returns this error without its diagnostic code decoration.
    #[must_use]
    pub fn uncoded(&self) -> &PipelineError {
        match self {
            Self::Coded { source, .. } => source.uncoded(),
            other => other,
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::panic)]
mod tests {
    use rstest::rstest;

    use super::*;

    #[test]
    fn test_kind_sees_through_code() {
        let err = PipelineError::conflict("row version mismatch").with_code(1);
        assert_eq!(err.kind(), ErrorKind::Conflict);
        assert!(err.is_conflict());
        assert_eq!(err.code(), Some(1));
        assert_eq!(err.to_string(), "Optimistic conflict: row version mismatch");
    }

    #[test]
    fn test_with_code_replaces_existing_code() {
        let err = PipelineError::command("boom").with_code(20_001).with_code(20_002);
        assert_eq!(err.code(), Some(20_002));
        assert!(matches!(err.uncoded(), PipelineError::Command { .. }));
    }

    #[test]
    fn test_commit_conflict_stays_conflict() {
        let err = PipelineError::transaction_failed(
            TransactionOperation::Commit,
            PipelineError::conflict("serialization failure"),
        );
        assert_eq!(err.kind(), ErrorKind::TransactionInteraction);
        assert!(err.is_conflict());
        assert!(std::error::Error::source(&err).is_some());
    }

    #[test]
    fn test_transaction_failed_does_not_double_wrap() {
        let inner = PipelineError::transaction(TransactionOperation::Begin, "no connection");
        let err = PipelineError::transaction_failed(TransactionOperation::Commit, inner);
        assert!(matches!(
            err,
            PipelineError::TransactionInteraction { operation: TransactionOperation::Begin, .. }
        ));
    }

    #[test]
    fn test_listener_error_counts_all_failures() {
        let err = PipelineError::TransactionListener {
            state: TransactionState::Committed,
            source: Box::new(PipelineError::command("first")),
            suppressed: vec![PipelineError::command("second")],
        };
        assert_eq!(err.to_string(), "2 transaction listener(s) failed on committed");
        assert_eq!(err.kind(), ErrorKind::TransactionInteraction);
    }

    #[rstest]
    #[case::committing(TransactionState::Committing, true)]
    #[case::committed(TransactionState::Committed, false)]
    #[case::rolling_back(TransactionState::RollingBack, false)]
    #[case::rolled_back(TransactionState::RolledBack, false)]
    fn test_listener_conflict_only_before_commit(
        #[case] state: TransactionState,
        #[case] expected: bool,
    ) {
        let err = PipelineError::TransactionListener {
            state,
            source: Box::new(PipelineError::conflict("stale read")),
            suppressed: Vec::new(),
        };
        assert_eq!(err.is_conflict(), expected);
        assert_eq!(err.with_code(1).is_conflict(), expected);
    }

    #[test]
    fn test_configuration_from_config_error() {
        let err: PipelineError =
            ConfigError::InvalidChain { reason: "empty".into() }.into();
        assert_eq!(err.kind(), ErrorKind::Configuration);
        assert!(!err.is_conflict());
    }
}
