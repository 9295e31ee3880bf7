//! Pipeline configuration.
//!
//! [`PipelineConfig`] gathers everything the executors are assembled from:
//! the transaction strategy, the session-factory registry, the optional
//! conflict retry, error-code enrichment and the custom interceptors of each
//! chain. Both [`PipelineConfig`] and [`RetryConfig`] are built with
//! validating `bon` builders.
//!
//! # Example
//!
//! ```
//! use std::time::Duration;
//!
//! use process_engine_command::config::{PipelineConfig, RetryConfig};
//!
//! let config = PipelineConfig::builder()
//!     .retry(
//!         RetryConfig::builder()
//!             .max_attempts(5)
//!             .initial_backoff(Duration::from_millis(5))
//!             .build()?,
//!     )
//!     .build()?;
//! assert_eq!(config.retry().map(|retry| retry.max_attempts()), Some(5));
//! # Ok::<(), process_engine_command::ConfigError>(())
//! ```

use std::{fmt, sync::Arc, time::Duration};

use serde::{Deserialize, Serialize};

use crate::{
    error::{ConfigError, PipelineError},
    interceptor::{CommandCounter, CommandInterceptor, ErrorCodeProvider},
    metrics::PipelineMetrics,
    session::SessionFactories,
    transaction::{
        LocatedTransactionContextFactory, ManagedTransactionContextFactory,
        StandaloneTransactionContextFactory, TransactionContextFactory, TransactionManager,
        TransactionManagerLocator,
    },
};

/// Default total number of attempts of the conflict retry (3).
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

/// Default backoff before the first retry (10 milliseconds).
pub const DEFAULT_INITIAL_BACKOFF: Duration = Duration::from_millis(10);

/// Default upper bound of the retry backoff (1 second).
pub const DEFAULT_MAX_BACKOFF: Duration = Duration::from_secs(1);

/// Decides whether a failure is a write conflict worth retrying.
pub type ConflictPredicate = Arc<dyn Fn(&PipelineError) -> bool + Send + Sync>;

/// The default [`ConflictPredicate`]: [`PipelineError::is_conflict`].
#[must_use]
pub fn default_conflict_predicate() -> ConflictPredicate {
    Arc::new(PipelineError::is_conflict)
}

/// Conflict retry settings.
///
/// `max_attempts` counts every execution, the first one included.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RetryConfig {
    #[serde(default = "default_max_attempts")]
    max_attempts: u32,

    #[serde(with = "humantime_serde", default = "default_initial_backoff")]
    initial_backoff: Duration,

    #[serde(with = "humantime_serde", default = "default_max_backoff")]
    max_backoff: Duration,
}

fn default_max_attempts() -> u32 {
    DEFAULT_MAX_ATTEMPTS
}

fn default_initial_backoff() -> Duration {
    DEFAULT_INITIAL_BACKOFF
}

fn default_max_backoff() -> Duration {
    DEFAULT_MAX_BACKOFF
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            initial_backoff: DEFAULT_INITIAL_BACKOFF,
            max_backoff: DEFAULT_MAX_BACKOFF,
        }
    }
}

#[bon::bon]
impl RetryConfig {
    /// Creates a retry configuration.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if `max_attempts` is zero or
    /// `initial_backoff` exceeds `max_backoff`.
    #[builder]
    pub fn new(
        #[builder(default = DEFAULT_MAX_ATTEMPTS)] max_attempts: u32,
        #[builder(default = DEFAULT_INITIAL_BACKOFF)] initial_backoff: Duration,
        #[builder(default = DEFAULT_MAX_BACKOFF)] max_backoff: Duration,
    ) -> Result<Self, ConfigError> {
        let config = Self { max_attempts, initial_backoff, max_backoff };
        config.validate()?;
        Ok(config)
    }

    /// Checks the invariants the builder enforces; needed after
    /// deserialisation.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if `max_attempts` is zero or
    /// `initial_backoff` exceeds `max_backoff`.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_attempts == 0 {
            return Err(ConfigError::BelowMinimum {
                field: "max_attempts",
                min: "1".into(),
                value: self.max_attempts.to_string(),
            });
        }
        if self.initial_backoff > self.max_backoff {
            return Err(ConfigError::ExceedsLimit {
                field: "initial_backoff",
                value: format!("{:?}", self.initial_backoff),
                limit_field: "max_backoff",
                limit: format!("{:?}", self.max_backoff),
            });
        }
        Ok(())
    }

    /// Total number of attempts, the first one included.
    #[must_use]
    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Backoff before the first retry.
    #[must_use]
    pub fn initial_backoff(&self) -> Duration {
        self.initial_backoff
    }

    /// Upper bound of the backoff.
    #[must_use]
    pub fn max_backoff(&self) -> Duration {
        self.max_backoff
    }
}

/// Where transactions come from.
#[derive(Clone, Default)]
pub enum TransactionStrategy {
    /// In-process transactions with no external resource.
    #[default]
    Standalone,
    /// Transactions of a manager handed over directly.
    Managed(Arc<dyn TransactionManager>),
    /// Transactions of a manager looked up by name on every begin.
    Located {
        /// Resolves the manager.
        locator: Arc<dyn TransactionManagerLocator>,
        /// Name the manager is registered under.
        name: String,
    },
}

impl fmt::Debug for TransactionStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Standalone => f.write_str("Standalone"),
            Self::Managed(manager) => f.debug_tuple("Managed").field(manager).finish(),
            Self::Located { name, .. } => f.debug_struct("Located").field("name", name).finish(),
        }
    }
}

impl TransactionStrategy {
    /// Builds the factory this strategy begins transactions with.
    #[must_use]
    pub fn factory(&self) -> Arc<dyn TransactionContextFactory> {
        match self {
            Self::Standalone => Arc::new(StandaloneTransactionContextFactory),
            Self::Managed(manager) => {
                Arc::new(ManagedTransactionContextFactory::new(Arc::clone(manager)))
            },
            Self::Located { locator, name } => {
                Arc::new(LocatedTransactionContextFactory::new(Arc::clone(locator), name.clone()))
            },
        }
    }
}

/// Everything the command executors are assembled from.
#[derive(Clone)]
pub struct PipelineConfig {
    transaction_strategy: TransactionStrategy,
    session_factories: Arc<SessionFactories>,
    retry: Option<RetryConfig>,
    conflict_predicate: ConflictPredicate,
    error_codes: bool,
    error_code_provider: Option<Arc<dyn ErrorCodeProvider>>,
    pre_interceptors: Vec<Arc<dyn CommandInterceptor>>,
    post_interceptors: Vec<Arc<dyn CommandInterceptor>>,
    requires_new_pre_interceptors: Vec<Arc<dyn CommandInterceptor>>,
    requires_new_post_interceptors: Vec<Arc<dyn CommandInterceptor>>,
    metrics: Arc<PipelineMetrics>,
    counter: Arc<CommandCounter>,
}

impl fmt::Debug for PipelineConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PipelineConfig")
            .field("transaction_strategy", &self.transaction_strategy)
            .field("session_factories", &self.session_factories)
            .field("retry", &self.retry)
            .field("error_codes", &self.error_codes)
            .field("error_code_provider", &self.error_code_provider)
            .field("pre_interceptors", &self.pre_interceptors)
            .field("post_interceptors", &self.post_interceptors)
            .field("requires_new_pre_interceptors", &self.requires_new_pre_interceptors)
            .field("requires_new_post_interceptors", &self.requires_new_post_interceptors)
            .finish_non_exhaustive()
    }
}

#[bon::bon]
impl PipelineConfig {
    /// Creates a pipeline configuration.
    ///
    /// # Optional Fields
    ///
    /// * `transaction_strategy` - Where transactions come from (default: standalone).
    /// * `session_factories` - Session-factory registry (default: empty).
    /// * `retry` - Conflict retry; no retry interceptor when absent.
    /// * `conflict_predicate` - Retry predicate (default: [`PipelineError::is_conflict`]).
    /// * `error_codes` - Error-code enrichment (default: enabled).
    /// * `error_code_provider` - Custom error codes.
    /// * `pre_interceptors` / `post_interceptors` - Custom interceptors of the `TxRequired`
    ///   chain.
    /// * `requires_new_pre_interceptors` / `requires_new_post_interceptors` - Custom
    ///   interceptors of the `TxRequiresNew` chain.
    /// * `metrics` / `counter` - Shared counters (default: fresh).
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if:
    /// - `retry` is invalid
    /// - A located strategy has an empty manager name
    /// - A custom interceptor is terminal
    #[builder]
    pub fn new(
        #[builder(default)] transaction_strategy: TransactionStrategy,
        #[builder(default)] session_factories: SessionFactories,
        retry: Option<RetryConfig>,
        conflict_predicate: Option<ConflictPredicate>,
        #[builder(default = true)] error_codes: bool,
        error_code_provider: Option<Arc<dyn ErrorCodeProvider>>,
        #[builder(default)] pre_interceptors: Vec<Arc<dyn CommandInterceptor>>,
        #[builder(default)] post_interceptors: Vec<Arc<dyn CommandInterceptor>>,
        #[builder(default)] requires_new_pre_interceptors: Vec<Arc<dyn CommandInterceptor>>,
        #[builder(default)] requires_new_post_interceptors: Vec<Arc<dyn CommandInterceptor>>,
        #[builder(default = PipelineMetrics::shared())] metrics: Arc<PipelineMetrics>,
        #[builder(default = CommandCounter::shared())] counter: Arc<CommandCounter>,
    ) -> Result<Self, ConfigError> {
        if let Some(retry) = &retry {
            retry.validate()?;
        }

        if let TransactionStrategy::Located { name, .. } = &transaction_strategy
            && name.is_empty()
        {
            return Err(ConfigError::Empty { field: "transaction manager name" });
        }

        let custom = pre_interceptors
            .iter()
            .chain(&post_interceptors)
            .chain(&requires_new_pre_interceptors)
            .chain(&requires_new_post_interceptors);
        for interceptor in custom {
            if interceptor.is_terminal() {
                return Err(ConfigError::InvalidChain {
                    reason: format!("custom interceptor {} is terminal", interceptor.name()),
                });
            }
        }

        Ok(Self {
            transaction_strategy,
            session_factories: Arc::new(session_factories),
            retry,
            conflict_predicate: conflict_predicate.unwrap_or_else(default_conflict_predicate),
            error_codes,
            error_code_provider,
            pre_interceptors,
            post_interceptors,
            requires_new_pre_interceptors,
            requires_new_post_interceptors,
            metrics,
            counter,
        })
    }

    /// Returns the transaction strategy.
    #[must_use]
    pub fn transaction_strategy(&self) -> &TransactionStrategy {
        &self.transaction_strategy
    }

    /// Returns the session-factory registry.
    #[must_use]
    pub fn session_factories(&self) -> &Arc<SessionFactories> {
        &self.session_factories
    }

    /// Returns the retry configuration, if retry is enabled.
    #[must_use]
    pub fn retry(&self) -> Option<&RetryConfig> {
        self.retry.as_ref()
    }

    /// Returns the conflict predicate used by the retry interceptor.
    #[must_use]
    pub fn conflict_predicate(&self) -> &ConflictPredicate {
        &self.conflict_predicate
    }

    /// Returns whether error-code enrichment is enabled.
    #[must_use]
    pub fn error_codes(&self) -> bool {
        self.error_codes
    }

    /// Returns the custom error-code provider.
    #[must_use]
    pub fn error_code_provider(&self) -> Option<&Arc<dyn ErrorCodeProvider>> {
        self.error_code_provider.as_ref()
    }

    /// Returns the custom pre and post interceptors of the `TxRequired` chain.
    #[must_use]
    pub fn custom_interceptors(
        &self,
    ) -> (&[Arc<dyn CommandInterceptor>], &[Arc<dyn CommandInterceptor>]) {
        (&self.pre_interceptors, &self.post_interceptors)
    }

    /// Returns the custom pre and post interceptors of the `TxRequiresNew`
    /// chain.
    #[must_use]
    pub fn requires_new_custom_interceptors(
        &self,
    ) -> (&[Arc<dyn CommandInterceptor>], &[Arc<dyn CommandInterceptor>]) {
        (&self.requires_new_pre_interceptors, &self.requires_new_post_interceptors)
    }

    /// Returns the shared metrics.
    #[must_use]
    pub fn metrics(&self) -> &Arc<PipelineMetrics> {
        &self.metrics
    }

    /// Returns the shared in-flight counter.
    #[must_use]
    pub fn counter(&self) -> &Arc<CommandCounter> {
        &self.counter
    }
}
