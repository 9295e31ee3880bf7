//! Sessions and the session-factory registry.
//!
//! A [`Session`] is a unit-of-work scoped handle onto some capability
//! (persistence, identity lookups, deferred history events, ...). Sessions
//! are opened lazily by [`CommandContext::session`](crate::CommandContext::session)
//! through the [`SessionFactory`] registered for their type, flushed when the
//! unit of work succeeds and closed in reverse acquisition order when it
//! ends. A session is never shared between two command contexts.
//!
//! # Example
//!
//! ```
//! use process_engine_command::session::{Session, SessionFactories, session_factory_fn};
//!
//! #[derive(Default)]
//! struct AuditSession {
//!     entries: Vec<String>,
//! }
//!
//! impl Session for AuditSession {}
//!
//! let mut factories = SessionFactories::new();
//! factories.register(session_factory_fn(|_tx| Ok(AuditSession::default())));
//! assert!(factories.contains::<AuditSession>());
//! ```

use std::{
    any::{Any, TypeId, type_name},
    collections::HashMap,
    fmt,
    marker::PhantomData,
    sync::Arc,
};

use async_trait::async_trait;

use crate::{error::PipelineResult, transaction::TransactionContext};

/// A capability opened once per unit of work.
///
/// Both hooks default to no-ops. Return [`PipelineError::Conflict`](crate::PipelineError::Conflict)
/// from [`flush`](Session::flush) when pending writes collide with a
/// concurrent writer.
#[async_trait]
pub trait Session: Any + Send {
    /// Persists pending writes. Called only when the unit of work succeeded.
    async fn flush(&mut self) -> PipelineResult<()> {
        Ok(())
    }

    /// Releases the session's resources. Always called at teardown.
    async fn close(&mut self) -> PipelineResult<()> {
        Ok(())
    }
}

/// Opens sessions of one type.
#[async_trait]
pub trait SessionFactory: Send + Sync {
    /// The [`TypeId`] of the sessions this factory opens.
    fn session_type(&self) -> TypeId;

    /// Human-readable name of the session type, for diagnostics.
    fn session_type_name(&self) -> &'static str;

    /// Opens a new session bound to `transaction`.
    async fn open_session(
        &self,
        transaction: &Arc<dyn TransactionContext>,
    ) -> PipelineResult<Box<dyn Session>>;
}

/// [`SessionFactory`] built from a closure. See [`session_factory_fn`].
pub struct FnSessionFactory<S, F> {
    open: F,
    _session: PhantomData<fn() -> S>,
}

/// Wraps a closure opening sessions of type `S` as a [`SessionFactory`].
pub fn session_factory_fn<S, F>(open: F) -> FnSessionFactory<S, F>
where
    S: Session,
    F: Fn(&Arc<dyn TransactionContext>) -> PipelineResult<S> + Send + Sync + 'static,
{
    FnSessionFactory { open, _session: PhantomData }
}

#[async_trait]
impl<S, F> SessionFactory for FnSessionFactory<S, F>
where
    S: Session,
    F: Fn(&Arc<dyn TransactionContext>) -> PipelineResult<S> + Send + Sync + 'static,
{
    fn session_type(&self) -> TypeId {
        TypeId::of::<S>()
    }

    fn session_type_name(&self) -> &'static str {
        type_name::<S>()
    }

    async fn open_session(
        &self,
        transaction: &Arc<dyn TransactionContext>,
    ) -> PipelineResult<Box<dyn Session>> {
        let session = (self.open)(transaction)?;
        Ok(Box::new(session))
    }
}

/// Registry mapping session types to their factories.
///
/// Built during configuration and read-only afterwards; the pipeline shares
/// it between all command contexts through an [`Arc`].
#[derive(Clone, Default)]
pub struct SessionFactories {
    factories: HashMap<TypeId, Arc<dyn SessionFactory>>,
}

impl fmt::Debug for SessionFactories {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list()
            .entries(self.factories.values().map(|factory| factory.session_type_name()))
            .finish()
    }
}

impl SessionFactories {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `factory`, replacing any factory for the same session type.
    pub fn register(&mut self, factory: impl SessionFactory + 'static) -> &mut Self {
        self.factories.insert(factory.session_type(), Arc::new(factory));
        self
    }

    /// Registers an already shared factory.
    pub fn register_shared(&mut self, factory: Arc<dyn SessionFactory>) -> &mut Self {
        self.factories.insert(factory.session_type(), factory);
        self
    }

    /// Returns `true` if a factory for `S` is registered.
    #[must_use]
    pub fn contains<S: Session>(&self) -> bool {
        self.factories.contains_key(&TypeId::of::<S>())
    }

    /// Returns the factory for the given session type.
    #[must_use]
    pub fn get(&self, session_type: TypeId) -> Option<&Arc<dyn SessionFactory>> {
        self.factories.get(&session_type)
    }

    /// Returns the number of registered factories.
    #[must_use]
    pub fn len(&self) -> usize {
        self.factories.len()
    }

    /// Returns `true` if no factory is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.factories.is_empty()
    }
}
