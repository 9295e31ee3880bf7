//! The command context: unit of work for one logical operation.
//!
//! A [`CommandContext`] is opened by the command-context interceptor at the
//! entry of a top-level (or `RequiresNew`) invocation and owns everything the
//! operation touches:
//!
//! - sessions, opened lazily per type and closed in reverse acquisition order;
//! - close listeners, run once when the unit of work ends;
//! - the [`TransactionContext`] the sessions are bound to.
//!
//! Nested invocations on the same execution join the open context instead of
//! opening a new one; only the outermost acquisition closes it.
//!
//! # Teardown Order
//!
//! 1. Flush every session in acquisition order, unless the command failed.
//! 2. Run close listeners in registration order, collecting failures.
//! 3. Close every session in reverse acquisition order, collecting failures.
//! 4. Surface the first teardown failure if the command itself succeeded.

use std::{
    any::{Any, TypeId, type_name},
    fmt,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
};

use fail::fail_point;

use crate::{
    command::ApplicationContext,
    error::{PipelineError, PipelineResult},
    session::{Session, SessionFactories},
    transaction::TransactionContext,
};

static NEXT_CONTEXT_ID: AtomicU64 = AtomicU64::new(1);

/// Outcome a close listener is restricted to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CloseListenerScope {
    /// Run whatever the outcome.
    #[default]
    Always,
    /// Run only if the command and the flush succeeded.
    OnSuccess,
    /// Run only if the command or the flush failed.
    OnFailure,
}

impl CloseListenerScope {
    fn applies(self, succeeded: bool) -> bool {
        match self {
            Self::Always => true,
            Self::OnSuccess => succeeded,
            Self::OnFailure => !succeeded,
        }
    }
}

type CloseListener = Box<dyn FnOnce() -> PipelineResult<()> + Send>;

/// Unit of work for one logical command execution.
pub struct CommandContext {
    id: u64,
    transaction: Arc<dyn TransactionContext>,
    session_factories: Arc<SessionFactories>,
    sessions: Vec<(TypeId, Box<dyn Session>)>,
    close_listeners: Vec<(CloseListenerScope, CloseListener)>,
    application: Option<ApplicationContext>,
    depth: u32,
}

impl fmt::Debug for CommandContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CommandContext")
            .field("id", &self.id)
            .field("transaction", &self.transaction)
            .field("sessions", &self.sessions.len())
            .field("close_listeners", &self.close_listeners.len())
            .field("application", &self.application)
            .field("depth", &self.depth)
            .finish()
    }
}

impl CommandContext {
    pub(crate) fn new(
        transaction: Arc<dyn TransactionContext>,
        session_factories: Arc<SessionFactories>,
        application: Option<ApplicationContext>,
    ) -> Self {
        Self {
            id: NEXT_CONTEXT_ID.fetch_add(1, Ordering::Relaxed),
            transaction,
            session_factories,
            sessions: Vec::new(),
            close_listeners: Vec::new(),
            application,
            depth: 0,
        }
    }

    /// Process-unique identifier of this unit of work.
    #[must_use]
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Returns the session of type `S`, opening it on first use.
    ///
    /// # Errors
    ///
    /// - [`PipelineError::MissingSessionFactory`] if no factory is registered for `S`
    /// - Whatever the factory returns when opening fails
    pub async fn session<S: Session>(&mut self) -> PipelineResult<&mut S> {
        let session_type = TypeId::of::<S>();
        let existing = self.sessions.iter().position(|(id, _)| *id == session_type);
        let index = match existing {
            Some(index) => index,
            None => {
                let factory = self
                    .session_factories
                    .get(session_type)
                    .cloned()
                    .ok_or(PipelineError::MissingSessionFactory { session_type: type_name::<S>() })?;
                let session = factory.open_session(&self.transaction).await?;
                tracing::trace!(context = self.id, session = type_name::<S>(), "session opened");
                self.sessions.push((session_type, session));
                self.sessions.len() - 1
            },
        };

        let session: &mut dyn Any = &mut *self.sessions[index].1;
        session.downcast_mut::<S>().ok_or_else(|| {
            PipelineError::invalid_chain(format!(
                "session factory for {} opened a session of another type",
                type_name::<S>()
            ))
        })
    }

    /// Returns `true` if a session of type `S` is open in this unit of work.
    #[must_use]
    pub fn has_session<S: Session>(&self) -> bool {
        let session_type = TypeId::of::<S>();
        self.sessions.iter().any(|(id, _)| *id == session_type)
    }

    /// Number of sessions opened so far.
    #[must_use]
    pub fn open_session_count(&self) -> usize {
        self.sessions.len()
    }

    /// Queues `listener` to run once when the unit of work ends.
    pub fn register_close_listener<F>(&mut self, listener: F)
    where
        F: FnOnce() -> PipelineResult<()> + Send + 'static,
    {
        self.register_close_listener_scoped(CloseListenerScope::Always, listener);
    }

    /// Queues `listener` to run once when the unit of work ends with an
    /// outcome matching `scope`.
    pub fn register_close_listener_scoped<F>(&mut self, scope: CloseListenerScope, listener: F)
    where
        F: FnOnce() -> PipelineResult<()> + Send + 'static,
    {
        self.close_listeners.push((scope, Box::new(listener)));
    }

    /// The transaction this unit of work runs in.
    #[must_use]
    pub fn transaction(&self) -> &Arc<dyn TransactionContext> {
        &self.transaction
    }

    /// Marks the transaction rollback-only; the command still returns its
    /// result.
    pub fn set_rollback_only(&self) {
        self.transaction.set_rollback_only();
    }

    /// Returns `true` if the transaction was marked rollback-only.
    #[must_use]
    pub fn is_rollback_only(&self) -> bool {
        self.transaction.is_rollback_only()
    }

    /// Application context of the command currently running in this context.
    #[must_use]
    pub fn application(&self) -> Option<&ApplicationContext> {
        self.application.as_ref()
    }

    /// Number of nested invocations currently joined to this context.
    #[must_use]
    pub fn nesting_depth(&self) -> u32 {
        self.depth
    }

    /// Joins a nested invocation, switching to its application context.
    ///
    /// Returns the application context to restore in
    /// [`leave_nested`](Self::leave_nested).
    pub(crate) fn enter_nested(
        &mut self,
        application: Option<ApplicationContext>,
    ) -> Option<ApplicationContext> {
        self.depth += 1;
        std::mem::replace(&mut self.application, application)
    }

    pub(crate) fn leave_nested(&mut self, previous: Option<ApplicationContext>) {
        self.depth = self.depth.saturating_sub(1);
        self.application = previous;
    }

    /// Ends the unit of work.
    ///
    /// `failure` is the error the command body raised, if any. When present
    /// it suppresses the flush, and teardown failures are logged instead of
    /// returned.
    pub(crate) async fn close(mut self, failure: Option<&PipelineError>) -> PipelineResult<()> {
        let mut teardown: Option<PipelineError> = None;

        if failure.is_none() {
            for (_, session) in &mut self.sessions {
                let flushed = match session_flush_failpoint() {
                    Ok(()) => session.flush().await,
                    Err(err) => Err(err),
                };
                if let Err(err) = flushed {
                    teardown = Some(err);
                    break;
                }
            }
        }

        let succeeded = failure.is_none() && teardown.is_none();
        for (scope, listener) in std::mem::take(&mut self.close_listeners) {
            if !scope.applies(succeeded) {
                continue;
            }
            if let Err(err) = listener() {
                record(&mut teardown, PipelineError::teardown("close listener", err));
            }
        }

        while let Some((_, mut session)) = self.sessions.pop() {
            if let Err(err) = session.close().await {
                record(&mut teardown, PipelineError::teardown("session close", err));
            }
        }

        tracing::trace!(context = self.id, succeeded, "command context closed");

        match (failure, teardown) {
            (None, Some(err)) => Err(err),
            (Some(cause), Some(err)) => {
                tracing::warn!(error = %err, cause = %cause, "teardown failed after command failure");
                Ok(())
            },
            (_, None) => Ok(()),
        }
    }
}

fn record(slot: &mut Option<PipelineError>, err: PipelineError) {
    match slot {
        None => *slot = Some(err),
        Some(first) => {
            tracing::warn!(error = %err, first = %first, "additional teardown failure");
        },
    }
}

fn session_flush_failpoint() -> PipelineResult<()> {
    fail_point!("session-before-flush", |_| Err(PipelineError::conflict("injected flush conflict")));
    Ok(())
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::panic)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use parking_lot::Mutex;

    use super::*;
    use crate::{
        session::session_factory_fn,
        testutil::{RecordingSession, SessionEvent, SessionLog},
        transaction::StandaloneTransactionContext,
    };

    fn context_with(log: &SessionLog) -> CommandContext {
        let mut factories = SessionFactories::new();
        factories.register(RecordingSession::factory(log.clone()));
        CommandContext::new(
            Arc::new(StandaloneTransactionContext::new()),
            Arc::new(factories),
            None,
        )
    }

    #[tokio::test]
    async fn test_session_opened_once_per_context() {
        let log = SessionLog::new();
        let mut ctx = context_with(&log);

        ctx.session::<RecordingSession>().await.unwrap().write("a");
        ctx.session::<RecordingSession>().await.unwrap().write("b");

        assert_eq!(ctx.open_session_count(), 1);
        assert_eq!(log.count(SessionEvent::Opened), 1);
    }

    fn assert_send<T: Send>(_: &T) {}

    #[tokio::test]
    async fn test_session_future_is_send() {
        let log = SessionLog::new();
        let mut ctx = context_with(&log);

        let opening = ctx.session::<RecordingSession>();
        assert_send(&opening);
        opening.await.unwrap().write("a");

        let cached = ctx.session::<RecordingSession>();
        assert_send(&cached);
        assert_eq!(cached.await.unwrap().pending(), ["a".to_owned()]);
    }

    #[tokio::test]
    async fn test_missing_factory_is_configuration_error() {
        struct Unregistered;
        impl Session for Unregistered {}

        let mut ctx = context_with(&SessionLog::new());
        let result = ctx.session::<Unregistered>().await;
        assert!(matches!(result, Err(PipelineError::MissingSessionFactory { .. })));
    }

    #[tokio::test]
    async fn test_close_after_success_flushes_then_closes() {
        let log = SessionLog::new();
        let mut ctx = context_with(&log);
        ctx.session::<RecordingSession>().await.unwrap().write("value");

        ctx.close(None).await.unwrap();

        assert_eq!(log.events(), vec![SessionEvent::Opened, SessionEvent::Flushed, SessionEvent::Closed]);
        assert_eq!(log.flushed_writes(), vec!["value".to_owned()]);
    }

    #[tokio::test]
    async fn test_close_after_failure_skips_flush() {
        let log = SessionLog::new();
        let mut ctx = context_with(&log);
        ctx.session::<RecordingSession>().await.unwrap().write("value");

        let failure = PipelineError::command("body failed");
        ctx.close(Some(&failure)).await.unwrap();

        assert_eq!(log.count(SessionEvent::Flushed), 0);
        assert_eq!(log.count(SessionEvent::Closed), 1);
    }

    #[tokio::test]
    async fn test_close_listeners_run_in_order_despite_failures() {
        let mut ctx = context_with(&SessionLog::new());
        let order = Arc::new(Mutex::new(Vec::new()));
        for name in ["first", "second", "third"] {
            let order = Arc::clone(&order);
            ctx.register_close_listener(move || {
                order.lock().push(name);
                if name == "second" {
                    return Err(PipelineError::command("listener failed"));
                }
                Ok(())
            });
        }

        let err = ctx.close(None).await.unwrap_err();

        assert_eq!(*order.lock(), vec!["first", "second", "third"]);
        assert!(matches!(err, PipelineError::Teardown { stage: "close listener", .. }));
    }

    #[tokio::test]
    async fn test_scoped_close_listeners() {
        let mut ctx = context_with(&SessionLog::new());
        let success = Arc::new(AtomicUsize::new(0));
        let failure = Arc::new(AtomicUsize::new(0));
        let on_success = Arc::clone(&success);
        let on_failure = Arc::clone(&failure);
        ctx.register_close_listener_scoped(CloseListenerScope::OnSuccess, move || {
            on_success.fetch_add(1, Ordering::Relaxed);
            Ok(())
        });
        ctx.register_close_listener_scoped(CloseListenerScope::OnFailure, move || {
            on_failure.fetch_add(1, Ordering::Relaxed);
            Ok(())
        });

        ctx.close(Some(&PipelineError::command("failed"))).await.unwrap();

        assert_eq!(success.load(Ordering::Relaxed), 0);
        assert_eq!(failure.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn test_sessions_closed_in_reverse_order() {
        struct Named(&'static str, Arc<Mutex<Vec<&'static str>>>);

        #[async_trait::async_trait]
        impl Session for Named {
            async fn close(&mut self) -> PipelineResult<()> {
                self.1.lock().push(self.0);
                Ok(())
            }
        }

        struct Other(Named);

        #[async_trait::async_trait]
        impl Session for Other {
            async fn close(&mut self) -> PipelineResult<()> {
                self.0.close().await
            }
        }

        let closed = Arc::new(Mutex::new(Vec::new()));
        let mut factories = SessionFactories::new();
        let first = Arc::clone(&closed);
        let second = Arc::clone(&closed);
        factories
            .register(session_factory_fn(move |_| Ok(Named("named", Arc::clone(&first)))))
            .register(session_factory_fn(move |_| {
                Ok(Other(Named("other", Arc::clone(&second))))
            }));
        let mut ctx = CommandContext::new(
            Arc::new(StandaloneTransactionContext::new()),
            Arc::new(factories),
            None,
        );

        ctx.session::<Named>().await.unwrap();
        ctx.session::<Other>().await.unwrap();
        ctx.close(None).await.unwrap();

        assert_eq!(*closed.lock(), vec!["other", "named"]);
    }

    #[tokio::test]
    async fn test_flush_failure_returned_and_sessions_still_closed() {
        let log = SessionLog::new();
        log.fail_next_flush(PipelineError::conflict("version mismatch"));
        let mut ctx = context_with(&log);
        ctx.session::<RecordingSession>().await.unwrap().write("value");

        let err = ctx.close(None).await.unwrap_err();

        assert!(err.is_conflict());
        assert_eq!(log.count(SessionEvent::Closed), 1);
    }

    #[test]
    fn test_nesting_restores_application() {
        let mut ctx = CommandContext::new(
            Arc::new(StandaloneTransactionContext::new()),
            Arc::new(SessionFactories::new()),
            Some(ApplicationContext::new("invoicing")),
        );

        let previous = ctx.enter_nested(Some(ApplicationContext::new("billing")));
        assert_eq!(ctx.nesting_depth(), 1);
        assert_eq!(ctx.application().map(ApplicationContext::name), Some("billing"));

        ctx.leave_nested(previous);
        assert_eq!(ctx.nesting_depth(), 0);
        assert_eq!(ctx.application().map(ApplicationContext::name), Some("invoicing"));
    }
}
