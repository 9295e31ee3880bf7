//! Shared test utilities for pipeline testing.
//!
//! This module provides recording collaborators (a transaction manager, a
//! session and its factory, a transaction-listener recorder), a few ready
//! made commands and assertion macros for [`PipelineResult`] values. It is
//! feature-gated behind `testutil` to prevent leaking into production
//! builds.
//!
//! # Usage
//!
//! In integration tests, enable the feature in `Cargo.toml`:
//!
//! ```toml
//! [dev-dependencies]
//! process-engine-command = { path = "../command", features = ["testutil"] }
//! ```
//!
//! Then import helpers:
//!
//! ```no_run
//! // Requires the `testutil` feature to be enabled.
//! use process_engine_command::testutil::{RecordingSession, RecordingTransactionManager, SessionLog};
//! ```

use std::{
    collections::HashMap,
    sync::{
        Arc,
        atomic::{AtomicU32, Ordering},
    },
};

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::{
    command::Command,
    context::CommandContext,
    error::{PipelineError, PipelineResult},
    session::{Session, SessionFactory, session_factory_fn},
    transaction::{
        ResourceStatus, TransactionContext, TransactionId, TransactionListener, TransactionManager,
        TransactionState, listener_fn,
    },
};

/// Call recorded by [`RecordingTransactionManager`], with the transaction id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ManagerEvent {
    /// `begin` returned this id.
    Begin(u64),
    /// `commit` was called.
    Commit(u64),
    /// `rollback` was called.
    Rollback(u64),
    /// `suspend` was called.
    Suspend(u64),
    /// `resume` was called.
    Resume(u64),
}

#[derive(Debug, Default)]
struct ManagerState {
    next_id: u64,
    events: Vec<ManagerEvent>,
    statuses: HashMap<u64, ResourceStatus>,
    fail_next_begin: Option<PipelineError>,
    fail_next_commit: Option<PipelineError>,
}

/// In-memory [`TransactionManager`] recording every call.
///
/// Transaction ids start at 1. Failures can be injected for the next
/// `begin` or `commit`.
#[derive(Debug, Default)]
pub struct RecordingTransactionManager {
    state: Mutex<ManagerState>,
}

impl RecordingTransactionManager {
    /// Creates a manager with no transactions.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Calls recorded so far, in order.
    #[must_use]
    pub fn events(&self) -> Vec<ManagerEvent> {
        self.state.lock().events.clone()
    }

    /// Makes the next `begin` fail with `error`.
    pub fn fail_next_begin(&self, error: PipelineError) {
        self.state.lock().fail_next_begin = Some(error);
    }

    /// Makes the next `commit` fail with `error`.
    pub fn fail_next_commit(&self, error: PipelineError) {
        self.state.lock().fail_next_commit = Some(error);
    }
}

#[async_trait]
impl TransactionManager for RecordingTransactionManager {
    async fn begin(&self) -> PipelineResult<TransactionId> {
        let mut state = self.state.lock();
        if let Some(err) = state.fail_next_begin.take() {
            return Err(err);
        }
        state.next_id += 1;
        let id = state.next_id;
        state.statuses.insert(id, ResourceStatus::Active);
        state.events.push(ManagerEvent::Begin(id));
        Ok(TransactionId(id))
    }

    async fn commit(&self, id: TransactionId) -> PipelineResult<()> {
        let mut state = self.state.lock();
        state.events.push(ManagerEvent::Commit(id.0));
        if let Some(err) = state.fail_next_commit.take() {
            state.statuses.insert(id.0, ResourceStatus::RolledBack);
            return Err(err);
        }
        state.statuses.insert(id.0, ResourceStatus::Committed);
        Ok(())
    }

    async fn rollback(&self, id: TransactionId) -> PipelineResult<()> {
        let mut state = self.state.lock();
        state.events.push(ManagerEvent::Rollback(id.0));
        state.statuses.insert(id.0, ResourceStatus::RolledBack);
        Ok(())
    }

    async fn suspend(&self, id: TransactionId) -> PipelineResult<()> {
        self.state.lock().events.push(ManagerEvent::Suspend(id.0));
        Ok(())
    }

    async fn resume(&self, id: TransactionId) -> PipelineResult<()> {
        self.state.lock().events.push(ManagerEvent::Resume(id.0));
        Ok(())
    }

    fn set_rollback_only(&self, id: TransactionId) -> PipelineResult<()> {
        let mut state = self.state.lock();
        let Some(status) = state.statuses.get_mut(&id.0) else {
            return Err(PipelineError::command(format!("transaction {id} is unknown")));
        };
        match *status {
            ResourceStatus::Active | ResourceStatus::MarkedRollback => {
                *status = ResourceStatus::MarkedRollback;
                Ok(())
            },
            _ => Err(PipelineError::command(format!("transaction {id} is not active"))),
        }
    }

    fn status(&self, id: TransactionId) -> ResourceStatus {
        self.state.lock().statuses.get(&id.0).copied().unwrap_or(ResourceStatus::Unknown)
    }
}

/// Lifecycle event of a [`RecordingSession`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionEvent {
    /// The factory opened a session.
    Opened,
    /// A session flushed its pending writes.
    Flushed,
    /// A session was closed.
    Closed,
}

#[derive(Debug, Default)]
struct LogState {
    events: Vec<SessionEvent>,
    flushed: Vec<String>,
    fail_next_flush: Option<PipelineError>,
    fail_next_close: Option<PipelineError>,
}

/// Shared record of what [`RecordingSession`]s did.
///
/// Cloning shares the record, so a test keeps one handle and gives another
/// to the factory.
#[derive(Debug, Clone, Default)]
pub struct SessionLog {
    state: Arc<Mutex<LogState>>,
}

impl SessionLog {
    /// Creates an empty log.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Events recorded so far, in order.
    #[must_use]
    pub fn events(&self) -> Vec<SessionEvent> {
        self.state.lock().events.clone()
    }

    /// Number of times `event` was recorded.
    #[must_use]
    pub fn count(&self, event: SessionEvent) -> usize {
        self.state.lock().events.iter().filter(|recorded| **recorded == event).count()
    }

    /// Every write that was flushed, in flush order.
    #[must_use]
    pub fn flushed_writes(&self) -> Vec<String> {
        self.state.lock().flushed.clone()
    }

    /// Makes the next flush fail with `error`.
    pub fn fail_next_flush(&self, error: PipelineError) {
        self.state.lock().fail_next_flush = Some(error);
    }

    /// Makes the next close fail with `error`.
    pub fn fail_next_close(&self, error: PipelineError) {
        self.state.lock().fail_next_close = Some(error);
    }

    fn record(&self, event: SessionEvent) {
        self.state.lock().events.push(event);
    }
}

/// Session buffering string writes until flush.
#[derive(Debug)]
pub struct RecordingSession {
    log: SessionLog,
    pending: Vec<String>,
}

impl RecordingSession {
    /// Factory opening sessions that report to `log`.
    pub fn factory(log: SessionLog) -> impl SessionFactory + 'static {
        session_factory_fn(move |_transaction| {
            log.record(SessionEvent::Opened);
            Ok(RecordingSession { log: log.clone(), pending: Vec::new() })
        })
    }

    /// Buffers a write until flush.
    pub fn write(&mut self, value: impl Into<String>) {
        self.pending.push(value.into());
    }

    /// Writes buffered since the last flush.
    #[must_use]
    pub fn pending(&self) -> &[String] {
        &self.pending
    }
}

#[async_trait]
impl Session for RecordingSession {
    async fn flush(&mut self) -> PipelineResult<()> {
        let mut state = self.log.state.lock();
        if let Some(err) = state.fail_next_flush.take() {
            return Err(err);
        }
        state.events.push(SessionEvent::Flushed);
        state.flushed.append(&mut self.pending);
        Ok(())
    }

    async fn close(&mut self) -> PipelineResult<()> {
        let mut state = self.log.state.lock();
        state.events.push(SessionEvent::Closed);
        match state.fail_next_close.take() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

/// Records every [`TransactionState`] a transaction reaches.
#[derive(Debug, Clone, Default)]
pub struct ListenerRecorder {
    states: Arc<Mutex<Vec<TransactionState>>>,
}

impl ListenerRecorder {
    /// Creates an empty recorder.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Listener appending the fired state to this recorder.
    #[must_use]
    pub fn listener(&self) -> Arc<dyn TransactionListener> {
        let states = Arc::clone(&self.states);
        listener_fn(move |state| {
            states.lock().push(state);
            Ok(())
        })
    }

    /// Registers the recorder for every state of `transaction`.
    pub fn attach(&self, transaction: &dyn TransactionContext) {
        for state in [
            TransactionState::Committing,
            TransactionState::Committed,
            TransactionState::RollingBack,
            TransactionState::RolledBack,
        ] {
            transaction.add_transaction_listener(state, self.listener());
        }
    }

    /// States fired so far, in order.
    #[must_use]
    pub fn states(&self) -> Vec<TransactionState> {
        self.states.lock().clone()
    }
}

/// Command returning a fixed value.
#[derive(Debug, Clone, Copy)]
pub struct ConstantCommand(pub u32);

#[async_trait]
impl Command for ConstantCommand {
    type Output = u32;

    async fn execute(&self, _context: &mut CommandContext) -> PipelineResult<u32> {
        Ok(self.0)
    }
}

/// Command failing with [`PipelineError::Command`].
#[derive(Debug, Clone, Copy)]
pub struct FailingCommand(pub &'static str);

#[async_trait]
impl Command for FailingCommand {
    type Output = ();

    async fn execute(&self, _context: &mut CommandContext) -> PipelineResult<()> {
        Err(PipelineError::command(self.0))
    }
}

/// Command failing with a conflict a fixed number of times, then succeeding
/// with the number of the successful attempt.
///
/// Clones share the attempt counter.
#[derive(Debug, Clone)]
pub struct ConflictingCommand {
    conflicts: u32,
    attempts: Arc<AtomicU32>,
}

impl ConflictingCommand {
    /// Creates a command conflicting on its first `conflicts` attempts.
    #[must_use]
    pub fn new(conflicts: u32) -> Self {
        Self { conflicts, attempts: Arc::new(AtomicU32::new(0)) }
    }

    /// Attempts made so far.
    #[must_use]
    pub fn attempts(&self) -> u32 {
        self.attempts.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl Command for ConflictingCommand {
    type Output = u32;

    async fn execute(&self, _context: &mut CommandContext) -> PipelineResult<u32> {
        let attempt = self.attempts.fetch_add(1, Ordering::Relaxed) + 1;
        if attempt <= self.conflicts {
            return Err(PipelineError::conflict(format!("conflict on attempt {attempt}")));
        }
        Ok(attempt)
    }
}

/// Assert that a [`PipelineResult`] failed with a write conflict.
///
/// # Examples
///
/// ```no_run
/// // Requires the `testutil` feature to be enabled.
/// use process_engine_command::{PipelineError, PipelineResult, assert_conflict};
///
/// let result: PipelineResult<()> = Err(PipelineError::conflict("stale"));
/// assert_conflict!(result);
/// ```
#[macro_export]
macro_rules! assert_conflict {
    ($result:expr) => {
        assert!(
            matches!(&$result, Err(err) if err.is_conflict()),
            "expected a conflict, got: {:?}",
            $result,
        );
    };
    ($result:expr, $msg:expr) => {
        assert!(
            matches!(&$result, Err(err) if err.is_conflict()),
            "{}: expected a conflict, got: {:?}",
            $msg,
            $result,
        );
    };
}

/// Assert that a [`PipelineResult`] failed with the given [`ErrorKind`](crate::ErrorKind).
#[macro_export]
macro_rules! assert_error_kind {
    ($result:expr, $kind:expr) => {
        assert!(
            matches!(&$result, Err(err) if err.kind() == $kind),
            "expected {:?} error, got: {:?}",
            $kind,
            $result,
        );
    };
}

/// Assert that a [`PipelineResult`] is `Ok`.
///
/// Returns the inner value on success, panics with a descriptive message
/// on failure.
#[macro_export]
macro_rules! assert_pipeline_ok {
    ($result:expr) => {
        match $result {
            Ok(val) => val,
            Err(e) => panic!("expected Ok, got PipelineError: {e:?}"),
        }
    };
    ($result:expr, $msg:expr) => {
        match $result {
            Ok(val) => val,
            Err(e) => panic!("{}: expected Ok, got PipelineError: {e:?}", $msg),
        }
    };
}

#[cfg(test)]
#[allow(clippy::expect_used, clippy::panic)]
mod tests {
    use super::*;
    use crate::ErrorKind;

    #[tokio::test]
    async fn test_recording_manager_tracks_status() {
        let manager = RecordingTransactionManager::new();
        let first = manager.begin().await.expect("begin");
        let second = manager.begin().await.expect("begin");
        assert_eq!((first.0, second.0), (1, 2));

        manager.set_rollback_only(first).expect("mark");
        manager.commit(second).await.expect("commit");

        assert_eq!(manager.status(first), ResourceStatus::MarkedRollback);
        assert_eq!(manager.status(second), ResourceStatus::Committed);
        assert_eq!(manager.status(TransactionId(9)), ResourceStatus::Unknown);
        assert!(manager.set_rollback_only(second).is_err());
    }

    #[test]
    fn test_assert_conflict_macro() {
        let result: PipelineResult<()> = Err(PipelineError::conflict("stale"));
        assert_conflict!(result);
    }

    #[test]
    fn test_assert_error_kind_macro() {
        let result: PipelineResult<()> = Err(PipelineError::command("boom"));
        assert_error_kind!(result, ErrorKind::Command);
    }

    #[test]
    fn test_assert_pipeline_ok_macro() {
        let result: PipelineResult<i32> = Ok(42);
        let val = assert_pipeline_ok!(result);
        assert_eq!(val, 42);
    }
}
