//! Connection and transaction state machine.
//!
//! A [`Connection`] owns one driver session. Every operation moves it from idle to busy, runs on a
//! spawned task holding the session, and moves it back to idle when that task is done. Callers
//! awaiting with a timeout only stop waiting; the task still finishes and the state machine still
//! settles.

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use bb8::PooledConnection;
use tokio::runtime::Handle;
use tokio::sync::{Mutex, OwnedMutexGuard, watch};
use tracing::{debug, info, warn};

use crate::driver::{AbortHandle, DriverCapabilities, ParamChecker, Session};
use crate::error::SqlSessionError;
use crate::options::StatementOptions;
use crate::pool::SessionManager;
use crate::statement::Statement;

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// Transaction phase of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxPhase {
    None,
    Active,
    /// A commit or rollback is in flight.
    Ending,
}

/// Externally visible state of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Ready for the next operation, no transaction open.
    Idle,
    /// Ready for the next operation inside an open transaction.
    IdleInTx,
    /// An operation, or a stream, is using the session.
    Busy,
    Released,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Lifecycle {
    Idle,
    Busy,
    Released,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct ConnState {
    lifecycle: Lifecycle,
    tx: TxPhase,
}

pub(crate) enum SessionSlot {
    Pooled(PooledConnection<'static, SessionManager>),
    Dedicated(Box<dyn Session>),
}

impl SessionSlot {
    fn session(&mut self) -> &mut (dyn Session + 'static) {
        match self {
            SessionSlot::Pooled(conn) => &mut ***conn,
            SessionSlot::Dedicated(session) => &mut **session,
        }
    }

    async fn release(mut self) {
        if let SessionSlot::Dedicated(session) = &mut self {
            if let Err(err) = session.close().await {
                warn!(error = %err, "closing session failed");
            }
        }
    }
}

struct Shared {
    id: u64,
    slot: Arc<Mutex<Option<SessionSlot>>>,
    state: watch::Sender<ConnState>,
    checker: Arc<dyn ParamChecker>,
    capabilities: DriverCapabilities,
    abort: Option<AbortHandle>,
}

impl Shared {
    fn leave(&self, next: Lifecycle, tx: TxPhase) {
        self.state.send_if_modified(|state| {
            if state.lifecycle != Lifecycle::Busy {
                return false;
            }
            state.lifecycle = next;
            state.tx = tx;
            true
        });
    }

    fn interrupt(&self) {
        if let Some(abort) = &self.abort {
            abort();
        }
    }
}

impl Drop for Shared {
    fn drop(&mut self) {
        let state = *self.state.borrow();
        if state.lifecycle == Lifecycle::Released || state.tx != TxPhase::Active {
            return;
        }
        warn!(
            connection = self.id,
            "connection dropped with an open transaction, rolling back"
        );
        let slot = Arc::clone(&self.slot);
        if let Ok(handle) = Handle::try_current() {
            handle.spawn(async move {
                let mut guard = slot.lock().await;
                if let Some(slot) = guard.as_mut() {
                    let session = slot.session();
                    if let Err(err) = session.rollback().await {
                        warn!(error = %err, "rollback of abandoned transaction failed");
                        session.mark_broken();
                    }
                }
            });
        } else if let Ok(mut guard) = slot.try_lock() {
            if let Some(slot) = guard.as_mut() {
                slot.session().mark_broken();
            }
        }
    }
}

/// Holds a connection in the busy state; leaving it puts the connection back to idle.
pub(crate) struct BusyGuard {
    shared: Arc<Shared>,
    next: Lifecycle,
    tx: TxPhase,
}

impl Drop for BusyGuard {
    fn drop(&mut self) {
        self.shared.leave(self.next, self.tx);
    }
}

/// Exclusive access to the session for the duration of one operation.
pub(crate) struct SessionLease {
    slot: OwnedMutexGuard<Option<SessionSlot>>,
    busy: BusyGuard,
}

impl SessionLease {
    pub(crate) async fn acquire(busy: BusyGuard) -> Self {
        let slot = Arc::clone(&busy.shared.slot).lock_owned().await;
        Self { slot, busy }
    }

    pub(crate) fn session(&mut self) -> Result<&mut (dyn Session + 'static), SqlSessionError> {
        self.slot
            .as_mut()
            .map(SessionSlot::session)
            .ok_or_else(|| SqlSessionError::IllegalState("connection released".into()))
    }

    pub(crate) fn tx_phase(&self) -> TxPhase {
        self.busy.tx
    }

    fn set_tx_phase(&mut self, tx: TxPhase) {
        self.busy.tx = tx;
    }

    fn connection_id(&self) -> u64 {
        self.busy.shared.id
    }

    fn take_slot(&mut self) -> Option<SessionSlot> {
        self.busy.next = Lifecycle::Released;
        self.slot.take()
    }
}

/// One exclusive session to a database.
///
/// `Connection` is a cheap handle; clones refer to the same session and share its state machine.
/// Only one operation may be in flight at a time: issuing another while the connection is busy
/// fails with [`SqlSessionError::IllegalState`].
#[derive(Clone)]
pub struct Connection {
    shared: Arc<Shared>,
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.shared.id)
            .field("state", &self.state())
            .finish()
    }
}

impl Connection {
    pub(crate) fn from_slot(mut slot: SessionSlot) -> Self {
        let session = slot.session();
        let checker = session.param_checker();
        let capabilities = session.capabilities();
        let abort = session.abort_handle();
        let (state, _) = watch::channel(ConnState {
            lifecycle: Lifecycle::Idle,
            tx: TxPhase::None,
        });
        let id = NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed);
        debug!(connection = id, "connection opened");
        Self {
            shared: Arc::new(Shared {
                id,
                slot: Arc::new(Mutex::new(Some(slot))),
                state,
                checker,
                capabilities,
                abort,
            }),
        }
    }

    /// Wrap a session that is not managed by a pool. Releasing the connection closes it.
    #[must_use]
    pub fn dedicated(session: Box<dyn Session>) -> Self {
        Self::from_slot(SessionSlot::Dedicated(session))
    }

    #[must_use]
    pub fn state(&self) -> ConnectionState {
        let state = *self.shared.state.borrow();
        match (state.lifecycle, state.tx) {
            (Lifecycle::Released, _) => ConnectionState::Released,
            (Lifecycle::Busy, _) => ConnectionState::Busy,
            (Lifecycle::Idle, TxPhase::None) => ConnectionState::Idle,
            (Lifecycle::Idle, _) => ConnectionState::IdleInTx,
        }
    }

    #[must_use]
    pub fn tx_phase(&self) -> TxPhase {
        self.shared.state.borrow().tx
    }

    #[must_use]
    pub fn capabilities(&self) -> DriverCapabilities {
        self.shared.capabilities
    }

    pub(crate) fn param_checker(&self) -> &Arc<dyn ParamChecker> {
        &self.shared.checker
    }

    pub(crate) fn id(&self) -> u64 {
        self.shared.id
    }

    pub(crate) fn abort_handle(&self) -> Option<AbortHandle> {
        self.shared.abort.clone()
    }

    /// Move from idle to busy if `check` accepts the current transaction phase.
    pub(crate) fn start<C>(&self, check: C) -> Result<BusyGuard, SqlSessionError>
    where
        C: FnOnce(TxPhase) -> Result<(), SqlSessionError>,
    {
        let mut outcome = Err(SqlSessionError::IllegalState("connection busy".into()));
        self.shared.state.send_if_modified(|state| match state.lifecycle {
            Lifecycle::Released => {
                outcome = Err(SqlSessionError::IllegalState("connection released".into()));
                false
            }
            Lifecycle::Busy => false,
            Lifecycle::Idle => match check(state.tx) {
                Ok(()) => {
                    outcome = Ok(state.tx);
                    state.lifecycle = Lifecycle::Busy;
                    true
                }
                Err(err) => {
                    outcome = Err(err);
                    false
                }
            },
        });
        outcome.map(|tx| BusyGuard {
            shared: Arc::clone(&self.shared),
            next: Lifecycle::Idle,
            tx,
        })
    }

    /// Run `body` on a spawned task holding the session, waiting at most `timeout` for it.
    pub(crate) async fn run<T, C, F, Fut>(
        &self,
        timeout: Option<Duration>,
        check: C,
        body: F,
    ) -> Result<T, SqlSessionError>
    where
        T: Send + 'static,
        C: FnOnce(TxPhase) -> Result<(), SqlSessionError>,
        F: FnOnce(SessionLease) -> Fut + Send + 'static,
        Fut: Future<Output = Result<T, SqlSessionError>> + Send + 'static,
    {
        let busy = self.start(check)?;
        self.run_started(timeout, busy, body).await
    }

    /// [`Connection::run`] for a caller that already moved the connection to busy.
    pub(crate) async fn run_started<T, F, Fut>(
        &self,
        timeout: Option<Duration>,
        busy: BusyGuard,
        body: F,
    ) -> Result<T, SqlSessionError>
    where
        T: Send + 'static,
        F: FnOnce(SessionLease) -> Fut + Send + 'static,
        Fut: Future<Output = Result<T, SqlSessionError>> + Send + 'static,
    {
        let task = tokio::spawn(async move {
            let lease = SessionLease::acquire(busy).await;
            body(lease).await
        });
        let joined = match timeout {
            Some(limit) => match tokio::time::timeout(limit, task).await {
                Ok(joined) => joined,
                Err(_) => {
                    warn!(connection = self.shared.id, ?limit, "operation timed out");
                    self.shared.interrupt();
                    return Err(SqlSessionError::Timeout(limit));
                }
            },
            None => task.await,
        };
        joined.map_err(|err| {
            SqlSessionError::ExecutionError(format!("connection task failed: {err}"))
        })?
    }

    /// Begin a transaction. Legal only when no transaction is open.
    ///
    /// # Errors
    /// [`SqlSessionError::BeginTx`] when the driver refuses, [`SqlSessionError::IllegalState`] when
    /// a transaction is already open or the connection is busy or released.
    pub async fn begin_tx(&self) -> Result<(), SqlSessionError> {
        self.begin_tx_timeout(None).await
    }

    /// [`Connection::begin_tx`] with an optional deadline.
    ///
    /// # Errors
    /// As [`Connection::begin_tx`], plus [`SqlSessionError::Timeout`].
    pub async fn begin_tx_timeout(&self, timeout: Option<Duration>) -> Result<(), SqlSessionError> {
        self.run(timeout, require_no_tx, begin_body).await
    }

    /// Commit the open transaction.
    ///
    /// A failed commit is followed by a rollback attempt; either way the connection leaves the
    /// transaction.
    ///
    /// # Errors
    /// [`SqlSessionError::CommitTx`] when the driver refuses, [`SqlSessionError::IllegalState`]
    /// when no transaction is open.
    pub async fn commit_tx(&self) -> Result<(), SqlSessionError> {
        self.commit_tx_timeout(None).await
    }

    /// [`Connection::commit_tx`] with an optional deadline.
    ///
    /// # Errors
    /// As [`Connection::commit_tx`], plus [`SqlSessionError::Timeout`].
    pub async fn commit_tx_timeout(
        &self,
        timeout: Option<Duration>,
    ) -> Result<(), SqlSessionError> {
        let busy = self.start(require_tx)?;
        self.mark_ending();
        self.run_started(timeout, busy, |mut lease| async move {
            let id = lease.connection_id();
            let outcome = {
                let session = lease.session()?;
                match session.commit().await {
                    Ok(()) => Ok(()),
                    Err(err) => {
                        warn!(connection = id, error = %err, "commit failed, rolling back");
                        if let Err(rollback_err) = session.rollback().await {
                            warn!(connection = id, error = %rollback_err, "rollback after failed commit failed");
                            session.mark_broken();
                        }
                        Err(commit_error(err))
                    }
                }
            };
            lease.set_tx_phase(TxPhase::None);
            debug!(connection = id, ok = outcome.is_ok(), "transaction committed");
            outcome
        })
        .await
    }

    /// Roll back the open transaction.
    ///
    /// # Errors
    /// [`SqlSessionError::RollbackTx`] when the driver refuses, in which case the session is
    /// marked broken; [`SqlSessionError::IllegalState`] when no transaction is open.
    pub async fn rollback_tx(&self) -> Result<(), SqlSessionError> {
        self.rollback_tx_timeout(None).await
    }

    /// [`Connection::rollback_tx`] with an optional deadline.
    ///
    /// # Errors
    /// As [`Connection::rollback_tx`], plus [`SqlSessionError::Timeout`].
    pub async fn rollback_tx_timeout(
        &self,
        timeout: Option<Duration>,
    ) -> Result<(), SqlSessionError> {
        let busy = self.start(require_tx)?;
        self.mark_ending();
        self.run_started(timeout, busy, rollback_body).await
    }

    /// Run `body` inside a transaction: commit when it succeeds, roll back when it fails.
    ///
    /// The body's own error is returned unchanged. If the returned future is dropped before it
    /// settles, the transaction is rolled back in the background; await
    /// [`Connection::watch_for_idle`] before reusing the connection in that case.
    ///
    /// ```rust,no_run
    /// # async fn demo(conn: sql_session::Connection) -> Result<(), sql_session::SqlSessionError> {
    /// let moved = conn
    ///     .with_transaction(|tx| async move {
    ///         tx.statement("update accounts set balance = balance - :amt where id = :id")?
    ///             .arg("amt", 10_i64)
    ///             .arg("id", 1_i64)
    ///             .bind()?
    ///             .execute_for_rows_affected()
    ///             .await
    ///     })
    ///     .await?;
    /// assert_eq!(moved, 1);
    /// # Ok(())
    /// # }
    /// ```
    ///
    /// # Errors
    /// Begin and commit failures, or whatever `body` returned.
    pub async fn with_transaction<T, F, Fut>(&self, body: F) -> Result<T, SqlSessionError>
    where
        F: FnOnce(Connection) -> Fut,
        Fut: Future<Output = Result<T, SqlSessionError>>,
    {
        self.with_transaction_timeout(None, body).await
    }

    /// [`Connection::with_transaction`] where `timeout` bounds each call that manages the
    /// transaction: begin, then commit or rollback. The body itself runs unbounded.
    ///
    /// A begin that times out is rolled back in the background once it lands, so the connection
    /// never stays inside a transaction nobody owns.
    ///
    /// # Errors
    /// As [`Connection::with_transaction`], plus [`SqlSessionError::Timeout`].
    pub async fn with_transaction_timeout<T, F, Fut>(
        &self,
        timeout: Option<Duration>,
        body: F,
    ) -> Result<T, SqlSessionError>
    where
        F: FnOnce(Connection) -> Fut,
        Fut: Future<Output = Result<T, SqlSessionError>>,
    {
        let busy = self.start(require_no_tx)?;
        // Armed before begin is awaited: the begin task outlives a timeout or a dropped caller.
        let mut scope = TxScope {
            conn: self,
            armed: true,
        };
        match self.run_started(timeout, busy, begin_body).await {
            Ok(()) => {}
            Err(err @ SqlSessionError::Timeout(_)) => return Err(err),
            Err(err) => {
                scope.armed = false;
                return Err(err);
            }
        }

        let outcome = body(self.clone()).await;

        // A stream left running by the body still owns the session.
        let settled = self.watch_for_idle().await;
        scope.armed = false;
        if settled.is_err() || self.tx_phase() != TxPhase::Active {
            return outcome;
        }
        match outcome {
            Ok(value) => {
                self.commit_tx_timeout(timeout).await?;
                Ok(value)
            }
            Err(err) => {
                if let Err(rollback_err) = self.rollback_tx_timeout(timeout).await {
                    warn!(connection = self.shared.id, error = %rollback_err, "rollback after failed transaction body failed");
                }
                Err(err)
            }
        }
    }

    /// Give the session back.
    ///
    /// An open transaction is rolled back first. Releasing an already released connection is a
    /// no-op.
    ///
    /// # Errors
    /// [`SqlSessionError::ConnectionRelease`] while an operation or stream is in flight; use
    /// [`Connection::force_release`] in that case.
    pub async fn release(&self) -> Result<(), SqlSessionError> {
        if self.state() == ConnectionState::Released {
            return Ok(());
        }
        let busy = self.start(|_| Ok(())).map_err(|err| match err {
            SqlSessionError::IllegalState(msg) => SqlSessionError::ConnectionRelease(msg),
            other => other,
        })?;
        self.run_started(None, busy, |mut lease| async move {
            let id = lease.connection_id();
            if lease.tx_phase() == TxPhase::Active {
                warn!(connection = id, "releasing connection with an open transaction, rolling back");
                let session = lease.session()?;
                if let Err(err) = session.rollback().await {
                    warn!(connection = id, error = %err, "rollback on release failed");
                    session.mark_broken();
                }
                lease.set_tx_phase(TxPhase::None);
            }
            if let Some(slot) = lease.take_slot() {
                slot.release().await;
            }
            debug!(connection = id, "connection released");
            Ok(())
        })
        .await
    }

    /// Abandon the session from any state. The session is marked broken so a pool discards it.
    ///
    /// An in-flight operation is interrupted on a best-effort basis and the session is dropped
    /// once that operation lets go of it.
    pub fn force_release(&self) {
        let mut was_busy = false;
        let changed = self.shared.state.send_if_modified(|state| {
            if state.lifecycle == Lifecycle::Released {
                return false;
            }
            was_busy = state.lifecycle == Lifecycle::Busy;
            state.lifecycle = Lifecycle::Released;
            state.tx = TxPhase::None;
            true
        });
        if !changed {
            return;
        }
        info!(connection = self.shared.id, busy = was_busy, "force releasing connection");
        if was_busy {
            self.shared.interrupt();
        }

        let slot = Arc::clone(&self.shared.slot);
        if let Ok(mut guard) = slot.try_lock() {
            discard(guard.take());
        } else if let Ok(handle) = Handle::try_current() {
            handle.spawn(async move {
                discard(slot.lock().await.take());
            });
        }
    }

    /// Liveness check. Does not touch the transaction phase.
    ///
    /// # Errors
    /// [`SqlSessionError::ConnectionValidation`] when the check fails, [`SqlSessionError::Timeout`]
    /// when it does not answer in time.
    pub async fn validate(&self, timeout: Option<Duration>) -> Result<(), SqlSessionError> {
        self.run(timeout, |_| Ok(()), |mut lease| async move {
            lease.session()?.validate().await.map_err(|err| match err {
                SqlSessionError::ConnectionValidation(_) => err,
                other => SqlSessionError::ConnectionValidation(other.to_string()),
            })
        })
        .await
    }

    /// Resolve once the connection is ready for the next operation.
    ///
    /// Needed after cancelling a stream: the stream's task may still be closing the cursor.
    ///
    /// # Errors
    /// [`SqlSessionError::IllegalState`] if the connection is, or becomes, released.
    pub async fn watch_for_idle(&self) -> Result<(), SqlSessionError> {
        let mut rx = self.shared.state.subscribe();
        let state = rx
            .wait_for(|state| state.lifecycle != Lifecycle::Busy)
            .await
            .map_err(|_| SqlSessionError::IllegalState("connection dropped".into()))?;
        if state.lifecycle == Lifecycle::Released {
            return Err(SqlSessionError::IllegalState("connection released".into()));
        }
        Ok(())
    }

    /// Prepare a statement from a template with `:name` parameters. Performs no I/O.
    ///
    /// # Errors
    /// [`SqlSessionError::IllegalState`] on a released connection.
    pub fn statement(&self, sql: &str) -> Result<Statement, SqlSessionError> {
        self.statement_with_options(sql, StatementOptions::default())
    }

    /// [`Connection::statement`] with explicit options.
    ///
    /// # Errors
    /// [`SqlSessionError::IllegalState`] on a released connection.
    pub fn statement_with_options(
        &self,
        sql: &str,
        options: StatementOptions,
    ) -> Result<Statement, SqlSessionError> {
        if self.state() == ConnectionState::Released {
            return Err(SqlSessionError::IllegalState("connection released".into()));
        }
        Ok(Statement::new(self.clone(), sql, options))
    }

    fn mark_ending(&self) {
        self.shared.state.send_if_modified(|state| {
            if state.lifecycle == Lifecycle::Busy && state.tx == TxPhase::Active {
                state.tx = TxPhase::Ending;
                true
            } else {
                false
            }
        });
    }

    /// Roll back without waiting; used when a transaction scope is dropped mid-flight.
    fn rollback_in_background(&self) {
        let Ok(handle) = Handle::try_current() else {
            warn!(connection = self.shared.id, "no runtime to roll back abandoned transaction");
            self.force_release();
            return;
        };
        match self.start(require_tx) {
            Ok(busy) => {
                self.mark_ending();
                handle.spawn(async move {
                    let lease = SessionLease::acquire(busy).await;
                    let _ = rollback_body(lease).await;
                });
            }
            Err(_) => {
                let conn = self.clone();
                handle.spawn(async move {
                    if conn.watch_for_idle().await.is_ok() && conn.tx_phase() == TxPhase::Active {
                        if let Err(err) = conn.rollback_tx().await {
                            warn!(connection = conn.shared.id, error = %err, "background rollback failed");
                        }
                    }
                });
            }
        }
    }
}

/// Rolls back if dropped before the owning `with_transaction` settles.
struct TxScope<'a> {
    conn: &'a Connection,
    armed: bool,
}

impl Drop for TxScope<'_> {
    fn drop(&mut self) {
        if self.armed {
            warn!(
                connection = self.conn.shared.id,
                "transaction scope cancelled, rolling back"
            );
            self.conn.rollback_in_background();
        }
    }
}

async fn begin_body(mut lease: SessionLease) -> Result<(), SqlSessionError> {
    lease.session()?.begin().await.map_err(begin_error)?;
    lease.set_tx_phase(TxPhase::Active);
    debug!(connection = lease.connection_id(), "transaction started");
    Ok(())
}

async fn rollback_body(mut lease: SessionLease) -> Result<(), SqlSessionError> {
    let id = lease.connection_id();
    let outcome = {
        let session = lease.session()?;
        session.rollback().await.map_err(|err| {
            warn!(connection = id, error = %err, "rollback failed, discarding session");
            session.mark_broken();
            rollback_error(err)
        })
    };
    lease.set_tx_phase(TxPhase::None);
    debug!(connection = id, ok = outcome.is_ok(), "transaction rolled back");
    outcome
}

fn discard(slot: Option<SessionSlot>) {
    if let Some(mut slot) = slot {
        slot.session().mark_broken();
    }
}

fn require_no_tx(tx: TxPhase) -> Result<(), SqlSessionError> {
    match tx {
        TxPhase::None => Ok(()),
        _ => Err(SqlSessionError::IllegalState(
            "transaction already active".into(),
        )),
    }
}

fn require_tx(tx: TxPhase) -> Result<(), SqlSessionError> {
    match tx {
        TxPhase::Active => Ok(()),
        _ => Err(SqlSessionError::IllegalState("no active transaction".into())),
    }
}

fn begin_error(err: SqlSessionError) -> SqlSessionError {
    match err {
        SqlSessionError::BeginTx(_) | SqlSessionError::IllegalState(_) => err,
        other => SqlSessionError::BeginTx(other.to_string()),
    }
}

fn commit_error(err: SqlSessionError) -> SqlSessionError {
    match err {
        SqlSessionError::CommitTx(_) => err,
        other => SqlSessionError::CommitTx(other.to_string()),
    }
}

fn rollback_error(err: SqlSessionError) -> SqlSessionError {
    match err {
        SqlSessionError::RollbackTx(_) => err,
        other => SqlSessionError::RollbackTx(other.to_string()),
    }
}
