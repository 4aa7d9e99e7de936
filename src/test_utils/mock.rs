//! Scripted in-memory driver.
//!
//! A [`MockDatabase`] maps SQL text to canned [`MockResponse`]s and records every call a session
//! receives, so tests can assert on what reached the driver and in which order.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Notify;

use crate::driver::{
    AbortHandle, BoundStatement, Connector, Cursor, CursorSummary, DriverCapabilities, Session,
};
use crate::error::SqlSessionError;
use crate::metadata::{ColumnMetadata, RowMetadata, Warning};
use crate::types::SqlValue;

/// One call observed by a mock session.
#[derive(Debug, Clone, PartialEq)]
pub enum MockEvent {
    Connect,
    Begin,
    Commit,
    Rollback,
    Validate,
    /// A cursor was opened for this SQL with these values.
    Open(String, Vec<SqlValue>),
    Close,
    Abandon,
    Interrupt,
}

/// Canned outcome for one SQL text.
#[derive(Debug, Clone, Default)]
pub struct MockResponse {
    columns: Vec<String>,
    rows: Vec<Vec<SqlValue>>,
    rows_affected: Option<u64>,
    warnings: Vec<Warning>,
    error: Option<SqlSessionError>,
    fail_after: Option<(usize, SqlSessionError)>,
    delay: Option<Duration>,
}

impl MockResponse {
    /// A result with `columns` and `rows`. Rows affected defaults to the row count.
    #[must_use]
    pub fn rows<C, S>(columns: C, rows: Vec<Vec<SqlValue>>) -> Self
    where
        C: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            columns: columns.into_iter().map(Into::into).collect(),
            rows,
            ..Self::default()
        }
    }

    /// A result without rows.
    #[must_use]
    pub fn affected(rows_affected: u64) -> Self {
        Self {
            rows_affected: Some(rows_affected),
            ..Self::default()
        }
    }

    /// Opening the cursor fails with `error`.
    #[must_use]
    pub fn error(error: SqlSessionError) -> Self {
        Self {
            error: Some(error),
            ..Self::default()
        }
    }

    /// Fetching fails with `error` once `rows` rows were returned.
    #[must_use]
    pub fn failing_after(mut self, rows: usize, error: SqlSessionError) -> Self {
        self.fail_after = Some((rows, error));
        self
    }

    #[must_use]
    pub fn with_warning(mut self, warning: Warning) -> Self {
        self.warnings.push(warning);
        self
    }

    /// Wait this long before opening the cursor. Interruptible.
    #[must_use]
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }
}

#[derive(Default)]
struct MockState {
    responses: Mutex<HashMap<String, MockResponse>>,
    events: Mutex<Vec<MockEvent>>,
    active: AtomicUsize,
    max_active: AtomicUsize,
    fail_begin: AtomicBool,
    fail_commit: AtomicBool,
    fail_rollback: AtomicBool,
    single_use_statements: AtomicBool,
    begin_delay: Mutex<Option<Duration>>,
    broken_sessions: AtomicUsize,
    fetches: AtomicUsize,
}

impl MockState {
    fn record(&self, event: MockEvent) {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(event);
    }

    fn response(&self, sql: &str) -> MockResponse {
        self.responses
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(sql)
            .cloned()
            .unwrap_or_else(|| MockResponse::affected(0))
    }

    fn enter(self: &Arc<Self>) -> ActiveCall {
        let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_active.fetch_max(now, Ordering::SeqCst);
        ActiveCall {
            state: Arc::clone(self),
        }
    }
}

struct ActiveCall {
    state: Arc<MockState>,
}

impl Drop for ActiveCall {
    fn drop(&mut self) {
        self.state.active.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Shared script and call log for any number of mock sessions.
#[derive(Clone, Default)]
pub struct MockDatabase {
    state: Arc<MockState>,
}

impl std::fmt::Debug for MockDatabase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MockDatabase")
            .field("events", &self.events().len())
            .finish()
    }
}

impl MockDatabase {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Answer `sql` with `response` from now on.
    pub fn respond(&self, sql: impl Into<String>, response: MockResponse) -> &Self {
        self.state
            .responses
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(sql.into(), response);
        self
    }

    pub fn fail_begin(&self, fail: bool) -> &Self {
        self.state.fail_begin.store(fail, Ordering::SeqCst);
        self
    }

    pub fn fail_commit(&self, fail: bool) -> &Self {
        self.state.fail_commit.store(fail, Ordering::SeqCst);
        self
    }

    pub fn fail_rollback(&self, fail: bool) -> &Self {
        self.state.fail_rollback.store(fail, Ordering::SeqCst);
        self
    }

    /// Make `begin` take `delay`. The delay ignores interrupts, like a driver that finishes its
    /// begin regardless.
    pub fn delay_begin(&self, delay: Duration) -> &Self {
        *self
            .state
            .begin_delay
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(delay);
        self
    }

    /// Report statements as executable only once.
    pub fn single_use_statements(&self, single_use: bool) -> &Self {
        self.state
            .single_use_statements
            .store(single_use, Ordering::SeqCst);
        self
    }

    #[must_use]
    pub fn events(&self) -> Vec<MockEvent> {
        self.state
            .events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Events other than cursor bookkeeping, i.e. what was sent to the database.
    #[must_use]
    pub fn io_events(&self) -> Vec<MockEvent> {
        self.events()
            .into_iter()
            .filter(|event| {
                !matches!(
                    event,
                    MockEvent::Connect | MockEvent::Close | MockEvent::Abandon
                )
            })
            .collect()
    }

    pub fn clear_events(&self) {
        self.state
            .events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }

    /// Highest number of driver calls observed in flight at once.
    #[must_use]
    pub fn max_concurrent_calls(&self) -> usize {
        self.state.max_active.load(Ordering::SeqCst)
    }

    /// Rows handed out by cursors so far.
    #[must_use]
    pub fn fetches(&self) -> usize {
        self.state.fetches.load(Ordering::SeqCst)
    }

    /// Sessions that were marked broken.
    #[must_use]
    pub fn broken_sessions(&self) -> usize {
        self.state.broken_sessions.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn connector(&self) -> MockConnector {
        MockConnector { db: self.clone() }
    }

    #[must_use]
    pub fn session(&self) -> MockSession {
        self.state.record(MockEvent::Connect);
        MockSession {
            state: Arc::clone(&self.state),
            interrupt: Arc::new(Notify::new()),
            broken: false,
        }
    }
}

/// [`Connector`] handing out [`MockSession`]s.
#[derive(Debug, Clone)]
pub struct MockConnector {
    db: MockDatabase,
}

#[async_trait]
impl Connector for MockConnector {
    async fn connect(&self) -> Result<Box<dyn Session>, SqlSessionError> {
        Ok(Box::new(self.db.session()))
    }
}

/// A session answering from its [`MockDatabase`] script.
pub struct MockSession {
    state: Arc<MockState>,
    interrupt: Arc<Notify>,
    broken: bool,
}

impl MockSession {
    async fn pause(&self, delay: Option<Duration>) -> Result<(), SqlSessionError> {
        let Some(delay) = delay else {
            return Ok(());
        };
        tokio::select! {
            () = tokio::time::sleep(delay) => Ok(()),
            () = self.interrupt.notified() => {
                self.state.record(MockEvent::Interrupt);
                Err(SqlSessionError::ExecutionError("interrupted".into()))
            }
        }
    }
}

#[async_trait]
impl Session for MockSession {
    fn capabilities(&self) -> DriverCapabilities {
        DriverCapabilities {
            reusable_statements: !self.state.single_use_statements.load(Ordering::SeqCst),
        }
    }

    fn abort_handle(&self) -> Option<AbortHandle> {
        let interrupt = Arc::clone(&self.interrupt);
        Some(Arc::new(move || interrupt.notify_waiters()))
    }

    async fn begin(&mut self) -> Result<(), SqlSessionError> {
        let _call = self.state.enter();
        self.state.record(MockEvent::Begin);
        let delay = *self
            .state
            .begin_delay
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if self.state.fail_begin.load(Ordering::SeqCst) {
            return Err(SqlSessionError::BeginTx("scripted begin failure".into()));
        }
        Ok(())
    }

    async fn commit(&mut self) -> Result<(), SqlSessionError> {
        let _call = self.state.enter();
        self.state.record(MockEvent::Commit);
        if self.state.fail_commit.load(Ordering::SeqCst) {
            return Err(SqlSessionError::CommitTx("scripted commit failure".into()));
        }
        Ok(())
    }

    async fn rollback(&mut self) -> Result<(), SqlSessionError> {
        let _call = self.state.enter();
        self.state.record(MockEvent::Rollback);
        if self.state.fail_rollback.load(Ordering::SeqCst) {
            return Err(SqlSessionError::RollbackTx(
                "scripted rollback failure".into(),
            ));
        }
        Ok(())
    }

    async fn validate(&mut self) -> Result<(), SqlSessionError> {
        let _call = self.state.enter();
        self.state.record(MockEvent::Validate);
        if self.broken {
            return Err(SqlSessionError::ConnectionValidation("broken".into()));
        }
        Ok(())
    }

    async fn open_cursor(
        &mut self,
        stmt: &BoundStatement,
        _in_tx: bool,
    ) -> Result<Box<dyn Cursor>, SqlSessionError> {
        let call = self.state.enter();
        self.state
            .record(MockEvent::Open(stmt.sql.clone(), stmt.values()));
        let response = self.state.response(&stmt.sql);
        self.pause(response.delay).await?;
        if let Some(err) = response.error {
            return Err(err);
        }
        let metadata = Arc::new(RowMetadata::new(
            response
                .columns
                .iter()
                .map(|name| ColumnMetadata::new(name.as_str(), "mock"))
                .collect(),
        ));
        let summary = CursorSummary {
            rows_affected: response
                .rows_affected
                .unwrap_or(response.rows.len() as u64),
            warnings: response.warnings,
        };
        Ok(Box::new(MockCursor {
            state: Arc::clone(&self.state),
            metadata,
            rows: response.rows.into_iter(),
            fetched: 0,
            fail_after: response.fail_after,
            summary,
            _call: call,
        }))
    }

    async fn close(&mut self) -> Result<(), SqlSessionError> {
        Ok(())
    }

    fn is_broken(&self) -> bool {
        self.broken
    }

    fn mark_broken(&mut self) {
        if !self.broken {
            self.broken = true;
            self.state.broken_sessions.fetch_add(1, Ordering::SeqCst);
        }
    }
}

/// Cursor over a canned row list.
pub struct MockCursor {
    state: Arc<MockState>,
    metadata: Arc<RowMetadata>,
    rows: std::vec::IntoIter<Vec<SqlValue>>,
    fetched: usize,
    fail_after: Option<(usize, SqlSessionError)>,
    summary: CursorSummary,
    _call: ActiveCall,
}

#[async_trait]
impl Cursor for MockCursor {
    fn metadata(&self) -> Arc<RowMetadata> {
        Arc::clone(&self.metadata)
    }

    async fn fetch(&mut self) -> Result<Option<Vec<SqlValue>>, SqlSessionError> {
        if let Some((after, err)) = &self.fail_after {
            if self.fetched >= *after {
                return Err(err.clone());
            }
        }
        let row = self.rows.next();
        if row.is_some() {
            self.fetched += 1;
            self.state.fetches.fetch_add(1, Ordering::SeqCst);
        }
        Ok(row)
    }

    async fn close(self: Box<Self>) -> Result<CursorSummary, SqlSessionError> {
        self.state.record(MockEvent::Close);
        Ok(self.summary.clone())
    }

    async fn abandon(self: Box<Self>) -> Result<CursorSummary, SqlSessionError> {
        self.state.record(MockEvent::Abandon);
        Ok(CursorSummary {
            rows_affected: self.fetched as u64,
            warnings: self.summary.warnings.clone(),
        })
    }
}
