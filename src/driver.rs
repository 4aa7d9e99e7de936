//! Driver-facing contract.
//!
//! A driver provides a [`Connector`] that opens [`Session`]s. Everything above this module
//! (connection state machine, binder, execution shapes, streaming) is written against these
//! traits only, so a driver never has to know about transaction phases, busy tracking or
//! backpressure.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;

use crate::error::SqlSessionError;
use crate::metadata::{RowMetadata, Warning};
use crate::options::StatementOptions;
use crate::types::{SqlParam, SqlValue};

/// Best-effort interrupt of whatever the session is currently running.
pub type AbortHandle = Arc<dyn Fn() + Send + Sync>;

/// Optional behaviours a driver may or may not support.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DriverCapabilities {
    /// Whether one bound statement may be executed more than once.
    pub reusable_statements: bool,
}

impl Default for DriverCapabilities {
    fn default() -> Self {
        Self {
            reusable_statements: true,
        }
    }
}

/// Decides, before any I/O, whether the driver can send a parameter value.
pub trait ParamChecker: Send + Sync {
    /// # Errors
    /// Returns [`SqlSessionError::NoSuitableConverter`] when `param` has no database mapping.
    fn check(&self, name: &str, param: &SqlParam) -> Result<(), SqlSessionError>;
}

/// Checker for drivers that accept every [`SqlParam`].
#[derive(Debug, Default, Clone, Copy)]
pub struct AcceptAll;

impl ParamChecker for AcceptAll {
    fn check(&self, _name: &str, _param: &SqlParam) -> Result<(), SqlSessionError> {
        Ok(())
    }
}

/// A statement ready to be sent: positional SQL plus one value per `?N` placeholder.
#[derive(Debug, Clone, PartialEq)]
pub struct BoundStatement {
    /// SQL in positional `?N` form.
    pub sql: String,
    /// `params[i]` binds `?{i + 1}`.
    pub params: Vec<SqlParam>,
    pub options: StatementOptions,
}

impl BoundStatement {
    /// Values as the driver sends them; typed NULLs become [`SqlValue::Null`].
    #[must_use]
    pub fn values(&self) -> Vec<SqlValue> {
        self.params.iter().map(SqlParam::to_value).collect()
    }
}

/// What a cursor reports once it is finished.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CursorSummary {
    pub rows_affected: u64,
    pub warnings: Vec<Warning>,
}

/// One open result, read a row at a time.
///
/// The owning session is held exclusively until the cursor is closed or abandoned.
#[async_trait]
pub trait Cursor: Send {
    fn metadata(&self) -> Arc<RowMetadata>;

    /// Next row, `None` once the result is exhausted.
    async fn fetch(&mut self) -> Result<Option<Vec<SqlValue>>, SqlSessionError>;

    /// Drain what is left and report the outcome.
    async fn close(self: Box<Self>) -> Result<CursorSummary, SqlSessionError>;

    /// Stop early without reading the remaining rows.
    async fn abandon(self: Box<Self>) -> Result<CursorSummary, SqlSessionError>;
}

/// One physical database session.
///
/// Calls are never issued concurrently; the connection layer serializes them.
#[async_trait]
pub trait Session: Send + 'static {
    fn capabilities(&self) -> DriverCapabilities {
        DriverCapabilities::default()
    }

    fn param_checker(&self) -> Arc<dyn ParamChecker> {
        Arc::new(AcceptAll)
    }

    fn abort_handle(&self) -> Option<AbortHandle> {
        None
    }

    async fn begin(&mut self) -> Result<(), SqlSessionError>;

    async fn commit(&mut self) -> Result<(), SqlSessionError>;

    async fn rollback(&mut self) -> Result<(), SqlSessionError>;

    /// Cheap liveness check.
    async fn validate(&mut self) -> Result<(), SqlSessionError>;

    /// Run `stmt` and open a cursor over its result.
    ///
    /// `in_tx` tells the driver an explicit transaction is expected to be open, so it can report
    /// [`SqlSessionError::InactiveTx`] when the engine has ended it behind our back.
    async fn open_cursor(
        &mut self,
        stmt: &BoundStatement,
        in_tx: bool,
    ) -> Result<Box<dyn Cursor>, SqlSessionError>;

    /// Free the session's resources. Called at most once, for sessions that are not pooled.
    async fn close(&mut self) -> Result<(), SqlSessionError> {
        Ok(())
    }

    fn is_broken(&self) -> bool {
        false
    }

    /// Flag the session as unusable so a pool discards it instead of handing it out again.
    fn mark_broken(&mut self);
}

/// Opens new sessions.
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    async fn connect(&self) -> Result<Box<dyn Session>, SqlSessionError>;
}

impl fmt::Debug for dyn Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("capabilities", &self.capabilities())
            .field("broken", &self.is_broken())
            .finish()
    }
}
