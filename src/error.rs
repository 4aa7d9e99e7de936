use std::time::Duration;

use thiserror::Error;

/// Every failure this crate can surface.
///
/// Variants are grouped the same way callers usually handle them: binding errors are raised
/// before any I/O, execution and transaction errors arrive through the operation's own result,
/// and conversion/access errors are local to reading a [`Row`](crate::Row).
#[derive(Debug, Clone, Error, PartialEq)]
pub enum SqlSessionError {
    /// An argument was supplied for a parameter the statement does not declare.
    #[error("no parameter named '{0}' is declared by the statement")]
    NoSuchParam(String),

    /// A declared parameter was left without a value.
    #[error("missing value for parameter '{0}'")]
    MissingParamVal(String),

    /// More positional arguments than declared parameters.
    #[error("statement declares {declared} parameters but {provided} were provided")]
    TooManyParams { declared: usize, provided: usize },

    /// The driver has no mapping for the supplied value.
    #[error("no suitable converter for parameter '{param}' holding {value}")]
    NoSuitableConverter { param: String, value: String },

    #[error("unauthorized: {0}")]
    Unauthorized(String),

    #[error("invalid query: {0}")]
    InvalidQuery(String),

    /// A transaction exists but can no longer run statements.
    #[error("inactive transaction: {0}")]
    InactiveTx(String),

    #[error("constraint {constraint} violated on table {schema}.{table}: {message}")]
    ConstraintViolation {
        schema: String,
        table: String,
        constraint: String,
        message: String,
    },

    #[error("could not begin transaction: {0}")]
    BeginTx(String),

    #[error("could not commit transaction: {0}")]
    CommitTx(String),

    #[error("could not roll back transaction: {0}")]
    RollbackTx(String),

    /// The caller stopped waiting. The underlying work may still be running.
    #[error("operation timed out after {0:?}")]
    Timeout(Duration),

    #[error("value '{value}' could not be converted to '{target}'")]
    Conversion { value: String, target: &'static str },

    #[error("no column named '{0}'")]
    MissingColumn(String),

    #[error("requested index {idx} is out of range, column count is {column_count}")]
    ColumnIndexOutOfBounds { idx: usize, column_count: usize },

    #[error("connection release failed: {0}")]
    ConnectionRelease(String),

    #[error("connection validation failed: {0}")]
    ConnectionValidation(String),

    /// The operation is not legal in the connection's current state.
    #[error("illegal connection state: {0}")]
    IllegalState(String),

    /// An accessor was called on a variant that carries no such value.
    #[error("value absent: {0}")]
    ValueAbsent(String),

    #[error("could not acquire connection: {0}")]
    Acquire(String),

    #[error("connection factory has been shut down")]
    FactoryShutdown,

    #[error("Connection error: {0}")]
    ConnectionError(String),

    #[error("SQL execution error: {0}")]
    ExecutionError(String),
}

impl SqlSessionError {
    pub(crate) fn conversion(value: &crate::SqlValue, target: &'static str) -> Self {
        SqlSessionError::Conversion {
            value: value.to_string(),
            target,
        }
    }

    /// True for the failures that are detected while binding, before any I/O.
    #[must_use]
    pub fn is_binding_error(&self) -> bool {
        matches!(
            self,
            SqlSessionError::NoSuchParam(_)
                | SqlSessionError::MissingParamVal(_)
                | SqlSessionError::TooManyParams { .. }
                | SqlSessionError::NoSuitableConverter { .. }
        )
    }
}
