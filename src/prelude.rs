//! Convenient imports for common functionality.
//!
//! This module re-exports the most commonly used types so application code can start with a
//! single `use sql_session::prelude::*;`.

pub use crate::{
    ColumnIndex, Connection, ConnectionFactory, ConnectionState, DecimalNumber,
    ExecutableStatement, FactoryConfig, FromSqlValue, KeyColumns, ResultSet, Row, RowMetadata,
    RowStream, SqlParam, SqlSessionError, SqlType, SqlValue, Statement, StatementOptions, TxPhase,
};

#[cfg(feature = "sqlite")]
pub use crate::sqlite::{SqliteOptions, SqliteOptionsBuilder};
