//! Async connection, transaction and row-streaming layer for relational databases.
//!
//! Drivers implement the small [`driver`] contract; this crate supplies the rest: a connection
//! state machine that serializes operations and tracks transactions, a binder for `:name`
//! placeholders, execution shapes from "rows affected" to a backpressured [`RowStream`], typed row
//! accessors, and a pooled [`ConnectionFactory`]. A `SQLite` driver ships behind the `sqlite`
//! feature.
//!
//! ```rust,no_run
//! use sql_session::prelude::*;
//!
//! # async fn demo() -> Result<(), SqlSessionError> {
//! let factory = ConnectionFactory::sqlite_builder("app.db".into()).build().await?;
//! let name = factory
//!     .with_connection(|conn| async move {
//!         conn.statement("select name from users where id = :id")?
//!             .arg("id", 7_i64)
//!             .bind()?
//!             .execute_for_value(|row| row.get_str("name"))
//!             .await
//!     })
//!     .await?;
//! println!("{name:?}");
//! # Ok(())
//! # }
//! ```
#![forbid(unsafe_code)]

pub mod prelude;

mod connection;
pub mod conversion;
mod decimal;
pub mod driver;
mod error;
mod executor;
mod metadata;
mod options;
pub mod placeholders;
mod pool;
mod results;
mod statement;
mod stream;
mod types;

#[cfg(feature = "sqlite")]
pub mod sqlite;

#[cfg(feature = "test-utils")]
pub mod test_utils;

pub use connection::{Connection, ConnectionState, TxPhase};
pub use conversion::FromSqlValue;
pub use decimal::DecimalNumber;
pub use driver::DriverCapabilities;
pub use error::SqlSessionError;
pub use executor::ExecutableStatement;
pub use metadata::{ColumnMetadata, RowMetadata, Warning};
pub use options::{KeyColumns, KeyColumnsKind, StatementOptions};
pub use pool::{ConnectionFactory, FactoryConfig, SessionManager};
pub use results::{ColumnIndex, ResultSet, Row};
pub use statement::{Statement, StatementArgBinder};
pub use stream::RowStream;
pub use types::{SqlParam, SqlType, SqlValue};

#[cfg(feature = "sqlite")]
pub use sqlite::{SqliteConnector, SqliteOptions, SqliteOptionsBuilder, SqliteSession};
