//! Execution shapes for a bound statement.

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use crate::connection::{Connection, TxPhase};
use crate::driver::{BoundStatement, Cursor};
use crate::error::SqlSessionError;
use crate::results::{ResultSet, Row};
use crate::stream::RowStream;

/// A statement with every parameter bound, ready to run on its connection.
///
/// Each execution shape is independent. Whether the same value may be executed twice is up to
/// the driver ([`DriverCapabilities::reusable_statements`](crate::DriverCapabilities)).
#[derive(Clone)]
pub struct ExecutableStatement {
    conn: Connection,
    bound: Arc<BoundStatement>,
    timeout: Option<Duration>,
    executed: Arc<AtomicBool>,
}

impl fmt::Debug for ExecutableStatement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExecutableStatement")
            .field("sql", &self.bound.sql)
            .field("params", &self.bound.params.len())
            .field("timeout", &self.timeout)
            .finish()
    }
}

impl ExecutableStatement {
    pub(crate) fn new(conn: Connection, bound: Arc<BoundStatement>) -> Self {
        Self {
            conn,
            bound,
            timeout: None,
            executed: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Give up waiting after `timeout`. The abort is advisory: the driver is interrupted on a
    /// best-effort basis and the connection returns to idle once it has settled.
    #[must_use]
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    #[must_use]
    pub fn bound(&self) -> &BoundStatement {
        &self.bound
    }

    /// Run and discard the result.
    ///
    /// # Errors
    /// Execution errors reported by the driver, [`SqlSessionError::Timeout`], or
    /// [`SqlSessionError::IllegalState`] when the connection is busy or released.
    pub async fn execute(&self) -> Result<(), SqlSessionError> {
        self.with_cursor(|cursor| async move { cursor.close().await.map(|_| ()) })
            .await
    }

    /// Run and buffer every row.
    ///
    /// The whole result is held in memory.
    ///
    /// # Errors
    /// As [`ExecutableStatement::execute`].
    pub async fn execute_for_set(&self) -> Result<ResultSet, SqlSessionError> {
        self.with_cursor(|mut cursor| async move {
            let metadata = cursor.metadata();
            let mut rows = Vec::new();
            loop {
                match cursor.fetch().await {
                    Ok(Some(values)) => rows.push(Row::new(Arc::clone(&metadata), values)),
                    Ok(None) => break,
                    Err(err) => return Err(abandon_after(cursor, err).await),
                }
            }
            let summary = cursor.close().await?;
            Ok(ResultSet::new(
                summary.rows_affected,
                summary.warnings,
                metadata,
                rows,
            ))
        })
        .await
    }

    /// Run and report only the affected-row count. Any rows produced are drained.
    ///
    /// # Errors
    /// As [`ExecutableStatement::execute`].
    pub async fn execute_for_rows_affected(&self) -> Result<u64, SqlSessionError> {
        self.with_cursor(|cursor| async move {
            cursor.close().await.map(|summary| summary.rows_affected)
        })
        .await
    }

    /// Run and keep the first row, `None` for an empty result. Remaining rows are drained.
    ///
    /// # Errors
    /// As [`ExecutableStatement::execute`].
    pub async fn execute_for_first_row(&self) -> Result<Option<Row>, SqlSessionError> {
        self.with_cursor(|mut cursor| async move {
            let first = match cursor.fetch().await {
                Ok(first) => first,
                Err(err) => return Err(abandon_after(cursor, err).await),
            };
            let metadata = cursor.metadata();
            cursor.close().await?;
            Ok(first.map(|values| Row::new(metadata, values)))
        })
        .await
    }

    /// Run, then apply `extract` to the first row. `None` for an empty result.
    ///
    /// ```rust,no_run
    /// # async fn demo(conn: sql_session::Connection) -> Result<(), sql_session::SqlSessionError> {
    /// let count = conn
    ///     .statement("select count(*) from users")?
    ///     .no_args()?
    ///     .execute_for_value(|row| row.get_long(0_usize))
    ///     .await?;
    /// # let _ = count;
    /// # Ok(())
    /// # }
    /// ```
    ///
    /// # Errors
    /// As [`ExecutableStatement::execute`], plus any error `extract` returns.
    pub async fn execute_for_value<T, F>(&self, extract: F) -> Result<Option<T>, SqlSessionError>
    where
        F: FnOnce(&Row) -> Result<T, SqlSessionError>,
    {
        let first = self.execute_for_first_row().await?;
        first.as_ref().map(extract).transpose()
    }

    /// Run and return a demand-driven stream of rows.
    ///
    /// The connection stays busy until the stream is drained, cancelled or dropped. After
    /// cancelling, await [`Connection::watch_for_idle`] before issuing the next operation.
    /// The timeout, if set, bounds opening the cursor and each individual fetch.
    ///
    /// # Errors
    /// [`SqlSessionError::IllegalState`] when the connection is busy or released, or when called
    /// outside a Tokio runtime. Execution errors arrive through the stream itself.
    pub fn stream(&self) -> Result<RowStream, SqlSessionError> {
        RowStream::start(&self.conn, Arc::clone(&self.bound), self.timeout, || {
            self.claim()
        })
    }

    /// Consume the single run of a statement the driver cannot re-execute. Called only once the
    /// connection has moved to busy, so a rejected call leaves the statement runnable.
    fn claim(&self) -> Result<(), SqlSessionError> {
        if self.conn.capabilities().reusable_statements {
            return Ok(());
        }
        if self.executed.swap(true, Ordering::SeqCst) {
            return Err(SqlSessionError::ExecutionError(
                "statement cannot be executed more than once on this driver".into(),
            ));
        }
        Ok(())
    }

    async fn with_cursor<T, F, Fut>(&self, consume: F) -> Result<T, SqlSessionError>
    where
        T: Send + 'static,
        F: FnOnce(Box<dyn Cursor>) -> Fut + Send + 'static,
        Fut: Future<Output = Result<T, SqlSessionError>> + Send + 'static,
    {
        let busy = self.conn.start(|_| Ok(()))?;
        self.claim()?;
        let bound = Arc::clone(&self.bound);
        self.conn
            .run_started(self.timeout, busy, move |mut lease| async move {
                let in_tx = lease.tx_phase() == TxPhase::Active;
                let cursor = lease.session()?.open_cursor(&bound, in_tx).await?;
                let outcome = consume(cursor).await;
                drop(lease);
                outcome
            })
            .await
    }
}

pub(crate) async fn abandon_after(cursor: Box<dyn Cursor>, err: SqlSessionError) -> SqlSessionError {
    if let Err(abandon_err) = cursor.abandon().await {
        tracing::debug!(error = %abandon_err, "abandoning cursor after failure also failed");
    }
    err
}
