use std::sync::Arc;

use async_trait::async_trait;
use rusqlite::InterruptHandle;
use tracing::debug;

use crate::driver::{AbortHandle, BoundStatement, Cursor, CursorSummary, ParamChecker, Session};
use crate::error::SqlSessionError;
use crate::metadata::RowMetadata;
use crate::options::KeyColumns;
use crate::placeholders::leading_keyword;
use crate::types::SqlValue;

use super::params::{SqliteParamChecker, convert_params};
use super::worker::{Control, OpenRequest, SqliteWorker, WorkerCursor};

/// Transactions are driven through the connection API, never through statement text.
const TX_CONTROL_KEYWORDS: &[&str] = &["BEGIN", "COMMIT", "ROLLBACK", "END", "SAVEPOINT", "RELEASE"];
const CHANGE_KEYWORDS: &[&str] = &["INSERT", "UPDATE", "DELETE", "REPLACE", "WITH"];

/// One `SQLite` database session, running on its own worker thread.
pub struct SqliteSession {
    worker: SqliteWorker,
    interrupt: Arc<InterruptHandle>,
    broken: bool,
}

impl SqliteSession {
    pub(crate) fn new(worker: SqliteWorker, interrupt: InterruptHandle) -> Self {
        Self {
            worker,
            interrupt: Arc::new(interrupt),
            broken: false,
        }
    }

    fn check_broken(&self) -> Result<(), SqlSessionError> {
        if self.broken {
            return Err(SqlSessionError::ConnectionError(
                "session is marked broken".into(),
            ));
        }
        Ok(())
    }
}

#[async_trait]
impl Session for SqliteSession {
    fn param_checker(&self) -> Arc<dyn ParamChecker> {
        Arc::new(SqliteParamChecker)
    }

    fn abort_handle(&self) -> Option<AbortHandle> {
        let interrupt = Arc::clone(&self.interrupt);
        Some(Arc::new(move || interrupt.interrupt()))
    }

    async fn begin(&mut self) -> Result<(), SqlSessionError> {
        self.check_broken()?;
        self.worker.control(Control::Begin).await
    }

    async fn commit(&mut self) -> Result<(), SqlSessionError> {
        self.worker.control(Control::Commit).await
    }

    async fn rollback(&mut self) -> Result<(), SqlSessionError> {
        self.worker.control(Control::Rollback).await
    }

    async fn validate(&mut self) -> Result<(), SqlSessionError> {
        self.check_broken()?;
        self.worker.control(Control::Validate).await
    }

    async fn open_cursor(
        &mut self,
        stmt: &BoundStatement,
        in_tx: bool,
    ) -> Result<Box<dyn Cursor>, SqlSessionError> {
        self.check_broken()?;
        let keyword = leading_keyword(&stmt.sql).unwrap_or_default();
        if TX_CONTROL_KEYWORDS.contains(&keyword.as_str()) {
            return Err(SqlSessionError::InvalidQuery(format!(
                "{keyword} is not allowed in a statement; use the connection's transaction methods"
            )));
        }
        let sql = with_returning(&stmt.sql, &keyword, &stmt.options.generated_key_cols);
        debug!(worker = self.worker.id(), sql = %sql, "opening cursor");
        let cursor = self
            .worker
            .open(OpenRequest {
                sql,
                params: convert_params(&stmt.params),
                in_tx,
                counts_changes: CHANGE_KEYWORDS.contains(&keyword.as_str()),
            })
            .await?;
        Ok(Box::new(SqliteCursor { inner: cursor }))
    }

    async fn close(&mut self) -> Result<(), SqlSessionError> {
        self.worker.shutdown();
        Ok(())
    }

    fn is_broken(&self) -> bool {
        self.broken
    }

    fn mark_broken(&mut self) {
        self.broken = true;
    }
}

struct SqliteCursor {
    inner: WorkerCursor,
}

#[async_trait]
impl Cursor for SqliteCursor {
    fn metadata(&self) -> Arc<RowMetadata> {
        self.inner.metadata()
    }

    async fn fetch(&mut self) -> Result<Option<Vec<SqlValue>>, SqlSessionError> {
        self.inner.fetch().await
    }

    async fn close(mut self: Box<Self>) -> Result<CursorSummary, SqlSessionError> {
        self.inner.finish(true).await
    }

    async fn abandon(mut self: Box<Self>) -> Result<CursorSummary, SqlSessionError> {
        self.inner.finish(false).await
    }
}

/// Append a `RETURNING` clause to an INSERT when generated keys were asked for.
fn with_returning(sql: &str, keyword: &str, keys: &KeyColumns) -> String {
    if !matches!(keyword, "INSERT" | "REPLACE") || has_returning(sql) {
        return sql.to_string();
    }
    let columns = match keys {
        KeyColumns::None => return sql.to_string(),
        KeyColumns::All => "*".to_string(),
        KeyColumns::Columns(columns) if columns.is_empty() => return sql.to_string(),
        KeyColumns::Columns(columns) => columns
            .iter()
            .map(|c| format!("\"{}\"", c.replace('"', "\"\"")))
            .collect::<Vec<_>>()
            .join(", "),
    };
    let body = sql.trim_end().trim_end_matches(';').trim_end();
    format!("{body} RETURNING {columns}")
}

fn has_returning(sql: &str) -> bool {
    sql.split(|c: char| !c.is_ascii_alphanumeric() && c != '_')
        .any(|word| word.eq_ignore_ascii_case("RETURNING"))
}
