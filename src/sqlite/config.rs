use std::time::Duration;

use async_trait::async_trait;
use tracing::info;

use crate::driver::{Connector, Session};
use crate::error::SqlSessionError;
use crate::pool::{ConnectionFactory, FactoryConfig};

use super::errors::map_sqlite_error;
use super::session::SqliteSession;
use super::worker::SqliteWorker;

const MEMORY_PATH: &str = ":memory:";

/// Options for configuring a `SQLite` connection factory.
#[derive(Debug, Clone)]
pub struct SqliteOptions {
    pub db_path: String,
    pub max_connections: u32,
    pub acquire_timeout: Duration,
    /// How long a statement waits on a locked database before failing.
    pub busy_timeout: Duration,
    pub wal: bool,
    pub foreign_keys: bool,
}

impl SqliteOptions {
    #[must_use]
    pub fn new(db_path: String) -> Self {
        Self {
            db_path,
            max_connections: 4,
            acquire_timeout: Duration::from_secs(30),
            busy_timeout: Duration::from_secs(5),
            wal: true,
            foreign_keys: true,
        }
    }

    /// Every `:memory:` session is its own database, so the pool is capped at one.
    #[must_use]
    pub fn is_memory(&self) -> bool {
        self.db_path == MEMORY_PATH
    }

    #[must_use]
    pub fn factory_config(&self) -> FactoryConfig {
        let max_size = if self.is_memory() {
            1
        } else {
            self.max_connections.max(1)
        };
        FactoryConfig {
            max_size,
            acquire_timeout: self.acquire_timeout,
            ..FactoryConfig::default()
        }
    }

    pub(crate) fn connect_options(&self) -> ConnectOptions {
        ConnectOptions {
            path: self.db_path.clone(),
            busy_timeout: self.busy_timeout,
            wal: self.wal && !self.is_memory(),
            foreign_keys: self.foreign_keys,
        }
    }
}

/// Fluent builder for `SQLite` options.
#[derive(Debug, Clone)]
pub struct SqliteOptionsBuilder {
    opts: SqliteOptions,
}

impl SqliteOptionsBuilder {
    #[must_use]
    pub fn new(db_path: String) -> Self {
        Self {
            opts: SqliteOptions::new(db_path),
        }
    }

    #[must_use]
    pub fn max_connections(mut self, max_connections: u32) -> Self {
        self.opts.max_connections = max_connections;
        self
    }

    #[must_use]
    pub fn acquire_timeout(mut self, timeout: Duration) -> Self {
        self.opts.acquire_timeout = timeout;
        self
    }

    #[must_use]
    pub fn busy_timeout(mut self, timeout: Duration) -> Self {
        self.opts.busy_timeout = timeout;
        self
    }

    #[must_use]
    pub fn wal(mut self, wal: bool) -> Self {
        self.opts.wal = wal;
        self
    }

    #[must_use]
    pub fn foreign_keys(mut self, foreign_keys: bool) -> Self {
        self.opts.foreign_keys = foreign_keys;
        self
    }

    #[must_use]
    pub fn finish(self) -> SqliteOptions {
        self.opts
    }

    /// Build a [`ConnectionFactory`] for `SQLite`.
    ///
    /// # Errors
    ///
    /// Returns `SqlSessionError` if pool creation fails.
    pub async fn build(self) -> Result<ConnectionFactory, SqlSessionError> {
        new_sqlite(self.finish()).await
    }
}

impl ConnectionFactory {
    #[must_use]
    pub fn sqlite_builder(db_path: String) -> SqliteOptionsBuilder {
        SqliteOptionsBuilder::new(db_path)
    }
}

/// Build a [`ConnectionFactory`] backed by `SQLite` sessions.
///
/// # Errors
/// Returns `SqlSessionError::ConnectionError` if the pool cannot be created.
pub async fn new_sqlite(opts: SqliteOptions) -> Result<ConnectionFactory, SqlSessionError> {
    let config = opts.factory_config();
    info!(path = %opts.db_path, max_size = config.max_size, "creating SQLite connection factory");
    ConnectionFactory::new(SqliteConnector::new(opts), config).await
}

/// Opens [`SqliteSession`]s for one database path.
#[derive(Debug, Clone)]
pub struct SqliteConnector {
    opts: SqliteOptions,
}

impl SqliteConnector {
    #[must_use]
    pub fn new(opts: SqliteOptions) -> Self {
        Self { opts }
    }

    /// Open a session outside any pool.
    ///
    /// # Errors
    /// Returns `SqlSessionError::ConnectionError` if the database cannot be opened.
    pub async fn open(&self) -> Result<SqliteSession, SqlSessionError> {
        let (worker, interrupt) = SqliteWorker::spawn(self.opts.connect_options()).await?;
        Ok(SqliteSession::new(worker, interrupt))
    }
}

#[async_trait]
impl Connector for SqliteConnector {
    async fn connect(&self) -> Result<Box<dyn Session>, SqlSessionError> {
        Ok(Box::new(self.open().await?))
    }
}

/// What the worker thread needs to open its connection.
#[derive(Debug, Clone)]
pub(crate) struct ConnectOptions {
    path: String,
    busy_timeout: Duration,
    wal: bool,
    foreign_keys: bool,
}

impl ConnectOptions {
    pub(crate) fn open(&self) -> Result<rusqlite::Connection, SqlSessionError> {
        let conn = rusqlite::Connection::open(&self.path).map_err(|err| {
            SqlSessionError::ConnectionError(format!("failed to open {}: {err}", self.path))
        })?;
        conn.busy_timeout(self.busy_timeout)
            .map_err(map_sqlite_error)?;
        if self.wal {
            conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| {
                row.get::<_, String>(0)
            })
            .map_err(map_sqlite_error)?;
        }
        conn.pragma_update(None, "foreign_keys", self.foreign_keys)
            .map_err(map_sqlite_error)?;
        Ok(conn)
    }
}
