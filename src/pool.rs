//! Connection factory backed by a `bb8` pool of driver sessions.

use std::future::Future;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use bb8::{ManageConnection, Pool, RunError};
use tokio::runtime::Handle;
use tracing::{debug, info, warn};

use crate::connection::{Connection, SessionSlot};
use crate::driver::{Connector, Session};
use crate::error::SqlSessionError;

/// Adapts a [`Connector`] to `bb8`.
pub struct SessionManager {
    connector: Arc<dyn Connector>,
}

impl SessionManager {
    #[must_use]
    pub fn new(connector: Arc<dyn Connector>) -> Self {
        Self { connector }
    }
}

impl ManageConnection for SessionManager {
    type Connection = Box<dyn Session>;
    type Error = SqlSessionError;

    #[allow(clippy::manual_async_fn)]
    fn connect(&self) -> impl Future<Output = Result<Self::Connection, Self::Error>> + Send {
        let connector = Arc::clone(&self.connector);
        async move { connector.connect().await }
    }

    #[allow(clippy::manual_async_fn)]
    fn is_valid(
        &self,
        conn: &mut Self::Connection,
    ) -> impl Future<Output = Result<(), Self::Error>> + Send {
        async move { conn.validate().await }
    }

    fn has_broken(&self, conn: &mut Self::Connection) -> bool {
        conn.is_broken()
    }
}

/// Pool settings for a [`ConnectionFactory`].
#[derive(Debug, Clone)]
pub struct FactoryConfig {
    pub max_size: u32,
    pub min_idle: Option<u32>,
    /// How long `get_connection` waits for a free session before failing.
    pub acquire_timeout: Duration,
    /// Validate a pooled session before handing it out.
    pub test_on_check_out: bool,
}

impl Default for FactoryConfig {
    fn default() -> Self {
        Self {
            max_size: 10,
            min_idle: None,
            acquire_timeout: Duration::from_secs(30),
            test_on_check_out: true,
        }
    }
}

/// Hands out [`Connection`]s and takes them back.
///
/// Clones share one pool; the factory is safe to use from many tasks at once.
#[derive(Clone)]
pub struct ConnectionFactory {
    inner: Arc<FactoryInner>,
}

struct FactoryInner {
    pool: RwLock<Option<Pool<SessionManager>>>,
    config: FactoryConfig,
}

impl std::fmt::Debug for ConnectionFactory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionFactory")
            .field("config", &self.inner.config)
            .field("shut_down", &self.is_shut_down())
            .finish()
    }
}

impl ConnectionFactory {
    /// Build a factory whose sessions come from `connector`.
    ///
    /// # Errors
    /// Returns [`SqlSessionError::ConnectionError`] if the pool cannot be built, e.g. when
    /// `min_idle` sessions cannot be opened.
    pub async fn new<C: Connector>(
        connector: C,
        config: FactoryConfig,
    ) -> Result<Self, SqlSessionError> {
        let manager = SessionManager::new(Arc::new(connector));
        let pool = Pool::builder()
            .max_size(config.max_size)
            .min_idle(config.min_idle)
            .connection_timeout(config.acquire_timeout)
            .test_on_check_out(config.test_on_check_out)
            .build(manager)
            .await
            .map_err(|e| SqlSessionError::ConnectionError(format!("pool error: {e}")))?;
        debug!(max_size = config.max_size, "connection factory ready");
        Ok(Self {
            inner: Arc::new(FactoryInner {
                pool: RwLock::new(Some(pool)),
                config,
            }),
        })
    }

    #[must_use]
    pub fn config(&self) -> &FactoryConfig {
        &self.inner.config
    }

    #[must_use]
    pub fn is_shut_down(&self) -> bool {
        self.read_pool().is_none()
    }

    /// Current pool occupancy.
    ///
    /// # Errors
    /// [`SqlSessionError::FactoryShutdown`] after [`ConnectionFactory::shutdown`].
    pub fn pool_state(&self) -> Result<bb8::State, SqlSessionError> {
        self.read_pool()
            .map(|pool| pool.state())
            .ok_or(SqlSessionError::FactoryShutdown)
    }

    /// Acquire a connection.
    ///
    /// # Errors
    /// [`SqlSessionError::FactoryShutdown`] after shutdown, [`SqlSessionError::Timeout`] when no
    /// session frees up within the configured acquisition timeout, [`SqlSessionError::Acquire`]
    /// when opening a session fails.
    pub async fn get_connection(&self) -> Result<Connection, SqlSessionError> {
        self.get_connection_timeout(None).await
    }

    /// [`ConnectionFactory::get_connection`] with a caller deadline on top of the pool's own.
    ///
    /// # Errors
    /// As [`ConnectionFactory::get_connection`].
    pub async fn get_connection_timeout(
        &self,
        timeout: Option<Duration>,
    ) -> Result<Connection, SqlSessionError> {
        let pool = self.read_pool().ok_or(SqlSessionError::FactoryShutdown)?;
        let checkout = pool.get_owned();
        let pooled = match timeout {
            Some(limit) => tokio::time::timeout(limit, checkout)
                .await
                .map_err(|_| SqlSessionError::Timeout(limit))?,
            None => checkout.await,
        };
        let pooled = pooled.map_err(|err| match err {
            RunError::User(err) => SqlSessionError::Acquire(err.to_string()),
            RunError::TimedOut => SqlSessionError::Timeout(self.inner.config.acquire_timeout),
        })?;
        Ok(Connection::from_slot(SessionSlot::Pooled(pooled)))
    }

    /// Acquire a connection, run `body`, and release the connection on every exit path.
    ///
    /// `timeout` bounds acquisition. If the returned future is dropped early the connection is
    /// released in the background once it is idle.
    ///
    /// # Errors
    /// Acquisition failures, or whatever `body` returned.
    pub async fn with_connection<T, F, Fut>(&self, body: F) -> Result<T, SqlSessionError>
    where
        F: FnOnce(Connection) -> Fut,
        Fut: Future<Output = Result<T, SqlSessionError>>,
    {
        self.with_connection_timeout(None, body).await
    }

    /// [`ConnectionFactory::with_connection`] with an acquisition deadline.
    ///
    /// # Errors
    /// As [`ConnectionFactory::with_connection`].
    pub async fn with_connection_timeout<T, F, Fut>(
        &self,
        timeout: Option<Duration>,
        body: F,
    ) -> Result<T, SqlSessionError>
    where
        F: FnOnce(Connection) -> Fut,
        Fut: Future<Output = Result<T, SqlSessionError>>,
    {
        let conn = self.get_connection_timeout(timeout).await?;
        let mut scope = ReleaseScope {
            conn: conn.clone(),
            armed: true,
        };
        let outcome = body(conn.clone()).await;
        scope.armed = false;
        release_quietly(&conn).await;
        outcome
    }

    /// Acquire a connection and run `body` inside a transaction on it, then release.
    ///
    /// # Errors
    /// Acquisition, begin and commit failures, or whatever `body` returned.
    pub async fn with_transaction<T, F, Fut>(&self, body: F) -> Result<T, SqlSessionError>
    where
        F: FnOnce(Connection) -> Fut,
        Fut: Future<Output = Result<T, SqlSessionError>>,
    {
        self.with_transaction_timeout(None, body).await
    }

    /// [`ConnectionFactory::with_transaction`] where `timeout` bounds acquisition and, separately,
    /// each call managing the transaction (begin, commit, rollback). The body runs unbounded.
    ///
    /// # Errors
    /// As [`ConnectionFactory::with_transaction`], plus [`SqlSessionError::Timeout`].
    pub async fn with_transaction_timeout<T, F, Fut>(
        &self,
        timeout: Option<Duration>,
        body: F,
    ) -> Result<T, SqlSessionError>
    where
        F: FnOnce(Connection) -> Fut,
        Fut: Future<Output = Result<T, SqlSessionError>>,
    {
        self.with_connection_timeout(timeout, |conn| async move {
            conn.with_transaction_timeout(timeout, body).await
        })
        .await
    }

    /// Stop handing out connections. Idle sessions are closed; sessions still checked out are
    /// closed when their connections are released.
    pub async fn shutdown(&self) {
        let pool = self
            .inner
            .pool
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(pool) = pool {
            let state = pool.state();
            drop(pool);
            info!(
                connections = state.connections,
                idle = state.idle_connections,
                "connection factory shut down"
            );
        }
    }

    fn read_pool(&self) -> Option<Pool<SessionManager>> {
        self.inner
            .pool
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

async fn release_quietly(conn: &Connection) {
    if let Err(err) = conn.release().await {
        warn!(error = %err, "release failed, forcing");
        conn.force_release();
    }
}

struct ReleaseScope {
    conn: Connection,
    armed: bool,
}

impl Drop for ReleaseScope {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let conn = self.conn.clone();
        match Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    if conn.watch_for_idle().await.is_ok() {
                        release_quietly(&conn).await;
                    }
                });
            }
            Err(_) => conn.force_release(),
        }
    }
}
