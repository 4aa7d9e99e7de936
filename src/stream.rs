//! Demand-driven row streaming.
//!
//! A producer task owns the session while the stream is open. It fetches a row from the driver
//! only when the consumer has signalled demand for one, so at most `requested` rows are ever in
//! flight.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use futures_util::{Stream, StreamExt};
use tokio::runtime::Handle;
use tokio::sync::{mpsc, watch};
use tracing::{debug, warn};

use crate::connection::{BusyGuard, Connection, SessionLease, TxPhase};
use crate::driver::{AbortHandle, BoundStatement, CursorSummary};
use crate::error::SqlSessionError;
use crate::executor::abandon_after;
use crate::metadata::{RowMetadata, Warning};
use crate::results::Row;

enum Demand {
    Request(u64),
    Cancel,
}

#[derive(Clone, Default)]
struct Progress {
    metadata: Option<Arc<RowMetadata>>,
    outcome: Option<Result<CursorSummary, SqlSessionError>>,
}

/// Live, backpressured sequence of rows.
///
/// Rows arrive in the order the engine produced them. Polling the stream asks for one row at a
/// time; [`RowStream::request`] asks for more up front.
///
/// [`RowStream::rows_affected`] and [`RowStream::warnings`] resolve only once every row has been
/// consumed or the stream has been cancelled. Awaiting them on a stream that is neither drained
/// nor cancelled waits forever; this is intended.
///
/// ```rust,no_run
/// use futures_util::StreamExt;
///
/// # async fn demo(conn: sql_session::Connection) -> Result<(), sql_session::SqlSessionError> {
/// let mut rows = conn.statement("select id from big_table")?.no_args()?.stream()?;
/// while let Some(row) = rows.next().await {
///     if row?.get_long("id")? > 100 {
///         rows.cancel();
///         break;
///     }
/// }
/// conn.watch_for_idle().await?;
/// # Ok(())
/// # }
/// ```
pub struct RowStream {
    demand: mpsc::UnboundedSender<Demand>,
    rows: mpsc::UnboundedReceiver<Result<Row, SqlSessionError>>,
    progress: watch::Receiver<Progress>,
    outstanding: u64,
    finished: bool,
}

impl std::fmt::Debug for RowStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RowStream")
            .field("outstanding", &self.outstanding)
            .field("finished", &self.finished)
            .finish()
    }
}

impl RowStream {
    /// `claim` runs after the connection has moved to busy and before the producer starts.
    pub(crate) fn start<C>(
        conn: &Connection,
        bound: Arc<BoundStatement>,
        timeout: Option<Duration>,
        claim: C,
    ) -> Result<Self, SqlSessionError>
    where
        C: FnOnce() -> Result<(), SqlSessionError>,
    {
        let handle = Handle::try_current()
            .map_err(|_| SqlSessionError::IllegalState("streaming needs a Tokio runtime".into()))?;
        let busy = conn.start(|_| Ok(()))?;
        claim()?;
        let (demand_tx, demand_rx) = mpsc::unbounded_channel();
        let (row_tx, row_rx) = mpsc::unbounded_channel();
        let (progress_tx, progress_rx) = watch::channel(Progress::default());
        let producer = Producer {
            bound,
            timeout,
            abort: conn.abort_handle(),
            demand: demand_rx,
            rows: row_tx,
            progress: progress_tx,
            connection: conn.id(),
        };
        handle.spawn(producer.run(busy));
        Ok(Self {
            demand: demand_tx,
            rows: row_rx,
            progress: progress_rx,
            outstanding: 0,
            finished: false,
        })
    }

    /// Ask the producer for `n` more rows.
    pub fn request(&mut self, n: u64) {
        if n == 0 || self.finished {
            return;
        }
        self.outstanding = self.outstanding.saturating_add(n);
        let _ = self.demand.send(Demand::Request(n));
    }

    /// Stop the stream. Rows already produced are discarded.
    ///
    /// The connection is not ready for reuse until [`Connection::watch_for_idle`] resolves.
    pub fn cancel(&mut self) {
        if self.finished {
            return;
        }
        self.finished = true;
        let _ = self.demand.send(Demand::Cancel);
        self.rows.close();
    }

    /// Column descriptors, available once the statement has been opened.
    ///
    /// # Errors
    /// The execution error, if the statement failed before producing metadata.
    pub async fn metadata(&self) -> Result<Arc<RowMetadata>, SqlSessionError> {
        let progress = self
            .wait(|progress| progress.metadata.is_some() || progress.outcome.is_some())
            .await?;
        match (progress.metadata, progress.outcome) {
            (Some(metadata), _) => Ok(metadata),
            (None, Some(Err(err))) => Err(err),
            (None, _) => Err(SqlSessionError::ExecutionError(
                "stream finished without metadata".into(),
            )),
        }
    }

    /// Rows affected, once the stream is drained or cancelled.
    ///
    /// # Errors
    /// The error that ended the stream.
    pub async fn rows_affected(&self) -> Result<u64, SqlSessionError> {
        self.summary().await.map(|summary| summary.rows_affected)
    }

    /// Warnings, once the stream is drained or cancelled.
    ///
    /// # Errors
    /// The error that ended the stream.
    pub async fn warnings(&self) -> Result<Vec<Warning>, SqlSessionError> {
        self.summary().await.map(|summary| summary.warnings)
    }

    /// Next row, asking for one more if none is outstanding.
    pub async fn next_row(&mut self) -> Option<Result<Row, SqlSessionError>> {
        self.next().await
    }

    async fn summary(&self) -> Result<CursorSummary, SqlSessionError> {
        let progress = self.wait(|progress| progress.outcome.is_some()).await?;
        progress.outcome.unwrap_or_else(|| {
            Err(SqlSessionError::ExecutionError(
                "stream finished without outcome".into(),
            ))
        })
    }

    async fn wait(
        &self,
        ready: impl FnMut(&Progress) -> bool,
    ) -> Result<Progress, SqlSessionError> {
        let mut rx = self.progress.clone();
        let progress = rx
            .wait_for(ready)
            .await
            .map_err(|_| SqlSessionError::ExecutionError("stream producer vanished".into()))?;
        Ok(progress.clone())
    }
}

impl Stream for RowStream {
    type Item = Result<Row, SqlSessionError>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        if this.finished {
            return Poll::Ready(None);
        }
        if this.outstanding == 0 {
            this.outstanding = 1;
            let _ = this.demand.send(Demand::Request(1));
        }
        match this.rows.poll_recv(cx) {
            Poll::Ready(Some(Ok(row))) => {
                this.outstanding = this.outstanding.saturating_sub(1);
                Poll::Ready(Some(Ok(row)))
            }
            Poll::Ready(Some(Err(err))) => {
                this.finished = true;
                Poll::Ready(Some(Err(err)))
            }
            Poll::Ready(None) => {
                this.finished = true;
                Poll::Ready(None)
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

impl Drop for RowStream {
    fn drop(&mut self) {
        if !self.finished {
            let _ = self.demand.send(Demand::Cancel);
        }
    }
}

struct Producer {
    bound: Arc<BoundStatement>,
    timeout: Option<Duration>,
    abort: Option<AbortHandle>,
    demand: mpsc::UnboundedReceiver<Demand>,
    rows: mpsc::UnboundedSender<Result<Row, SqlSessionError>>,
    progress: watch::Sender<Progress>,
    connection: u64,
}

impl Producer {
    async fn run(mut self, busy: BusyGuard) {
        let mut lease = SessionLease::acquire(busy).await;
        let outcome = self.pump(&mut lease).await;
        // Idle before the consumer can observe the end of the stream.
        drop(lease);
        if let Err(err) = &outcome {
            warn!(connection = self.connection, error = %err, "stream failed");
            let _ = self.rows.send(Err(err.clone()));
        }
        self.progress.send_modify(|progress| progress.outcome = Some(outcome));
    }

    async fn pump(&mut self, lease: &mut SessionLease) -> Result<CursorSummary, SqlSessionError> {
        let in_tx = lease.tx_phase() == TxPhase::Active;
        let session = lease.session()?;
        let mut cursor = self
            .bounded(session.open_cursor(&self.bound, in_tx))
            .await?;
        let metadata = cursor.metadata();
        self.progress
            .send_modify(|progress| progress.metadata = Some(Arc::clone(&metadata)));

        let mut demand = 0_u64;
        loop {
            // Take every signal already queued; block only when nothing is requested.
            loop {
                let signal = if demand == 0 {
                    self.demand.recv().await
                } else {
                    match self.demand.try_recv() {
                        Ok(signal) => Some(signal),
                        Err(mpsc::error::TryRecvError::Empty) => break,
                        Err(mpsc::error::TryRecvError::Disconnected) => None,
                    }
                };
                match signal {
                    Some(Demand::Request(n)) => demand = demand.saturating_add(n),
                    Some(Demand::Cancel) | None => {
                        debug!(connection = self.connection, "stream cancelled");
                        return cursor.abandon().await;
                    }
                }
            }

            match self.bounded(cursor.fetch()).await {
                Ok(Some(values)) => {
                    let row = Row::new(Arc::clone(&metadata), values);
                    if self.rows.send(Ok(row)).is_err() {
                        debug!(connection = self.connection, "stream consumer dropped");
                        return cursor.abandon().await;
                    }
                    demand -= 1;
                }
                Ok(None) => return cursor.close().await,
                Err(err) => return Err(abandon_after(cursor, err).await),
            }
        }
    }

    async fn bounded<T>(
        &self,
        fut: impl Future<Output = Result<T, SqlSessionError>>,
    ) -> Result<T, SqlSessionError> {
        let Some(limit) = self.timeout else {
            return fut.await;
        };
        match tokio::time::timeout(limit, fut).await {
            Ok(outcome) => outcome,
            Err(_) => {
                warn!(connection = self.connection, ?limit, "stream timed out");
                if let Some(abort) = &self.abort {
                    abort();
                }
                Err(SqlSessionError::Timeout(limit))
            }
        }
    }
}
