//! Dedicated thread owning one `rusqlite::Connection`.
//!
//! Commands arrive over a std channel and replies go back over `oneshot` channels. While a cursor
//! is open the worker stays inside [`run_cursor`], stepping the statement only when a `Fetch`
//! arrives.

use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread;

use rusqlite::types::Value;
use rusqlite::{InterruptHandle, params_from_iter};
use tokio::sync::oneshot;
use tracing::debug;

use crate::driver::CursorSummary;
use crate::error::SqlSessionError;
use crate::metadata::RowMetadata;
use crate::types::SqlValue;

use super::config::ConnectOptions;
use super::errors::map_sqlite_error;
use super::query::{decode_row, describe};

static NEXT_WORKER_ID: AtomicU64 = AtomicU64::new(1);

type Reply<T> = oneshot::Sender<Result<T, SqlSessionError>>;

#[derive(Debug, Clone, Copy)]
pub(crate) enum Control {
    Begin,
    Commit,
    Rollback,
    Validate,
}

pub(crate) struct OpenRequest {
    pub sql: String,
    pub params: Vec<Value>,
    /// An explicit transaction is expected to be open.
    pub in_tx: bool,
    /// Report `changes()` rather than the number of rows read.
    pub counts_changes: bool,
}

enum Command {
    Control {
        op: Control,
        respond_to: Reply<()>,
    },
    Open {
        request: OpenRequest,
        respond_to: Reply<Arc<RowMetadata>>,
    },
    Fetch {
        respond_to: Reply<Option<Vec<SqlValue>>>,
    },
    Finish {
        drain: bool,
        respond_to: Reply<CursorSummary>,
    },
    Shutdown,
}

/// Handle to a worker thread. Dropping it stops the thread.
pub(crate) struct SqliteWorker {
    sender: Sender<Command>,
    id: u64,
}

impl SqliteWorker {
    /// Open the database on a fresh worker thread.
    pub(crate) async fn spawn(
        options: ConnectOptions,
    ) -> Result<(Self, InterruptHandle), SqlSessionError> {
        let (sender, receiver) = mpsc::channel::<Command>();
        let (ready_tx, ready_rx) = oneshot::channel();
        let id = NEXT_WORKER_ID.fetch_add(1, Ordering::Relaxed);
        thread::Builder::new()
            .name(format!("sqlite-worker-{id}"))
            .spawn(move || {
                let conn = match options.open() {
                    Ok(conn) => conn,
                    Err(err) => {
                        let _ = ready_tx.send(Err(err));
                        return;
                    }
                };
                if ready_tx.send(Ok(conn.get_interrupt_handle())).is_err() {
                    return;
                }
                run_sqlite_worker(&conn, &receiver);
                debug!(worker = id, "sqlite worker stopped");
            })
            .map_err(|err| {
                SqlSessionError::ConnectionError(format!(
                    "failed to spawn SQLite worker thread: {err}"
                ))
            })?;

        let interrupt = ready_rx.await.map_err(|_| {
            SqlSessionError::ConnectionError("SQLite worker exited while opening".into())
        })??;
        debug!(worker = id, "sqlite worker ready");
        Ok((Self { sender, id }, interrupt))
    }

    pub(crate) fn id(&self) -> u64 {
        self.id
    }

    pub(crate) async fn control(&self, op: Control) -> Result<(), SqlSessionError> {
        let (tx, rx) = oneshot::channel();
        send(&self.sender, Command::Control { op, respond_to: tx })?;
        receive(rx, "control").await
    }

    pub(crate) async fn open(
        &self,
        request: OpenRequest,
    ) -> Result<WorkerCursor, SqlSessionError> {
        let (tx, rx) = oneshot::channel();
        send(
            &self.sender,
            Command::Open {
                request,
                respond_to: tx,
            },
        )?;
        let metadata = receive(rx, "open").await?;
        Ok(WorkerCursor {
            sender: self.sender.clone(),
            metadata,
            finished: false,
        })
    }

    pub(crate) fn shutdown(&self) {
        let _ = self.sender.send(Command::Shutdown);
    }
}

impl Drop for SqliteWorker {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Worker side of an open cursor.
pub(crate) struct WorkerCursor {
    sender: Sender<Command>,
    metadata: Arc<RowMetadata>,
    finished: bool,
}

impl WorkerCursor {
    pub(crate) fn metadata(&self) -> Arc<RowMetadata> {
        Arc::clone(&self.metadata)
    }

    pub(crate) async fn fetch(&mut self) -> Result<Option<Vec<SqlValue>>, SqlSessionError> {
        let (tx, rx) = oneshot::channel();
        send(&self.sender, Command::Fetch { respond_to: tx })?;
        receive(rx, "fetch").await
    }

    pub(crate) async fn finish(&mut self, drain: bool) -> Result<CursorSummary, SqlSessionError> {
        self.finished = true;
        let (tx, rx) = oneshot::channel();
        send(
            &self.sender,
            Command::Finish {
                drain,
                respond_to: tx,
            },
        )?;
        receive(rx, "finish").await
    }
}

impl Drop for WorkerCursor {
    fn drop(&mut self) {
        if !self.finished {
            let (tx, _) = oneshot::channel();
            let _ = self.sender.send(Command::Finish {
                drain: false,
                respond_to: tx,
            });
        }
    }
}

fn send(sender: &Sender<Command>, command: Command) -> Result<(), SqlSessionError> {
    sender
        .send(command)
        .map_err(|_| SqlSessionError::ConnectionError("SQLite worker closed".into()))
}

async fn receive<T>(
    rx: oneshot::Receiver<Result<T, SqlSessionError>>,
    what: &str,
) -> Result<T, SqlSessionError> {
    rx.await.map_err(|_| {
        SqlSessionError::ConnectionError(format!("SQLite worker dropped during {what}"))
    })?
}

#[derive(PartialEq, Eq)]
enum Flow {
    Continue,
    Shutdown,
}

fn run_sqlite_worker(conn: &rusqlite::Connection, receiver: &Receiver<Command>) {
    while let Ok(command) = receiver.recv() {
        match command {
            Command::Control { op, respond_to } => {
                let _ = respond_to.send(run_control(conn, op));
            }
            Command::Open {
                request,
                respond_to,
            } => {
                if run_cursor(conn, request, respond_to, receiver) == Flow::Shutdown {
                    break;
                }
            }
            Command::Fetch { respond_to } => {
                let _ = respond_to.send(Err(no_cursor()));
            }
            Command::Finish { respond_to, .. } => {
                let _ = respond_to.send(Err(no_cursor()));
            }
            Command::Shutdown => break,
        }
    }
}

fn run_control(conn: &rusqlite::Connection, op: Control) -> Result<(), SqlSessionError> {
    let outcome = match op {
        Control::Begin => conn.execute_batch("BEGIN"),
        Control::Commit => conn.execute_batch("COMMIT"),
        // The engine may already have rolled back, e.g. after SQLITE_FULL.
        Control::Rollback if conn.is_autocommit() => Ok(()),
        Control::Rollback => conn.execute_batch("ROLLBACK"),
        Control::Validate => conn
            .query_row("SELECT 1", [], |row| row.get::<_, i64>(0))
            .map(|_| ()),
    };
    outcome.map_err(map_sqlite_error)
}

fn run_cursor(
    conn: &rusqlite::Connection,
    request: OpenRequest,
    respond_to: Reply<Arc<RowMetadata>>,
    receiver: &Receiver<Command>,
) -> Flow {
    if request.in_tx && conn.is_autocommit() {
        let _ = respond_to.send(Err(SqlSessionError::InactiveTx(
            "the transaction was ended by the database".into(),
        )));
        return Flow::Continue;
    }
    let mut stmt = match conn.prepare(&request.sql) {
        Ok(stmt) => stmt,
        Err(err) => {
            let _ = respond_to.send(Err(map_sqlite_error(err)));
            return Flow::Continue;
        }
    };
    let (metadata, kinds) = describe(&stmt);
    let metadata = Arc::new(metadata);
    let counts_changes = request.counts_changes && !stmt.readonly();
    let mut rows = match stmt.query(params_from_iter(request.params.iter())) {
        Ok(rows) => rows,
        Err(err) => {
            let _ = respond_to.send(Err(map_sqlite_error(err)));
            return Flow::Continue;
        }
    };
    if respond_to.send(Ok(metadata)).is_err() {
        return Flow::Continue;
    }

    let mut fetched: u64 = 0;
    let mut failed = false;
    while let Ok(command) = receiver.recv() {
        match command {
            Command::Fetch { respond_to } => {
                let outcome = if failed {
                    Ok(None)
                } else {
                    match rows.next() {
                        Ok(Some(row)) => decode_row(row, &kinds).map(Some),
                        Ok(None) => Ok(None),
                        Err(err) => Err(err),
                    }
                };
                let outcome = match outcome {
                    Ok(Some(values)) => {
                        fetched += 1;
                        Ok(Some(values))
                    }
                    Ok(None) => Ok(None),
                    Err(err) => {
                        failed = true;
                        Err(map_sqlite_error(err))
                    }
                };
                let _ = respond_to.send(outcome);
            }
            Command::Finish { drain, respond_to } => {
                let mut outcome = Ok(());
                if drain && !failed {
                    loop {
                        match rows.next() {
                            Ok(Some(_)) => fetched += 1,
                            Ok(None) => break,
                            Err(err) => {
                                outcome = Err(map_sqlite_error(err));
                                break;
                            }
                        }
                    }
                }
                drop(rows);
                let rows_affected = if counts_changes {
                    u64::try_from(conn.changes()).unwrap_or(u64::MAX)
                } else {
                    fetched
                };
                let _ = respond_to.send(outcome.map(|()| CursorSummary {
                    rows_affected,
                    warnings: Vec::new(),
                }));
                return Flow::Continue;
            }
            Command::Control { respond_to, .. } => {
                let _ = respond_to.send(Err(cursor_open()));
            }
            Command::Open { respond_to, .. } => {
                let _ = respond_to.send(Err(cursor_open()));
            }
            Command::Shutdown => return Flow::Shutdown,
        }
    }
    Flow::Shutdown
}

fn no_cursor() -> SqlSessionError {
    SqlSessionError::IllegalState("no cursor is open".into())
}

fn cursor_open() -> SqlSessionError {
    SqlSessionError::IllegalState("a cursor is still open".into())
}
