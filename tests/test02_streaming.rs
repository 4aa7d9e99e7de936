use std::time::Duration;

use futures_util::{StreamExt, stream};
use sql_session::test_utils::{MockDatabase, MockEvent, MockResponse};
use sql_session::{Connection, ConnectionState, SqlParam, SqlSessionError, SqlValue};

fn ten_rows(db: &MockDatabase) -> Connection {
    let rows = (1..=10).map(|i| vec![SqlValue::Long(i)]).collect();
    db.respond("select id from t", MockResponse::rows(["id"], rows));
    Connection::dedicated(Box::new(db.session()))
}

#[tokio::test(flavor = "current_thread")]
async fn rows_are_fetched_only_on_demand() -> Result<(), SqlSessionError> {
    let db = MockDatabase::new();
    let conn = ten_rows(&db);
    let mut rows = conn.statement("select id from t")?.no_args()?.stream()?;

    let first = rows.next().await.expect("first row")?;
    assert_eq!(first.get_long("id")?, 1);
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(db.fetches(), 1);

    rows.request(3);
    for expected in 2..=4 {
        let row = rows.next().await.expect("requested row")?;
        assert_eq!(row.get_long(0_usize)?, expected);
    }
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(db.fetches(), 4);
    assert_eq!(conn.state(), ConnectionState::Busy);

    let metadata = rows.metadata().await?;
    assert_eq!(metadata.column_names(), ["id"]);

    let rest: Vec<_> = rows.by_ref().collect().await;
    assert_eq!(rest.len(), 6);
    assert_eq!(rows.rows_affected().await?, 10);
    assert_eq!(conn.state(), ConnectionState::Idle);
    Ok(())
}

#[tokio::test(flavor = "current_thread")]
async fn cancel_requires_waiting_for_idle() -> Result<(), SqlSessionError> {
    let db = MockDatabase::new();
    let conn = ten_rows(&db);
    let mut rows = conn.statement("select id from t")?.no_args()?.stream()?;

    rows.next().await.expect("row 1")?;
    let second = rows.next().await.expect("row 2")?;
    assert_eq!(second.get_int("id")?, 2);
    rows.cancel();
    assert!(rows.next().await.is_none());

    // The producer has not yet closed the cursor on this single-threaded runtime.
    let err = conn
        .statement("select 1")?
        .no_args()?
        .execute()
        .await
        .unwrap_err();
    assert!(matches!(err, SqlSessionError::IllegalState(_)));

    conn.watch_for_idle().await?;
    conn.statement("select 1")?.no_args()?.execute().await?;

    assert_eq!(rows.rows_affected().await?, 2);
    assert!(db.events().contains(&MockEvent::Abandon));
    assert_eq!(db.fetches(), 2);
    Ok(())
}

#[tokio::test(flavor = "current_thread")]
async fn dropping_stream_abandons_cursor() -> Result<(), SqlSessionError> {
    let db = MockDatabase::new();
    let conn = ten_rows(&db);
    {
        let mut rows = conn.statement("select id from t")?.no_args()?.stream()?;
        rows.next().await.expect("row 1")?;
    }
    conn.watch_for_idle().await?;
    assert!(db.events().contains(&MockEvent::Abandon));
    assert_eq!(conn.state(), ConnectionState::Idle);
    Ok(())
}

#[tokio::test(flavor = "current_thread")]
async fn fetch_error_ends_stream() -> Result<(), SqlSessionError> {
    let db = MockDatabase::new();
    db.respond(
        "select id from t",
        MockResponse::rows(["id"], vec![vec![SqlValue::Long(1)], vec![SqlValue::Long(2)]])
            .failing_after(1, SqlSessionError::ExecutionError("disk on fire".into())),
    );
    let conn = Connection::dedicated(Box::new(db.session()));
    let mut rows = conn.statement("select id from t")?.no_args()?.stream()?;

    assert!(rows.next().await.expect("row 1").is_ok());
    assert_eq!(
        rows.next().await.expect("error item").unwrap_err(),
        SqlSessionError::ExecutionError("disk on fire".into())
    );
    assert!(rows.next().await.is_none());
    assert!(rows.rows_affected().await.is_err());
    assert_eq!(conn.state(), ConnectionState::Idle);
    Ok(())
}

#[tokio::test(flavor = "current_thread")]
async fn open_error_surfaces_through_stream() -> Result<(), SqlSessionError> {
    let db = MockDatabase::new();
    db.respond(
        "select nope",
        MockResponse::error(SqlSessionError::InvalidQuery("no such table".into())),
    );
    let conn = Connection::dedicated(Box::new(db.session()));
    let mut rows = conn.statement("select nope")?.no_args()?.stream()?;

    assert!(matches!(
        rows.metadata().await,
        Err(SqlSessionError::InvalidQuery(_))
    ));
    assert!(matches!(
        rows.next().await,
        Some(Err(SqlSessionError::InvalidQuery(_)))
    ));
    assert_eq!(conn.state(), ConnectionState::Idle);
    Ok(())
}

#[tokio::test(flavor = "current_thread")]
async fn stream_on_busy_connection_is_rejected() -> Result<(), SqlSessionError> {
    let db = MockDatabase::new();
    let conn = ten_rows(&db);
    let exec = conn.statement("select id from t")?.no_args()?;
    let _rows = exec.stream()?;
    assert!(matches!(
        exec.stream(),
        Err(SqlSessionError::IllegalState(_))
    ));
    Ok(())
}

#[tokio::test(flavor = "current_thread")]
async fn stream_timeout_bounds_cursor_open() -> Result<(), SqlSessionError> {
    let db = MockDatabase::new();
    db.respond(
        "select slow",
        MockResponse::rows(["id"], vec![vec![SqlValue::Long(1)]])
            .with_delay(Duration::from_secs(30)),
    );
    let conn = Connection::dedicated(Box::new(db.session()));
    let mut rows = conn
        .statement("select slow")?
        .no_args()?
        .timeout(Duration::from_millis(50))
        .stream()?;

    assert_eq!(
        rows.next().await.expect("timeout item").unwrap_err(),
        SqlSessionError::Timeout(Duration::from_millis(50))
    );
    assert!(rows.next().await.is_none());
    assert!(matches!(
        rows.rows_affected().await,
        Err(SqlSessionError::Timeout(_))
    ));
    conn.watch_for_idle().await?;
    conn.statement("select 1")?.no_args()?.execute().await?;
    Ok(())
}

fn opened(db: &MockDatabase) -> Vec<MockEvent> {
    db.io_events()
        .into_iter()
        .filter(|event| matches!(event, MockEvent::Open(..)))
        .collect()
}

#[tokio::test(flavor = "current_thread")]
async fn positional_argument_sets_run_in_order() -> Result<(), SqlSessionError> {
    let db = MockDatabase::new();
    db.respond("insert into t values (?1, ?2)", MockResponse::affected(1));
    let conn = Connection::dedicated(Box::new(db.session()));

    let total = conn
        .statement("insert into t values (:a, :b)")?
        .stream_args_by_idx(stream::iter(vec![
            vec![SqlParam::from(1_i64), SqlParam::from("x")],
            vec![SqlParam::from(2_i64), SqlParam::from("y")],
        ]))
        .await?;

    assert_eq!(total, 2);
    let sql = "insert into t values (?1, ?2)";
    assert_eq!(
        opened(&db),
        vec![
            MockEvent::Open(sql.into(), vec![SqlValue::Long(1), SqlValue::Text("x".into())]),
            MockEvent::Open(sql.into(), vec![SqlValue::Long(2), SqlValue::Text("y".into())]),
        ]
    );
    Ok(())
}

#[tokio::test(flavor = "current_thread")]
async fn one_bad_argument_set_fails_the_batch() -> Result<(), SqlSessionError> {
    let db = MockDatabase::new();
    db.respond("insert into t values (?1, ?2)", MockResponse::affected(1));
    let conn = Connection::dedicated(Box::new(db.session()));
    let insert = conn.statement("insert into t values (:a, :b)")?;

    let outcome = insert
        .stream_args_by_idx(stream::iter(vec![
            vec![SqlParam::from(1_i64), SqlParam::from("x")],
            vec![SqlParam::from(2_i64)],
            vec![SqlParam::from(3_i64), SqlParam::from("z")],
        ]))
        .await;
    assert_eq!(
        outcome.unwrap_err(),
        SqlSessionError::MissingParamVal("b".into())
    );
    assert_eq!(opened(&db).len(), 1);

    let named = insert
        .stream_args(stream::iter(vec![
            vec![("a", SqlParam::from(4_i64)), ("b", SqlParam::from("w"))],
            vec![("a", SqlParam::from(5_i64)), ("c", SqlParam::from("v"))],
        ]))
        .await;
    assert_eq!(
        named.unwrap_err(),
        SqlSessionError::NoSuchParam("c".into())
    );
    assert_eq!(opened(&db).len(), 2);
    assert_eq!(conn.state(), ConnectionState::Idle);
    Ok(())
}
