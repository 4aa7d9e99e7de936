use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use sql_session::test_utils::{MockDatabase, MockEvent, MockResponse};
use sql_session::{Connection, ConnectionState, SqlSessionError, SqlValue, TxPhase};

fn connect(db: &MockDatabase) -> Connection {
    Connection::dedicated(Box::new(db.session()))
}

async fn wait_until_busy(conn: &Connection) {
    while conn.state() != ConnectionState::Busy {
        tokio::task::yield_now().await;
    }
}

/// Wait until the driver has started running `sql`.
async fn wait_until_opened(db: &MockDatabase, sql: &str) {
    while !db
        .events()
        .iter()
        .any(|event| matches!(event, MockEvent::Open(opened, _) if opened == sql))
    {
        tokio::task::yield_now().await;
    }
}

#[tokio::test(flavor = "current_thread")]
async fn second_operation_while_busy_is_rejected() -> Result<(), SqlSessionError> {
    let db = MockDatabase::new();
    db.respond(
        "select slow",
        MockResponse::rows(["x"], vec![vec![SqlValue::Long(1)]])
            .with_delay(Duration::from_millis(100)),
    );
    let conn = connect(&db);

    let slow = conn.statement("select slow")?.no_args()?;
    let first = tokio::spawn(async move { slow.execute_for_set().await });
    wait_until_busy(&conn).await;

    let err = conn
        .statement("select 1")?
        .no_args()?
        .execute()
        .await
        .unwrap_err();
    assert_eq!(err, SqlSessionError::IllegalState("connection busy".into()));

    let set = first.await.expect("task panicked")?;
    assert_eq!(set.len(), 1);
    assert_eq!(conn.state(), ConnectionState::Idle);
    assert_eq!(db.max_concurrent_calls(), 1);
    Ok(())
}

#[tokio::test(flavor = "current_thread")]
async fn with_transaction_commits_on_success() -> Result<(), SqlSessionError> {
    let db = MockDatabase::new();
    db.respond("update t set a = ?1", MockResponse::affected(3));
    let conn = connect(&db);

    let affected = conn
        .with_transaction(|tx| async move {
            assert_eq!(tx.state(), ConnectionState::IdleInTx);
            tx.statement("update t set a = :a")?
                .arg("a", 1_i64)
                .bind()?
                .execute_for_rows_affected()
                .await
        })
        .await?;

    assert_eq!(affected, 3);
    assert_eq!(
        db.io_events(),
        vec![
            MockEvent::Begin,
            MockEvent::Open("update t set a = ?1".into(), vec![SqlValue::Long(1)]),
            MockEvent::Commit,
        ]
    );
    assert_eq!(conn.tx_phase(), TxPhase::None);
    assert_eq!(conn.state(), ConnectionState::Idle);
    Ok(())
}

#[tokio::test(flavor = "current_thread")]
async fn with_transaction_rolls_back_and_keeps_body_error() -> Result<(), SqlSessionError> {
    let db = MockDatabase::new();
    let conn = connect(&db);

    let outcome: Result<(), _> = conn
        .with_transaction(|_tx| async move { Err(SqlSessionError::ExecutionError("boom".into())) })
        .await;

    assert_eq!(
        outcome.unwrap_err(),
        SqlSessionError::ExecutionError("boom".into())
    );
    assert_eq!(db.io_events(), vec![MockEvent::Begin, MockEvent::Rollback]);
    assert_eq!(conn.state(), ConnectionState::Idle);
    Ok(())
}

#[tokio::test(flavor = "current_thread")]
async fn failed_commit_rolls_back_and_leaves_transaction() -> Result<(), SqlSessionError> {
    let db = MockDatabase::new();
    db.fail_commit(true);
    let conn = connect(&db);

    conn.begin_tx().await?;
    let err = conn.commit_tx().await.unwrap_err();

    assert!(matches!(err, SqlSessionError::CommitTx(_)));
    assert_eq!(
        db.io_events(),
        vec![MockEvent::Begin, MockEvent::Commit, MockEvent::Rollback]
    );
    assert_eq!(conn.tx_phase(), TxPhase::None);
    Ok(())
}

#[tokio::test(flavor = "current_thread")]
async fn transaction_calls_are_checked_against_phase() -> Result<(), SqlSessionError> {
    let db = MockDatabase::new();
    let conn = connect(&db);

    assert!(matches!(
        conn.commit_tx().await,
        Err(SqlSessionError::IllegalState(_))
    ));
    assert!(matches!(
        conn.rollback_tx().await,
        Err(SqlSessionError::IllegalState(_))
    ));

    conn.begin_tx().await?;
    assert_eq!(conn.tx_phase(), TxPhase::Active);
    assert!(matches!(
        conn.begin_tx().await,
        Err(SqlSessionError::IllegalState(_))
    ));
    conn.rollback_tx().await?;
    assert_eq!(db.io_events(), vec![MockEvent::Begin, MockEvent::Rollback]);
    Ok(())
}

#[tokio::test(flavor = "current_thread")]
async fn failed_begin_is_reported_as_begin_error() {
    let db = MockDatabase::new();
    db.fail_begin(true);
    let conn = connect(&db);

    assert!(matches!(
        conn.begin_tx().await,
        Err(SqlSessionError::BeginTx(_))
    ));
    assert_eq!(conn.tx_phase(), TxPhase::None);
    assert_eq!(conn.state(), ConnectionState::Idle);
}

#[tokio::test(flavor = "current_thread")]
async fn failed_rollback_marks_session_broken() -> Result<(), SqlSessionError> {
    let db = MockDatabase::new();
    db.fail_rollback(true);
    let conn = connect(&db);

    conn.begin_tx().await?;
    assert!(matches!(
        conn.rollback_tx().await,
        Err(SqlSessionError::RollbackTx(_))
    ));
    assert_eq!(db.broken_sessions(), 1);
    assert_eq!(conn.tx_phase(), TxPhase::None);
    Ok(())
}

#[tokio::test(flavor = "current_thread")]
async fn release_rolls_back_open_transaction() -> Result<(), SqlSessionError> {
    let db = MockDatabase::new();
    let conn = connect(&db);

    conn.begin_tx().await?;
    conn.release().await?;

    assert_eq!(db.io_events(), vec![MockEvent::Begin, MockEvent::Rollback]);
    assert_eq!(conn.state(), ConnectionState::Released);
    // Releasing twice is a no-op.
    conn.release().await?;
    assert!(matches!(
        conn.statement("select 1"),
        Err(SqlSessionError::IllegalState(_))
    ));
    assert!(matches!(
        conn.validate(None).await,
        Err(SqlSessionError::IllegalState(_))
    ));
    Ok(())
}

#[tokio::test(flavor = "current_thread")]
async fn release_while_busy_fails_and_force_release_works() -> Result<(), SqlSessionError> {
    let db = MockDatabase::new();
    db.respond(
        "select slow",
        MockResponse::affected(0).with_delay(Duration::from_secs(30)),
    );
    let conn = connect(&db);

    let slow = conn.statement("select slow")?.no_args()?;
    let pending = tokio::spawn(async move { slow.execute().await });
    wait_until_opened(&db, "select slow").await;

    assert!(matches!(
        conn.release().await,
        Err(SqlSessionError::ConnectionRelease(_))
    ));

    conn.force_release();
    assert_eq!(conn.state(), ConnectionState::Released);

    // The interrupted operation still finishes, with an error.
    assert!(pending.await.expect("task panicked").is_err());
    assert!(db.events().contains(&MockEvent::Interrupt));
    Ok(())
}

#[tokio::test]
async fn timeout_interrupts_and_connection_settles() -> Result<(), SqlSessionError> {
    let db = MockDatabase::new();
    db.respond(
        "select slow",
        MockResponse::affected(0).with_delay(Duration::from_secs(30)),
    );
    let conn = connect(&db);

    let err = conn
        .statement("select slow")?
        .no_args()?
        .timeout(Duration::from_millis(50))
        .execute()
        .await
        .unwrap_err();
    assert_eq!(err, SqlSessionError::Timeout(Duration::from_millis(50)));

    conn.watch_for_idle().await?;
    assert!(db.events().contains(&MockEvent::Interrupt));
    conn.statement("select 1")?.no_args()?.execute().await?;
    Ok(())
}

#[tokio::test(flavor = "current_thread")]
async fn validate_reports_validation_errors() -> Result<(), SqlSessionError> {
    let db = MockDatabase::new();
    let conn = connect(&db);
    conn.validate(Some(Duration::from_secs(1))).await?;
    assert_eq!(db.io_events(), vec![MockEvent::Validate]);
    assert_eq!(conn.tx_phase(), TxPhase::None);
    Ok(())
}

#[tokio::test(flavor = "current_thread")]
async fn dropping_connection_rolls_back_open_transaction() -> Result<(), SqlSessionError> {
    let db = MockDatabase::new();
    let conn = connect(&db);
    conn.begin_tx().await?;
    drop(conn);

    for _ in 0..100 {
        if db.events().contains(&MockEvent::Rollback) {
            return Ok(());
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("open transaction was not rolled back: {:?}", db.events());
}

#[tokio::test(flavor = "current_thread")]
async fn cancelled_transaction_scope_rolls_back() -> Result<(), SqlSessionError> {
    let db = MockDatabase::new();
    let conn = connect(&db);

    let scope = conn.with_transaction(|_tx| async move {
        tokio::time::sleep(Duration::from_secs(30)).await;
        Ok(())
    });
    assert!(
        tokio::time::timeout(Duration::from_millis(20), scope)
            .await
            .is_err()
    );

    for _ in 0..100 {
        if conn.tx_phase() == TxPhase::None && conn.state() == ConnectionState::Idle {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert_eq!(db.io_events(), vec![MockEvent::Begin, MockEvent::Rollback]);
    Ok(())
}

#[tokio::test(flavor = "current_thread")]
async fn timed_out_begin_is_rolled_back_once_it_lands() -> Result<(), SqlSessionError> {
    let db = MockDatabase::new();
    db.delay_begin(Duration::from_millis(50));
    let conn = connect(&db);

    let ran = Arc::new(AtomicBool::new(false));
    let body_ran = Arc::clone(&ran);
    let err = conn
        .with_transaction_timeout(Some(Duration::from_millis(10)), |_tx| async move {
            body_ran.store(true, Ordering::SeqCst);
            Ok(())
        })
        .await
        .unwrap_err();
    assert_eq!(err, SqlSessionError::Timeout(Duration::from_millis(10)));

    for _ in 0..100 {
        if db.events().contains(&MockEvent::Rollback) && conn.state() == ConnectionState::Idle {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert_eq!(db.io_events(), vec![MockEvent::Begin, MockEvent::Rollback]);
    assert_eq!(conn.tx_phase(), TxPhase::None);
    assert_eq!(conn.state(), ConnectionState::Idle);
    assert!(!ran.load(Ordering::SeqCst));
    Ok(())
}

#[tokio::test(flavor = "current_thread")]
async fn transaction_timeout_does_not_bound_the_body() -> Result<(), SqlSessionError> {
    let db = MockDatabase::new();
    db.respond("update t set a = ?1", MockResponse::affected(7));
    let conn = connect(&db);

    let affected = conn
        .with_transaction_timeout(Some(Duration::from_millis(50)), |tx| async move {
            tokio::time::sleep(Duration::from_millis(150)).await;
            tx.statement("update t set a = :a")?
                .arg("a", 1_i64)
                .bind()?
                .execute_for_rows_affected()
                .await
        })
        .await?;

    assert_eq!(affected, 7);
    assert_eq!(
        db.io_events(),
        vec![
            MockEvent::Begin,
            MockEvent::Open("update t set a = ?1".into(), vec![SqlValue::Long(1)]),
            MockEvent::Commit,
        ]
    );
    assert_eq!(conn.state(), ConnectionState::Idle);
    Ok(())
}

#[tokio::test(flavor = "current_thread")]
async fn busy_rejection_keeps_single_use_statement_runnable() -> Result<(), SqlSessionError> {
    let db = MockDatabase::new();
    db.single_use_statements(true);
    db.respond(
        "select slow",
        MockResponse::affected(0).with_delay(Duration::from_millis(100)),
    );
    let conn = connect(&db);

    let slow = conn.statement("select slow")?.no_args()?;
    let first = tokio::spawn(async move { slow.execute().await });
    wait_until_busy(&conn).await;

    let update = conn.statement("update t set a = 1")?.no_args()?;
    assert_eq!(
        update.execute().await.unwrap_err(),
        SqlSessionError::IllegalState("connection busy".into())
    );
    assert!(matches!(
        update.stream(),
        Err(SqlSessionError::IllegalState(_))
    ));
    first.await.expect("task panicked")?;

    update.execute().await?;
    assert!(matches!(
        update.execute().await,
        Err(SqlSessionError::ExecutionError(_))
    ));
    Ok(())
}
