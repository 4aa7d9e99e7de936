#![cfg(feature = "sqlite")]

use chrono::{FixedOffset, NaiveDate, NaiveDateTime, NaiveTime, TimeZone, Utc};
use futures_util::StreamExt;
use rust_decimal::Decimal;
use serde_json::json;
use sql_session::test_utils::temp_sqlite_path;
use sql_session::{
    ConnectionFactory, ConnectionState, DecimalNumber, KeyColumns, SqlParam, SqlSessionError,
    SqlType, StatementOptions,
};
use tempfile::TempDir;
use uuid::Uuid;

const SCHEMA: &str = "create table users (
    id integer primary key,
    email text not null unique,
    name text,
    age int
)";

async fn factory(dir: &TempDir) -> Result<ConnectionFactory, SqlSessionError> {
    let factory = ConnectionFactory::sqlite_builder(temp_sqlite_path(dir.path(), "test"))
        .max_connections(2)
        .build()
        .await?;
    factory
        .with_connection(|conn| async move {
            conn.statement(SCHEMA)?.no_args()?.execute().await
        })
        .await?;
    Ok(factory)
}

#[tokio::test]
async fn every_type_round_trips() -> Result<(), SqlSessionError> {
    let dir = tempfile::tempdir().expect("tempdir");
    let factory = factory(&dir).await?;
    let conn = factory.get_connection().await?;

    conn.statement(
        "create table everything (
            b boolean, c char(1), s smallint, i int, l bigint, f float, d double,
            dec decimal(10, 2), u uuid, dt date, tm time, ts datetime, z timestamptz,
            inst timestamptz, j json, t text, bin blob
        )",
    )?
    .no_args()?
    .execute()
    .await?;

    let uuid = Uuid::new_v4();
    let date = NaiveDate::from_ymd_opt(2024, 2, 29).expect("date");
    let time = NaiveTime::from_hms_milli_opt(10, 11, 12, 500).expect("time");
    let stamp = NaiveDateTime::new(date, NaiveTime::from_hms_opt(8, 9, 10).expect("time"));
    let zoned = FixedOffset::east_opt(2 * 3600)
        .expect("offset")
        .with_ymd_and_hms(2024, 2, 29, 10, 11, 12)
        .single()
        .expect("zoned");
    let instant = Utc.with_ymd_and_hms(2024, 1, 2, 3, 4, 5).single().expect("instant");
    let doc = json!({"tags": ["a", "b"], "n": 1});

    let inserted = conn
        .statement(
            "insert into everything values
             (:b, :c, :s, :i, :l, :f, :d, :dec, :u, :dt, :tm, :ts, :z, :inst, :j, :t, :bin)",
        )?
        .arg("b", true)
        .arg("c", 'x')
        .arg("s", 7_i16)
        .arg("i", 42_i32)
        .arg("l", 9_000_000_000_i64)
        .arg("f", 1.5_f32)
        .arg("d", 2.25_f64)
        .arg("dec", Decimal::new(1234, 2))
        .arg("u", uuid)
        .arg("dt", date)
        .arg("tm", time)
        .arg("ts", stamp)
        .arg("z", zoned)
        .arg("inst", instant)
        .arg("j", doc.clone())
        .arg("t", "hello")
        .arg("bin", vec![0_u8, 1, 2, 255])
        .bind()?
        .execute_for_rows_affected()
        .await?;
    assert_eq!(inserted, 1);

    let row = conn
        .statement("select * from everything")?
        .no_args()?
        .execute_for_first_row()
        .await?
        .expect("one row");

    assert!(row.get_bool("b")?);
    assert_eq!(row.get_char("c")?, 'x');
    assert_eq!(row.get_short("s")?, 7);
    assert_eq!(row.get_int("i")?, 42);
    assert_eq!(row.get_long("l")?, 9_000_000_000);
    assert!((row.get_float("f")? - 1.5).abs() < f32::EPSILON);
    assert!((row.get_double("d")? - 2.25).abs() < f64::EPSILON);
    assert_eq!(row.get_big_decimal("dec")?, Decimal::new(1234, 2));
    assert_eq!(row.get_uuid("u")?, uuid);
    assert_eq!(row.get_local_date("dt")?, date);
    assert_eq!(row.get_local_time("tm")?, time);
    assert_eq!(row.get_local_date_time("ts")?, stamp);
    assert_eq!(row.get_zoned_date_time("z")?, zoned);
    assert_eq!(row.get_instant("inst")?, instant);
    assert_eq!(row.get::<serde_json::Value>("j")?, doc);
    assert_eq!(row.get_str("t")?, "hello");
    assert_eq!(row.get_bytes("bin")?, vec![0, 1, 2, 255]);

    // Widening and narrowing conversions.
    assert_eq!(row.get_long("i")?, 42);
    assert_eq!(row.get_local_date("ts")?, date);
    conn.release().await?;
    Ok(())
}

#[tokio::test]
async fn non_finite_decimals_are_preserved() -> Result<(), SqlSessionError> {
    let dir = tempfile::tempdir().expect("tempdir");
    let factory = factory(&dir).await?;
    let values = factory
        .with_connection(|conn| async move {
            conn.statement("create table amounts (id integer primary key, v numeric)")?
                .no_args()?
                .execute()
                .await?;
            let insert = conn.statement("insert into amounts (v) values (:v)")?;
            for v in [
                DecimalNumber::NAN,
                DecimalNumber::POS_INFINITY,
                DecimalNumber::of(Decimal::new(-5, 1)),
            ] {
                insert.arg("v", v).bind()?.execute().await?;
            }
            let set = conn
                .statement("select v from amounts order by id")?
                .no_args()?
                .execute_for_set()
                .await?;
            set.iter()
                .map(|row| row.get_decimal("v"))
                .collect::<Result<Vec<_>, _>>()
        })
        .await?;

    assert!(values[0].is_nan());
    assert!(values[1].is_pos_infinity());
    assert_eq!(values[2].value()?, Decimal::new(-5, 1));
    Ok(())
}

#[tokio::test]
async fn nan_reals_are_rejected_at_bind_time() -> Result<(), SqlSessionError> {
    let dir = tempfile::tempdir().expect("tempdir");
    let factory = factory(&dir).await?;
    let conn = factory.get_connection().await?;
    let err = conn
        .statement("select :x")?
        .arg("x", f64::NAN)
        .bind()
        .unwrap_err();
    assert!(err.is_binding_error());
    conn.release().await?;
    Ok(())
}

#[tokio::test]
async fn generated_keys_are_returned() -> Result<(), SqlSessionError> {
    let dir = tempfile::tempdir().expect("tempdir");
    let factory = factory(&dir).await?;
    let conn = factory.get_connection().await?;

    let row = conn
        .statement_with_options(
            "insert into users (email, name) values (:email, :name)",
            StatementOptions::RETURN_GEN_KEYS,
        )?
        .arg("email", "ada@example.com")
        .arg("name", "Ada")
        .bind()?
        .execute_for_first_row()
        .await?
        .expect("generated row");
    assert_eq!(row.get_long("id")?, 1);
    assert_eq!(row.get_str("email")?, "ada@example.com");

    let keys = StatementOptions::of(KeyColumns::columns(["id"]));
    let set = conn
        .statement_with_options("insert into users (email) values (:email)", keys)?
        .arg("email", "bob@example.com")
        .bind()?
        .execute_for_set()
        .await?;
    assert_eq!(set.metadata().column_names(), ["id"]);
    assert_eq!(set.rows()[0].get_long("id")?, 2);
    assert_eq!(set.rows_affected(), 1);
    conn.release().await?;
    Ok(())
}

#[tokio::test]
async fn null_columns_and_empty_results() -> Result<(), SqlSessionError> {
    let dir = tempfile::tempdir().expect("tempdir");
    let factory = factory(&dir).await?;
    let conn = factory.get_connection().await?;

    conn.statement("insert into users (email, age) values (:email, :age)")?
        .arg("email", "nobody@example.com")
        .arg("age", SqlParam::null(SqlType::Int))
        .bind()?
        .execute()
        .await?;

    let row = conn
        .statement("select age from users where email = :email")?
        .arg("email", "nobody@example.com")
        .bind()?
        .execute_for_first_row()
        .await?
        .expect("row");
    assert_eq!(row.get_int_opt("age")?, None);
    assert!(matches!(
        row.get_int("age"),
        Err(SqlSessionError::Conversion { .. })
    ));
    assert!(matches!(
        row.get_int("missing"),
        Err(SqlSessionError::MissingColumn(_))
    ));

    let none = conn
        .statement("select * from users where id = :id")?
        .arg("id", 999_i64)
        .bind()?
        .execute_for_first_row()
        .await?;
    assert!(none.is_none());

    let value = conn
        .statement("select name from users where id = :id")?
        .arg("id", 999_i64)
        .bind()?
        .execute_for_value(|row| row.get_str("name"))
        .await?;
    assert_eq!(value, None);
    conn.release().await?;
    Ok(())
}

#[tokio::test]
async fn update_reports_rows_affected() -> Result<(), SqlSessionError> {
    let dir = tempfile::tempdir().expect("tempdir");
    let factory = factory(&dir).await?;
    let conn = factory.get_connection().await?;

    let insert = conn.statement("insert into users (email, age) values (:email, :age)")?;
    let inserted = insert
        .stream_args(futures_util::stream::iter((0..5).map(|i| {
            [
                ("email", SqlParam::from(format!("u{i}@example.com"))),
                ("age", SqlParam::from(20 + i)),
            ]
        })))
        .await?;
    assert_eq!(inserted, 5);

    let updated = conn
        .statement("update users set age = age + 1 where age >= :min")?
        .arg("min", 22)
        .bind()?
        .execute_for_rows_affected()
        .await?;
    assert_eq!(updated, 3);

    let selected = conn
        .statement("select * from users")?
        .no_args()?
        .execute_for_rows_affected()
        .await?;
    assert_eq!(selected, 5);
    conn.release().await?;
    Ok(())
}

#[tokio::test]
async fn constraint_and_query_errors_are_classified() -> Result<(), SqlSessionError> {
    let dir = tempfile::tempdir().expect("tempdir");
    let factory = factory(&dir).await?;
    let conn = factory.get_connection().await?;

    let insert = conn.statement("insert into users (email) values (:email)")?;
    insert.arg("email", "dup@example.com").bind()?.execute().await?;
    let err = insert
        .arg("email", "dup@example.com")
        .bind()?
        .execute()
        .await
        .unwrap_err();
    match err {
        SqlSessionError::ConstraintViolation {
            table, constraint, ..
        } => {
            assert_eq!(table, "users");
            assert_eq!(constraint, "UNIQUE");
        }
        other => panic!("expected constraint violation, got {other:?}"),
    }

    assert!(matches!(
        conn.statement("select * from no_such_table")?
            .no_args()?
            .execute()
            .await,
        Err(SqlSessionError::InvalidQuery(_))
    ));
    assert!(matches!(
        conn.statement("BEGIN")?.no_args()?.execute().await,
        Err(SqlSessionError::InvalidQuery(_))
    ));
    assert!(matches!(
        conn.statement("  -- sneaky\n commit")?.no_args()?.execute().await,
        Err(SqlSessionError::InvalidQuery(_))
    ));
    assert_eq!(conn.state(), ConnectionState::Idle);
    conn.release().await?;
    Ok(())
}

#[tokio::test]
async fn transactions_commit_and_roll_back() -> Result<(), SqlSessionError> {
    let dir = tempfile::tempdir().expect("tempdir");
    let factory = factory(&dir).await?;

    factory
        .with_transaction(|conn| async move {
            conn.statement("insert into users (email) values (:email)")?
                .arg("email", "kept@example.com")
                .bind()?
                .execute()
                .await
        })
        .await?;

    let failed: Result<(), _> = factory
        .with_transaction(|conn| async move {
            conn.statement("insert into users (email) values (:email)")?
                .arg("email", "dropped@example.com")
                .bind()?
                .execute()
                .await?;
            Err(SqlSessionError::ExecutionError("abort".into()))
        })
        .await;
    assert_eq!(
        failed.unwrap_err(),
        SqlSessionError::ExecutionError("abort".into())
    );

    let emails = factory
        .with_connection(|conn| async move {
            let set = conn
                .statement("select email from users order by id")?
                .no_args()?
                .execute_for_set()
                .await?;
            set.iter()
                .map(|row| row.get_str("email"))
                .collect::<Result<Vec<_>, _>>()
        })
        .await?;
    assert_eq!(emails, ["kept@example.com"]);
    Ok(())
}

#[tokio::test]
async fn release_rolls_back_uncommitted_work() -> Result<(), SqlSessionError> {
    let dir = tempfile::tempdir().expect("tempdir");
    let factory = factory(&dir).await?;

    let conn = factory.get_connection().await?;
    conn.begin_tx().await?;
    conn.statement("insert into users (email) values ('ghost@example.com')")?
        .no_args()?
        .execute()
        .await?;
    conn.release().await?;

    let count = factory
        .with_connection(|conn| async move {
            conn.statement("select count(*) as n from users")?
                .no_args()?
                .execute_for_value(|row| row.get_long("n"))
                .await
        })
        .await?;
    assert_eq!(count, Some(0));
    Ok(())
}

#[tokio::test]
async fn streaming_cancel_then_reuse() -> Result<(), SqlSessionError> {
    let dir = tempfile::tempdir().expect("tempdir");
    let factory = factory(&dir).await?;
    let conn = factory.get_connection().await?;

    let insert = conn.statement("insert into users (email) values (:email)")?;
    for i in 0..10 {
        insert
            .arg("email", format!("s{i}@example.com"))
            .bind()?
            .execute()
            .await?;
    }

    let mut rows = conn
        .statement("select id, email from users order by id")?
        .no_args()?
        .stream()?;
    let mut seen = Vec::new();
    while let Some(row) = rows.next().await {
        seen.push(row?.get_long("id")?);
        if seen.len() == 2 {
            rows.cancel();
        }
    }
    assert_eq!(seen, [1, 2]);

    conn.watch_for_idle().await?;
    let total = conn
        .statement("select count(*) from users")?
        .no_args()?
        .execute_for_value(|row| row.get_long(0_usize))
        .await?;
    assert_eq!(total, Some(10));
    conn.release().await?;
    Ok(())
}

#[tokio::test]
async fn shut_down_factory_refuses_connections() -> Result<(), SqlSessionError> {
    let dir = tempfile::tempdir().expect("tempdir");
    let factory = factory(&dir).await?;
    factory.shutdown().await;

    assert!(factory.is_shut_down());
    assert_eq!(
        factory.get_connection().await.unwrap_err(),
        SqlSessionError::FactoryShutdown
    );
    assert!(matches!(
        factory.with_connection(|_conn| async move { Ok(()) }).await,
        Err(SqlSessionError::FactoryShutdown)
    ));
    Ok(())
}

#[tokio::test]
async fn instants_round_trip_through_plain_timestamp_columns() -> Result<(), SqlSessionError> {
    let dir = tempfile::tempdir().expect("tempdir");
    let factory = factory(&dir).await?;
    let conn = factory.get_connection().await?;
    conn.statement("create table events (at timestamp, local datetime)")?
        .no_args()?
        .execute()
        .await?;

    let instant = Utc.with_ymd_and_hms(2024, 1, 2, 3, 4, 5).single().expect("instant");
    let local = instant.naive_utc();
    conn.statement("insert into events values (:at, :local)")?
        .arg("at", instant)
        .arg("local", local)
        .bind()?
        .execute()
        .await?;

    let row = conn
        .statement("select at, local from events")?
        .no_args()?
        .execute_for_first_row()
        .await?
        .expect("one row");
    let plus_two = FixedOffset::east_opt(2 * 3600).expect("offset");

    assert_eq!(row.get_instant("at")?, instant);
    // The stored offset wins over the zone passed in.
    assert_eq!(row.get_instant_in("at", &plus_two)?, instant);
    assert_eq!(row.get_local_date_time("at")?, local);

    // Zone-less values need a zone to become an instant.
    assert!(matches!(
        row.get_instant("local"),
        Err(SqlSessionError::Conversion { .. })
    ));
    assert_eq!(
        row.get_instant_in("local", &plus_two)?,
        Utc.with_ymd_and_hms(2024, 1, 2, 1, 4, 5).single().expect("instant")
    );
    assert_eq!(row.get_instant_in("local", &Utc)?, instant);
    conn.release().await?;
    Ok(())
}

#[tokio::test]
async fn long_decimals_follow_numeric_affinity() -> Result<(), SqlSessionError> {
    let dir = tempfile::tempdir().expect("tempdir");
    let factory = factory(&dir).await?;
    let conn = factory.get_connection().await?;
    conn.statement("create table prices (short decimal(10, 2), long decimal(30, 10), whole decimal(30, 0))")?
        .no_args()?
        .execute()
        .await?;

    let short: Decimal = "12.50".parse().expect("decimal");
    let long: Decimal = "12345678901234.5678901234".parse().expect("decimal");
    let whole: Decimal = "123456789012345678".parse().expect("decimal");
    conn.statement("insert into prices values (:short, :long, :whole)")?
        .arg("short", short)
        .arg("long", long)
        .arg("whole", whole)
        .bind()?
        .execute()
        .await?;

    let row = conn
        .statement("select * from prices")?
        .no_args()?
        .execute_for_first_row()
        .await?
        .expect("one row");
    assert_eq!(row.get_big_decimal("short")?, short);
    assert_eq!(row.get_big_decimal("whole")?, whole);
    // Stored as REAL: rounded to the nearest double.
    let rounded: Decimal = "12345678901234.568".parse().expect("decimal");
    assert_eq!(row.get_big_decimal("long")?, rounded);
    assert_ne!(row.get_big_decimal("long")?, long);
    conn.release().await?;
    Ok(())
}

#[tokio::test]
async fn failing_argument_set_stops_the_batch() -> Result<(), SqlSessionError> {
    let dir = tempfile::tempdir().expect("tempdir");
    let factory = factory(&dir).await?;
    let conn = factory.get_connection().await?;

    let insert = conn.statement("insert into users (email) values (:email)")?;
    let err = insert
        .stream_args(futures_util::stream::iter(
            ["a@example.com", "a@example.com", "b@example.com"].map(|email| [("email", email)]),
        ))
        .await
        .unwrap_err();
    assert!(matches!(err, SqlSessionError::ConstraintViolation { .. }));

    let count = conn
        .statement("select count(*) as n from users")?
        .no_args()?
        .execute_for_value(|row| row.get_long("n"))
        .await?;
    assert_eq!(count, Some(1));
    conn.release().await?;
    Ok(())
}
