use std::str::FromStr;

use chrono::{DateTime, FixedOffset, NaiveDate, NaiveDateTime, NaiveTime, Utc};
use rusqlite::types::ValueRef;
use rust_decimal::Decimal;
use uuid::Uuid;

use crate::decimal::DecimalNumber;
use crate::metadata::{ColumnMetadata, RowMetadata};
use crate::types::{SqlType, SqlValue};

use super::params::{DATE_FORMAT, DATETIME_FORMAT, TIME_FORMAT, ZONED_FORMAT};

/// How a column's values are decoded, derived from its declared type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ColumnKind {
    Bool,
    Short,
    Int,
    Long,
    Float,
    Double,
    Decimal,
    Uuid,
    Date,
    Time,
    DateTime,
    Zoned,
    Json,
    Text,
    Bytes,
    /// No declared type; decode by storage class.
    Dynamic,
}

impl ColumnKind {
    pub(crate) fn from_decl(decl: Option<&str>) -> Self {
        let Some(decl) = decl else {
            return ColumnKind::Dynamic;
        };
        let decl = decl.trim().to_ascii_uppercase();
        let base = decl.split('(').next().unwrap_or("").trim();
        match base {
            "BOOL" | "BOOLEAN" => ColumnKind::Bool,
            "SMALLINT" | "INT2" | "TINYINT" => ColumnKind::Short,
            "INT" | "INT4" | "MEDIUMINT" => ColumnKind::Int,
            "INTEGER" | "BIGINT" | "INT8" => ColumnKind::Long,
            "FLOAT" | "FLOAT4" => ColumnKind::Float,
            "REAL" | "DOUBLE" | "DOUBLE PRECISION" | "FLOAT8" => ColumnKind::Double,
            "DECIMAL" | "NUMERIC" => ColumnKind::Decimal,
            "UUID" => ColumnKind::Uuid,
            "DATE" => ColumnKind::Date,
            "TIME" => ColumnKind::Time,
            "DATETIME" | "TIMESTAMP" => ColumnKind::DateTime,
            "TIMESTAMPTZ" | "TIMESTAMP WITH TIME ZONE" | "DATETIMEOFFSET" => ColumnKind::Zoned,
            "JSON" | "JSONB" => ColumnKind::Json,
            "BLOB" | "BYTEA" | "BINARY" | "VARBINARY" => ColumnKind::Bytes,
            "" => ColumnKind::Dynamic,
            _ if base.contains("CHAR") || base.contains("TEXT") || base.contains("CLOB") => {
                ColumnKind::Text
            }
            _ if base.contains("INT") => ColumnKind::Long,
            _ => ColumnKind::Dynamic,
        }
    }

    fn value_type(self) -> Option<SqlType> {
        let ty = match self {
            ColumnKind::Bool => SqlType::Bool,
            ColumnKind::Short => SqlType::Short,
            ColumnKind::Int => SqlType::Int,
            ColumnKind::Long => SqlType::Long,
            ColumnKind::Float => SqlType::Float,
            ColumnKind::Double => SqlType::Double,
            ColumnKind::Decimal => SqlType::Decimal,
            ColumnKind::Uuid => SqlType::Uuid,
            ColumnKind::Date => SqlType::Date,
            ColumnKind::Time => SqlType::Time,
            ColumnKind::DateTime => SqlType::DateTime,
            ColumnKind::Zoned => SqlType::ZonedDateTime,
            ColumnKind::Json => SqlType::Json,
            ColumnKind::Text => SqlType::Text,
            ColumnKind::Bytes => SqlType::Bytes,
            ColumnKind::Dynamic => return None,
        };
        Some(ty)
    }
}

/// Describe the columns of a prepared statement.
pub(crate) fn describe(stmt: &rusqlite::Statement<'_>) -> (RowMetadata, Vec<ColumnKind>) {
    let mut columns = Vec::with_capacity(stmt.column_count());
    let mut kinds = Vec::with_capacity(stmt.column_count());
    for column in stmt.columns() {
        let kind = ColumnKind::from_decl(column.decl_type());
        columns.push(
            ColumnMetadata::new(column.name(), column.decl_type().unwrap_or(""))
                .with_value_type(kind.value_type()),
        );
        kinds.push(kind);
    }
    (RowMetadata::new(columns), kinds)
}

/// Extract every column of a `SQLite` row.
///
/// # Errors
/// Returns the rusqlite error if a column cannot be read.
pub(crate) fn decode_row(
    row: &rusqlite::Row<'_>,
    kinds: &[ColumnKind],
) -> rusqlite::Result<Vec<SqlValue>> {
    let mut values = Vec::with_capacity(kinds.len());
    for (idx, kind) in kinds.iter().enumerate() {
        values.push(decode_value(row.get_ref(idx)?, *kind));
    }
    Ok(values)
}

/// Decode one stored value. A value that does not parse as the declared type is returned as
/// stored.
pub(crate) fn decode_value(value: ValueRef<'_>, kind: ColumnKind) -> SqlValue {
    match value {
        ValueRef::Null => SqlValue::Null,
        ValueRef::Integer(i) => decode_integer(i, kind),
        ValueRef::Real(f) => decode_real(f, kind),
        ValueRef::Text(bytes) => {
            let text = String::from_utf8_lossy(bytes);
            decode_text(&text, kind).unwrap_or_else(|| SqlValue::Text(text.into_owned()))
        }
        ValueRef::Blob(bytes) => match kind {
            ColumnKind::Uuid => Uuid::from_slice(bytes)
                .map_or_else(|_| SqlValue::Bytes(bytes.to_vec()), SqlValue::Uuid),
            _ => SqlValue::Bytes(bytes.to_vec()),
        },
    }
}

fn decode_integer(i: i64, kind: ColumnKind) -> SqlValue {
    match kind {
        ColumnKind::Bool => SqlValue::Bool(i != 0),
        ColumnKind::Short => i16::try_from(i).map_or(SqlValue::Long(i), SqlValue::Short),
        ColumnKind::Int => i32::try_from(i).map_or(SqlValue::Long(i), SqlValue::Int),
        ColumnKind::Decimal => SqlValue::Decimal(Decimal::from(i)),
        #[allow(clippy::cast_precision_loss)]
        ColumnKind::Float => SqlValue::Float(i as f32),
        #[allow(clippy::cast_precision_loss)]
        ColumnKind::Double => SqlValue::Double(i as f64),
        ColumnKind::DateTime => DateTime::from_timestamp(i, 0)
            .map_or(SqlValue::Long(i), |dt| SqlValue::DateTime(dt.naive_utc())),
        _ => SqlValue::Long(i),
    }
}

fn decode_real(f: f64, kind: ColumnKind) -> SqlValue {
    match kind {
        #[allow(clippy::cast_possible_truncation)]
        ColumnKind::Float => SqlValue::Float(f as f32),
        ColumnKind::Decimal if f.is_infinite() => SqlValue::Numeric(if f > 0.0 {
            DecimalNumber::POS_INFINITY
        } else {
            DecimalNumber::NEG_INFINITY
        }),
        // Shortest round-trip text keeps `0.1` from turning into its binary expansion.
        ColumnKind::Decimal => {
            Decimal::from_str(&f.to_string()).map_or(SqlValue::Double(f), SqlValue::Decimal)
        }
        _ => SqlValue::Double(f),
    }
}

fn decode_text(text: &str, kind: ColumnKind) -> Option<SqlValue> {
    let value = match kind {
        ColumnKind::Decimal => match DecimalNumber::parse(text)? {
            DecimalNumber::Finite(d) => SqlValue::Decimal(d),
            other => SqlValue::Numeric(other),
        },
        ColumnKind::Uuid => SqlValue::Uuid(Uuid::parse_str(text).ok()?),
        ColumnKind::Date => SqlValue::Date(
            NaiveDate::parse_from_str(text, DATE_FORMAT)
                .ok()
                .or_else(|| parse_datetime(text).map(|dt| dt.date()))
                .or_else(|| parse_zoned(text).map(|dt| dt.date_naive()))?,
        ),
        ColumnKind::Time => SqlValue::Time(
            NaiveTime::parse_from_str(text, TIME_FORMAT)
                .or_else(|_| NaiveTime::parse_from_str(text, "%H:%M"))
                .ok()?,
        ),
        // Instants are written with an offset; zone-less text is a local date-time.
        ColumnKind::DateTime => match parse_datetime(text) {
            Some(dt) => SqlValue::DateTime(dt),
            None => SqlValue::Timestamp(parse_zoned(text)?.with_timezone(&Utc)),
        },
        ColumnKind::Zoned => SqlValue::ZonedDateTime(parse_zoned(text)?),
        ColumnKind::Json => SqlValue::Json(serde_json::from_str(text).ok()?),
        _ => return None,
    };
    Some(value)
}

fn parse_zoned(text: &str) -> Option<DateTime<FixedOffset>> {
    DateTime::parse_from_str(text, ZONED_FORMAT)
        .or_else(|_| DateTime::parse_from_rfc3339(text))
        .ok()
}

fn parse_datetime(text: &str) -> Option<NaiveDateTime> {
    NaiveDateTime::parse_from_str(text, DATETIME_FORMAT)
        .or_else(|_| NaiveDateTime::parse_from_str(text, "%Y-%m-%dT%H:%M:%S%.f"))
        .or_else(|_| NaiveDateTime::parse_from_str(text, "%Y-%m-%d %H:%M"))
        .or_else(|_| {
            NaiveDate::parse_from_str(text, DATE_FORMAT).map(|d| d.and_time(NaiveTime::MIN))
        })
        .ok()
}
