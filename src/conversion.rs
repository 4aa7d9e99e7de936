//! Type-directed conversion from driver values to Rust types.
//!
//! The rules are deliberately lossy in a few controlled ways:
//! - any numeric source converts to any numeric target, truncating or rounding as needed;
//! - booleans accept the single-character literals `T`/`Y`/`1` and `F`/`N`/`0`, and the numbers
//!   `1`/`0`;
//! - textual UUIDs parse into [`Uuid`];
//! - date-times truncate to dates and times, dates extend to the start of the day;
//! - local date-times become instants only with an explicit zone, while values that carry an
//!   offset ignore any zone the caller supplies.
//!
//! Everything else fails with [`SqlSessionError::Conversion`].

use chrono::{DateTime, FixedOffset, NaiveDate, NaiveDateTime, NaiveTime, TimeZone, Utc};
use rust_decimal::Decimal;
use rust_decimal::prelude::{FromPrimitive, ToPrimitive};
use serde_json::Value as JsonValue;
use uuid::Uuid;

use crate::decimal::DecimalNumber;
use crate::error::SqlSessionError;
use crate::types::SqlValue;

/// Conversion from a non-NULL [`SqlValue`] into a Rust type.
///
/// NULL handling lives in the row accessors: required getters reject NULL, optional getters map it
/// to `None`, so implementations never see [`SqlValue::Null`] from there.
pub trait FromSqlValue: Sized {
    /// Name used in conversion errors.
    const TARGET: &'static str;

    /// Convert a value.
    ///
    /// # Errors
    /// Returns [`SqlSessionError::Conversion`] when no rule maps `value` to `Self`.
    fn from_sql_value(value: &SqlValue) -> Result<Self, SqlSessionError>;
}

/// Numeric view of a value used by every numeric target.
enum Numeric {
    Integer(i128),
    Real(f64),
    Exact(Decimal),
    NonFinite(DecimalNumber),
}

fn numeric(value: &SqlValue) -> Option<Numeric> {
    match value {
        SqlValue::Short(v) => Some(Numeric::Integer(i128::from(*v))),
        SqlValue::Int(v) => Some(Numeric::Integer(i128::from(*v))),
        SqlValue::Long(v) => Some(Numeric::Integer(i128::from(*v))),
        SqlValue::Float(v) => Some(Numeric::Real(f64::from(*v))),
        SqlValue::Double(v) => Some(Numeric::Real(*v)),
        SqlValue::Decimal(v) => Some(Numeric::Exact(*v)),
        SqlValue::Numeric(DecimalNumber::Finite(v)) => Some(Numeric::Exact(*v)),
        SqlValue::Numeric(other) => Some(Numeric::NonFinite(*other)),
        _ => None,
    }
}

fn integer(value: &SqlValue, target: &'static str) -> Result<i128, SqlSessionError> {
    match numeric(value) {
        Some(Numeric::Integer(v)) => Ok(v),
        // `as` saturates for floats; NaN becomes 0, so reject it explicitly.
        Some(Numeric::Real(v)) if v.is_finite() => Ok(v.trunc() as i128),
        Some(Numeric::Exact(v)) => v
            .trunc()
            .to_i128()
            .ok_or_else(|| SqlSessionError::conversion(value, target)),
        _ => Err(SqlSessionError::conversion(value, target)),
    }
}

macro_rules! impl_integer_target {
    ($($ty:ty => $name:literal),* $(,)?) => {
        $(
            impl FromSqlValue for $ty {
                const TARGET: &'static str = $name;

                #[allow(clippy::cast_possible_truncation)]
                fn from_sql_value(value: &SqlValue) -> Result<Self, SqlSessionError> {
                    // Narrowing keeps the low-order bits, like a primitive cast.
                    integer(value, Self::TARGET).map(|v| v as $ty)
                }
            }
        )*
    };
}

impl_integer_target! {
    i16 => "i16",
    i32 => "i32",
    i64 => "i64",
}

impl FromSqlValue for f64 {
    const TARGET: &'static str = "f64";

    #[allow(clippy::cast_precision_loss)]
    fn from_sql_value(value: &SqlValue) -> Result<Self, SqlSessionError> {
        match numeric(value) {
            Some(Numeric::Integer(v)) => Ok(v as f64),
            Some(Numeric::Real(v)) => Ok(v),
            Some(Numeric::Exact(v)) => v
                .to_f64()
                .ok_or_else(|| SqlSessionError::conversion(value, Self::TARGET)),
            Some(Numeric::NonFinite(DecimalNumber::NaN)) => Ok(f64::NAN),
            Some(Numeric::NonFinite(DecimalNumber::PosInfinity)) => Ok(f64::INFINITY),
            Some(Numeric::NonFinite(DecimalNumber::NegInfinity)) => Ok(f64::NEG_INFINITY),
            _ => Err(SqlSessionError::conversion(value, Self::TARGET)),
        }
    }
}

impl FromSqlValue for f32 {
    const TARGET: &'static str = "f32";

    #[allow(clippy::cast_possible_truncation)]
    fn from_sql_value(value: &SqlValue) -> Result<Self, SqlSessionError> {
        if let SqlValue::Float(v) = value {
            return Ok(*v);
        }
        f64::from_sql_value(value)
            .map(|v| v as f32)
            .map_err(|_| SqlSessionError::conversion(value, Self::TARGET))
    }
}

impl FromSqlValue for Decimal {
    const TARGET: &'static str = "Decimal";

    fn from_sql_value(value: &SqlValue) -> Result<Self, SqlSessionError> {
        match numeric(value) {
            Some(Numeric::Integer(v)) => {
                Decimal::from_i128(v).ok_or_else(|| SqlSessionError::conversion(value, Self::TARGET))
            }
            Some(Numeric::Real(v)) => {
                Decimal::from_f64(v).ok_or_else(|| SqlSessionError::conversion(value, Self::TARGET))
            }
            Some(Numeric::Exact(v)) => Ok(v),
            _ => Err(SqlSessionError::conversion(value, Self::TARGET)),
        }
    }
}

impl FromSqlValue for DecimalNumber {
    const TARGET: &'static str = "DecimalNumber";

    fn from_sql_value(value: &SqlValue) -> Result<Self, SqlSessionError> {
        match numeric(value) {
            Some(Numeric::NonFinite(v)) => Ok(v),
            Some(Numeric::Real(v)) if v.is_nan() => Ok(DecimalNumber::NaN),
            Some(Numeric::Real(v)) if v.is_infinite() => Ok(if v > 0.0 {
                DecimalNumber::PosInfinity
            } else {
                DecimalNumber::NegInfinity
            }),
            Some(_) => Decimal::from_sql_value(value)
                .map(DecimalNumber::Finite)
                .map_err(|_| SqlSessionError::conversion(value, Self::TARGET)),
            None => Err(SqlSessionError::conversion(value, Self::TARGET)),
        }
    }
}

fn bool_literal(c: char) -> Option<bool> {
    match c {
        'T' | 'Y' | '1' => Some(true),
        'F' | 'N' | '0' => Some(false),
        _ => None,
    }
}

fn single_char(text: &str) -> Option<char> {
    let mut chars = text.chars();
    match (chars.next(), chars.next()) {
        (Some(c), None) => Some(c),
        _ => None,
    }
}

impl FromSqlValue for bool {
    const TARGET: &'static str = "bool";

    fn from_sql_value(value: &SqlValue) -> Result<Self, SqlSessionError> {
        let converted = match value {
            SqlValue::Bool(v) => Some(*v),
            SqlValue::Char(c) => bool_literal(*c),
            SqlValue::Text(text) => single_char(text).and_then(bool_literal),
            other => match numeric(other) {
                Some(Numeric::Integer(1)) => Some(true),
                Some(Numeric::Integer(0)) => Some(false),
                Some(Numeric::Exact(d)) if d == Decimal::ONE => Some(true),
                Some(Numeric::Exact(d)) if d.is_zero() => Some(false),
                Some(Numeric::Real(f)) if f == 1.0 => Some(true),
                Some(Numeric::Real(f)) if f == 0.0 => Some(false),
                _ => None,
            },
        };
        converted.ok_or_else(|| SqlSessionError::conversion(value, Self::TARGET))
    }
}

impl FromSqlValue for char {
    const TARGET: &'static str = "char";

    fn from_sql_value(value: &SqlValue) -> Result<Self, SqlSessionError> {
        match value {
            SqlValue::Char(c) => Ok(*c),
            SqlValue::Text(text) => {
                single_char(text).ok_or_else(|| SqlSessionError::conversion(value, Self::TARGET))
            }
            _ => Err(SqlSessionError::conversion(value, Self::TARGET)),
        }
    }
}

impl FromSqlValue for String {
    const TARGET: &'static str = "String";

    fn from_sql_value(value: &SqlValue) -> Result<Self, SqlSessionError> {
        match value {
            SqlValue::Text(text) => Ok(text.clone()),
            SqlValue::Char(c) => Ok(c.to_string()),
            SqlValue::Json(JsonValue::String(text)) => Ok(text.clone()),
            _ => Err(SqlSessionError::conversion(value, Self::TARGET)),
        }
    }
}

impl FromSqlValue for Vec<u8> {
    const TARGET: &'static str = "Vec<u8>";

    fn from_sql_value(value: &SqlValue) -> Result<Self, SqlSessionError> {
        match value {
            SqlValue::Bytes(bytes) => Ok(bytes.clone()),
            _ => Err(SqlSessionError::conversion(value, Self::TARGET)),
        }
    }
}

impl FromSqlValue for Uuid {
    const TARGET: &'static str = "Uuid";

    fn from_sql_value(value: &SqlValue) -> Result<Self, SqlSessionError> {
        match value {
            SqlValue::Uuid(uuid) => Ok(*uuid),
            SqlValue::Text(text) => Uuid::parse_str(text.trim())
                .map_err(|_| SqlSessionError::conversion(value, Self::TARGET)),
            SqlValue::Bytes(bytes) => Uuid::from_slice(bytes)
                .map_err(|_| SqlSessionError::conversion(value, Self::TARGET)),
            _ => Err(SqlSessionError::conversion(value, Self::TARGET)),
        }
    }
}

impl FromSqlValue for JsonValue {
    const TARGET: &'static str = "serde_json::Value";

    fn from_sql_value(value: &SqlValue) -> Result<Self, SqlSessionError> {
        match value {
            SqlValue::Json(json) => Ok(json.clone()),
            SqlValue::Text(text) => serde_json::from_str(text)
                .map_err(|_| SqlSessionError::conversion(value, Self::TARGET)),
            _ => Err(SqlSessionError::conversion(value, Self::TARGET)),
        }
    }
}

impl FromSqlValue for NaiveDate {
    const TARGET: &'static str = "NaiveDate";

    fn from_sql_value(value: &SqlValue) -> Result<Self, SqlSessionError> {
        match value {
            SqlValue::Date(date) => Ok(*date),
            SqlValue::DateTime(dt) => Ok(dt.date()),
            SqlValue::ZonedDateTime(dt) => Ok(dt.date_naive()),
            SqlValue::Timestamp(dt) => Ok(dt.date_naive()),
            _ => Err(SqlSessionError::conversion(value, Self::TARGET)),
        }
    }
}

impl FromSqlValue for NaiveTime {
    const TARGET: &'static str = "NaiveTime";

    fn from_sql_value(value: &SqlValue) -> Result<Self, SqlSessionError> {
        match value {
            SqlValue::Time(time) => Ok(*time),
            SqlValue::DateTime(dt) => Ok(dt.time()),
            SqlValue::ZonedDateTime(dt) => Ok(dt.time()),
            SqlValue::Timestamp(dt) => Ok(dt.time()),
            _ => Err(SqlSessionError::conversion(value, Self::TARGET)),
        }
    }
}

impl FromSqlValue for NaiveDateTime {
    const TARGET: &'static str = "NaiveDateTime";

    fn from_sql_value(value: &SqlValue) -> Result<Self, SqlSessionError> {
        match value {
            SqlValue::DateTime(dt) => Ok(*dt),
            SqlValue::Date(date) => Ok(date.and_time(NaiveTime::MIN)),
            SqlValue::ZonedDateTime(dt) => Ok(dt.naive_local()),
            SqlValue::Timestamp(dt) => Ok(dt.naive_utc()),
            _ => Err(SqlSessionError::conversion(value, Self::TARGET)),
        }
    }
}

impl FromSqlValue for DateTime<FixedOffset> {
    const TARGET: &'static str = "DateTime<FixedOffset>";

    fn from_sql_value(value: &SqlValue) -> Result<Self, SqlSessionError> {
        match value {
            SqlValue::ZonedDateTime(dt) => Ok(*dt),
            SqlValue::Timestamp(dt) => Ok(dt.fixed_offset()),
            _ => Err(SqlSessionError::conversion(value, Self::TARGET)),
        }
    }
}

/// Instants need offset information: either carried by the value or supplied by the caller.
impl FromSqlValue for DateTime<Utc> {
    const TARGET: &'static str = "DateTime<Utc>";

    fn from_sql_value(value: &SqlValue) -> Result<Self, SqlSessionError> {
        match value {
            SqlValue::Timestamp(dt) => Ok(*dt),
            SqlValue::ZonedDateTime(dt) => Ok(dt.with_timezone(&Utc)),
            _ => Err(SqlSessionError::conversion(value, Self::TARGET)),
        }
    }
}

/// Convert to an instant, interpreting zone-less values in `zone`.
///
/// Values that already carry an offset ignore `zone`.
///
/// # Errors
/// Returns [`SqlSessionError::Conversion`] for non-temporal values and for local times that do
/// not exist or are ambiguous in `zone`.
pub fn instant_in<Tz: TimeZone>(
    value: &SqlValue,
    zone: &Tz,
) -> Result<DateTime<Utc>, SqlSessionError> {
    let local = match value {
        SqlValue::Timestamp(_) | SqlValue::ZonedDateTime(_) => {
            return DateTime::<Utc>::from_sql_value(value);
        }
        SqlValue::DateTime(dt) => *dt,
        SqlValue::Date(date) => date.and_time(NaiveTime::MIN),
        _ => return Err(SqlSessionError::conversion(value, DateTime::<Utc>::TARGET)),
    };
    zone.from_local_datetime(&local)
        .single()
        .map(|dt| dt.with_timezone(&Utc))
        .ok_or_else(|| SqlSessionError::conversion(value, DateTime::<Utc>::TARGET))
}
