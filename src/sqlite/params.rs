use rusqlite::types::Value;

use crate::decimal::DecimalNumber;
use crate::driver::ParamChecker;
use crate::error::SqlSessionError;
use crate::types::{SqlParam, SqlValue};

pub(crate) const DATE_FORMAT: &str = "%Y-%m-%d";
pub(crate) const TIME_FORMAT: &str = "%H:%M:%S%.f";
pub(crate) const DATETIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.f";
pub(crate) const ZONED_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.f%:z";

/// Convert a single [`SqlValue`] to a rusqlite `Value`.
///
/// Types SQLite has no storage class for are written as text in a format the decoder reads back.
///
/// Decimals go in as text, but a `DECIMAL`/`NUMERIC` column applies numeric affinity and keeps a
/// well-formed literal as INTEGER or REAL. A decimal that is not an `i64` comes back as the
/// nearest `f64`: up to 15 significant digits read back equal, longer values are rounded.
#[must_use]
pub fn to_sqlite_value(value: &SqlValue) -> Value {
    match value {
        SqlValue::Null => Value::Null,
        SqlValue::Bool(b) => Value::Integer(i64::from(*b)),
        SqlValue::Char(c) => Value::Text(c.to_string()),
        SqlValue::Short(i) => Value::Integer(i64::from(*i)),
        SqlValue::Int(i) => Value::Integer(i64::from(*i)),
        SqlValue::Long(i) => Value::Integer(*i),
        SqlValue::Float(f) => Value::Real(f64::from(*f)),
        SqlValue::Double(f) => Value::Real(*f),
        SqlValue::Decimal(d) => Value::Text(d.to_string()),
        SqlValue::Numeric(n) => Value::Text(numeric_text(n)),
        SqlValue::Text(s) => Value::Text(s.clone()),
        SqlValue::Bytes(b) => Value::Blob(b.clone()),
        SqlValue::Uuid(u) => Value::Text(u.hyphenated().to_string()),
        SqlValue::Date(d) => Value::Text(d.format(DATE_FORMAT).to_string()),
        SqlValue::Time(t) => Value::Text(t.format(TIME_FORMAT).to_string()),
        SqlValue::DateTime(dt) => Value::Text(dt.format(DATETIME_FORMAT).to_string()),
        SqlValue::Timestamp(ts) => Value::Text(ts.format(ZONED_FORMAT).to_string()),
        SqlValue::ZonedDateTime(zdt) => Value::Text(zdt.format(ZONED_FORMAT).to_string()),
        SqlValue::Json(json) => Value::Text(json.to_string()),
    }
}

fn numeric_text(n: &DecimalNumber) -> String {
    match n {
        DecimalNumber::NaN => "NaN".into(),
        DecimalNumber::PosInfinity => "Infinity".into(),
        DecimalNumber::NegInfinity => "-Infinity".into(),
        DecimalNumber::Finite(d) => d.to_string(),
    }
}

/// Convert bound parameters to the positional values rusqlite binds.
#[must_use]
pub fn convert_params(params: &[SqlParam]) -> Vec<Value> {
    params
        .iter()
        .map(|param| param.value().map_or(Value::Null, to_sqlite_value))
        .collect()
}

/// Rejects values SQLite would silently store as something else.
///
/// A NaN real is stored as NULL, so binding one is refused up front.
#[derive(Debug, Default, Clone, Copy)]
pub struct SqliteParamChecker;

impl ParamChecker for SqliteParamChecker {
    fn check(&self, name: &str, param: &SqlParam) -> Result<(), SqlSessionError> {
        let nan = match param.value() {
            Some(SqlValue::Double(v)) => v.is_nan(),
            Some(SqlValue::Float(v)) => v.is_nan(),
            _ => false,
        };
        if nan {
            return Err(SqlSessionError::NoSuitableConverter {
                param: name.to_string(),
                value: "NaN".into(),
            });
        }
        Ok(())
    }
}
