use std::fmt;

use chrono::{DateTime, FixedOffset, NaiveDate, NaiveDateTime, NaiveTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use uuid::Uuid;

use crate::decimal::DecimalNumber;

/// Values exchanged with a driver: bound as parameters and read back from rows.
///
/// ```rust
/// use sql_session::SqlValue;
///
/// let values = vec![
///     SqlValue::Long(1),
///     SqlValue::Text("alice".into()),
///     SqlValue::Bool(true),
///     SqlValue::Null,
/// ];
/// assert!(values[3].is_null());
/// ```
#[derive(Debug, Clone, PartialEq)]
pub enum SqlValue {
    /// SQL NULL
    Null,
    Bool(bool),
    Char(char),
    Short(i16),
    Int(i32),
    Long(i64),
    Float(f32),
    Double(f64),
    /// Arbitrary-precision decimal (finite only)
    Decimal(Decimal),
    /// Decimal that may also be NaN or an infinity
    Numeric(DecimalNumber),
    Text(String),
    Bytes(Vec<u8>),
    Uuid(Uuid),
    Date(NaiveDate),
    Time(NaiveTime),
    /// Local date-time without zone information
    DateTime(NaiveDateTime),
    /// An instant on the UTC time-line
    Timestamp(DateTime<Utc>),
    /// Date-time carrying its own offset
    ZonedDateTime(DateTime<FixedOffset>),
    Json(JsonValue),
}

impl SqlValue {
    #[must_use]
    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    /// Declared type of this value, `None` for NULL.
    #[must_use]
    pub fn sql_type(&self) -> Option<SqlType> {
        let ty = match self {
            SqlValue::Null => return None,
            SqlValue::Bool(_) => SqlType::Bool,
            SqlValue::Char(_) => SqlType::Char,
            SqlValue::Short(_) => SqlType::Short,
            SqlValue::Int(_) => SqlType::Int,
            SqlValue::Long(_) => SqlType::Long,
            SqlValue::Float(_) => SqlType::Float,
            SqlValue::Double(_) => SqlType::Double,
            SqlValue::Decimal(_) => SqlType::Decimal,
            SqlValue::Numeric(_) => SqlType::Numeric,
            SqlValue::Text(_) => SqlType::Text,
            SqlValue::Bytes(_) => SqlType::Bytes,
            SqlValue::Uuid(_) => SqlType::Uuid,
            SqlValue::Date(_) => SqlType::Date,
            SqlValue::Time(_) => SqlType::Time,
            SqlValue::DateTime(_) => SqlType::DateTime,
            SqlValue::Timestamp(_) => SqlType::Timestamp,
            SqlValue::ZonedDateTime(_) => SqlType::ZonedDateTime,
            SqlValue::Json(_) => SqlType::Json,
        };
        Some(ty)
    }

    #[must_use]
    pub fn as_text(&self) -> Option<&str> {
        if let SqlValue::Text(value) = self {
            Some(value)
        } else {
            None
        }
    }
}

impl fmt::Display for SqlValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SqlValue::Null => f.write_str("NULL"),
            SqlValue::Bool(v) => write!(f, "{v}"),
            SqlValue::Char(v) => write!(f, "{v}"),
            SqlValue::Short(v) => write!(f, "{v}"),
            SqlValue::Int(v) => write!(f, "{v}"),
            SqlValue::Long(v) => write!(f, "{v}"),
            SqlValue::Float(v) => write!(f, "{v}"),
            SqlValue::Double(v) => write!(f, "{v}"),
            SqlValue::Decimal(v) => write!(f, "{v}"),
            SqlValue::Numeric(v) => write!(f, "{v}"),
            SqlValue::Text(v) => f.write_str(v),
            SqlValue::Bytes(v) => write!(f, "<{} bytes>", v.len()),
            SqlValue::Uuid(v) => write!(f, "{v}"),
            SqlValue::Date(v) => write!(f, "{v}"),
            SqlValue::Time(v) => write!(f, "{v}"),
            SqlValue::DateTime(v) => write!(f, "{v}"),
            SqlValue::Timestamp(v) => write!(f, "{}", v.to_rfc3339()),
            SqlValue::ZonedDateTime(v) => write!(f, "{}", v.to_rfc3339()),
            SqlValue::Json(v) => write!(f, "{v}"),
        }
    }
}

/// Declared type of a parameter or column value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SqlType {
    Bool,
    Char,
    Short,
    Int,
    Long,
    Float,
    Double,
    Decimal,
    Numeric,
    Text,
    Bytes,
    Uuid,
    Date,
    Time,
    DateTime,
    Timestamp,
    ZonedDateTime,
    Json,
}

/// A statement argument: a declared type plus an optional value.
///
/// A missing value is a SQL NULL typed as the declared type. It still counts as a binding for
/// the parameter it is attached to.
///
/// ```rust
/// use sql_session::{SqlParam, SqlType, SqlValue};
///
/// let age: Option<i32> = None;
/// let param = SqlParam::from(age);
/// assert_eq!(param.sql_type(), SqlType::Int);
/// assert!(param.is_null());
///
/// let name = SqlParam::from("alice");
/// assert_eq!(name.value(), Some(&SqlValue::Text("alice".into())));
/// ```
#[derive(Debug, Clone, PartialEq)]
pub struct SqlParam {
    sql_type: SqlType,
    value: Option<SqlValue>,
}

impl SqlParam {
    /// A typed SQL NULL.
    #[must_use]
    pub fn null(sql_type: SqlType) -> Self {
        Self {
            sql_type,
            value: None,
        }
    }

    /// Wrap a value; `SqlValue::Null` becomes a NULL typed as text.
    #[must_use]
    pub fn of(value: SqlValue) -> Self {
        match value.sql_type() {
            Some(sql_type) => Self {
                sql_type,
                value: Some(value),
            },
            None => Self::null(SqlType::Text),
        }
    }

    #[must_use]
    pub fn sql_type(&self) -> SqlType {
        self.sql_type
    }

    #[must_use]
    pub fn value(&self) -> Option<&SqlValue> {
        self.value.as_ref()
    }

    #[must_use]
    pub fn is_null(&self) -> bool {
        self.value.is_none()
    }

    /// The value to hand to a driver, `SqlValue::Null` for typed NULLs.
    #[must_use]
    pub fn to_value(&self) -> SqlValue {
        self.value.clone().unwrap_or(SqlValue::Null)
    }
}

impl From<SqlValue> for SqlParam {
    fn from(value: SqlValue) -> Self {
        SqlParam::of(value)
    }
}

macro_rules! impl_param_from {
    ($($rust:ty => $variant:ident),* $(,)?) => {
        $(
            impl From<$rust> for SqlValue {
                fn from(value: $rust) -> Self {
                    SqlValue::$variant(value.into())
                }
            }

            impl From<$rust> for SqlParam {
                fn from(value: $rust) -> Self {
                    SqlParam {
                        sql_type: SqlType::$variant,
                        value: Some(SqlValue::$variant(value.into())),
                    }
                }
            }

            impl From<Option<$rust>> for SqlParam {
                fn from(value: Option<$rust>) -> Self {
                    match value {
                        Some(v) => SqlParam::from(v),
                        None => SqlParam::null(SqlType::$variant),
                    }
                }
            }
        )*
    };
}

impl_param_from! {
    bool => Bool,
    char => Char,
    i16 => Short,
    i32 => Int,
    i64 => Long,
    f32 => Float,
    f64 => Double,
    Decimal => Decimal,
    DecimalNumber => Numeric,
    String => Text,
    &str => Text,
    Vec<u8> => Bytes,
    Uuid => Uuid,
    NaiveDate => Date,
    NaiveTime => Time,
    NaiveDateTime => DateTime,
    DateTime<Utc> => Timestamp,
    DateTime<FixedOffset> => ZonedDateTime,
    JsonValue => Json,
}
