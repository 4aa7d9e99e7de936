use std::sync::Arc;

use chrono::{DateTime, FixedOffset, NaiveDate, NaiveDateTime, NaiveTime, TimeZone, Utc};
use rust_decimal::Decimal;
use uuid::Uuid;

use crate::conversion::{FromSqlValue, instant_in};
use crate::decimal::DecimalNumber;
use crate::error::SqlSessionError;
use crate::metadata::RowMetadata;
use crate::types::SqlValue;

/// Column reference accepted by row accessors: a 0-based index or a column name.
pub trait ColumnIndex {
    /// Resolve to a position within `row`.
    ///
    /// # Errors
    /// Returns [`SqlSessionError::ColumnIndexOutOfBounds`] or [`SqlSessionError::MissingColumn`].
    fn column_index(&self, row: &Row) -> Result<usize, SqlSessionError>;
}

impl ColumnIndex for usize {
    fn column_index(&self, row: &Row) -> Result<usize, SqlSessionError> {
        if *self < row.values.len() {
            Ok(*self)
        } else {
            Err(SqlSessionError::ColumnIndexOutOfBounds {
                idx: *self,
                column_count: row.values.len(),
            })
        }
    }
}

impl ColumnIndex for &str {
    fn column_index(&self, row: &Row) -> Result<usize, SqlSessionError> {
        row.metadata
            .index_of(self)
            .filter(|idx| *idx < row.values.len())
            .ok_or_else(|| SqlSessionError::MissingColumn((*self).to_string()))
    }
}

impl ColumnIndex for String {
    fn column_index(&self, row: &Row) -> Result<usize, SqlSessionError> {
        self.as_str().column_index(row)
    }
}

impl ColumnIndex for &String {
    fn column_index(&self, row: &Row) -> Result<usize, SqlSessionError> {
        self.as_str().column_index(row)
    }
}

/// One tuple of a result.
///
/// Every typed accessor comes in two forms. The required form (`get_int`) fails with
/// [`SqlSessionError::Conversion`] on SQL NULL; the optional form (`get_int_opt`) returns `None`
/// for NULL and never treats it as an error.
///
/// ```rust
/// use std::sync::Arc;
/// use sql_session::{ColumnMetadata, Row, RowMetadata, SqlSessionError, SqlValue};
///
/// let meta = Arc::new(RowMetadata::new(vec![
///     ColumnMetadata::new("name", "TEXT"),
///     ColumnMetadata::new("age", "INTEGER"),
/// ]));
/// let row = Row::new(meta, vec![SqlValue::Text("ada".into()), SqlValue::Null]);
///
/// assert_eq!(row.get_str("name")?, "ada");
/// assert_eq!(row.get_int_opt("age")?, None);
/// assert!(matches!(row.get_int("age"), Err(SqlSessionError::Conversion { .. })));
/// # Ok::<(), SqlSessionError>(())
/// ```
#[derive(Debug, Clone, PartialEq)]
pub struct Row {
    metadata: Arc<RowMetadata>,
    values: Vec<SqlValue>,
}

macro_rules! typed_getters {
    ($($(#[$doc:meta])* $get:ident, $get_opt:ident => $ty:ty;)*) => {
        $(
            $(#[$doc])*
            ///
            /// # Errors
            /// Fails on SQL NULL, on an unknown column, or when the value does not convert.
            pub fn $get(&self, col: impl ColumnIndex) -> Result<$ty, SqlSessionError> {
                self.get::<$ty>(col)
            }

            $(#[$doc])*
            ///
            /// # Errors
            /// Fails on an unknown column or when a non-NULL value does not convert.
            pub fn $get_opt(&self, col: impl ColumnIndex) -> Result<Option<$ty>, SqlSessionError> {
                self.get_opt::<$ty>(col)
            }
        )*
    };
}

impl Row {
    #[must_use]
    pub fn new(metadata: Arc<RowMetadata>, values: Vec<SqlValue>) -> Self {
        Self { metadata, values }
    }

    #[must_use]
    pub fn metadata(&self) -> &Arc<RowMetadata> {
        &self.metadata
    }

    #[must_use]
    pub fn values(&self) -> &[SqlValue] {
        &self.values
    }

    #[must_use]
    pub fn into_values(self) -> Vec<SqlValue> {
        self.values
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.values.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Raw value of a column.
    ///
    /// # Errors
    /// Returns [`SqlSessionError::MissingColumn`] or [`SqlSessionError::ColumnIndexOutOfBounds`].
    pub fn value(&self, col: impl ColumnIndex) -> Result<&SqlValue, SqlSessionError> {
        let idx = col.column_index(self)?;
        Ok(&self.values[idx])
    }

    /// # Errors
    /// Returns an error if the column does not exist.
    pub fn is_null(&self, col: impl ColumnIndex) -> Result<bool, SqlSessionError> {
        self.value(col).map(SqlValue::is_null)
    }

    /// Convert a column to any [`FromSqlValue`] type; SQL NULL is an error.
    ///
    /// # Errors
    /// Fails on SQL NULL, on an unknown column, or when the value does not convert.
    pub fn get<T: FromSqlValue>(&self, col: impl ColumnIndex) -> Result<T, SqlSessionError> {
        match self.value(col)? {
            SqlValue::Null => Err(SqlSessionError::conversion(&SqlValue::Null, T::TARGET)),
            value => T::from_sql_value(value),
        }
    }

    /// Convert a column to any [`FromSqlValue`] type; SQL NULL becomes `None`.
    ///
    /// # Errors
    /// Fails on an unknown column or when a non-NULL value does not convert.
    pub fn get_opt<T: FromSqlValue>(
        &self,
        col: impl ColumnIndex,
    ) -> Result<Option<T>, SqlSessionError> {
        match self.value(col)? {
            SqlValue::Null => Ok(None),
            value => T::from_sql_value(value).map(Some),
        }
    }

    typed_getters! {
        /// Text value.
        get_str, get_str_opt => String;
        /// Boolean value; single-character `T`/`Y`/`1` and `F`/`N`/`0`, and numeric `1`/`0` are
        /// accepted too.
        get_bool, get_bool_opt => bool;
        /// Single character.
        get_char, get_char_opt => char;
        get_short, get_short_opt => i16;
        get_int, get_int_opt => i32;
        get_long, get_long_opt => i64;
        /// Finite decimal. Non-finite stored values fail; use [`Row::get_decimal`] for those.
        get_big_decimal, get_big_decimal_opt => Decimal;
        /// Decimal that may be NaN or infinite.
        get_decimal, get_decimal_opt => DecimalNumber;
        get_float, get_float_opt => f32;
        get_double, get_double_opt => f64;
        get_bytes, get_bytes_opt => Vec<u8>;
        get_uuid, get_uuid_opt => Uuid;
        /// Instant; only values that carry an offset convert without an explicit zone.
        get_instant, get_instant_opt => DateTime<Utc>;
        get_local_date_time, get_local_date_time_opt => NaiveDateTime;
        get_local_date, get_local_date_opt => NaiveDate;
        get_local_time, get_local_time_opt => NaiveTime;
        get_zoned_date_time, get_zoned_date_time_opt => DateTime<FixedOffset>;
    }

    /// Instant, interpreting zone-less values in `zone`.
    ///
    /// When the stored value already carries an offset, `zone` is ignored.
    ///
    /// # Errors
    /// Fails on SQL NULL, on an unknown column, or when the value does not convert.
    pub fn get_instant_in<Tz: TimeZone>(
        &self,
        col: impl ColumnIndex,
        zone: &Tz,
    ) -> Result<DateTime<Utc>, SqlSessionError> {
        match self.value(col)? {
            SqlValue::Null => Err(SqlSessionError::conversion(
                &SqlValue::Null,
                DateTime::<Utc>::TARGET,
            )),
            value => instant_in(value, zone),
        }
    }

    /// Optional form of [`Row::get_instant_in`].
    ///
    /// # Errors
    /// Fails on an unknown column or when a non-NULL value does not convert.
    pub fn get_instant_in_opt<Tz: TimeZone>(
        &self,
        col: impl ColumnIndex,
        zone: &Tz,
    ) -> Result<Option<DateTime<Utc>>, SqlSessionError> {
        match self.value(col)? {
            SqlValue::Null => Ok(None),
            value => instant_in(value, zone).map(Some),
        }
    }
}
