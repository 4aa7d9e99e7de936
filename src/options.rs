use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::SqlSessionError;

/// Which kind of generated-key selection a [`KeyColumns`] holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum KeyColumnsKind {
    All,
    None,
    Columns,
}

/// Generated key columns a statement should return: none, all, or a named subset.
///
/// ```rust
/// use sql_session::KeyColumns;
///
/// let keys = KeyColumns::columns(["a", "b"]);
/// assert_eq!(keys.get_columns().unwrap(), ["a", "b"]);
/// assert!(KeyColumns::ALL.get_columns().is_err());
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum KeyColumns {
    All,
    None,
    Columns(Vec<String>),
}

impl KeyColumns {
    pub const ALL: KeyColumns = KeyColumns::All;
    pub const NONE: KeyColumns = KeyColumns::None;

    /// Select an explicit set of generated key columns.
    #[must_use]
    pub fn columns<I, S>(columns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        KeyColumns::Columns(columns.into_iter().map(Into::into).collect())
    }

    #[must_use]
    pub fn kind(&self) -> KeyColumnsKind {
        match self {
            KeyColumns::All => KeyColumnsKind::All,
            KeyColumns::None => KeyColumnsKind::None,
            KeyColumns::Columns(_) => KeyColumnsKind::Columns,
        }
    }

    /// The named columns.
    ///
    /// # Errors
    /// Returns [`SqlSessionError::ValueAbsent`] unless this is the `Columns` variant.
    pub fn get_columns(&self) -> Result<&[String], SqlSessionError> {
        match self {
            KeyColumns::Columns(columns) => Ok(columns),
            KeyColumns::All => Err(SqlSessionError::ValueAbsent(
                "KeyColumns value is ALL".into(),
            )),
            KeyColumns::None => Err(SqlSessionError::ValueAbsent(
                "KeyColumns value is NONE".into(),
            )),
        }
    }
}

impl fmt::Display for KeyColumns {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KeyColumns::All => f.write_str("KeyColumns(ALL)"),
            KeyColumns::None => f.write_str("KeyColumns(NONE)"),
            KeyColumns::Columns(columns) => write!(f, "KeyColumns(columns={columns:?})"),
        }
    }
}

/// Options attached to a statement template.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StatementOptions {
    pub generated_key_cols: KeyColumns,
}

impl StatementOptions {
    pub const DEFAULT: StatementOptions = StatementOptions {
        generated_key_cols: KeyColumns::None,
    };

    pub const RETURN_GEN_KEYS: StatementOptions = StatementOptions {
        generated_key_cols: KeyColumns::All,
    };

    #[must_use]
    pub fn of(generated_key_cols: KeyColumns) -> Self {
        Self { generated_key_cols }
    }
}

impl Default for StatementOptions {
    fn default() -> Self {
        StatementOptions::DEFAULT
    }
}
