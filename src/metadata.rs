use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::types::SqlType;

/// Describes one column of a result.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnMetadata {
    pub name: String,
    /// Vendor-specific type identifier, e.g. the declared column type.
    pub db_type_id: String,
    /// Value type the driver decodes this column into, when known.
    pub value_type: Option<SqlType>,
}

impl ColumnMetadata {
    #[must_use]
    pub fn new(name: impl Into<String>, db_type_id: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            db_type_id: db_type_id.into(),
            value_type: None,
        }
    }

    #[must_use]
    pub fn with_value_type(mut self, value_type: Option<SqlType>) -> Self {
        self.value_type = value_type;
        self
    }
}

/// Ordered column descriptors shared by every row of one result.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RowMetadata {
    columns: Vec<ColumnMetadata>,
    #[serde(skip)]
    index: HashMap<String, usize>,
}

impl RowMetadata {
    #[must_use]
    pub fn new(columns: Vec<ColumnMetadata>) -> Self {
        // First occurrence wins for duplicated names, matching positional lookup order.
        let mut index = HashMap::with_capacity(columns.len());
        for (i, col) in columns.iter().enumerate() {
            index.entry(col.name.clone()).or_insert(i);
        }
        Self { columns, index }
    }

    #[must_use]
    pub fn columns(&self) -> &[ColumnMetadata] {
        &self.columns
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.columns.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }

    #[must_use]
    pub fn column_names(&self) -> Vec<&str> {
        self.columns.iter().map(|c| c.name.as_str()).collect()
    }

    /// Index of the column with the given name.
    #[must_use]
    pub fn index_of(&self, name: &str) -> Option<usize> {
        if let Some(&idx) = self.index.get(name) {
            return Some(idx);
        }
        // Deserialized metadata has no cache.
        self.columns.iter().position(|col| col.name == name)
    }
}

impl PartialEq for RowMetadata {
    fn eq(&self, other: &Self) -> bool {
        self.columns == other.columns
    }
}

/// Non-fatal notice reported by the engine alongside a result.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Warning {
    pub msg: String,
    pub code: String,
}

impl Warning {
    #[must_use]
    pub fn new(msg: impl Into<String>, code: impl Into<String>) -> Self {
        Self {
            msg: msg.into(),
            code: code.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn index_lookup_prefers_first_duplicate() {
        let meta = RowMetadata::new(vec![
            ColumnMetadata::new("id", "INTEGER"),
            ColumnMetadata::new("name", "TEXT"),
            ColumnMetadata::new("id", "INTEGER"),
        ]);
        assert_eq!(meta.index_of("id"), Some(0));
        assert_eq!(meta.index_of("name"), Some(1));
        assert_eq!(meta.index_of("missing"), None);
        assert_eq!(meta.column_names(), ["id", "name", "id"]);
    }
}
