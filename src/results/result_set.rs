use std::sync::Arc;

use crate::metadata::{RowMetadata, Warning};

use super::row::Row;

/// Fully materialized result of a statement.
///
/// All rows are held in memory, so large results cost proportional memory; stream them with
/// [`ExecutableStatement::stream`](crate::ExecutableStatement::stream) instead.
#[derive(Debug, Clone, PartialEq)]
pub struct ResultSet {
    rows_affected: u64,
    warnings: Vec<Warning>,
    metadata: Arc<RowMetadata>,
    rows: Vec<Row>,
}

impl ResultSet {
    #[must_use]
    pub fn new(
        rows_affected: u64,
        warnings: Vec<Warning>,
        metadata: Arc<RowMetadata>,
        rows: Vec<Row>,
    ) -> Self {
        Self {
            rows_affected,
            warnings,
            metadata,
            rows,
        }
    }

    #[must_use]
    pub fn rows_affected(&self) -> u64 {
        self.rows_affected
    }

    #[must_use]
    pub fn warnings(&self) -> &[Warning] {
        &self.warnings
    }

    #[must_use]
    pub fn metadata(&self) -> &Arc<RowMetadata> {
        &self.metadata
    }

    #[must_use]
    pub fn rows(&self) -> &[Row] {
        &self.rows
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Row> {
        self.rows.iter()
    }

    #[must_use]
    pub fn into_rows(self) -> Vec<Row> {
        self.rows
    }
}

impl<'a> IntoIterator for &'a ResultSet {
    type Item = &'a Row;
    type IntoIter = std::slice::Iter<'a, Row>;

    fn into_iter(self) -> Self::IntoIter {
        self.rows.iter()
    }
}

impl IntoIterator for ResultSet {
    type Item = Row;
    type IntoIter = std::vec::IntoIter<Row>;

    fn into_iter(self) -> Self::IntoIter {
        self.rows.into_iter()
    }
}
