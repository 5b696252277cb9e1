//! Postgres row operation.
//!
//! - [`Row`]
//! - [`RowBatch`]
//! - [`QueryResult`]
//! - [`Index`]
use std::{fmt, sync::Arc};

use crate::{
    postgres::backend::DataRow,
    simple::CommandStatus,
    statement::Column,
    types::{DecodeError, TypeRegistry},
    value::{FromValue, Value},
    Result,
};

/// Postgres row.
///
/// Rows of one result share their column descriptors.
#[derive(Clone, PartialEq)]
pub struct Row {
    columns: Arc<[Column]>,
    values: Vec<Value>,
}

impl Row {
    /// Decode `DataRow` with `columns` using the connection registry.
    pub(crate) fn decode(
        columns: &Arc<[Column]>,
        datarow: DataRow,
        registry: &TypeRegistry,
    ) -> Result<Row> {
        let raw = datarow.into_values()?;
        if raw.len() != columns.len() {
            return Err(DecodeError::IndexOutOfBounds(raw.len()).into());
        }
        let mut values = Vec::with_capacity(raw.len());
        for (column, raw) in columns.iter().zip(raw) {
            values.push(registry.decode(column.type_oid(), column.format(), raw.as_deref())?);
        }
        Ok(Row { columns: columns.clone(), values })
    }

    /// Construct row from values, mostly used in tests.
    pub fn new(columns: Arc<[Column]>, values: Vec<Value>) -> Row {
        Row { columns, values }
    }

    /// Returns `true` if row contains no columns.
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Returns the number of fields/column.
    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn columns(&self) -> &[Column] {
        &self.columns
    }

    pub fn values(&self) -> &[Value] {
        &self.values
    }

    pub fn into_values(self) -> Vec<Value> {
        self.values
    }

    /// Get column value by position or name.
    pub fn get_value<I: Index>(&self, idx: I) -> Result<&Value, DecodeError> {
        let nth = idx.position(&self.columns)?;
        self.values.get(nth).ok_or(DecodeError::IndexOutOfBounds(nth))
    }

    /// Try get and convert column.
    pub fn try_get<I: Index, R: FromValue>(&self, idx: I) -> Result<R, DecodeError> {
        R::from_value(self.get_value(idx)?.clone())
    }
}

impl fmt::Debug for Row {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut dbg = f.debug_map();
        for (column, value) in self.columns.iter().zip(&self.values) {
            dbg.entry(&column.name(), value);
        }
        dbg.finish()
    }
}

/// Type that can be used for indexing column.
pub trait Index: Sized + sealed::Sealed {
    /// Returns the column position.
    fn position(self, columns: &[Column]) -> Result<usize, DecodeError>;
}

impl Index for usize {
    fn position(self, columns: &[Column]) -> Result<usize, DecodeError> {
        match self < columns.len() {
            true => Ok(self),
            false => Err(DecodeError::IndexOutOfBounds(self)),
        }
    }
}

impl Index for &str {
    fn position(self, columns: &[Column]) -> Result<usize, DecodeError> {
        columns
            .iter()
            .position(|column| column.name() == self)
            .ok_or_else(|| DecodeError::ColumnNotFound(String::from(self).into()))
    }
}

mod sealed {
    pub trait Sealed { }
    impl Sealed for usize { }
    impl Sealed for &str { }
}

/// Rows returned by one Execute.
#[derive(Debug, Clone, PartialEq)]
pub struct RowBatch {
    pub rows: Vec<Row>,
    /// Completion tag, [`None`] for an empty query or a suspended portal.
    pub status: Option<CommandStatus>,
    /// `true` if Execute row limit was reached before the portal completed.
    pub suspended: bool,
}

impl RowBatch {
    /// Number of rows affected, as reported by the completion tag.
    pub fn rows_affected(&self) -> u64 {
        self.status.as_ref().map_or(0, CommandStatus::rows)
    }
}

/// Result of a complete query: columns, rows and completion status.
#[derive(Debug, Clone, PartialEq)]
pub struct QueryResult {
    pub columns: Arc<[Column]>,
    pub rows: Vec<Row>,
    pub status: Option<CommandStatus>,
}

impl QueryResult {
    pub(crate) fn new(columns: Arc<[Column]>, batch: RowBatch) -> Self {
        Self { columns, rows: batch.rows, status: batch.status }
    }

    pub fn rows_affected(&self) -> u64 {
        self.status.as_ref().map_or(0, CommandStatus::rows)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::postgres::oid;

    #[test]
    fn index_by_name_and_position() {
        let columns: Arc<[Column]> = vec![Column::new("id", oid::INT4), Column::new("name", oid::TEXT)].into();
        let row = Row::new(columns, vec![Value::Int4(7), Value::Null]);

        assert_eq!(row.try_get::<_, i32>(0).unwrap(), 7);
        assert_eq!(row.try_get::<_, i64>("id").unwrap(), 7);
        assert_eq!(row.try_get::<_, Option<String>>("name").unwrap(), None);
        assert!(matches!(row.try_get::<_, i32>("missing"), Err(DecodeError::ColumnNotFound(_))));
        assert!(matches!(row.try_get::<_, i32>(2), Err(DecodeError::IndexOutOfBounds(2))));
    }
}
