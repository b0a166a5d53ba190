//! The local store contract.

use crate::error::StoreResult;
use crate::query::Query;
use crate::schema::TableSchema;
use crate::types::Record;
use async_trait::async_trait;

/// One operation inside an atomic batch.
#[derive(Debug, Clone)]
pub enum BatchOp {
    /// Insert or merge a row.
    Upsert {
        /// Target table.
        table: String,
        /// The row to upsert.
        row: Record,
    },
    /// Remove a row by id.
    Delete {
        /// Target table.
        table: String,
        /// Id of the row to remove.
        id: String,
    },
}

impl BatchOp {
    /// Convenience constructor for an upsert operation.
    pub fn upsert(table: impl Into<String>, row: Record) -> Self {
        BatchOp::Upsert {
            table: table.into(),
            row,
        }
    }

    /// Convenience constructor for a delete operation.
    pub fn delete(table: impl Into<String>, id: impl Into<String>) -> Self {
        BatchOp::Delete {
            table: table.into(),
            id: id.into(),
        }
    }
}

/// A table-oriented persistent store with atomic multi-statement batches.
///
/// The sync engine consumes this contract; it never assumes anything about
/// the on-disk format. Table and column name matching is case-insensitive.
///
/// # Invariants
///
/// - `execute_batch` is all-or-nothing: either every operation in the batch
///   is applied or none is.
/// - `upsert` merges into an existing row: columns absent from the new
///   record keep their stored values.
/// - Reads materialize every declared column, substituting `null` for
///   columns a row does not carry.
///
/// # Implementors
///
/// - [`crate::MemoryStore`] - the in-memory reference implementation
#[async_trait]
pub trait LocalStore: Send + Sync {
    /// Defines (or redefines) a table.
    ///
    /// Redefining an existing table replaces its schema and keeps its rows.
    async fn define_table(&self, schema: TableSchema) -> StoreResult<()>;

    /// Inserts or merges the given rows. Each row must carry a valid id.
    async fn upsert(&self, table: &str, rows: Vec<Record>) -> StoreResult<()>;

    /// Looks up a row by id. Returns `None` if the row does not exist.
    async fn lookup(&self, table: &str, id: &str) -> StoreResult<Option<Record>>;

    /// Reads the rows matching a query.
    async fn read(&self, query: &Query) -> StoreResult<Vec<Record>>;

    /// Removes rows by id. Ids without a matching row are ignored.
    async fn delete(&self, table: &str, ids: &[String]) -> StoreResult<()>;

    /// Removes every row matching a query. Returns the number of rows
    /// removed.
    async fn delete_matching(&self, query: &Query) -> StoreResult<u64>;

    /// Applies a batch of operations atomically.
    async fn execute_batch(&self, ops: Vec<BatchOp>) -> StoreResult<()>;
}
