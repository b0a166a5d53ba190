//! Error types for local store operations.

use thiserror::Error;

/// Result type for store operations.
pub type StoreResult<T> = Result<T, StoreError>;

/// Errors that can occur during local store operations.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The requested table has not been defined.
    #[error("table not defined: {name}")]
    TableNotDefined {
        /// Name of the table.
        name: String,
    },

    /// A record referenced a column that is not part of the table schema.
    #[error("column {column} is not defined in table {table}")]
    ColumnNotDefined {
        /// Name of the table.
        table: String,
        /// Name of the offending column.
        column: String,
    },

    /// A column value did not match the column's declared type.
    #[error("invalid value for column {column} of type {expected}: {value}")]
    InvalidColumnValue {
        /// Name of the offending column.
        column: String,
        /// The declared column type.
        expected: String,
        /// A rendering of the rejected value.
        value: String,
    },

    /// A record is missing its id, or the id is not usable as a key.
    #[error("invalid record id: {reason}")]
    InvalidId {
        /// Why the id was rejected.
        reason: String,
    },

    /// A table schema was rejected.
    #[error("invalid table definition for {table}: {reason}")]
    InvalidTableDefinition {
        /// Name of the table.
        table: String,
        /// Why the definition was rejected.
        reason: String,
    },

    /// The requested record does not exist.
    #[error("record {id} not found in table {table}")]
    RecordNotFound {
        /// Name of the table.
        table: String,
        /// Id of the missing record.
        id: String,
    },
}
