//! Error types for the sync engine.

use crate::remote::RemoteError;
use thiserror::Error;
use tidemark_store::StoreError;

/// Result type for sync operations.
pub type SyncResult<T> = Result<T, SyncError>;

/// Errors that can occur during sync operations.
#[derive(Debug, Error)]
pub enum SyncError {
    /// The sync context is being used before `initialize()` completed.
    #[error("sync context is not initialized")]
    NotInitialized,

    /// An empty table name was supplied.
    #[error("table name is empty")]
    EmptyTableName,

    /// The operation targets one of the engine's reserved system tables.
    #[error("table name {table} is reserved")]
    ReservedTable {
        /// The rejected table name.
        table: String,
    },

    /// The record does not carry the id the operation requires.
    #[error("record for table {table} has no id")]
    MissingId {
        /// The target table.
        table: String,
    },

    /// The pull page size is not a positive integer.
    #[error("page size must be a positive integer, got {value}")]
    InvalidPageSize {
        /// The rejected page size.
        value: i64,
    },

    /// The pull query carries clauses the pull pager owns.
    #[error("unsupported pull query: {reason}")]
    UnsupportedPullQuery {
        /// Which clause was rejected.
        reason: String,
    },

    /// The item already exists locally or has a pending insert or update.
    #[error("item {item_id} already exists in table {table}")]
    DuplicateItem {
        /// The target table.
        table: String,
        /// The offending item id.
        item_id: String,
    },

    /// The item cannot be updated because a delete is pending for it.
    #[error("item {item_id} in table {table} has a pending delete")]
    MissingItem {
        /// The target table.
        table: String,
        /// The offending item id.
        item_id: String,
    },

    /// The requested item does not exist in the local store.
    #[error("item {item_id} not found in table {table}")]
    ItemNotFound {
        /// The target table.
        table: String,
        /// The missing item id.
        item_id: String,
    },

    /// Purge was refused because unpushed operations exist for the table.
    #[error("table {table} has pending operations; push them or force the purge")]
    PendingChangesExist {
        /// The table under purge.
        table: String,
    },

    /// A persisted operation-log row could not be interpreted.
    #[error("invalid operation log entry: {message}")]
    InvalidLogEntry {
        /// What was wrong with the row.
        message: String,
    },

    /// An action tag outside insert/update/delete reached the engine.
    #[error("unknown action: {action}")]
    UnknownAction {
        /// The rejected tag.
        action: String,
    },

    /// A pulled record was unusable (missing id or modification time).
    #[error("invalid pulled record for table {table}: {reason}")]
    InvalidPulledRecord {
        /// The table being pulled.
        table: String,
        /// Why the record was rejected.
        reason: String,
    },

    /// Local store failure.
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    /// Remote table service failure.
    #[error("remote error: {0}")]
    Remote(#[from] RemoteError),

    /// Push could not make progress on any operation.
    #[error("push aborted: no operation could be pushed ({failures} failures)")]
    PushAborted {
        /// Number of operations that failed.
        failures: usize,
    },

    /// An internal invariant was violated.
    #[error("internal error: {0}")]
    Internal(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display() {
        let err = SyncError::DuplicateItem {
            table: "todo".into(),
            item_id: "1".into(),
        };
        assert!(err.to_string().contains("todo"));
        assert!(err.to_string().contains('1'));

        let err = SyncError::InvalidPageSize { value: -3 };
        assert!(err.to_string().contains("-3"));
    }
}
