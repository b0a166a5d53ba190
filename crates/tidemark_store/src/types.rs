//! Record type and system column names.

use crate::error::{StoreError, StoreResult};
use serde_json::Value;

/// A table record: a flat JSON object keyed by column name.
///
/// Records are schemaless at the API boundary; the store validates and
/// normalizes them against the owning table's [`crate::TableSchema`] on
/// every write.
pub type Record = serde_json::Map<String, Value>;

/// Well-known system column names.
pub mod sys {
    /// The record id column. Always a string.
    pub const ID: &str = "id";
    /// The optimistic-concurrency version column.
    pub const VERSION: &str = "version";
    /// The server-maintained last-modified timestamp column.
    pub const UPDATED_AT: &str = "updatedAt";
    /// The server-side soft-delete marker column.
    pub const DELETED: &str = "deleted";
}

/// Maximum accepted id length, in bytes.
pub const MAX_ID_LENGTH: usize = 255;

/// Returns the record's id, if present and a string.
pub fn record_id(record: &Record) -> Option<&str> {
    record.get(sys::ID).and_then(Value::as_str)
}

/// Validates a record id value.
///
/// Ids must be non-empty strings of at most [`MAX_ID_LENGTH`] bytes with no
/// control characters.
pub fn validate_id(value: &Value) -> StoreResult<&str> {
    let id = value.as_str().ok_or_else(|| StoreError::InvalidId {
        reason: format!("expected a string, got {value}"),
    })?;

    if id.is_empty() {
        return Err(StoreError::InvalidId {
            reason: "id is empty".into(),
        });
    }

    if id.len() > MAX_ID_LENGTH {
        return Err(StoreError::InvalidId {
            reason: format!("id exceeds {MAX_ID_LENGTH} bytes"),
        });
    }

    if id.chars().any(char::is_control) {
        return Err(StoreError::InvalidId {
            reason: "id contains control characters".into(),
        });
    }

    Ok(id)
}
