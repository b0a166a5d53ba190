//! Push conflict and error handling.
//!
//! When pushing an operation fails, the engine wraps the failure in a
//! [`PushError`] and hands it to the registered [`PushPolicy`]. The policy
//! answers with a [`Resolution`] describing what to do with the pending
//! operation; the engine performs all the bookkeeping. A policy that
//! answers [`Resolution::Unresolved`] (or returns an unusable resolution)
//! leaves the failure in the list returned by `push()`.

use crate::operations::{Action, OpMetadata};
use crate::remote::RemoteError;
use async_trait::async_trait;
use tidemark_store::Record;

/// A conflict or error encountered while pushing one operation.
///
/// The value is ephemeral: it exists for the duration of one failed push
/// attempt and the policy invocation, and is reported back from `push()`
/// when it stays unresolved. Accessors return deep copies, so mutating a
/// returned value never affects later calls.
#[derive(Debug, Clone)]
pub struct PushError {
    table_name: String,
    item_id: String,
    action: Action,
    client_record: Option<Record>,
    server_record: Option<Record>,
    error: RemoteError,
}

impl PushError {
    pub(crate) fn new(
        table_name: String,
        item_id: String,
        action: Action,
        client_record: Option<Record>,
        error: RemoteError,
    ) -> Self {
        let server_record = error.server_record().cloned();
        Self {
            table_name,
            item_id,
            action,
            client_record,
            server_record,
            error,
        }
    }

    /// The table the failing operation targets.
    pub fn table_name(&self) -> String {
        self.table_name.clone()
    }

    /// The failing item's id.
    pub fn item_id(&self) -> String {
        self.item_id.clone()
    }

    /// The action that was being pushed.
    pub fn action(&self) -> Action {
        self.action
    }

    /// The record that was pushed, as it was sent. `None` for deletes.
    ///
    /// This may lag the local table if the row changed after the push
    /// started.
    pub fn client_record(&self) -> Option<Record> {
        self.client_record.clone()
    }

    /// The server's copy of the record, when the server returned one.
    ///
    /// Servers do not always return it; in particular a duplicate-insert
    /// rejection may carry no body.
    pub fn server_record(&self) -> Option<Record> {
        self.server_record.clone()
    }

    /// The underlying remote failure.
    pub fn error(&self) -> RemoteError {
        self.error.clone()
    }

    /// True if the server detected a version or uniqueness conflict, as
    /// opposed to a transport-level failure.
    pub fn is_conflict(&self) -> bool {
        self.error.is_conflict()
    }
}

/// A policy's answer to a push failure.
///
/// The variants that keep the operation pending (`Retry`,
/// `UpdateAndRetry`, `ChangeAction`) cause the same item to be pushed
/// again, subject to the per-item retry ceiling. The `Cancel*` variants
/// remove the pending operation so it is never pushed.
#[derive(Debug, Clone)]
pub enum Resolution {
    /// Push the same operation again, unchanged.
    Retry,
    /// Replace the pushed record (and its version metadata) and retry.
    /// The record's id, if present, must match the failing item.
    UpdateAndRetry(Record),
    /// Switch the pending operation's action, optionally replacing the
    /// record, and retry. Switching away from a delete requires a record.
    ChangeAction {
        /// The new action to push.
        action: Action,
        /// Replacement record, merged into the local row.
        record: Option<Record>,
    },
    /// Remove the pending operation and overwrite the local row.
    CancelAndUpdate(Record),
    /// Remove the pending operation and delete the local row.
    CancelAndDiscard,
    /// Remove the pending operation; leave the local row untouched. Later
    /// changes to the same item sync normally.
    Cancel,
    /// Leave the failure unresolved; it is reported in the push result and
    /// the push moves on to the next item.
    Unresolved,
}

/// User-supplied conflict and error handling for push.
///
/// Both hooks default to [`Resolution::Unresolved`]. The engine awaits the
/// policy before deciding whether to retry the same item, so policies may
/// perform their own I/O (for example, fetching fresher data) before
/// answering.
#[async_trait]
pub trait PushPolicy: Send + Sync {
    /// Called when the server detects a version or uniqueness conflict.
    async fn on_conflict(&self, conflict: &PushError) -> Resolution {
        let _ = conflict;
        Resolution::Unresolved
    }

    /// Called for non-conflict push failures (network, HTTP errors).
    async fn on_error(&self, error: &PushError) -> Resolution {
        let _ = error;
        Resolution::Unresolved
    }
}

pub(crate) fn meta_from_record(record: Option<&Record>) -> OpMetadata {
    OpMetadata {
        version: record.and_then(|r| r.get(tidemark_store::sys::VERSION).cloned()),
    }
}
