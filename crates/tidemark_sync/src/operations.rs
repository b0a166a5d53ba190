//! The operation log.
//!
//! Every local mutation is recorded as a [`LogEntry`]: the single pending
//! operation for its (table, item) pair, awaiting push. Sequential local
//! mutations of the same item coalesce into the existing entry by a fixed
//! rule table; an entry that is locked (currently being pushed) never
//! coalesces — a new entry is appended instead, preserving order across the
//! push boundary.
//!
//! Entry ids come from a monotonic sequence persisted alongside the log, and
//! every log mutation is returned to the caller as [`BatchOp`]s so it lands
//! in the same atomic store batch as the data write it describes.

use crate::error::{SyncError, SyncResult};
use parking_lot::Mutex;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{json, Value};
use std::fmt;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use tidemark_store::{
    record_id, sys, BatchOp, ColumnType, Filter, LocalStore, Query, Record, SortDir, TableSchema,
};
use tracing::{debug, warn};

/// Name of the operation log table in the local store.
pub const OPERATIONS_TABLE: &str = "__operations";
/// Name of the incremental-pull watermark table in the local store.
pub const PULLTIME_TABLE: &str = "__pulltime";
/// Name of the sequence-counter table in the local store.
pub const SEQUENCES_TABLE: &str = "__sequences";

const OPERATIONS_SEQUENCE: &str = "operations";

mod col {
    pub const TABLE_NAME: &str = "tableName";
    pub const ITEM_ID: &str = "itemId";
    pub const ACTION: &str = "action";
    pub const METADATA: &str = "metadata";
    pub const VALUE: &str = "value";
}

/// A local mutation kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    /// The item was inserted locally.
    Insert,
    /// The item was updated locally.
    Update,
    /// The item was deleted locally.
    Delete,
}

impl Action {
    /// Renders the action as its wire tag.
    pub fn as_str(&self) -> &'static str {
        match self {
            Action::Insert => "insert",
            Action::Update => "update",
            Action::Delete => "delete",
        }
    }

    /// Parses a wire tag, rejecting anything outside the closed set.
    pub fn parse(tag: &str) -> SyncResult<Self> {
        match tag {
            "insert" => Ok(Action::Insert),
            "update" => Ok(Action::Update),
            "delete" => Ok(Action::Delete),
            other => Err(SyncError::UnknownAction {
                action: other.to_string(),
            }),
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Conflict-detection metadata attached to a log entry.
///
/// The `version` field distinguishes "no version key at all" (`None`) from
/// an explicit `null` version (`Some(Value::Null)`); both shapes round-trip
/// through the stored metadata object.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OpMetadata {
    /// The optimistic-concurrency version to push with, if known.
    #[serde(
        default,
        deserialize_with = "present_as_some",
        skip_serializing_if = "Option::is_none"
    )]
    pub version: Option<Value>,
}

fn present_as_some<'de, D>(deserializer: D) -> Result<Option<Value>, D::Error>
where
    D: Deserializer<'de>,
{
    Value::deserialize(deserializer).map(Some)
}

impl OpMetadata {
    /// The version as a string, when it is one.
    pub fn version_str(&self) -> Option<&str> {
        self.version.as_ref().and_then(Value::as_str)
    }

    fn to_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or_else(|_| json!({}))
    }
}

/// One pending local mutation awaiting push.
#[derive(Debug, Clone, PartialEq)]
pub struct LogEntry {
    /// Monotonic id, assigned at creation and never renumbered.
    pub id: i64,
    /// The table the mutation targets.
    pub table_name: String,
    /// The mutated item's id.
    pub item_id: String,
    /// The pending action.
    pub action: Action,
    /// Conflict-detection metadata.
    pub metadata: OpMetadata,
}

impl LogEntry {
    pub(crate) fn to_row(&self) -> Record {
        let mut row = Record::new();
        row.insert(sys::ID.into(), json!(self.id));
        row.insert(col::TABLE_NAME.into(), json!(self.table_name));
        row.insert(col::ITEM_ID.into(), json!(self.item_id));
        row.insert(col::ACTION.into(), json!(self.action.as_str()));
        row.insert(col::METADATA.into(), self.metadata.to_value());
        row
    }

    pub(crate) fn from_row(row: &Record) -> SyncResult<Self> {
        let id = row
            .get(sys::ID)
            .and_then(Value::as_i64)
            .ok_or_else(|| invalid_entry("missing id"))?;
        let table_name = row
            .get(col::TABLE_NAME)
            .and_then(Value::as_str)
            .ok_or_else(|| invalid_entry("missing tableName"))?
            .to_string();
        let item_id = row
            .get(col::ITEM_ID)
            .and_then(Value::as_str)
            .ok_or_else(|| invalid_entry("missing itemId"))?
            .to_string();
        let action = Action::parse(
            row.get(col::ACTION)
                .and_then(Value::as_str)
                .ok_or_else(|| invalid_entry("missing action"))?,
        )?;
        let metadata = match row.get(col::METADATA) {
            Some(Value::Object(_)) => serde_json::from_value(row[col::METADATA].clone())
                .map_err(|e| invalid_entry(&format!("bad metadata: {e}")))?,
            _ => OpMetadata::default(),
        };

        Ok(Self {
            id,
            table_name,
            item_id,
            action,
            metadata,
        })
    }
}

fn invalid_entry(message: &str) -> SyncError {
    SyncError::InvalidLogEntry {
        message: message.to_string(),
    }
}

/// Which state the version metadata is computed from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum MetaAction {
    /// Take the version the new record specifies, if any.
    Insert,
    /// Prefer the stored row's version; a version on the record overrides.
    Update,
    /// Always take the stored row's version, ignoring the record's.
    Delete,
    /// Like insert: trust the record (used when a push policy replaces the
    /// pushed record).
    Upsert,
}

impl From<Action> for MetaAction {
    fn from(action: Action) -> Self {
        match action {
            Action::Insert => MetaAction::Insert,
            Action::Update => MetaAction::Update,
            Action::Delete => MetaAction::Delete,
        }
    }
}

/// How a new action folds into the pending entry for the same item.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Coalesce {
    /// Append a brand-new entry with a fresh id.
    Append,
    /// Keep the pending entry untouched.
    Retain,
    /// Keep the pending entry's id but switch its action.
    Replace(Action),
    /// Remove the pending entry outright.
    Remove,
}

/// A coalescing-rule violation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum CoalesceError {
    /// Insert over a pending insert or update.
    Duplicate,
    /// Update over a pending delete.
    Missing,
}

/// The coalescing rule table.
///
/// A locked pending entry never coalesces; the new action always appends.
pub(crate) fn coalesce(
    pending: Option<Action>,
    locked: bool,
    new: Action,
) -> Result<Coalesce, CoalesceError> {
    let Some(pending) = pending else {
        return Ok(Coalesce::Append);
    };
    if locked {
        return Ok(Coalesce::Append);
    }

    match (pending, new) {
        (Action::Insert, Action::Update) => Ok(Coalesce::Retain),
        (Action::Insert, Action::Delete) => Ok(Coalesce::Remove),
        (Action::Insert, Action::Insert) => Err(CoalesceError::Duplicate),
        (Action::Update, Action::Update) => Ok(Coalesce::Retain),
        (Action::Update, Action::Delete) => Ok(Coalesce::Replace(Action::Delete)),
        (Action::Update, Action::Insert) => Err(CoalesceError::Duplicate),
        (Action::Delete, Action::Delete) => Ok(Coalesce::Retain),
        (Action::Delete, Action::Insert) => Ok(Coalesce::Append),
        (Action::Delete, Action::Update) => Err(CoalesceError::Missing),
    }
}

/// A pending operation paired with its local data row, as handed to push.
#[derive(Debug, Clone)]
pub(crate) struct PendingOp {
    pub entry: LogEntry,
    /// The local row being pushed. `None` for deletes.
    pub data: Option<Record>,
}

/// The operation log manager.
///
/// Owns the `__operations` table, the persisted id sequence, and the lock
/// protocol. All log mutations are expressed as [`BatchOp`]s so callers can
/// couple them atomically with their data writes.
pub struct OperationLog {
    store: Arc<dyn LocalStore>,
    max_id: AtomicI64,
    locked: Mutex<Option<i64>>,
}

impl OperationLog {
    /// Creates a log manager over the given store. Call
    /// [`OperationLog::initialize`] before anything else.
    pub fn new(store: Arc<dyn LocalStore>) -> Self {
        Self {
            store,
            max_id: AtomicI64::new(0),
            locked: Mutex::new(None),
        }
    }

    /// Defines the engine's system tables and recovers the id sequence.
    pub async fn initialize(&self) -> SyncResult<()> {
        self.store
            .define_table(
                TableSchema::new(OPERATIONS_TABLE)
                    .with_column(sys::ID, ColumnType::Integer)
                    .with_column(col::TABLE_NAME, ColumnType::String)
                    .with_column(col::ITEM_ID, ColumnType::String)
                    .with_column(col::ACTION, ColumnType::String)
                    .with_column(col::METADATA, ColumnType::Object),
            )
            .await?;
        self.store
            .define_table(
                TableSchema::new(PULLTIME_TABLE)
                    .with_column(sys::ID, ColumnType::String)
                    .with_column(col::TABLE_NAME, ColumnType::String)
                    .with_column(col::VALUE, ColumnType::Date),
            )
            .await?;
        self.store
            .define_table(
                TableSchema::new(SEQUENCES_TABLE)
                    .with_column(sys::ID, ColumnType::String)
                    .with_column(col::VALUE, ColumnType::Integer),
            )
            .await?;

        let persisted = self
            .store
            .lookup(SEQUENCES_TABLE, OPERATIONS_SEQUENCE)
            .await?
            .and_then(|row| row.get(col::VALUE).and_then(Value::as_i64))
            .unwrap_or(0);

        // Stores written before the sequence row existed recover the
        // counter from the highest log id.
        let max_logged = self
            .store
            .read(
                &Query::new(OPERATIONS_TABLE)
                    .order_by(sys::ID, SortDir::Desc)
                    .with_take(1),
            )
            .await?
            .first()
            .and_then(|row| row.get(sys::ID).and_then(Value::as_i64))
            .unwrap_or(0);

        self.max_id
            .store(persisted.max(max_logged), Ordering::SeqCst);
        Ok(())
    }

    /// Reads the pending operations for an item, oldest first.
    ///
    /// More than one entry can exist for an item when mutations arrived
    /// while an earlier entry was locked under push.
    pub async fn pending_operations(
        &self,
        table: &str,
        item_id: &str,
    ) -> SyncResult<Vec<LogEntry>> {
        let rows = self
            .store
            .read(
                &Query::new(OPERATIONS_TABLE)
                    .with_filter(Filter::Eq(col::TABLE_NAME.into(), json!(table)))
                    .with_filter(Filter::Eq(col::ITEM_ID.into(), json!(item_id)))
                    .order_by(sys::ID, SortDir::Asc),
            )
            .await?;
        rows.iter().map(LogEntry::from_row).collect()
    }

    /// Reads pending operations for a whole table, oldest first.
    pub async fn pending_for_table(
        &self,
        table: &str,
        take: Option<u64>,
    ) -> SyncResult<Vec<LogEntry>> {
        let mut query = Query::new(OPERATIONS_TABLE)
            .with_filter(Filter::Eq(col::TABLE_NAME.into(), json!(table)))
            .order_by(sys::ID, SortDir::Asc);
        if let Some(take) = take {
            query = query.with_take(take);
        }
        let rows = self.store.read(&query).await?;
        rows.iter().map(LogEntry::from_row).collect()
    }

    /// Computes the log mutations that record `action` on `item`.
    ///
    /// The returned operations must be executed in the same store batch as
    /// the data write they describe. An empty vector means the pending
    /// entry already covers the new action.
    pub async fn logging_ops(
        &self,
        table: &str,
        action: Action,
        item: &Record,
    ) -> SyncResult<Vec<BatchOp>> {
        let item_id = record_id(item).ok_or_else(|| SyncError::MissingId {
            table: table.to_string(),
        })?;

        let pending = self.pending_operations(table, item_id).await?;
        let last = pending.last();
        let locked = last.map(|e| self.is_locked(e.id)).unwrap_or(false);

        let outcome = coalesce(last.map(|e| e.action), locked, action).map_err(|e| match e {
            CoalesceError::Duplicate => SyncError::DuplicateItem {
                table: table.to_string(),
                item_id: item_id.to_string(),
            },
            CoalesceError::Missing => SyncError::MissingItem {
                table: table.to_string(),
                item_id: item_id.to_string(),
            },
        })?;

        match outcome {
            Coalesce::Append => {
                let metadata = self.metadata_for(table, action.into(), item).await?;
                let id = self.max_id.fetch_add(1, Ordering::SeqCst) + 1;
                let entry = LogEntry {
                    id,
                    table_name: table.to_string(),
                    item_id: item_id.to_string(),
                    action,
                    metadata,
                };
                debug!(id, table, item_id, action = %action, "appending operation");
                Ok(vec![
                    BatchOp::upsert(OPERATIONS_TABLE, entry.to_row()),
                    self.sequence_op(id),
                ])
            }
            Coalesce::Retain => Ok(Vec::new()),
            Coalesce::Replace(new_action) => {
                let existing = last.expect("replace requires a pending entry");
                let metadata = self.metadata_for(table, new_action.into(), item).await?;
                debug!(
                    id = existing.id,
                    table,
                    item_id,
                    action = %new_action,
                    "replacing pending operation action"
                );
                let mut row = Record::new();
                row.insert(sys::ID.into(), json!(existing.id));
                row.insert(col::ACTION.into(), json!(new_action.as_str()));
                row.insert(col::METADATA.into(), metadata.to_value());
                Ok(vec![BatchOp::upsert(OPERATIONS_TABLE, row)])
            }
            Coalesce::Remove => {
                let existing = last.expect("remove requires a pending entry");
                debug!(id = existing.id, table, item_id, "cancelling pending insert");
                Ok(vec![BatchOp::delete(OPERATIONS_TABLE, existing.id.to_string())])
            }
        }
    }

    /// Computes the conflict-detection metadata for an operation.
    ///
    /// The version comes from the current local store state, not from the
    /// caller, except where [`MetaAction`] says the record wins.
    pub(crate) async fn metadata_for(
        &self,
        table: &str,
        action: MetaAction,
        item: &Record,
    ) -> SyncResult<OpMetadata> {
        let from_item = || OpMetadata {
            version: item.get(sys::VERSION).cloned(),
        };

        match action {
            MetaAction::Insert | MetaAction::Upsert => Ok(from_item()),
            MetaAction::Update if item.contains_key(sys::VERSION) => Ok(from_item()),
            MetaAction::Update | MetaAction::Delete => {
                let item_id = record_id(item).ok_or_else(|| SyncError::MissingId {
                    table: table.to_string(),
                })?;
                let stored = self.store.lookup(table, item_id).await?;
                Ok(match stored {
                    Some(row) => OpMetadata {
                        version: Some(row.get(sys::VERSION).cloned().unwrap_or(Value::Null)),
                    },
                    None if action == MetaAction::Update => from_item(),
                    None => OpMetadata::default(),
                })
            }
        }
    }

    /// Finds the oldest pending operation with id greater than `after_id`
    /// whose item still has local data.
    ///
    /// Insert and update entries whose data row has vanished are discarded
    /// as orphans; delete entries never need data.
    pub(crate) async fn first_pending_with_data(
        &self,
        after_id: i64,
    ) -> SyncResult<Option<PendingOp>> {
        let mut after = after_id;
        loop {
            let rows = self
                .store
                .read(
                    &Query::new(OPERATIONS_TABLE)
                        .with_filter(Filter::Gt(sys::ID.into(), json!(after)))
                        .order_by(sys::ID, SortDir::Asc)
                        .with_take(1),
                )
                .await?;
            let Some(row) = rows.first() else {
                return Ok(None);
            };
            let entry = LogEntry::from_row(row)?;

            if entry.action == Action::Delete {
                return Ok(Some(PendingOp { entry, data: None }));
            }

            match self.store.lookup(&entry.table_name, &entry.item_id).await? {
                Some(data) => {
                    return Ok(Some(PendingOp {
                        entry,
                        data: Some(data),
                    }))
                }
                None => {
                    warn!(
                        id = entry.id,
                        table = %entry.table_name,
                        item_id = %entry.item_id,
                        "discarding orphaned operation with no local data"
                    );
                    self.store
                        .delete(OPERATIONS_TABLE, &[entry.id.to_string()])
                        .await?;
                    after = entry.id;
                }
            }
        }
    }

    /// Locks an entry for push. Locking the already-locked entry is a
    /// no-op; locking while another entry is locked is an error.
    pub(crate) fn lock(&self, id: i64) -> SyncResult<()> {
        let mut locked = self.locked.lock();
        match *locked {
            Some(existing) if existing == id => Ok(()),
            Some(_) => Err(SyncError::Internal(
                "only one operation can be locked at a time".into(),
            )),
            None => {
                *locked = Some(id);
                Ok(())
            }
        }
    }

    /// Clears the lock.
    pub(crate) fn unlock(&self) {
        *self.locked.lock() = None;
    }

    /// Whether the given entry is currently locked.
    pub(crate) fn is_locked(&self, id: i64) -> bool {
        *self.locked.lock() == Some(id)
    }

    /// The batch operation that persists the sequence counter.
    fn sequence_op(&self, value: i64) -> BatchOp {
        let mut row = Record::new();
        row.insert(sys::ID.into(), json!(OPERATIONS_SEQUENCE));
        row.insert(col::VALUE.into(), json!(value));
        BatchOp::upsert(SEQUENCES_TABLE, row)
    }
}
