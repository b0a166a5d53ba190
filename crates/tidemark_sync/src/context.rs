//! The sync context: the engine's façade.
//!
//! A [`SyncContext`] owns the local store handle, the operation log, and
//! the push/pull/purge managers, and serializes every public operation
//! through two task queues: local mutations (and the store batches the
//! managers issue) through the store queue, push/pull/purge through the
//! sync queue. At most one of each category is ever touching the operation
//! log or issuing store batches at a time.
//!
//! Table names are normalized to lower case at this boundary; the store
//! matches names case-insensitively either way.

use crate::config::{PullSettings, SyncConfig};
use crate::error::{SyncError, SyncResult};
use crate::operations::{Action, OperationLog};
use crate::pull::PullManager;
use crate::purge::PurgeManager;
use crate::push::PushManager;
use crate::push_error::{PushError, PushPolicy};
use crate::queue::TaskQueue;
use crate::remote::RemoteClient;
use parking_lot::RwLock;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tidemark_store::{sys, validate_id, BatchOp, LocalStore, Query, Record};
use tracing::debug;
use uuid::Uuid;

/// Context for offline table operations and their synchronization.
///
/// Applications read and write records through the context while
/// disconnected; every write is recorded in the operation log. [`push`]
/// replays the log against the remote, [`pull`] pages remote changes into
/// the local store, and [`purge`] evicts local data.
///
/// [`push`]: SyncContext::push
/// [`pull`]: SyncContext::pull
/// [`purge`]: SyncContext::purge
pub struct SyncContext {
    store: Arc<dyn LocalStore>,
    log: Arc<OperationLog>,
    push_manager: PushManager,
    pull_manager: PullManager,
    purge_manager: PurgeManager,
    store_queue: Arc<TaskQueue>,
    sync_queue: TaskQueue,
    policy: RwLock<Option<Arc<dyn PushPolicy>>>,
    initialized: AtomicBool,
}

impl SyncContext {
    /// Creates a context over the given store and remote.
    ///
    /// The context is unusable until [`SyncContext::initialize`] completes.
    pub fn new(
        store: Arc<dyn LocalStore>,
        remote: Arc<dyn RemoteClient>,
        config: SyncConfig,
    ) -> Self {
        let log = Arc::new(OperationLog::new(store.clone()));
        let store_queue = Arc::new(TaskQueue::new());

        let push_manager = PushManager::new(
            store.clone(),
            remote.clone(),
            log.clone(),
            store_queue.clone(),
            config.clone(),
        );
        let pull_manager = PullManager::new(
            store.clone(),
            remote.clone(),
            log.clone(),
            store_queue.clone(),
            config.clone(),
        );
        let purge_manager =
            PurgeManager::new(store.clone(), log.clone(), store_queue.clone(), config);

        Self {
            store,
            log,
            push_manager,
            pull_manager,
            purge_manager,
            store_queue,
            sync_queue: TaskQueue::new(),
            policy: RwLock::new(None),
            initialized: AtomicBool::new(false),
        }
    }

    /// Defines the engine's system tables and recovers persisted state.
    /// Initializing an initialized context has no effect.
    pub async fn initialize(&self) -> SyncResult<()> {
        self.log.initialize().await?;
        self.initialized.store(true, Ordering::SeqCst);
        Ok(())
    }

    /// Registers the conflict/error policy consulted during push.
    pub fn set_push_policy(&self, policy: Arc<dyn PushPolicy>) {
        *self.policy.write() = Some(policy);
    }

    /// Inserts a record into a local table, logging it for push.
    ///
    /// A record without an id is assigned a generated one; the inserted
    /// record is returned. Fails with [`SyncError::DuplicateItem`] when the
    /// item already exists locally or has a pending insert or update.
    pub async fn insert(&self, table: &str, item: Record) -> SyncResult<Record> {
        let table = checked_table(table)?;
        self.store_queue
            .run(async {
                self.ensure_initialized()?;

                let mut item = item;
                let id = match item.get(sys::ID) {
                    None | Some(Value::Null) => {
                        let id = Uuid::new_v4().to_string();
                        item.insert(sys::ID.into(), json!(id));
                        id
                    }
                    Some(value) => validate_id(value)?.to_string(),
                };

                if self.store.lookup(&table, &id).await?.is_some() {
                    return Err(SyncError::DuplicateItem {
                        table,
                        item_id: id,
                    });
                }

                let mut batch = vec![BatchOp::upsert(table.as_str(), item.clone())];
                batch.extend(self.log.logging_ops(&table, Action::Insert, &item).await?);
                self.store.execute_batch(batch).await?;

                debug!(table = %table, item_id = %id, "inserted");
                Ok(item)
            })
            .await
    }

    /// Updates a record in a local table, logging it for push.
    ///
    /// The record must carry an id; updating a row that does not exist
    /// locally writes it (the common case after an insert pushed earlier).
    pub async fn update(&self, table: &str, item: Record) -> SyncResult<Record> {
        let table = checked_table(table)?;
        self.store_queue
            .run(async {
                self.ensure_initialized()?;
                let id = required_id(&table, &item)?;

                let mut batch = vec![BatchOp::upsert(table.as_str(), item.clone())];
                batch.extend(self.log.logging_ops(&table, Action::Update, &item).await?);
                self.store.execute_batch(batch).await?;

                debug!(table = %table, item_id = %id, "updated");
                Ok(item)
            })
            .await
    }

    /// Deletes a record from a local table, logging it for push.
    pub async fn delete(&self, table: &str, item: Record) -> SyncResult<()> {
        let table = checked_table(table)?;
        self.store_queue
            .run(async {
                self.ensure_initialized()?;
                let id = required_id(&table, &item)?;

                let mut batch = vec![BatchOp::delete(table.as_str(), id.clone())];
                batch.extend(self.log.logging_ops(&table, Action::Delete, &item).await?);
                self.store.execute_batch(batch).await?;

                debug!(table = %table, item_id = %id, "deleted");
                Ok(())
            })
            .await
    }

    /// Looks up a record, failing with [`SyncError::ItemNotFound`] when it
    /// does not exist.
    pub async fn lookup(&self, table: &str, id: &str) -> SyncResult<Record> {
        self.try_lookup(table, id)
            .await?
            .ok_or_else(|| SyncError::ItemNotFound {
                table: table.to_ascii_lowercase(),
                item_id: id.to_string(),
            })
    }

    /// Looks up a record, returning `None` when it does not exist.
    pub async fn try_lookup(&self, table: &str, id: &str) -> SyncResult<Option<Record>> {
        let table = checked_table(table)?;
        self.ensure_initialized()?;
        Ok(self.store.lookup(&table, id).await?)
    }

    /// Reads local records matching a query.
    pub async fn read(&self, query: &Query) -> SyncResult<Vec<Record>> {
        checked_table(query.table())?;
        self.ensure_initialized()?;
        Ok(self.store.read(query).await?)
    }

    /// Pushes all pending local operations to the remote.
    ///
    /// Returns the conflicts and errors that stayed unresolved; per-item
    /// failures never fail the call unless no operation made progress.
    pub async fn push(&self) -> SyncResult<Vec<PushError>> {
        let policy = self.policy.read().clone();
        self.sync_queue
            .run(async {
                self.ensure_initialized()?;
                self.push_manager.push(policy).await
            })
            .await
    }

    /// Pulls remote records matching `query` into the local store.
    ///
    /// With a `query_id`, the pull is incremental: it resumes from the
    /// persisted watermark for that id and advances it as pages commit.
    pub async fn pull(
        &self,
        query: &Query,
        query_id: Option<&str>,
        settings: PullSettings,
    ) -> SyncResult<()> {
        checked_table(query.table())?;
        self.sync_queue
            .run(async {
                self.ensure_initialized()?;
                self.pull_manager.pull(query, query_id, &settings).await
            })
            .await
    }

    /// Purges local rows matching `query` along with the table's
    /// incremental-pull state.
    ///
    /// Refuses with [`SyncError::PendingChangesExist`] while unpushed
    /// operations exist for the table, unless `force` is set, in which
    /// case the pending operations are discarded too.
    pub async fn purge(&self, query: &Query, force: bool) -> SyncResult<()> {
        checked_table(query.table())?;
        self.sync_queue
            .run(async {
                self.ensure_initialized()?;
                self.purge_manager.purge(query, force).await
            })
            .await
    }

    fn ensure_initialized(&self) -> SyncResult<()> {
        if self.initialized.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(SyncError::NotInitialized)
        }
    }
}

// Table names beginning with `__` belong to the engine's own state and are
// not reachable through the public surface.
fn checked_table(table: &str) -> SyncResult<String> {
    if table.is_empty() {
        return Err(SyncError::EmptyTableName);
    }
    if table.starts_with("__") {
        return Err(SyncError::ReservedTable {
            table: table.to_string(),
        });
    }
    Ok(table.to_ascii_lowercase())
}

fn required_id(table: &str, item: &Record) -> SyncResult<String> {
    match item.get(sys::ID) {
        None | Some(Value::Null) => Err(SyncError::MissingId {
            table: table.to_string(),
        }),
        Some(value) => Ok(validate_id(value)?.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::remote::MemoryRemote;
    use serde_json::json;
    use tidemark_store::{ColumnType, MemoryStore, TableSchema};

    async fn context() -> SyncContext {
        let store = Arc::new(MemoryStore::new());
        store
            .define_table(
                TableSchema::new("todo")
                    .with_column(sys::ID, ColumnType::String)
                    .with_column("text", ColumnType::String)
                    .with_column(sys::VERSION, ColumnType::String)
                    .with_column(sys::UPDATED_AT, ColumnType::Date)
                    .with_column(sys::DELETED, ColumnType::Boolean),
            )
            .await
            .unwrap();

        let ctx = SyncContext::new(store, Arc::new(MemoryRemote::new()), SyncConfig::new());
        ctx.initialize().await.unwrap();
        ctx
    }

    fn rec(value: serde_json::Value) -> Record {
        value.as_object().unwrap().clone()
    }

    #[tokio::test]
    async fn operations_require_initialization() {
        let store = Arc::new(MemoryStore::new());
        let ctx = SyncContext::new(store, Arc::new(MemoryRemote::new()), SyncConfig::new());

        let result = ctx.insert("todo", rec(json!({"id": "1"}))).await;
        assert!(matches!(result, Err(SyncError::NotInitialized)));
        let result = ctx.push().await;
        assert!(matches!(result, Err(SyncError::NotInitialized)));
    }

    #[tokio::test]
    async fn insert_generates_an_id_when_absent() {
        let ctx = context().await;
        let inserted = ctx.insert("todo", rec(json!({"text": "no id"}))).await.unwrap();

        let id = inserted[sys::ID].as_str().unwrap();
        assert!(!id.is_empty());
        assert!(ctx.lookup("todo", id).await.is_ok());
    }

    #[tokio::test]
    async fn insert_rejects_existing_rows() {
        let ctx = context().await;
        ctx.insert("todo", rec(json!({"id": "1", "text": "a"})))
            .await
            .unwrap();

        let result = ctx.insert("todo", rec(json!({"id": "1", "text": "b"}))).await;
        assert!(matches!(result, Err(SyncError::DuplicateItem { .. })));
    }

    #[tokio::test]
    async fn update_and_delete_require_an_id() {
        let ctx = context().await;
        let result = ctx.update("todo", rec(json!({"text": "no id"}))).await;
        assert!(matches!(result, Err(SyncError::MissingId { .. })));

        let result = ctx.delete("todo", rec(json!({"text": "no id"}))).await;
        assert!(matches!(result, Err(SyncError::MissingId { .. })));
    }

    #[tokio::test]
    async fn empty_table_name_is_rejected() {
        let ctx = context().await;
        let result = ctx.insert("", rec(json!({"id": "1"}))).await;
        assert!(matches!(result, Err(SyncError::EmptyTableName)));
    }

    #[tokio::test]
    async fn system_tables_are_not_reachable() {
        let ctx = context().await;

        let result = ctx
            .insert("__operations", rec(json!({"id": "1"})))
            .await;
        assert!(matches!(result, Err(SyncError::ReservedTable { .. })));

        let result = ctx.read(&Query::new("__pulltime")).await;
        assert!(matches!(result, Err(SyncError::ReservedTable { .. })));

        let result = ctx.purge(&Query::new("__sequences"), true).await;
        assert!(matches!(result, Err(SyncError::ReservedTable { .. })));
    }

    #[tokio::test]
    async fn lookup_distinguishes_missing_items() {
        let ctx = context().await;
        ctx.insert("todo", rec(json!({"id": "1", "text": "a"})))
            .await
            .unwrap();

        assert!(ctx.lookup("todo", "1").await.is_ok());
        assert!(ctx.try_lookup("todo", "2").await.unwrap().is_none());
        assert!(matches!(
            ctx.lookup("todo", "2").await,
            Err(SyncError::ItemNotFound { .. })
        ));
    }

    #[tokio::test]
    async fn table_names_are_case_insensitive() {
        let ctx = context().await;
        ctx.insert("TODO", rec(json!({"id": "1", "text": "a"})))
            .await
            .unwrap();

        let row = ctx.lookup("Todo", "1").await.unwrap();
        assert_eq!(row["text"], json!("a"));

        // The logged operation carries the normalized name and pushes.
        let conflicts = ctx.push().await.unwrap();
        assert!(conflicts.is_empty());
    }

    #[tokio::test]
    async fn delete_then_read_shows_row_gone() {
        let ctx = context().await;
        ctx.insert("todo", rec(json!({"id": "1", "text": "a"})))
            .await
            .unwrap();
        ctx.delete("todo", rec(json!({"id": "1"}))).await.unwrap();

        let rows = ctx.read(&Query::new("todo")).await.unwrap();
        assert!(rows.is_empty());
    }
}
