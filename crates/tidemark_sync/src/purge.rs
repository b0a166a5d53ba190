//! Purge: bulk local-data eviction coordinated with the operation log.
//!
//! Purging removes every local row matching a query and resets the table's
//! incremental-pull watermarks, so the next incremental pull re-fetches
//! from scratch. The call refuses to run while unpushed operations exist
//! for the table unless it is forced, in which case those operations are
//! discarded too. Row deletion runs in bounded batches so a huge table
//! never needs one unbounded transaction.

use crate::config::SyncConfig;
use crate::error::{SyncError, SyncResult};
use crate::operations::{OperationLog, OPERATIONS_TABLE, PULLTIME_TABLE};
use crate::queue::TaskQueue;
use serde_json::json;
use std::sync::Arc;
use tidemark_store::{record_id, BatchOp, Filter, LocalStore, Query};
use tracing::{info, warn};

pub(crate) struct PurgeManager {
    store: Arc<dyn LocalStore>,
    log: Arc<OperationLog>,
    store_queue: Arc<TaskQueue>,
    config: SyncConfig,
}

impl PurgeManager {
    pub fn new(
        store: Arc<dyn LocalStore>,
        log: Arc<OperationLog>,
        store_queue: Arc<TaskQueue>,
        config: SyncConfig,
    ) -> Self {
        Self {
            store,
            log,
            store_queue,
            config,
        }
    }

    /// Purges the rows matching `query`, plus the table's watermarks and,
    /// when forced, its pending operations.
    pub async fn purge(&self, query: &Query, force: bool) -> SyncResult<()> {
        self.store_queue
            .run(async {
                let table = query.table().to_ascii_lowercase();

                let pending = self.log.pending_for_table(&table, Some(1)).await?;
                if !pending.is_empty() && !force {
                    return Err(SyncError::PendingChangesExist { table });
                }
                if force && !pending.is_empty() {
                    warn!(table = %table, "forced purge discarding pending operations");
                }

                let removed = self.purge_rows(query, &table).await?;
                self.purge_bookkeeping(&table, force).await?;

                info!(table = %table, removed, force, "purge finished");
                Ok(())
            })
            .await
    }

    /// Deletes matching rows in batches of at most `purge_batch_size`.
    async fn purge_rows(&self, query: &Query, table: &str) -> SyncResult<u64> {
        let batch = self.config.purge_batch_size as u64;
        let mut removed = 0u64;

        loop {
            let rows = self.store.read(&query.clone().with_take(batch)).await?;
            if rows.is_empty() {
                break;
            }

            let ids: Vec<String> = rows
                .iter()
                .filter_map(|r| record_id(r).map(str::to_string))
                .collect();
            if ids.is_empty() {
                break;
            }

            self.store.delete(table, &ids).await?;
            removed += ids.len() as u64;
        }

        Ok(removed)
    }

    /// Removes the table's watermark rows and, when forced, its pending
    /// log entries.
    async fn purge_bookkeeping(&self, table: &str, force: bool) -> SyncResult<()> {
        let mut ops: Vec<BatchOp> = Vec::new();

        let watermarks = self
            .store
            .read(
                &Query::new(PULLTIME_TABLE)
                    .with_filter(Filter::Eq("tableName".into(), json!(table))),
            )
            .await?;
        for row in &watermarks {
            if let Some(id) = record_id(row) {
                ops.push(BatchOp::delete(PULLTIME_TABLE, id));
            }
        }

        if force {
            for entry in self.log.pending_for_table(table, None).await? {
                ops.push(BatchOp::delete(OPERATIONS_TABLE, entry.id.to_string()));
            }
        }

        for chunk in ops.chunks(self.config.purge_batch_size.max(1)) {
            self.store.execute_batch(chunk.to_vec()).await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::operations::Action;
    use serde_json::{json, Value};
    use tidemark_store::{sys, ColumnType, MemoryStore, Record, TableSchema};

    struct Fixture {
        store: Arc<MemoryStore>,
        log: Arc<OperationLog>,
        purge: PurgeManager,
    }

    async fn fixture() -> Fixture {
        fixture_with_config(SyncConfig::new()).await
    }

    async fn fixture_with_config(config: SyncConfig) -> Fixture {
        let store = Arc::new(MemoryStore::new());
        store
            .define_table(
                TableSchema::new("todo")
                    .with_column(sys::ID, ColumnType::String)
                    .with_column("text", ColumnType::String),
            )
            .await
            .unwrap();

        let log = Arc::new(OperationLog::new(store.clone() as Arc<dyn LocalStore>));
        log.initialize().await.unwrap();

        let purge = PurgeManager::new(
            store.clone(),
            log.clone(),
            Arc::new(TaskQueue::new()),
            config,
        );

        Fixture { store, log, purge }
    }

    fn rec(value: Value) -> Record {
        value.as_object().unwrap().clone()
    }

    async fn seed_rows(f: &Fixture, n: usize) {
        let rows = (0..n)
            .map(|i| rec(json!({"id": format!("id{i}"), "text": "x"})))
            .collect();
        f.store.upsert("todo", rows).await.unwrap();
    }

    async fn seed_watermark(f: &Fixture) {
        f.store
            .upsert(
                PULLTIME_TABLE,
                vec![rec(json!({
                    "id": "q1",
                    "tableName": "todo",
                    "value": "2024-01-01T00:00:01.000Z"
                }))],
            )
            .await
            .unwrap();
    }

    async fn queue_insert(f: &Fixture, id: &str) {
        let item = rec(json!({"id": id, "text": "pending"}));
        let mut ops = f.log.logging_ops("todo", Action::Insert, &item).await.unwrap();
        ops.push(BatchOp::upsert("todo", item));
        f.store.execute_batch(ops).await.unwrap();
    }

    #[tokio::test]
    async fn purge_removes_rows_and_watermark() {
        let f = fixture().await;
        seed_rows(&f, 3).await;
        seed_watermark(&f).await;

        f.purge.purge(&Query::new("todo"), false).await.unwrap();

        assert_eq!(f.store.row_count("todo"), 0);
        assert!(f.store.lookup(PULLTIME_TABLE, "q1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn purge_with_filter_removes_only_matches() {
        let f = fixture().await;
        seed_rows(&f, 3).await;
        seed_watermark(&f).await;

        let query = Query::new("todo").with_filter(Filter::Eq(sys::ID.into(), json!("id1")));
        f.purge.purge(&query, false).await.unwrap();

        assert_eq!(f.store.row_count("todo"), 2);
        assert!(f.store.lookup("todo", "id1").await.unwrap().is_none());
        // The watermark resets regardless of the filter.
        assert!(f.store.lookup(PULLTIME_TABLE, "q1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn purge_refuses_pending_changes_and_mutates_nothing() {
        let f = fixture().await;
        seed_rows(&f, 2).await;
        seed_watermark(&f).await;
        queue_insert(&f, "new").await;

        let err = f.purge.purge(&Query::new("todo"), false).await.unwrap_err();
        assert!(matches!(err, SyncError::PendingChangesExist { .. }));

        // Rows, log entries, and the watermark are all untouched.
        assert_eq!(f.store.row_count("todo"), 3);
        assert_eq!(f.log.pending_for_table("todo", None).await.unwrap().len(), 1);
        assert!(f.store.lookup(PULLTIME_TABLE, "q1").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn forced_purge_discards_pending_operations() {
        let f = fixture().await;
        seed_rows(&f, 2).await;
        seed_watermark(&f).await;
        queue_insert(&f, "new").await;

        f.purge.purge(&Query::new("todo"), true).await.unwrap();

        assert_eq!(f.store.row_count("todo"), 0);
        assert!(f.log.pending_for_table("todo", None).await.unwrap().is_empty());
        assert!(f.store.lookup(PULLTIME_TABLE, "q1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn purge_batches_large_tables() {
        let f = fixture_with_config(SyncConfig::new().with_purge_batch_size(2)).await;
        seed_rows(&f, 7).await;

        f.purge.purge(&Query::new("todo"), false).await.unwrap();
        assert_eq!(f.store.row_count("todo"), 0);
    }

    #[tokio::test]
    async fn purge_leaves_other_tables_watermarks() {
        let f = fixture().await;
        seed_watermark(&f).await;
        f.store
            .upsert(
                PULLTIME_TABLE,
                vec![rec(json!({
                    "id": "other-query",
                    "tableName": "other",
                    "value": "2024-01-01T00:00:01.000Z"
                }))],
            )
            .await
            .unwrap();

        f.purge.purge(&Query::new("todo"), false).await.unwrap();

        assert!(f.store.lookup(PULLTIME_TABLE, "q1").await.unwrap().is_none());
        assert!(f
            .store
            .lookup(PULLTIME_TABLE, "other-query")
            .await
            .unwrap()
            .is_some());
    }
}
