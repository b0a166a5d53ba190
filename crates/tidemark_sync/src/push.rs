//! Push: replaying the operation log against the remote.
//!
//! Operations drain in log-id order, one at a time. Each is locked while
//! its remote call is in flight, so local mutations arriving meanwhile
//! append new entries instead of touching the one being pushed. Failures
//! are isolated per item: an unresolved failure is recorded and the drain
//! moves on, so one bad item never blocks the rest of the queue.

use crate::config::SyncConfig;
use crate::error::{SyncError, SyncResult};
use crate::operations::{Action, MetaAction, OperationLog, PendingOp, OPERATIONS_TABLE};
use crate::push_error::{meta_from_record, PushError, PushPolicy, Resolution};
use crate::queue::TaskQueue;
use crate::remote::{Features, RemoteClient, RemoteError};
use serde_json::json;
use std::sync::Arc;
use tidemark_store::{record_id, sys, BatchOp, LocalStore, Record};
use tracing::{debug, info, warn};

pub(crate) struct PushManager {
    store: Arc<dyn LocalStore>,
    remote: Arc<dyn RemoteClient>,
    log: Arc<OperationLog>,
    store_queue: Arc<TaskQueue>,
    config: SyncConfig,
}

/// What pushing one operation against the remote produced.
enum PushOutcome {
    Pushed,
    Failed(RemoteError),
}

/// What applying a resolution did to the pending operation.
enum Applied {
    /// The operation is still pending; push it again.
    Retry,
    /// The operation was removed; move on.
    Cancelled,
    /// Nothing was done; report the failure as unresolved.
    Unhandled,
}

impl PushManager {
    pub fn new(
        store: Arc<dyn LocalStore>,
        remote: Arc<dyn RemoteClient>,
        log: Arc<OperationLog>,
        store_queue: Arc<TaskQueue>,
        config: SyncConfig,
    ) -> Self {
        Self {
            store,
            remote,
            log,
            store_queue,
            config,
        }
    }

    /// Pushes all pending operations, returning the unresolved failures.
    ///
    /// Fails outright only when no operation made any progress and at
    /// least one non-conflict failure occurred (connectivity entirely
    /// absent).
    pub async fn push(&self, policy: Option<Arc<dyn PushPolicy>>) -> SyncResult<Vec<PushError>> {
        let mut last_processed = 0i64;
        let mut failing_id = 0i64;
        let mut attempts = 0u32;
        let mut unresolved: Vec<PushError> = Vec::new();
        let mut progressed = false;

        loop {
            let next = self
                .store_queue
                .run(async {
                    let op = self.log.first_pending_with_data(last_processed).await?;
                    if let Some(op) = &op {
                        self.log.lock(op.entry.id)?;
                    }
                    SyncResult::Ok(op)
                })
                .await?;
            let Some(op) = next else {
                break;
            };

            let outcome = self.push_operation(&op).await;
            let outcome = match outcome {
                Ok(outcome) => outcome,
                Err(e) => {
                    self.log.unlock();
                    return Err(e);
                }
            };

            match outcome {
                PushOutcome::Pushed => {
                    let removal = self
                        .store_queue
                        .run(self.store.execute_batch(vec![BatchOp::delete(
                            OPERATIONS_TABLE,
                            op.entry.id.to_string(),
                        )]))
                        .await;
                    self.log.unlock();
                    removal?;

                    debug!(
                        id = op.entry.id,
                        table = %op.entry.table_name,
                        item_id = %op.entry.item_id,
                        "operation pushed"
                    );
                    last_processed = op.entry.id;
                    progressed = true;
                }
                PushOutcome::Failed(remote_error) => {
                    self.log.unlock();

                    let push_error = PushError::new(
                        op.entry.table_name.clone(),
                        op.entry.item_id.clone(),
                        op.entry.action,
                        op.data.clone(),
                        remote_error,
                    );

                    // The attempt counter is per item: it resets whenever a
                    // different item starts failing.
                    if failing_id != op.entry.id {
                        failing_id = op.entry.id;
                        attempts = 0;
                    }
                    attempts += 1;

                    let applied = if attempts < self.config.max_push_retries {
                        let resolution = self.invoke_policy(policy.as_deref(), &push_error).await;
                        self.apply_resolution(&op, resolution).await?
                    } else {
                        warn!(
                            id = op.entry.id,
                            attempts, "push retry ceiling reached; reporting unresolved"
                        );
                        Applied::Unhandled
                    };

                    match applied {
                        Applied::Retry => {
                            // Same item is re-read on the next turn.
                        }
                        Applied::Cancelled => {
                            progressed = true;
                        }
                        Applied::Unhandled => {
                            warn!(
                                id = op.entry.id,
                                table = %op.entry.table_name,
                                item_id = %op.entry.item_id,
                                conflict = push_error.is_conflict(),
                                "push failure unresolved; continuing with next item"
                            );
                            unresolved.push(push_error);
                            last_processed = op.entry.id;
                        }
                    }
                }
            }
        }

        if !progressed && unresolved.iter().any(|e| !e.is_conflict()) {
            return Err(SyncError::PushAborted {
                failures: unresolved.len(),
            });
        }

        info!(unresolved = unresolved.len(), "push finished");
        Ok(unresolved)
    }

    /// Executes the remote call for one pending operation.
    async fn push_operation(&self, op: &PendingOp) -> SyncResult<PushOutcome> {
        let table = op.entry.table_name.as_str();
        let version = op.entry.metadata.version_str();

        let result = match op.entry.action {
            Action::Insert => {
                let mut record = required_data(op)?;
                for key in [sys::VERSION, sys::UPDATED_AT, sys::DELETED] {
                    record.remove(key);
                }
                self.remote
                    .insert(table, record, Features::offline())
                    .await
                    .map(|_| ())
            }
            Action::Update => {
                let mut record = required_data(op)?;
                for key in [sys::VERSION, sys::UPDATED_AT, sys::DELETED] {
                    record.remove(key);
                }
                self.remote
                    .update(table, record, version, Features::offline())
                    .await
                    .map(|_| ())
            }
            Action::Delete => {
                match self
                    .remote
                    .delete(table, &op.entry.item_id, version, Features::offline())
                    .await
                {
                    // The row is already gone; the delete's intent holds.
                    Err(RemoteError::NotFound { .. }) => {
                        debug!(
                            table,
                            item_id = %op.entry.item_id,
                            "remote row already absent; treating delete as pushed"
                        );
                        Ok(())
                    }
                    other => other,
                }
            }
        };

        Ok(match result {
            Ok(()) => PushOutcome::Pushed,
            Err(e) => PushOutcome::Failed(e),
        })
    }

    async fn invoke_policy(
        &self,
        policy: Option<&dyn PushPolicy>,
        error: &PushError,
    ) -> Resolution {
        match policy {
            None => Resolution::Unresolved,
            Some(policy) if error.is_conflict() => policy.on_conflict(error).await,
            Some(policy) => policy.on_error(error).await,
        }
    }

    /// Performs the bookkeeping a resolution asks for.
    ///
    /// Unusable resolutions (id mismatch, updating a pending delete,
    /// switching away from a delete without a record) are rejected and the
    /// failure is treated as unresolved.
    async fn apply_resolution(&self, op: &PendingOp, resolution: Resolution) -> SyncResult<Applied> {
        let table = op.entry.table_name.as_str();
        let item_id = op.entry.item_id.as_str();

        match resolution {
            Resolution::Retry => Ok(Applied::Retry),
            Resolution::Unresolved => Ok(Applied::Unhandled),

            Resolution::UpdateAndRetry(record) => {
                if op.entry.action == Action::Delete {
                    warn!(table, item_id, "cannot replace the record of a pending delete");
                    return Ok(Applied::Unhandled);
                }
                let Some(record) = keyed_record(record, item_id) else {
                    warn!(table, item_id, "resolution record id does not match the failing item");
                    return Ok(Applied::Unhandled);
                };

                self.store_queue
                    .run(async {
                        let metadata = self
                            .log
                            .metadata_for(table, MetaAction::Upsert, &record)
                            .await?;
                        let mut entry = op.entry.clone();
                        entry.metadata = metadata;
                        self.store
                            .execute_batch(vec![
                                BatchOp::upsert(OPERATIONS_TABLE, entry.to_row()),
                                BatchOp::upsert(table, record),
                            ])
                            .await?;
                        Ok(Applied::Retry)
                    })
                    .await
            }

            Resolution::ChangeAction { action, record } => {
                let record = match record {
                    Some(record) => match keyed_record(record, item_id) {
                        Some(record) => Some(record),
                        None => {
                            warn!(
                                table,
                                item_id, "resolution record id does not match the failing item"
                            );
                            return Ok(Applied::Unhandled);
                        }
                    },
                    None => None,
                };
                if record.is_none()
                    && op.entry.action == Action::Delete
                    && matches!(action, Action::Insert | Action::Update)
                {
                    warn!(
                        table,
                        item_id, "changing a delete to {action} requires a record"
                    );
                    return Ok(Applied::Unhandled);
                }

                self.store_queue
                    .run(async {
                        let mut entry = op.entry.clone();
                        entry.action = action;
                        if let Some(record) = &record {
                            entry.metadata = meta_from_record(Some(record));
                        }

                        let mut batch = vec![BatchOp::upsert(OPERATIONS_TABLE, entry.to_row())];
                        match action {
                            Action::Insert | Action::Update => {
                                if let Some(record) = record {
                                    batch.push(BatchOp::upsert(table, record));
                                }
                            }
                            Action::Delete => {
                                batch.push(BatchOp::delete(table, item_id));
                            }
                        }
                        self.store.execute_batch(batch).await?;
                        Ok(Applied::Retry)
                    })
                    .await
            }

            Resolution::CancelAndUpdate(record) => {
                if op.entry.action == Action::Delete {
                    warn!(table, item_id, "cannot update the record of a pending delete");
                    return Ok(Applied::Unhandled);
                }
                let Some(record) = keyed_record(record, item_id) else {
                    warn!(table, item_id, "resolution record id does not match the failing item");
                    return Ok(Applied::Unhandled);
                };

                self.store_queue
                    .run(self.store.execute_batch(vec![
                        BatchOp::upsert(table, record),
                        BatchOp::delete(OPERATIONS_TABLE, op.entry.id.to_string()),
                    ]))
                    .await?;
                Ok(Applied::Cancelled)
            }

            Resolution::CancelAndDiscard => {
                self.store_queue
                    .run(self.store.execute_batch(vec![
                        BatchOp::delete(table, item_id),
                        BatchOp::delete(OPERATIONS_TABLE, op.entry.id.to_string()),
                    ]))
                    .await?;
                Ok(Applied::Cancelled)
            }

            Resolution::Cancel => {
                self.store_queue
                    .run(self.store.execute_batch(vec![BatchOp::delete(
                        OPERATIONS_TABLE,
                        op.entry.id.to_string(),
                    )]))
                    .await?;
                Ok(Applied::Cancelled)
            }
        }
    }
}

fn required_data(op: &PendingOp) -> SyncResult<Record> {
    op.data.clone().ok_or_else(|| {
        SyncError::Internal(format!(
            "operation {} has no data to push",
            op.entry.id
        ))
    })
}

/// Checks the resolution record's id against the failing item, supplying
/// the id when the record omits it.
fn keyed_record(mut record: Record, item_id: &str) -> Option<Record> {
    match record_id(&record) {
        Some(id) if id == item_id => Some(record),
        Some(_) => None,
        None => {
            record.insert(sys::ID.into(), json!(item_id));
            Some(record)
        }
    }
}
