//! Pull: paging remote changes into the local store.
//!
//! A vanilla pull (no query id) walks the query's full result set with
//! skip/take paging. An incremental pull resumes from the persisted
//! watermark for its query id: the outgoing query is narrowed to rows
//! modified strictly after the watermark, ordered ascending by modification
//! time, and the watermark advances (and is persisted) after every ingested
//! page, so an interrupted pull resumes without re-fetching what it already
//! committed.
//!
//! Server rows never overwrite items with pending local operations; rows
//! the server reports deleted are removed locally.

use crate::config::{PullSettings, SyncConfig};
use crate::error::{SyncError, SyncResult};
use crate::operations::{OperationLog, PULLTIME_TABLE};
use crate::queue::TaskQueue;
use crate::remote::{Features, RemoteClient};
use chrono::{DateTime, SecondsFormat, Utc};
use serde_json::{json, Value};
use std::sync::Arc;
use tidemark_store::{record_id, sys, Filter, LocalStore, Query, Record, SortDir};
use tracing::{debug, info};

pub(crate) struct PullManager {
    store: Arc<dyn LocalStore>,
    remote: Arc<dyn RemoteClient>,
    log: Arc<OperationLog>,
    store_queue: Arc<TaskQueue>,
    config: SyncConfig,
}

impl PullManager {
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

    /// Pulls the records matched by `query` into the local store.
    pub async fn pull(
        &self,
        query: &Query,
        query_id: Option<&str>,
        settings: &PullSettings,
    ) -> SyncResult<()> {
        validate_pull_query(query)?;
        let page_size = match settings.page_size {
            None => self.config.default_page_size,
            Some(n) if n > 0 => n as u64,
            Some(n) => return Err(SyncError::InvalidPageSize { value: n }),
        };

        // Log entries and watermarks carry lower-cased table names; the
        // remote sees the query's original casing.
        let table = query.table().to_ascii_lowercase();
        match query_id {
            Some(query_id) => {
                self.pull_incremental(query, &table, query_id, page_size)
                    .await
            }
            None => self.pull_vanilla(query, &table, page_size).await,
        }
    }

    async fn pull_vanilla(&self, query: &Query, table: &str, page_size: u64) -> SyncResult<()> {
        let mut skip = 0u64;
        let mut total = 0u64;

        loop {
            let page_query = query.clone().with_skip(skip).with_take(page_size);
            let page = self
                .remote
                .query(&page_query, true, Features::offline())
                .await?;

            let count = page.records.len() as u64;
            for record in page.records {
                self.merge_record(table, record).await?;
            }
            total += count;
            debug!(table, count, "pulled page");

            if count == 0 || !page.has_more {
                break;
            }
            skip += count;
        }

        info!(table, total, "pull finished");
        Ok(())
    }

    async fn pull_incremental(
        &self,
        query: &Query,
        table: &str,
        query_id: &str,
        page_size: u64,
    ) -> SyncResult<()> {
        let mut watermark = self.load_watermark(query_id).await?;
        let mut total = 0u64;

        loop {
            let mut page_query = query.clone();
            if let Some(watermark) = watermark {
                page_query = page_query.with_filter(Filter::Gt(
                    sys::UPDATED_AT.into(),
                    json!(format_time(watermark)),
                ));
            }
            let page_query = page_query
                .order_by(sys::UPDATED_AT, SortDir::Asc)
                .with_take(page_size);

            let page = self
                .remote
                .query(&page_query, true, Features::incremental())
                .await?;

            let empty = page.records.is_empty();
            let has_more = page.has_more;
            let mut page_max: Option<DateTime<Utc>> = None;

            for record in page.records {
                let modified = modified_time(table, &record)?;
                page_max = Some(page_max.map_or(modified, |m| m.max(modified)));
                self.merge_record(table, record).await?;
            }
            total += u64::from(!empty);

            // Persist the advanced watermark before fetching the next page
            // so an interrupted pull resumes behind at most one page.
            if let Some(page_max) = page_max {
                let advanced = watermark.map_or(page_max, |w| w.max(page_max));
                self.save_watermark(query_id, table, advanced).await?;
                watermark = Some(advanced);
                debug!(table, query_id, watermark = %format_time(advanced), "watermark advanced");
            }

            if empty || !has_more {
                break;
            }
        }

        info!(table, query_id, pages = total, "incremental pull finished");
        Ok(())
    }

    /// Writes one pulled record into the local store.
    ///
    /// Rows the server reports deleted are removed even when the item has
    /// pending local operations (which then become orphans, discarded by
    /// the next push). Other rows are skipped while pending operations
    /// exist: local edits in flight stay authoritative until pushed.
    async fn merge_record(&self, table: &str, record: Record) -> SyncResult<()> {
        self.store_queue
            .run(async {
                let item_id = record_id(&record)
                    .ok_or_else(|| SyncError::InvalidPulledRecord {
                        table: table.to_string(),
                        reason: "record has no id".into(),
                    })?
                    .to_string();

                if record.get(sys::DELETED) == Some(&Value::Bool(true)) {
                    debug!(table, item_id, "removing row deleted on server");
                    self.store.delete(table, &[item_id]).await?;
                    return Ok(());
                }

                let pending = self.log.pending_operations(table, &item_id).await?;
                if pending.is_empty() {
                    self.store.upsert(table, vec![record]).await?;
                } else {
                    debug!(table, item_id, "skipping pulled row with pending local operations");
                }
                Ok(())
            })
            .await
    }

    async fn load_watermark(&self, query_id: &str) -> SyncResult<Option<DateTime<Utc>>> {
        let row = self.store.lookup(PULLTIME_TABLE, query_id).await?;
        Ok(row
            .and_then(|r| r.get("value").and_then(Value::as_str).map(str::to_string))
            .and_then(|s| s.parse::<DateTime<Utc>>().ok()))
    }

    async fn save_watermark(
        &self,
        query_id: &str,
        table: &str,
        value: DateTime<Utc>,
    ) -> SyncResult<()> {
        let mut row = Record::new();
        row.insert(sys::ID.into(), json!(query_id));
        row.insert("tableName".into(), json!(table));
        row.insert("value".into(), json!(format_time(value)));
        self.store.upsert(PULLTIME_TABLE, vec![row]).await?;
        Ok(())
    }
}

fn modified_time(table: &str, record: &Record) -> SyncResult<DateTime<Utc>> {
    record
        .get(sys::UPDATED_AT)
        .and_then(Value::as_str)
        .and_then(|s| s.parse::<DateTime<Utc>>().ok())
        .ok_or_else(|| SyncError::InvalidPulledRecord {
            table: table.to_string(),
            reason: format!("missing or invalid {}", sys::UPDATED_AT),
        })
}

fn format_time(time: DateTime<Utc>) -> String {
    time.to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// The pull pager owns ordering and paging; a pull query that carries its
/// own is rejected before anything is fetched.
fn validate_pull_query(query: &Query) -> SyncResult<()> {
    if !query.ordering().is_empty() {
        return Err(SyncError::UnsupportedPullQuery {
            reason: "ordering clauses are not supported in a pull query".into(),
        });
    }
    if query.skip().is_some() {
        return Err(SyncError::UnsupportedPullQuery {
            reason: "skip is not supported in a pull query".into(),
        });
    }
    if query.take().is_some() {
        return Err(SyncError::UnsupportedPullQuery {
            reason: "take is not supported in a pull query".into(),
        });
    }
    Ok(())
}
