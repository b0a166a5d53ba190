//! Remote table service abstraction.
//!
//! The engine talks to the remote through [`RemoteClient`]: per-table CRUD
//! with an If-Match style version precondition, and a paged query surface.
//! HTTP framing, auth, and wire encoding live behind the trait; the engine
//! only needs the failure classification (conflict vs transport) and the
//! telemetry [`Features`] markers it attaches to requests.

use async_trait::async_trait;
use chrono::{DateTime, Duration, SecondsFormat, TimeZone, Utc};
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap, VecDeque};
use thiserror::Error;
use tidemark_store::{sys, Query, Record};

/// Telemetry markers attached to remote requests.
///
/// These are consumed by the transport layer only (typically as a request
/// header); the engine sets them and otherwise ignores them.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Features {
    /// The request originates from the offline sync engine.
    pub offline_sync: bool,
    /// The request is part of an incremental pull.
    pub incremental_pull: bool,
}

impl Features {
    /// Markers for a plain offline-sync request.
    pub fn offline() -> Self {
        Self {
            offline_sync: true,
            incremental_pull: false,
        }
    }

    /// Markers for an incremental pull request.
    pub fn incremental() -> Self {
        Self {
            offline_sync: true,
            incremental_pull: true,
        }
    }

    /// Renders the markers as a comma-separated header value.
    pub fn header_value(&self) -> String {
        let mut codes = Vec::new();
        if self.offline_sync {
            codes.push("OL");
        }
        if self.incremental_pull {
            codes.push("IP");
        }
        codes.join(",")
    }
}

/// One page of a remote query result.
#[derive(Debug, Clone)]
pub struct QueryPage {
    /// Records in this page.
    pub records: Vec<Record>,
    /// Whether more records match beyond this page.
    pub has_more: bool,
}

/// Result type for remote operations.
pub type RemoteResult<T> = Result<T, RemoteError>;

/// Errors surfaced by the remote table service.
#[derive(Debug, Clone, Error)]
pub enum RemoteError {
    /// The version precondition did not match the server row.
    #[error("precondition failed for item {item_id} in table {table}")]
    PreconditionFailed {
        /// The target table.
        table: String,
        /// The item that conflicted.
        item_id: String,
        /// The server's current row, when the server returned it.
        server_record: Option<Record>,
    },

    /// An insert collided with an existing server row.
    #[error("item {item_id} already exists in table {table}")]
    ItemAlreadyExists {
        /// The target table.
        table: String,
        /// The item that collided.
        item_id: String,
        /// The server's current row, when the server returned it.
        server_record: Option<Record>,
    },

    /// The server has no such row.
    #[error("item {item_id} not found in table {table}")]
    NotFound {
        /// The target table.
        table: String,
        /// The missing item id.
        item_id: String,
    },

    /// A non-conflict HTTP failure.
    #[error("server returned status {status}: {message}")]
    Status {
        /// The HTTP status code.
        status: u16,
        /// The server's error message.
        message: String,
    },

    /// The request never reached the server.
    #[error("network error: {0}")]
    Network(String),
}

impl RemoteError {
    /// Returns true if the failure is a version or uniqueness conflict.
    pub fn is_conflict(&self) -> bool {
        matches!(
            self,
            RemoteError::PreconditionFailed { .. } | RemoteError::ItemAlreadyExists { .. }
        )
    }

    /// Returns the server row attached to a conflict, if any.
    pub fn server_record(&self) -> Option<&Record> {
        match self {
            RemoteError::PreconditionFailed { server_record, .. }
            | RemoteError::ItemAlreadyExists { server_record, .. } => server_record.as_ref(),
            _ => None,
        }
    }
}

/// A remote table service.
///
/// Inserts carry no precondition; updates and deletes carry the stored
/// version as an If-Match style precondition when one is known. Queries are
/// paged by the caller via the query's skip/take and report whether more
/// rows match beyond the returned page.
#[async_trait]
pub trait RemoteClient: Send + Sync {
    /// Inserts a record into a server table.
    async fn insert(&self, table: &str, record: Record, features: Features)
        -> RemoteResult<Record>;

    /// Updates a record, subject to the version precondition.
    async fn update(
        &self,
        table: &str,
        record: Record,
        version: Option<&str>,
        features: Features,
    ) -> RemoteResult<Record>;

    /// Deletes a record by id, subject to the version precondition.
    async fn delete(
        &self,
        table: &str,
        id: &str,
        version: Option<&str>,
        features: Features,
    ) -> RemoteResult<()>;

    /// Reads one page of records matching the query.
    ///
    /// With `include_deleted`, soft-deleted rows are returned with their
    /// `deleted` marker set.
    async fn query(
        &self,
        query: &Query,
        include_deleted: bool,
        features: Features,
    ) -> RemoteResult<QueryPage>;
}

/// An in-memory remote table service for tests.
///
/// Behaves like a small table service with optimistic concurrency and soft
/// delete: inserts reject duplicate ids, updates and deletes enforce the
/// version precondition, deletes mark rows as `deleted` rather than
/// removing them, and every write bumps the row version and `updatedAt`.
/// Errors can be injected ahead of the next requests, and query traffic is
/// counted so tests can assert page-fetch behavior.
#[derive(Default)]
pub struct MemoryRemote {
    tables: Mutex<HashMap<String, BTreeMap<String, Record>>>,
    injected: Mutex<VecDeque<RemoteError>>,
    injected_for: Mutex<HashMap<String, VecDeque<RemoteError>>>,
    fail_query_at: Mutex<Option<(usize, RemoteError)>>,
    clock: Mutex<i64>,
    query_log: Mutex<Vec<Features>>,
    write_log: Mutex<Vec<(&'static str, String)>>,
}

impl MemoryRemote {
    /// Creates an empty remote.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Queues an error to be returned by the next request.
    pub fn inject_error(&self, error: RemoteError) {
        self.injected.lock().push_back(error);
    }

    /// Queues an error to be returned by the next write touching `id`.
    pub fn inject_error_for(&self, id: &str, error: RemoteError) {
        self.injected_for
            .lock()
            .entry(id.to_string())
            .or_default()
            .push_back(error);
    }

    /// Fails the `n`-th query (1-based, counted over the remote's life).
    pub fn inject_query_error_at(&self, n: usize, error: RemoteError) {
        *self.fail_query_at.lock() = Some((n, error));
    }

    /// Returns the number of queries served.
    pub fn query_count(&self) -> usize {
        self.query_log.lock().len()
    }

    /// Returns the number of write requests (insert, update, delete) that
    /// targeted `id`, including failed ones.
    pub fn write_attempts(&self, id: &str) -> usize {
        self.write_log.lock().iter().filter(|(_, i)| i == id).count()
    }

    /// Returns the features attached to each served query.
    pub fn query_features(&self) -> Vec<Features> {
        self.query_log.lock().clone()
    }

    /// Returns a server row for inspection, including soft-deleted rows.
    pub fn row(&self, table: &str, id: &str) -> Option<Record> {
        self.tables
            .lock()
            .get(&table.to_ascii_lowercase())
            .and_then(|t| t.get(id))
            .cloned()
    }

    /// Seeds server rows directly, stamping version and `updatedAt`.
    pub fn seed(&self, table: &str, rows: Vec<Record>) {
        let mut tables = self.tables.lock();
        let entries = tables.entry(table.to_ascii_lowercase()).or_default();
        for mut row in rows {
            let id = row
                .get(sys::ID)
                .and_then(Value::as_str)
                .expect("seeded rows need an id")
                .to_string();
            self.stamp(&mut row);
            entries.insert(id, row);
        }
    }

    /// Overwrites a server row's version, for conflict setups in tests.
    pub fn set_version(&self, table: &str, id: &str, version: &str) {
        if let Some(row) = self
            .tables
            .lock()
            .get_mut(&table.to_ascii_lowercase())
            .and_then(|t| t.get_mut(id))
        {
            row.insert(sys::VERSION.into(), Value::String(version.into()));
        }
    }

    fn stamp(&self, row: &mut Record) {
        let mut clock = self.clock.lock();
        *clock += 1;
        let version = row
            .get(sys::VERSION)
            .and_then(Value::as_str)
            .and_then(|v| v.parse::<u64>().ok())
            .unwrap_or(0)
            + 1;
        row.insert(sys::VERSION.into(), Value::String(version.to_string()));
        row.insert(
            sys::UPDATED_AT.into(),
            Value::String(Self::timestamp(*clock)),
        );
        row.entry(sys::DELETED.to_string())
            .or_insert(Value::Bool(false));
    }

    fn timestamp(tick: i64) -> String {
        let base: DateTime<Utc> = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        (base + Duration::milliseconds(tick)).to_rfc3339_opts(SecondsFormat::Millis, true)
    }

    fn take_injected(&self) -> Option<RemoteError> {
        self.injected.lock().pop_front()
    }

    // Records the write and pops any injected failure for it.
    fn begin_write(&self, op: &'static str, id: &str) -> Option<RemoteError> {
        self.write_log.lock().push((op, id.to_string()));
        if let Some(queued) = self.injected_for.lock().get_mut(id) {
            if let Some(error) = queued.pop_front() {
                return Some(error);
            }
        }
        self.take_injected()
    }

    fn version_matches(row: &Record, version: Option<&str>) -> bool {
        match version {
            None => true,
            Some(v) => row.get(sys::VERSION).and_then(Value::as_str) == Some(v),
        }
    }
}

#[async_trait]
impl RemoteClient for MemoryRemote {
    async fn insert(
        &self,
        table: &str,
        record: Record,
        _features: Features,
    ) -> RemoteResult<Record> {
        let id = record
            .get(sys::ID)
            .and_then(Value::as_str)
            .ok_or_else(|| RemoteError::Status {
                status: 400,
                message: "record has no id".into(),
            })?
            .to_string();
        if let Some(error) = self.begin_write("insert", &id) {
            return Err(error);
        }

        let mut tables = self.tables.lock();
        let entries = tables.entry(table.to_ascii_lowercase()).or_default();
        if entries.contains_key(&id) {
            return Err(RemoteError::ItemAlreadyExists {
                table: table.to_string(),
                item_id: id.clone(),
                server_record: entries.get(&id).cloned(),
            });
        }

        let mut row = record;
        row.remove(sys::VERSION);
        self.stamp(&mut row);
        entries.insert(id.clone(), row.clone());
        Ok(row)
    }

    async fn update(
        &self,
        table: &str,
        record: Record,
        version: Option<&str>,
        _features: Features,
    ) -> RemoteResult<Record> {
        let id = record
            .get(sys::ID)
            .and_then(Value::as_str)
            .ok_or_else(|| RemoteError::Status {
                status: 400,
                message: "record has no id".into(),
            })?
            .to_string();
        if let Some(error) = self.begin_write("update", &id) {
            return Err(error);
        }

        let mut tables = self.tables.lock();
        let entries = tables.entry(table.to_ascii_lowercase()).or_default();
        let Some(row) = entries.get_mut(&id) else {
            return Err(RemoteError::NotFound {
                table: table.to_string(),
                item_id: id,
            });
        };

        if !Self::version_matches(row, version) {
            return Err(RemoteError::PreconditionFailed {
                table: table.to_string(),
                item_id: id,
                server_record: Some(row.clone()),
            });
        }

        for (column, value) in record {
            if column != sys::VERSION && column != sys::UPDATED_AT {
                row.insert(column, value);
            }
        }
        let mut updated = row.clone();
        self.stamp(&mut updated);
        *row = updated.clone();
        Ok(updated)
    }

    async fn delete(
        &self,
        table: &str,
        id: &str,
        version: Option<&str>,
        _features: Features,
    ) -> RemoteResult<()> {
        if let Some(error) = self.begin_write("delete", id) {
            return Err(error);
        }

        let mut tables = self.tables.lock();
        let entries = tables.entry(table.to_ascii_lowercase()).or_default();
        let Some(row) = entries.get_mut(id) else {
            return Err(RemoteError::NotFound {
                table: table.to_string(),
                item_id: id.to_string(),
            });
        };

        if !Self::version_matches(row, version) {
            return Err(RemoteError::PreconditionFailed {
                table: table.to_string(),
                item_id: id.to_string(),
                server_record: Some(row.clone()),
            });
        }

        row.insert(sys::DELETED.into(), Value::Bool(true));
        let mut updated = row.clone();
        self.stamp(&mut updated);
        *row = updated;
        Ok(())
    }

    async fn query(
        &self,
        query: &Query,
        include_deleted: bool,
        features: Features,
    ) -> RemoteResult<QueryPage> {
        self.query_log.lock().push(features);

        let served = self.query_log.lock().len();
        let positional = {
            let mut slot = self.fail_query_at.lock();
            match slot.take() {
                Some((n, error)) if n == served => Some(error),
                other => {
                    *slot = other;
                    None
                }
            }
        };
        if let Some(error) = positional.or_else(|| self.take_injected()) {
            return Err(error);
        }

        let tables = self.tables.lock();
        let rows: Vec<Record> = tables
            .get(&query.table().to_ascii_lowercase())
            .map(|t| t.values().cloned().collect())
            .unwrap_or_default();

        let visible = rows.into_iter().filter(|row| {
            include_deleted || row.get(sys::DELETED) != Some(&Value::Bool(true))
        });

        // Apply filtering and ordering, then page by hand so we can report
        // whether rows remain past the requested window.
        let mut unpaged = Query::new(query.table());
        if let Some(filter) = query.filter() {
            unpaged = unpaged.with_filter(filter.clone());
        }
        for (column, dir) in query.ordering() {
            unpaged = unpaged.order_by(column.clone(), *dir);
        }
        let sorted = unpaged.apply(visible);

        let total = sorted.len();
        let skip = query.skip().unwrap_or(0) as usize;
        let take = query.take().map(|t| t as usize).unwrap_or(usize::MAX);
        let records: Vec<Record> = sorted.into_iter().skip(skip).take(take).collect();
        let has_more = skip + records.len() < total;

        Ok(QueryPage { records, has_more })
    }
}
