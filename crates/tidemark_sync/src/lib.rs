//! # Tidemark Sync
//!
//! Offline sync engine for Tidemark.
//!
//! This crate provides:
//! - The operation log: one pending mutation per item, with coalescing and
//!   a lock protocol around in-flight pushes
//! - Push: replaying local changes with conflict detection, per-item
//!   isolation, and bounded retry
//! - Pull: paging remote changes into the local store, with persisted
//!   watermarks for incremental resumption
//! - Purge: bulk local eviction coordinated with the log
//! - [`SyncContext`], the façade that serializes everything through a
//!   single pair of task queues
//!
//! ## Architecture
//!
//! The engine consumes two contracts: the local table store
//! ([`tidemark_store::LocalStore`]) and the remote table service
//! ([`RemoteClient`]). Local writes couple their data mutation and their
//! operation-log record in one atomic store batch; push drains the log in
//! id order, one item at a time; pull never overwrites items with pending
//! local operations.
//!
//! ## Key Invariants
//!
//! - Log entry ids are strictly increasing and never renumbered
//! - At most one log entry per (table, item), except across a locked entry
//! - A locked entry is never mutated by new local writes
//! - The watermark only advances after its page is fully ingested
//!
//! ## Example
//!
//! ```rust
//! use std::sync::Arc;
//! use serde_json::json;
//! use tidemark_store::{ColumnType, LocalStore, MemoryStore, TableSchema};
//! use tidemark_sync::{MemoryRemote, SyncConfig, SyncContext, SyncResult};
//!
//! async fn example() -> SyncResult<()> {
//!     let store = Arc::new(MemoryStore::new());
//!     store
//!         .define_table(
//!             TableSchema::new("todoitem")
//!                 .with_column("id", ColumnType::String)
//!                 .with_column("text", ColumnType::String)
//!                 .with_column("version", ColumnType::String)
//!                 .with_column("updatedAt", ColumnType::Date)
//!                 .with_column("deleted", ColumnType::Boolean),
//!         )
//!         .await?;
//!
//!     let context = SyncContext::new(store, Arc::new(MemoryRemote::new()), SyncConfig::new());
//!     context.initialize().await?;
//!
//!     let item = json!({"text": "buy milk"}).as_object().unwrap().clone();
//!     let item = context.insert("todoitem", item).await?;
//!     let conflicts = context.push().await?;
//!     assert!(conflicts.is_empty());
//!     let _ = item;
//!     Ok(())
//! }
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod config;
mod context;
mod error;
mod operations;
mod pull;
mod purge;
mod push;
mod push_error;
mod queue;
mod remote;

pub use config::{PullSettings, SyncConfig};
pub use context::SyncContext;
pub use error::{SyncError, SyncResult};
pub use operations::{
    Action, LogEntry, OpMetadata, OperationLog, OPERATIONS_TABLE, PULLTIME_TABLE, SEQUENCES_TABLE,
};
pub use push_error::{PushError, PushPolicy, Resolution};
pub use remote::{Features, MemoryRemote, QueryPage, RemoteClient, RemoteError, RemoteResult};
