//! # Tidemark Store
//!
//! Local table store contract and in-memory reference store for Tidemark.
//!
//! This crate defines the storage surface the sync engine consumes:
//! - Typed table schemas and value normalization ([`TableSchema`],
//!   [`ColumnType`])
//! - A small query model evaluated against rows ([`Query`], [`Filter`])
//! - The [`LocalStore`] trait with atomic multi-statement batches
//! - [`MemoryStore`], the in-memory reference implementation
//!
//! ## Design Principles
//!
//! - The store is **table-oriented**: rows are flat JSON records validated
//!   against a declared schema on every write.
//! - Table and column name matching is case-insensitive.
//! - `execute_batch` is all-or-nothing; the sync engine relies on this to
//!   couple data writes with operation-log writes.
//! - The on-disk format is an implementor concern; nothing in the contract
//!   assumes one.
//!
//! ## Example
//!
//! ```rust
//! use tidemark_store::{ColumnType, LocalStore, MemoryStore, StoreResult, TableSchema};
//! use serde_json::json;
//!
//! async fn example() -> StoreResult<()> {
//!     let store = MemoryStore::new();
//!     store
//!         .define_table(
//!             TableSchema::new("todoitem")
//!                 .with_column("id", ColumnType::String)
//!                 .with_column("text", ColumnType::String),
//!         )
//!         .await?;
//!
//!     let row = json!({"id": "1", "text": "buy milk"});
//!     store
//!         .upsert("todoitem", vec![row.as_object().unwrap().clone()])
//!         .await?;
//!     Ok(())
//! }
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod error;
mod memory;
mod query;
mod schema;
mod store;
mod types;

pub use error::{StoreError, StoreResult};
pub use memory::MemoryStore;
pub use query::{compare_values, Filter, Query, SortDir};
pub use schema::{ColumnDef, ColumnType, TableSchema};
pub use store::{BatchOp, LocalStore};
pub use types::{record_id, sys, validate_id, Record, MAX_ID_LENGTH};
