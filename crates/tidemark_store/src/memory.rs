//! In-memory local store.

use crate::error::{StoreError, StoreResult};
use crate::query::Query;
use crate::schema::TableSchema;
use crate::store::{BatchOp, LocalStore};
use crate::types::{sys, Record};
use async_trait::async_trait;
use parking_lot::RwLock;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};

// Rows are keyed by their id rendered as a string; integer ids (the
// operation log) key by their decimal form.
fn row_key(row: &Record) -> StoreResult<String> {
    match row.get(sys::ID) {
        Some(Value::String(s)) => Ok(s.clone()),
        Some(Value::Number(n)) if n.is_i64() => Ok(n.to_string()),
        _ => Err(StoreError::InvalidId {
            reason: format!("record has no usable {} property", sys::ID),
        }),
    }
}

struct TableData {
    schema: TableSchema,
    // Rows stored in serialized (normalized) form, keyed by id.
    rows: BTreeMap<String, Record>,
}

/// An in-memory [`LocalStore`].
///
/// This store keeps all tables in memory and is suitable for:
/// - Unit and integration tests
/// - Ephemeral clients that do not need persistence across restarts
///
/// Tables are keyed case-insensitively. All mutations validate records
/// against the table schema before anything is applied, so a failed batch
/// leaves the store untouched.
///
/// # Thread Safety
///
/// The store is thread-safe and can be shared across tasks.
#[derive(Default)]
pub struct MemoryStore {
    tables: RwLock<HashMap<String, TableData>>,
}

impl MemoryStore {
    /// Creates a new empty in-memory store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the number of rows in a table, for inspection in tests.
    pub fn row_count(&self, table: &str) -> usize {
        self.tables
            .read()
            .get(&table.to_ascii_lowercase())
            .map_or(0, |t| t.rows.len())
    }

    fn serialize_into(
        tables: &HashMap<String, TableData>,
        table: &str,
        record: &Record,
    ) -> StoreResult<(String, String, Record)> {
        let key = table.to_ascii_lowercase();
        let data = tables.get(&key).ok_or_else(|| StoreError::TableNotDefined {
            name: table.to_string(),
        })?;

        let row = data.schema.serialize(record)?;
        let id = row_key(&row)?;

        Ok((key, id, row))
    }

    fn resolve<'a>(
        tables: &'a HashMap<String, TableData>,
        table: &str,
    ) -> StoreResult<&'a TableData> {
        tables
            .get(&table.to_ascii_lowercase())
            .ok_or_else(|| StoreError::TableNotDefined {
                name: table.to_string(),
            })
    }
}

#[async_trait]
impl LocalStore for MemoryStore {
    async fn define_table(&self, schema: TableSchema) -> StoreResult<()> {
        schema.validate()?;

        let mut tables = self.tables.write();
        let key = schema.name().to_ascii_lowercase();
        match tables.get_mut(&key) {
            Some(existing) => existing.schema = schema,
            None => {
                tables.insert(
                    key,
                    TableData {
                        schema,
                        rows: BTreeMap::new(),
                    },
                );
            }
        }
        Ok(())
    }

    async fn upsert(&self, table: &str, rows: Vec<Record>) -> StoreResult<()> {
        let ops = rows
            .into_iter()
            .map(|row| BatchOp::Upsert {
                table: table.to_string(),
                row,
            })
            .collect();
        self.execute_batch(ops).await
    }

    async fn lookup(&self, table: &str, id: &str) -> StoreResult<Option<Record>> {
        let tables = self.tables.read();
        let data = Self::resolve(&tables, table)?;
        Ok(data.rows.get(id).map(|row| data.schema.deserialize(row)))
    }

    async fn read(&self, query: &Query) -> StoreResult<Vec<Record>> {
        let tables = self.tables.read();
        let data = Self::resolve(&tables, query.table())?;
        let records = data.rows.values().map(|row| data.schema.deserialize(row));
        Ok(query.apply(records))
    }

    async fn delete(&self, table: &str, ids: &[String]) -> StoreResult<()> {
        let mut tables = self.tables.write();
        let key = table.to_ascii_lowercase();
        let data = tables
            .get_mut(&key)
            .ok_or_else(|| StoreError::TableNotDefined {
                name: table.to_string(),
            })?;
        for id in ids {
            data.rows.remove(id);
        }
        Ok(())
    }

    async fn delete_matching(&self, query: &Query) -> StoreResult<u64> {
        let mut tables = self.tables.write();
        let key = query.table().to_ascii_lowercase();
        let data = tables
            .get_mut(&key)
            .ok_or_else(|| StoreError::TableNotDefined {
                name: query.table().to_string(),
            })?;

        let matching: Vec<String> = data
            .rows
            .iter()
            .filter(|(_, row)| {
                let record = data.schema.deserialize(row);
                query.filter().is_none_or(|f| f.matches(&record))
            })
            .map(|(id, _)| id.clone())
            .collect();

        for id in &matching {
            data.rows.remove(id);
        }
        Ok(matching.len() as u64)
    }

    async fn execute_batch(&self, ops: Vec<BatchOp>) -> StoreResult<()> {
        let mut tables = self.tables.write();

        // Validate and serialize everything up front so the mutation phase
        // cannot fail part way through.
        enum Planned {
            Upsert(String, String, Record),
            Delete(String, String),
        }

        let mut planned = Vec::with_capacity(ops.len());
        for op in &ops {
            match op {
                BatchOp::Upsert { table, row } => {
                    let (key, id, serialized) = Self::serialize_into(&tables, table, row)?;
                    planned.push(Planned::Upsert(key, id, serialized));
                }
                BatchOp::Delete { table, id } => {
                    Self::resolve(&tables, table)?;
                    planned.push(Planned::Delete(table.to_ascii_lowercase(), id.clone()));
                }
            }
        }

        for op in planned {
            match op {
                Planned::Upsert(key, id, row) => {
                    let data = tables.get_mut(&key).expect("validated above");
                    match data.rows.get_mut(&id) {
                        Some(existing) => {
                            for (column, value) in row {
                                existing.insert(column, value);
                            }
                        }
                        None => {
                            data.rows.insert(id, row);
                        }
                    }
                }
                Planned::Delete(key, id) => {
                    let data = tables.get_mut(&key).expect("validated above");
                    data.rows.remove(&id);
                }
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::{Filter, SortDir};
    use crate::schema::ColumnType;
    use serde_json::json;

    async fn store_with_table() -> MemoryStore {
        let store = MemoryStore::new();
        let schema = TableSchema::new("TodoItem")
            .with_column("id", ColumnType::String)
            .with_column("text", ColumnType::String)
            .with_column("count", ColumnType::Integer);
        store.define_table(schema).await.unwrap();
        store
    }

    fn rec(value: serde_json::Value) -> Record {
        value.as_object().unwrap().clone()
    }

    #[tokio::test]
    async fn upsert_and_lookup() {
        let store = store_with_table().await;
        store
            .upsert("todoitem", vec![rec(json!({"id": "1", "text": "a"}))])
            .await
            .unwrap();

        let row = store.lookup("TODOITEM", "1").await.unwrap().unwrap();
        assert_eq!(row.get("text"), Some(&json!("a")));
        assert_eq!(row.get("count"), Some(&json!(null)));

        assert!(store.lookup("todoitem", "2").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn upsert_merges_existing_rows() {
        let store = store_with_table().await;
        store
            .upsert(
                "todoitem",
                vec![rec(json!({"id": "1", "text": "a", "count": 1}))],
            )
            .await
            .unwrap();
        store
            .upsert("todoitem", vec![rec(json!({"id": "1", "count": 2}))])
            .await
            .unwrap();

        let row = store.lookup("todoitem", "1").await.unwrap().unwrap();
        assert_eq!(row.get("text"), Some(&json!("a")));
        assert_eq!(row.get("count"), Some(&json!(2)));
    }

    #[tokio::test]
    async fn lookup_on_undefined_table_fails() {
        let store = MemoryStore::new();
        assert!(matches!(
            store.lookup("nope", "1").await,
            Err(StoreError::TableNotDefined { .. })
        ));
    }

    #[tokio::test]
    async fn read_with_filter_and_order() {
        let store = store_with_table().await;
        store
            .upsert(
                "todoitem",
                vec![
                    rec(json!({"id": "1", "count": 3})),
                    rec(json!({"id": "2", "count": 1})),
                    rec(json!({"id": "3", "count": 2})),
                ],
            )
            .await
            .unwrap();

        let query = Query::new("todoitem")
            .with_filter(Filter::Ge("count".into(), json!(2)))
            .order_by("count", SortDir::Desc);
        let rows = store.read(&query).await.unwrap();
        let ids: Vec<_> = rows.iter().map(|r| r["id"].clone()).collect();
        assert_eq!(ids, vec![json!("1"), json!("3")]);
    }

    #[tokio::test]
    async fn delete_ignores_missing_ids() {
        let store = store_with_table().await;
        store
            .upsert("todoitem", vec![rec(json!({"id": "1"}))])
            .await
            .unwrap();
        store
            .delete("todoitem", &["1".into(), "missing".into()])
            .await
            .unwrap();
        assert_eq!(store.row_count("todoitem"), 0);
    }

    #[tokio::test]
    async fn delete_matching_removes_only_matches() {
        let store = store_with_table().await;
        store
            .upsert(
                "todoitem",
                vec![
                    rec(json!({"id": "1", "count": 1})),
                    rec(json!({"id": "2", "count": 2})),
                ],
            )
            .await
            .unwrap();

        let removed = store
            .delete_matching(&Query::new("todoitem").with_filter(Filter::Eq("count".into(), json!(2))))
            .await
            .unwrap();
        assert_eq!(removed, 1);
        assert!(store.lookup("todoitem", "1").await.unwrap().is_some());
        assert!(store.lookup("todoitem", "2").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn batch_is_all_or_nothing() {
        let store = store_with_table().await;
        store
            .upsert("todoitem", vec![rec(json!({"id": "1", "text": "a"}))])
            .await
            .unwrap();

        // Second op references an undefined column, so the whole batch
        // must be rejected.
        let result = store
            .execute_batch(vec![
                BatchOp::delete("todoitem", "1"),
                BatchOp::upsert("todoitem", rec(json!({"id": "2", "bogus": true}))),
            ])
            .await;
        assert!(result.is_err());

        assert!(store.lookup("todoitem", "1").await.unwrap().is_some());
        assert!(store.lookup("todoitem", "2").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn batch_applies_mixed_operations() {
        let store = store_with_table().await;
        store
            .upsert("todoitem", vec![rec(json!({"id": "1", "text": "a"}))])
            .await
            .unwrap();

        store
            .execute_batch(vec![
                BatchOp::upsert("todoitem", rec(json!({"id": "2", "text": "b"}))),
                BatchOp::delete("todoitem", "1"),
            ])
            .await
            .unwrap();

        assert!(store.lookup("todoitem", "1").await.unwrap().is_none());
        assert!(store.lookup("todoitem", "2").await.unwrap().is_some());
    }
}
