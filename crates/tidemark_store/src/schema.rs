//! Table schemas and value normalization.
//!
//! Every table in the local store is defined by a [`TableSchema`]: a set of
//! named, typed columns. Writes are validated and normalized against the
//! schema ([`TableSchema::serialize`]); reads materialize every declared
//! column, substituting `null` for columns the stored row does not carry
//! ([`TableSchema::deserialize`]). Column name matching is case-insensitive
//! throughout.

use crate::error::{StoreError, StoreResult};
use crate::types::{sys, validate_id, Record};
use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// The type of a table column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ColumnType {
    /// UTF-8 text.
    String,
    /// 64-bit signed integer.
    Integer,
    /// 64-bit float.
    Float,
    /// Boolean.
    Boolean,
    /// An RFC 3339 timestamp, normalized to UTC with millisecond precision.
    Date,
    /// A nested JSON object.
    Object,
    /// A JSON array.
    Array,
}

impl fmt::Display for ColumnType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ColumnType::String => "string",
            ColumnType::Integer => "integer",
            ColumnType::Float => "float",
            ColumnType::Boolean => "boolean",
            ColumnType::Date => "date",
            ColumnType::Object => "object",
            ColumnType::Array => "array",
        };
        f.write_str(name)
    }
}

/// A named, typed column.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnDef {
    /// Column name, as declared.
    pub name: String,
    /// Column type.
    pub column_type: ColumnType,
}

/// The definition of a local table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableSchema {
    name: String,
    columns: Vec<ColumnDef>,
}

impl TableSchema {
    /// Creates a schema for the named table with no columns.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            columns: Vec::new(),
        }
    }

    /// Adds a column to the schema.
    pub fn with_column(mut self, name: impl Into<String>, column_type: ColumnType) -> Self {
        self.columns.push(ColumnDef {
            name: name.into(),
            column_type,
        });
        self
    }

    /// Returns the table name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns the declared columns.
    pub fn columns(&self) -> &[ColumnDef] {
        &self.columns
    }

    /// Finds a column by case-insensitive name.
    pub fn column(&self, name: &str) -> Option<&ColumnDef> {
        self.columns
            .iter()
            .find(|c| c.name.eq_ignore_ascii_case(name))
    }

    /// Checks that the schema is usable: a non-empty table name, a string
    /// `id` column, and no duplicate column names.
    pub fn validate(&self) -> StoreResult<()> {
        if self.name.is_empty() {
            return Err(StoreError::InvalidTableDefinition {
                table: self.name.clone(),
                reason: "table name is empty".into(),
            });
        }

        match self.column(sys::ID) {
            Some(col)
                if col.column_type == ColumnType::String
                    || col.column_type == ColumnType::Integer => {}
            Some(_) => {
                return Err(StoreError::InvalidTableDefinition {
                    table: self.name.clone(),
                    reason: "id column must be of type string or integer".into(),
                })
            }
            None => {
                return Err(StoreError::InvalidTableDefinition {
                    table: self.name.clone(),
                    reason: "schema must define an id column".into(),
                })
            }
        }

        for (i, col) in self.columns.iter().enumerate() {
            if self.columns[..i]
                .iter()
                .any(|c| c.name.eq_ignore_ascii_case(&col.name))
            {
                return Err(StoreError::InvalidTableDefinition {
                    table: self.name.clone(),
                    reason: format!("duplicate column {}", col.name),
                });
            }
        }

        Ok(())
    }

    /// Validates and normalizes a record for storage.
    ///
    /// Every key in the record must match a declared column
    /// (case-insensitively); the stored row uses the declared casing. Values
    /// are checked against the column type; `Date` values are normalized to
    /// UTC RFC 3339 with millisecond precision. The `id` value is validated
    /// if present.
    pub fn serialize(&self, record: &Record) -> StoreResult<Record> {
        let mut row = Record::new();

        for (key, value) in record {
            let col = self
                .column(key)
                .ok_or_else(|| StoreError::ColumnNotDefined {
                    table: self.name.clone(),
                    column: key.clone(),
                })?;

            if col.name.eq_ignore_ascii_case(sys::ID)
                && col.column_type == ColumnType::String
                && !value.is_null()
            {
                validate_id(value)?;
            }

            let normalized = normalize_value(&col.name, col.column_type, value)?;
            row.insert(col.name.clone(), normalized);
        }

        Ok(row)
    }

    /// Materializes a stored row as a full record.
    ///
    /// Every declared column is present in the result; columns the stored
    /// row does not carry become `null`.
    pub fn deserialize(&self, row: &Record) -> Record {
        let mut record = Record::new();
        for col in &self.columns {
            let value = row.get(&col.name).cloned().unwrap_or(Value::Null);
            record.insert(col.name.clone(), value);
        }
        record
    }
}

fn normalize_value(column: &str, column_type: ColumnType, value: &Value) -> StoreResult<Value> {
    if value.is_null() {
        return Ok(Value::Null);
    }

    let ok = match column_type {
        ColumnType::String => value.is_string(),
        ColumnType::Integer => value.as_i64().is_some(),
        ColumnType::Float => value.is_number(),
        ColumnType::Boolean => value.is_boolean(),
        ColumnType::Object => value.is_object(),
        ColumnType::Array => value.is_array(),
        ColumnType::Date => {
            let Some(text) = value.as_str() else {
                return Err(invalid_value(column, column_type, value));
            };
            let parsed: DateTime<Utc> = text
                .parse()
                .map_err(|_| invalid_value(column, column_type, value))?;
            return Ok(Value::String(
                parsed.to_rfc3339_opts(SecondsFormat::Millis, true),
            ));
        }
    };

    if ok {
        Ok(value.clone())
    } else {
        Err(invalid_value(column, column_type, value))
    }
}

fn invalid_value(column: &str, column_type: ColumnType, value: &Value) -> StoreError {
    StoreError::InvalidColumnValue {
        column: column.to_string(),
        expected: column_type.to_string(),
        value: value.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn item_schema() -> TableSchema {
        TableSchema::new("todoitem")
            .with_column("id", ColumnType::String)
            .with_column("text", ColumnType::String)
            .with_column("count", ColumnType::Integer)
            .with_column("score", ColumnType::Float)
            .with_column("done", ColumnType::Boolean)
            .with_column("due", ColumnType::Date)
            .with_column("tags", ColumnType::Array)
            .with_column("extra", ColumnType::Object)
    }

    fn as_record(value: serde_json::Value) -> Record {
        value.as_object().unwrap().clone()
    }

    #[test]
    fn schema_requires_id_column() {
        let schema = TableSchema::new("t").with_column("text", ColumnType::String);
        assert!(schema.validate().is_err());

        let schema = TableSchema::new("t").with_column("id", ColumnType::Boolean);
        assert!(schema.validate().is_err());

        // String and integer ids are both accepted.
        let schema = TableSchema::new("t").with_column("id", ColumnType::Integer);
        assert!(schema.validate().is_ok());
        assert!(item_schema().validate().is_ok());
    }

    #[test]
    fn schema_rejects_duplicate_columns() {
        let schema = TableSchema::new("t")
            .with_column("id", ColumnType::String)
            .with_column("Text", ColumnType::String)
            .with_column("text", ColumnType::String);
        assert!(schema.validate().is_err());
    }

    #[test]
    fn serialize_rejects_undefined_column() {
        let schema = item_schema();
        let record = as_record(json!({"id": "1", "bogus": 1}));
        assert!(matches!(
            schema.serialize(&record),
            Err(StoreError::ColumnNotDefined { .. })
        ));
    }

    #[test]
    fn serialize_is_case_insensitive_on_columns() {
        let schema = item_schema();
        let record = as_record(json!({"ID": "1", "TEXT": "hello"}));
        let row = schema.serialize(&record).unwrap();
        assert_eq!(row.get("id"), Some(&json!("1")));
        assert_eq!(row.get("text"), Some(&json!("hello")));
    }

    #[test]
    fn serialize_validates_types() {
        let schema = item_schema();
        assert!(schema
            .serialize(&as_record(json!({"id": "1", "count": "nope"})))
            .is_err());
        assert!(schema
            .serialize(&as_record(json!({"id": "1", "done": 1})))
            .is_err());
        assert!(schema
            .serialize(&as_record(json!({"id": "1", "due": "not a date"})))
            .is_err());
        assert!(schema
            .serialize(&as_record(json!({"id": 5})))
            .is_err());
    }

    #[test]
    fn serialize_normalizes_dates_to_utc_millis() {
        let schema = item_schema();
        let record = as_record(json!({"id": "1", "due": "2024-03-01T10:30:00+02:00"}));
        let row = schema.serialize(&record).unwrap();
        assert_eq!(row.get("due"), Some(&json!("2024-03-01T08:30:00.000Z")));
    }

    #[test]
    fn roundtrip_preserves_all_supported_types() {
        let schema = item_schema();
        let record = as_record(json!({
            "id": "item-1",
            "text": "buy milk",
            "count": 3,
            "score": 1.5,
            "done": false,
            "due": "2024-03-01T08:30:00.000Z",
            "tags": ["a", "b"],
            "extra": {"nested": true}
        }));

        let row = schema.serialize(&record).unwrap();
        assert_eq!(schema.deserialize(&row), record);
    }

    #[test]
    fn roundtrip_preserves_nulls_for_every_type() {
        let schema = item_schema();
        let record = as_record(json!({
            "id": "item-1",
            "text": null,
            "count": null,
            "score": null,
            "done": null,
            "due": null,
            "tags": null,
            "extra": null
        }));

        let row = schema.serialize(&record).unwrap();
        assert_eq!(schema.deserialize(&row), record);
    }

    mod roundtrip_properties {
        use super::*;
        use chrono::TimeZone;
        use proptest::prelude::*;

        // Values already in normalized form for each column type, plus
        // null for every one of them.
        fn column_value(column_type: ColumnType) -> BoxedStrategy<Value> {
            let non_null = match column_type {
                ColumnType::String => "[a-zA-Z0-9 ]{0,20}".prop_map(Value::String).boxed(),
                ColumnType::Integer => any::<i64>().prop_map(|n| json!(n)).boxed(),
                ColumnType::Float => any::<i32>()
                    .prop_map(|n| json!(f64::from(n) / 8.0))
                    .boxed(),
                ColumnType::Boolean => any::<bool>().prop_map(Value::Bool).boxed(),
                ColumnType::Date => (0i64..4_000_000_000i64)
                    .prop_map(|ms| {
                        let time = chrono::Utc.timestamp_millis_opt(ms).unwrap();
                        json!(time.to_rfc3339_opts(SecondsFormat::Millis, true))
                    })
                    .boxed(),
                ColumnType::Object => "[a-z]{0,8}".prop_map(|s| json!({ "k": s })).boxed(),
                ColumnType::Array => proptest::collection::vec(any::<i64>(), 0..4)
                    .prop_map(|v| json!(v))
                    .boxed(),
            };
            prop_oneof![non_null, Just(Value::Null)].boxed()
        }

        proptest! {
            #[test]
            fn serialize_deserialize_is_identity(
                text in column_value(ColumnType::String),
                count in column_value(ColumnType::Integer),
                score in column_value(ColumnType::Float),
                done in column_value(ColumnType::Boolean),
                due in column_value(ColumnType::Date),
                tags in column_value(ColumnType::Array),
                extra in column_value(ColumnType::Object),
            ) {
                let schema = item_schema();
                let mut record = Record::new();
                record.insert("id".into(), json!("item-1"));
                record.insert("text".into(), text);
                record.insert("count".into(), count);
                record.insert("score".into(), score);
                record.insert("done".into(), done);
                record.insert("due".into(), due);
                record.insert("tags".into(), tags);
                record.insert("extra".into(), extra);

                let row = schema.serialize(&record).unwrap();
                prop_assert_eq!(schema.deserialize(&row), record);
            }
        }
    }

    #[test]
    fn missing_columns_become_null() {
        let schema = item_schema();
        let record = as_record(json!({"id": "item-1"}));
        let row = schema.serialize(&record).unwrap();
        let read = schema.deserialize(&row);

        assert_eq!(read.get("id"), Some(&json!("item-1")));
        for col in ["text", "count", "score", "done", "due", "tags", "extra"] {
            assert_eq!(read.get(col), Some(&Value::Null), "column {col}");
        }
    }
}
