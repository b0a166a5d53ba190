//! Query model for reading and deleting table rows.
//!
//! Queries carry a target table, an optional [`Filter`] tree, an ordering,
//! and skip/take paging. The filter algebra is deliberately small: it is
//! what the sync engine and applications need to express row selection, not
//! a general query language. Column name matching is case-insensitive.

use crate::types::Record;
use serde_json::Value;
use std::cmp::Ordering;

/// Sort direction for an ordering clause.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortDir {
    /// Ascending.
    Asc,
    /// Descending.
    Desc,
}

/// A row predicate.
#[derive(Debug, Clone, PartialEq)]
pub enum Filter {
    /// Column equals value.
    Eq(String, Value),
    /// Column does not equal value.
    Ne(String, Value),
    /// Column is greater than value.
    Gt(String, Value),
    /// Column is greater than or equal to value.
    Ge(String, Value),
    /// Column is less than value.
    Lt(String, Value),
    /// Column is less than or equal to value.
    Le(String, Value),
    /// All sub-filters match.
    And(Vec<Filter>),
    /// Any sub-filter matches.
    Or(Vec<Filter>),
    /// The sub-filter does not match.
    Not(Box<Filter>),
}

impl Filter {
    /// Evaluates the filter against a record.
    pub fn matches(&self, record: &Record) -> bool {
        match self {
            Filter::Eq(column, value) => values_equal(field(record, column), value),
            Filter::Ne(column, value) => !values_equal(field(record, column), value),
            Filter::Gt(column, value) => ordered(field(record, column), value, Ordering::Greater),
            Filter::Ge(column, value) => {
                let lhs = field(record, column);
                ordered(lhs, value, Ordering::Greater) || values_equal(lhs, value)
            }
            Filter::Lt(column, value) => ordered(field(record, column), value, Ordering::Less),
            Filter::Le(column, value) => {
                let lhs = field(record, column);
                ordered(lhs, value, Ordering::Less) || values_equal(lhs, value)
            }
            Filter::And(filters) => filters.iter().all(|f| f.matches(record)),
            Filter::Or(filters) => filters.iter().any(|f| f.matches(record)),
            Filter::Not(filter) => !filter.matches(record),
        }
    }

    /// Combines this filter with another under `And`.
    pub fn and(self, other: Filter) -> Filter {
        match self {
            Filter::And(mut filters) => {
                filters.push(other);
                Filter::And(filters)
            }
            f => Filter::And(vec![f, other]),
        }
    }
}

fn field<'a>(record: &'a Record, column: &str) -> &'a Value {
    record
        .iter()
        .find(|(k, _)| k.eq_ignore_ascii_case(column))
        .map(|(_, v)| v)
        .unwrap_or(&Value::Null)
}

fn values_equal(a: &Value, b: &Value) -> bool {
    match (a.as_f64(), b.as_f64()) {
        (Some(x), Some(y)) => x == y,
        _ => a == b,
    }
}

/// Compares two values, returning `None` for incomparable pairs.
///
/// Numbers compare numerically, strings lexicographically (normalized
/// RFC 3339 dates therefore compare chronologically), booleans as
/// `false < true`. `null` compares less than any non-null value.
pub fn compare_values(a: &Value, b: &Value) -> Option<Ordering> {
    match (a, b) {
        (Value::Null, Value::Null) => Some(Ordering::Equal),
        (Value::Null, _) => Some(Ordering::Less),
        (_, Value::Null) => Some(Ordering::Greater),
        (Value::String(x), Value::String(y)) => Some(x.cmp(y)),
        (Value::Bool(x), Value::Bool(y)) => Some(x.cmp(y)),
        _ => match (a.as_f64(), b.as_f64()) {
            (Some(x), Some(y)) => x.partial_cmp(&y),
            _ => None,
        },
    }
}

fn ordered(a: &Value, b: &Value, expected: Ordering) -> bool {
    compare_values(a, b) == Some(expected)
}

/// A query against a single table.
#[derive(Debug, Clone, PartialEq)]
pub struct Query {
    table: String,
    filter: Option<Filter>,
    ordering: Vec<(String, SortDir)>,
    skip: Option<u64>,
    take: Option<u64>,
}

impl Query {
    /// Creates a query selecting all rows of the named table.
    pub fn new(table: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            filter: None,
            ordering: Vec::new(),
            skip: None,
            take: None,
        }
    }

    /// Restricts the query with a filter, combining with any existing
    /// filter under `And`.
    pub fn with_filter(mut self, filter: Filter) -> Self {
        self.filter = Some(match self.filter.take() {
            Some(existing) => existing.and(filter),
            None => filter,
        });
        self
    }

    /// Appends an ordering clause.
    pub fn order_by(mut self, column: impl Into<String>, dir: SortDir) -> Self {
        self.ordering.push((column.into(), dir));
        self
    }

    /// Skips the first `n` matching rows.
    pub fn with_skip(mut self, n: u64) -> Self {
        self.skip = Some(n);
        self
    }

    /// Limits the result to `n` rows.
    pub fn with_take(mut self, n: u64) -> Self {
        self.take = Some(n);
        self
    }

    /// Returns the target table name.
    pub fn table(&self) -> &str {
        &self.table
    }

    /// Returns the filter, if any.
    pub fn filter(&self) -> Option<&Filter> {
        self.filter.as_ref()
    }

    /// Returns the ordering clauses.
    pub fn ordering(&self) -> &[(String, SortDir)] {
        &self.ordering
    }

    /// Returns the skip count, if any.
    pub fn skip(&self) -> Option<u64> {
        self.skip
    }

    /// Returns the take limit, if any.
    pub fn take(&self) -> Option<u64> {
        self.take
    }

    /// Applies the filter, ordering, and paging to an iterator of records.
    pub fn apply(&self, records: impl IntoIterator<Item = Record>) -> Vec<Record> {
        let mut rows: Vec<Record> = records
            .into_iter()
            .filter(|r| self.filter.as_ref().is_none_or(|f| f.matches(r)))
            .collect();

        if !self.ordering.is_empty() {
            rows.sort_by(|a, b| {
                for (column, dir) in &self.ordering {
                    let ord = compare_values(field(a, column), field(b, column))
                        .unwrap_or(Ordering::Equal);
                    let ord = match dir {
                        SortDir::Asc => ord,
                        SortDir::Desc => ord.reverse(),
                    };
                    if ord != Ordering::Equal {
                        return ord;
                    }
                }
                Ordering::Equal
            });
        }

        let skip = self.skip.unwrap_or(0) as usize;
        let take = self.take.map(|t| t as usize).unwrap_or(usize::MAX);
        rows.into_iter().skip(skip).take(take).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn row(id: &str, count: i64) -> Record {
        json!({"id": id, "count": count}).as_object().unwrap().clone()
    }

    #[test]
    fn filter_comparisons() {
        let r = row("a", 5);
        assert!(Filter::Eq("id".into(), json!("a")).matches(&r));
        assert!(Filter::Eq("ID".into(), json!("a")).matches(&r));
        assert!(!Filter::Eq("id".into(), json!("b")).matches(&r));
        assert!(Filter::Gt("count".into(), json!(4)).matches(&r));
        assert!(Filter::Ge("count".into(), json!(5)).matches(&r));
        assert!(Filter::Lt("count".into(), json!(6)).matches(&r));
        assert!(!Filter::Gt("count".into(), json!(5)).matches(&r));
    }

    #[test]
    fn filter_missing_column_is_null() {
        let r = row("a", 5);
        assert!(Filter::Eq("bogus".into(), Value::Null).matches(&r));
        assert!(!Filter::Gt("bogus".into(), json!(0)).matches(&r));
    }

    #[test]
    fn filter_combinators() {
        let r = row("a", 5);
        let f = Filter::Eq("id".into(), json!("a")).and(Filter::Gt("count".into(), json!(1)));
        assert!(f.matches(&r));

        let f = Filter::Or(vec![
            Filter::Eq("id".into(), json!("zzz")),
            Filter::Eq("count".into(), json!(5)),
        ]);
        assert!(f.matches(&r));

        assert!(!Filter::Not(Box::new(Filter::Eq("id".into(), json!("a")))).matches(&r));
    }

    #[test]
    fn date_strings_compare_chronologically() {
        let early = json!("2024-01-01T00:00:00.000Z");
        let late = json!("2024-06-01T00:00:00.000Z");
        assert_eq!(compare_values(&early, &late), Some(Ordering::Less));
    }

    #[test]
    fn query_orders_skips_and_takes() {
        let rows = vec![row("c", 3), row("a", 1), row("b", 2), row("d", 4)];
        let query = Query::new("t")
            .order_by("count", SortDir::Asc)
            .with_skip(1)
            .with_take(2);

        let result = query.apply(rows);
        let ids: Vec<_> = result.iter().map(|r| r["id"].clone()).collect();
        assert_eq!(ids, vec![json!("b"), json!("c")]);
    }

    #[test]
    fn query_filter_then_order_desc() {
        let rows = vec![row("a", 1), row("b", 2), row("c", 3)];
        let query = Query::new("t")
            .with_filter(Filter::Ge("count".into(), json!(2)))
            .order_by("count", SortDir::Desc);

        let result = query.apply(rows);
        let ids: Vec<_> = result.iter().map(|r| r["id"].clone()).collect();
        assert_eq!(ids, vec![json!("c"), json!("b")]);
    }
}
