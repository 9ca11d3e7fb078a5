//! Generic row representation and row filters.
//!
//! Rows cross the store boundary as JSON objects keyed by column name, so
//! record types only need `Serialize`/`Deserialize` to be stored.

use peerwork_core::types::Timestamp;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;

use crate::error::DbError;
use crate::schema::Table;

/// One row: column name to value.
pub type Row = serde_json::Map<String, Value>;

/// Serialize a record into a row.
///
/// The record must serialize to a JSON object.
pub fn to_row<T: Serialize>(record: &T) -> Result<Row, DbError> {
    match serde_json::to_value(record)? {
        Value::Object(row) => Ok(row),
        other => Err(DbError::Encoding(serde::ser::Error::custom(format!(
            "record must serialize to an object, got {other}"
        )))),
    }
}

/// Deserialize a record from a row.
pub fn from_row<T: DeserializeOwned>(row: Row) -> Result<T, DbError> {
    Ok(serde_json::from_value(Value::Object(row))?)
}

/// Conjunction of column predicates applied by `select`, `update`, `delete`.
#[derive(Debug, Clone, Default)]
pub struct Filter {
    equals: Row,
    before: Option<(String, Timestamp)>,
    for_update: bool,
}

impl Filter {
    /// Match every row.
    pub fn all() -> Self {
        Self::default()
    }

    /// Require `column = value`.
    pub fn eq(mut self, column: impl Into<String>, value: impl Into<Value>) -> Self {
        self.equals.insert(column.into(), value.into());
        self
    }

    /// Require `column < bound`.
    pub fn before(mut self, column: impl Into<String>, bound: Timestamp) -> Self {
        self.before = Some((column.into(), bound));
        self
    }

    /// Lock matched rows until the transaction ends (`SELECT ... FOR UPDATE`).
    pub fn for_update(mut self) -> Self {
        self.for_update = true;
        self
    }

    pub fn equals(&self) -> &Row {
        &self.equals
    }

    pub fn before_bound(&self) -> Option<(&str, Timestamp)> {
        self.before.as_ref().map(|(c, t)| (c.as_str(), *t))
    }

    pub fn is_for_update(&self) -> bool {
        self.for_update
    }

    /// Check every referenced column exists in `table`.
    pub fn validate(&self, table: &Table) -> Result<(), DbError> {
        for column in self.equals.keys() {
            table.require_column(column)?;
        }
        if let Some((column, _)) = &self.before {
            table.require_column(column)?;
        }
        Ok(())
    }

    /// Evaluate the filter against an in-memory row. `NULL` never compares
    /// equal, as in SQL.
    pub fn matches(&self, row: &Row) -> bool {
        let equal = self.equals.iter().all(|(column, expected)| {
            row.get(column)
                .is_some_and(|value| !value.is_null() && value == expected)
        });
        if !equal {
            return false;
        }
        match &self.before {
            None => true,
            Some((column, bound)) => row
                .get(column)
                .and_then(|v| serde_json::from_value::<Timestamp>(v.clone()).ok())
                .is_some_and(|value| value < *bound),
        }
    }
}

#[cfg(test)]
mod tests {
    use serde::Deserialize;
    use serde_json::json;

    use super::*;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Sample {
        id: i64,
        name: String,
    }

    fn row(value: Value) -> Row {
        value.as_object().cloned().unwrap()
    }

    #[test]
    fn record_round_trips_through_row() {
        let sample = Sample { id: 7, name: "x".into() };
        let back: Sample = from_row(to_row(&sample).unwrap()).unwrap();
        assert_eq!(back, sample);
    }

    #[test]
    fn non_object_record_rejected() {
        assert!(matches!(to_row(&42), Err(DbError::Encoding(_))));
    }

    #[test]
    fn empty_filter_matches_everything() {
        assert!(Filter::all().matches(&row(json!({"id": 1}))));
    }

    #[test]
    fn equality_filter() {
        let filter = Filter::all().eq("hostname", "a").eq("port", 1);
        assert!(filter.matches(&row(json!({"hostname": "a", "port": 1, "pid": 9}))));
        assert!(!filter.matches(&row(json!({"hostname": "a", "port": 2}))));
    }

    #[test]
    fn null_never_equals() {
        let filter = Filter::all().eq("work_group", Value::Null);
        assert!(!filter.matches(&row(json!({ "work_group": null }))));
    }

    #[test]
    fn before_filter_compares_timestamps() {
        let bound = chrono::DateTime::from_timestamp(1_000, 0).unwrap();
        let filter = Filter::all().before("not_before", bound);
        let early = chrono::DateTime::from_timestamp(999, 0).unwrap();
        let late = chrono::DateTime::from_timestamp(1_000, 0).unwrap();
        assert!(filter.matches(&row(json!({ "not_before": early }))));
        assert!(!filter.matches(&row(json!({ "not_before": late }))));
        assert!(!filter.matches(&row(json!({ "not_before": null }))));
    }
}
