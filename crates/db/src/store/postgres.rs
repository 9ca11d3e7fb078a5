//! PostgreSQL row store.
//!
//! Rows travel as JSONB: values are bound as one JSON object and expanded
//! into typed columns with `jsonb_populate_record`, and results come back
//! through `to_jsonb`. Work tables therefore keep real column types.

use async_trait::async_trait;
use peerwork_core::types::Timestamp;
use serde_json::Value;
use sqlx::postgres::PgArguments;
use sqlx::query::QueryScalar;
use sqlx::{PgPool, Postgres};

use crate::error::DbError;
use crate::row::{Filter, Row};
use crate::schema::{quote_ident, Table};
use crate::store::{Store, StoreTransaction};
use crate::transaction::Transaction;

/// Row store backed by a PostgreSQL connection pool.
#[derive(Debug, Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl Store for PgStore {
    async fn begin(&self) -> Result<Transaction, DbError> {
        let tx = self.pool.begin().await?;
        Ok(Transaction::new(Box::new(PgTransaction { tx })))
    }
}

/// A pooled connection inside `BEGIN`. sqlx rolls back on drop.
struct PgTransaction {
    tx: sqlx::Transaction<'static, Postgres>,
}

impl PgTransaction {
    async fn fetch_rows(&mut self, statement: Statement) -> Result<Vec<Row>, DbError> {
        let mut query: QueryScalar<'_, Postgres, Value, PgArguments> =
            sqlx::query_scalar(&statement.sql);
        for bind in statement.binds {
            query = match bind {
                Bind::Json(value) => query.bind(value),
                Bind::Time(ts) => query.bind(ts),
            };
        }
        let values = query.fetch_all(&mut *self.tx).await?;
        values
            .into_iter()
            .map(|value| match value {
                Value::Object(row) => Ok(row),
                other => Err(DbError::Encoding(serde::de::Error::custom(format!(
                    "expected a row object, got {other}"
                )))),
            })
            .collect()
    }
}

#[async_trait]
impl StoreTransaction for PgTransaction {
    async fn insert(&mut self, table: &Table, row: Row) -> Result<Row, DbError> {
        let statement = Statement::insert(table, row);
        self.fetch_rows(statement)
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| DbError::NoSuchRecord {
                table: table.name().to_string(),
            })
    }

    async fn select(&mut self, table: &Table, filter: &Filter) -> Result<Vec<Row>, DbError> {
        self.fetch_rows(Statement::select(table, filter)).await
    }

    async fn update(
        &mut self,
        table: &Table,
        filter: &Filter,
        changes: Row,
    ) -> Result<u64, DbError> {
        let rows = self.fetch_rows(Statement::update(table, filter, changes)).await?;
        Ok(rows.len() as u64)
    }

    async fn delete(&mut self, table: &Table, filter: &Filter) -> Result<Vec<Row>, DbError> {
        self.fetch_rows(Statement::delete(table, filter)).await
    }

    async fn lock_exclusive(&mut self, table: &Table) -> Result<(), DbError> {
        let sql = format!("LOCK TABLE {} IN EXCLUSIVE MODE", quote_ident(table.name()));
        sqlx::query(&sql).execute(&mut *self.tx).await?;
        Ok(())
    }

    async fn commit(self: Box<Self>) -> Result<(), DbError> {
        self.tx.commit().await?;
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<(), DbError> {
        self.tx.rollback().await?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Statement building
// ---------------------------------------------------------------------------

enum Bind {
    Json(Value),
    Time(Timestamp),
}

/// SQL text plus its positional parameters.
struct Statement {
    sql: String,
    binds: Vec<Bind>,
}

impl Statement {
    fn new() -> Self {
        Self {
            sql: String::new(),
            binds: Vec::new(),
        }
    }

    /// Push a parameter and return its placeholder.
    fn bind(&mut self, bind: Bind) -> String {
        self.binds.push(bind);
        format!("${}", self.binds.len())
    }

    /// `jsonb_populate_record(NULL::"table", $n)` for `row`.
    fn record(&mut self, table: &Table, row: Row) -> String {
        let placeholder = self.bind(Bind::Json(Value::Object(row)));
        format!(
            "jsonb_populate_record(NULL::{}, {placeholder})",
            quote_ident(table.name())
        )
    }

    /// Extra `FROM` item (aliased `k`) and `WHERE` condition for `filter`
    /// against the table aliased `t`.
    fn condition(&mut self, table: &Table, filter: &Filter) -> (Option<String>, String) {
        let mut clauses = Vec::new();
        let mut source = None;
        if !filter.equals().is_empty() {
            for column in filter.equals().keys() {
                let column = quote_ident(column);
                clauses.push(format!("t.{column} = k.{column}"));
            }
            source = Some(format!("{} AS k", self.record(table, filter.equals().clone())));
        }
        if let Some((column, bound)) = filter.before_bound() {
            let placeholder = self.bind(Bind::Time(bound));
            clauses.push(format!("t.{} < {placeholder}", quote_ident(column)));
        }
        let condition = if clauses.is_empty() {
            "TRUE".to_string()
        } else {
            clauses.join(" AND ")
        };
        (source, condition)
    }

    fn insert(table: &Table, mut row: Row) -> Self {
        // A NULL for a defaulted column means "use the default".
        row.retain(|name, value| {
            !value.is_null()
                || table
                    .column(name)
                    .is_some_and(|c| c.nullable && c.default.is_none())
        });
        let mut statement = Self::new();
        let target = quote_ident(table.name());
        statement.sql = if row.is_empty() {
            format!("INSERT INTO {target} AS t DEFAULT VALUES RETURNING to_jsonb(t)")
        } else {
            let columns: Vec<String> = row.keys().map(|c| quote_ident(c)).collect();
            let values: Vec<String> = columns.iter().map(|c| format!("k.{c}")).collect();
            let record = statement.record(table, row);
            format!(
                "INSERT INTO {target} AS t ({}) SELECT {} FROM {record} AS k RETURNING to_jsonb(t)",
                columns.join(", "),
                values.join(", ")
            )
        };
        statement
    }

    fn select(table: &Table, filter: &Filter) -> Self {
        let mut statement = Self::new();
        let (source, condition) = statement.condition(table, filter);
        let mut sql = format!("SELECT to_jsonb(t) FROM {} AS t", quote_ident(table.name()));
        if let Some(source) = source {
            sql.push_str(&format!(", {source}"));
        }
        sql.push_str(&format!(" WHERE {condition}"));
        if !table.primary_key().is_empty() {
            let keys: Vec<String> = table
                .primary_key()
                .iter()
                .map(|k| format!("t.{}", quote_ident(k)))
                .collect();
            sql.push_str(&format!(" ORDER BY {}", keys.join(", ")));
        }
        if filter.is_for_update() {
            sql.push_str(" FOR UPDATE OF t");
        }
        statement.sql = sql;
        statement
    }

    fn update(table: &Table, filter: &Filter, changes: Row) -> Self {
        let mut statement = Self::new();
        let assignments: Vec<String> = changes
            .keys()
            .map(|c| {
                let c = quote_ident(c);
                format!("{c} = v.{c}")
            })
            .collect();
        let values = statement.record(table, changes);
        let (source, condition) = statement.condition(table, filter);
        let mut sql = format!(
            "UPDATE {} AS t SET {} FROM {values} AS v",
            quote_ident(table.name()),
            assignments.join(", ")
        );
        if let Some(source) = source {
            sql.push_str(&format!(", {source}"));
        }
        sql.push_str(&format!(" WHERE {condition} RETURNING to_jsonb(t)"));
        statement.sql = sql;
        statement
    }

    fn delete(table: &Table, filter: &Filter) -> Self {
        let mut statement = Self::new();
        let (source, condition) = statement.condition(table, filter);
        let mut sql = format!("DELETE FROM {} AS t", quote_ident(table.name()));
        if let Some(source) = source {
            sql.push_str(&format!(" USING {source}"));
        }
        sql.push_str(&format!(" WHERE {condition} RETURNING to_jsonb(t)"));
        statement.sql = sql;
        statement
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::schema::Column;

    fn table() -> Table {
        Table::new("node_info")
            .with_column(Column::text("hostname"))
            .with_column(Column::integer("port"))
            .with_column(Column::integer("pid"))
            .with_column(Column::timestamp("time").default_now())
            .with_primary_key(["hostname", "port"])
    }

    fn row(value: Value) -> Row {
        value.as_object().cloned().unwrap()
    }

    #[test]
    fn insert_expands_record() {
        let statement = Statement::insert(
            &table(),
            row(json!({"hostname": "a", "pid": 2, "port": 1, "time": null})),
        );
        assert_eq!(
            statement.sql,
            "INSERT INTO \"node_info\" AS t (\"hostname\", \"pid\", \"port\") \
             SELECT k.\"hostname\", k.\"pid\", k.\"port\" \
             FROM jsonb_populate_record(NULL::\"node_info\", $1) AS k RETURNING to_jsonb(t)"
        );
        assert_eq!(statement.binds.len(), 1);
    }

    #[test]
    fn select_orders_by_key_and_locks() {
        let statement = Statement::select(&table(), &Filter::all().eq("hostname", "a").for_update());
        assert_eq!(
            statement.sql,
            "SELECT to_jsonb(t) FROM \"node_info\" AS t, \
             jsonb_populate_record(NULL::\"node_info\", $1) AS k \
             WHERE t.\"hostname\" = k.\"hostname\" \
             ORDER BY t.\"hostname\", t.\"port\" FOR UPDATE OF t"
        );
    }

    #[test]
    fn select_all_has_trivial_condition() {
        let statement = Statement::select(&table(), &Filter::all());
        assert!(statement.sql.contains("WHERE TRUE"));
        assert!(statement.binds.is_empty());
    }

    #[test]
    fn update_binds_changes_before_filter() {
        let bound = chrono::DateTime::from_timestamp(1_000, 0).unwrap();
        let statement = Statement::update(
            &table(),
            &Filter::all().eq("port", 1).before("time", bound),
            row(json!({"pid": 9})),
        );
        assert_eq!(
            statement.sql,
            "UPDATE \"node_info\" AS t SET \"pid\" = v.\"pid\" \
             FROM jsonb_populate_record(NULL::\"node_info\", $1) AS v, \
             jsonb_populate_record(NULL::\"node_info\", $2) AS k \
             WHERE t.\"port\" = k.\"port\" AND t.\"time\" < $3 RETURNING to_jsonb(t)"
        );
        assert_eq!(statement.binds.len(), 3);
    }

    #[test]
    fn delete_uses_key_record() {
        let statement = Statement::delete(&table(), &Filter::all().eq("port", 1));
        assert_eq!(
            statement.sql,
            "DELETE FROM \"node_info\" AS t \
             USING jsonb_populate_record(NULL::\"node_info\", $1) AS k \
             WHERE t.\"port\" = k.\"port\" RETURNING to_jsonb(t)"
        );
    }
}
