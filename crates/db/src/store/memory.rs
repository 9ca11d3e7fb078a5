//! In-process row store.
//!
//! Transactions are fully serialized: `begin` takes the store lock and holds
//! it until commit or rollback. Rollback restores a snapshot taken at
//! `begin`. Tables come into existence on first use.

use std::cmp::Ordering;
use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value;
use tokio::sync::{Mutex, OwnedMutexGuard};

use crate::error::DbError;
use crate::row::{Filter, Row};
use crate::schema::{ColumnDefault, ColumnKind, Table};
use crate::store::{Store, StoreTransaction};
use crate::transaction::Transaction;

#[derive(Debug, Clone, Default)]
struct MemoryTable {
    rows: Vec<Row>,
    last_serial: i64,
}

#[derive(Debug, Clone, Default)]
struct MemoryState {
    tables: HashMap<String, MemoryTable>,
}

/// Row store held entirely in memory.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    state: Arc<Mutex<MemoryState>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Committed rows of `table`, in insertion order.
    pub async fn rows(&self, table: &str) -> Vec<Row> {
        let state = self.state.lock().await;
        state
            .tables
            .get(table)
            .map(|t| t.rows.clone())
            .unwrap_or_default()
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn begin(&self) -> Result<Transaction, DbError> {
        let guard = Arc::clone(&self.state).lock_owned().await;
        let snapshot = guard.clone();
        Ok(Transaction::new(Box::new(MemoryTransaction {
            guard,
            snapshot: Some(snapshot),
        })))
    }
}

struct MemoryTransaction {
    guard: OwnedMutexGuard<MemoryState>,
    /// State at `begin`; `None` once committed.
    snapshot: Option<MemoryState>,
}

impl MemoryTransaction {
    fn table(&mut self, table: &Table) -> &mut MemoryTable {
        self.guard
            .tables
            .entry(table.name().to_string())
            .or_default()
    }
}

impl Drop for MemoryTransaction {
    fn drop(&mut self) {
        if let Some(snapshot) = self.snapshot.take() {
            *self.guard = snapshot;
        }
    }
}

#[async_trait]
impl StoreTransaction for MemoryTransaction {
    async fn insert(&mut self, table: &Table, mut row: Row) -> Result<Row, DbError> {
        let stored = self.table(table);
        for column in table.columns() {
            let missing = row.get(&column.name).is_none_or(Value::is_null);
            if !missing {
                if column.kind == ColumnKind::Serial {
                    if let Some(id) = row.get(&column.name).and_then(Value::as_i64) {
                        stored.last_serial = stored.last_serial.max(id);
                    }
                }
                continue;
            }
            let value = if column.kind == ColumnKind::Serial {
                stored.last_serial += 1;
                Value::from(stored.last_serial)
            } else if column.default == Some(ColumnDefault::Now) {
                serde_json::to_value(Utc::now())?
            } else if column.nullable {
                Value::Null
            } else {
                return Err(not_null(table, &column.name));
            };
            row.insert(column.name.clone(), value);
        }

        if !table.primary_key().is_empty()
            && stored
                .rows
                .iter()
                .any(|existing| same_key(table, existing, &row))
        {
            return Err(DbError::DuplicateKey {
                table: table.name().to_string(),
            });
        }
        stored.rows.push(row.clone());
        Ok(row)
    }

    async fn select(&mut self, table: &Table, filter: &Filter) -> Result<Vec<Row>, DbError> {
        let mut rows: Vec<Row> = self
            .table(table)
            .rows
            .iter()
            .filter(|row| filter.matches(row))
            .cloned()
            .collect();
        rows.sort_by(|a, b| compare_keys(table, a, b));
        Ok(rows)
    }

    async fn update(
        &mut self,
        table: &Table,
        filter: &Filter,
        changes: Row,
    ) -> Result<u64, DbError> {
        for (name, value) in &changes {
            if value.is_null() && !table.require_column(name)?.nullable {
                return Err(not_null(table, name));
            }
        }
        let mut updated = 0;
        for row in self.table(table).rows.iter_mut() {
            if filter.matches(row) {
                row.extend(changes.clone());
                updated += 1;
            }
        }
        Ok(updated)
    }

    async fn delete(&mut self, table: &Table, filter: &Filter) -> Result<Vec<Row>, DbError> {
        let stored = self.table(table);
        let (mut removed, kept): (Vec<Row>, Vec<Row>) = std::mem::take(&mut stored.rows)
            .into_iter()
            .partition(|row| filter.matches(row));
        stored.rows = kept;
        removed.sort_by(|a, b| compare_keys(table, a, b));
        Ok(removed)
    }

    async fn lock_exclusive(&mut self, _table: &Table) -> Result<(), DbError> {
        // The whole store is already held by this transaction.
        Ok(())
    }

    async fn commit(mut self: Box<Self>) -> Result<(), DbError> {
        self.snapshot = None;
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<(), DbError> {
        Ok(())
    }
}

fn not_null(table: &Table, column: &str) -> DbError {
    DbError::NotNull {
        table: table.name().to_string(),
        column: column.to_string(),
    }
}

fn same_key(table: &Table, a: &Row, b: &Row) -> bool {
    table
        .primary_key()
        .iter()
        .all(|key| a.get(key) == b.get(key))
}

fn compare_keys(table: &Table, a: &Row, b: &Row) -> Ordering {
    table
        .primary_key()
        .iter()
        .map(|key| compare_values(a.get(key), b.get(key)))
        .find(|ordering| ordering.is_ne())
        .unwrap_or(Ordering::Equal)
}

fn compare_values(a: Option<&Value>, b: Option<&Value>) -> Ordering {
    match (a, b) {
        (Some(Value::Number(x)), Some(Value::Number(y))) => {
            match (x.as_i64(), y.as_i64()) {
                (Some(x), Some(y)) => x.cmp(&y),
                _ => x
                    .as_f64()
                    .partial_cmp(&y.as_f64())
                    .unwrap_or(Ordering::Equal),
            }
        }
        (Some(Value::String(x)), Some(Value::String(y))) => x.cmp(y),
        _ => Ordering::Equal,
    }
}
