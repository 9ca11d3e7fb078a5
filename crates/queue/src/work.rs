//! Work item types, the table registry, and the perform cycle.
//!
//! A work type is a serde record bound to its own table. Every work table
//! shares three leading columns (`id`, `not_before`, `work_group`) followed
//! by the type's own parameter columns. A row's existence means the work
//! has not been performed yet.

use std::collections::BTreeMap;
use std::marker::PhantomData;
use std::sync::Arc;

use async_trait::async_trait;
use peerwork_core::types::{DbId, Timestamp};
use peerwork_db::row::from_row;
use peerwork_db::{run_in_transaction, Column, DbError, Filter, Row, Store, Table, Transaction};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::QueueError;

/// Primary key column of every work table.
pub const ID_COLUMN: &str = "id";

/// Earliest time a row may be performed; defaults to insert time.
pub const NOT_BEFORE_COLUMN: &str = "not_before";

/// Optional named set the item belongs to. Stored only; never enforced.
pub const GROUP_COLUMN: &str = "work_group";

/// A unit of deferred work bound to a table.
///
/// The implementing type's serialized fields are the table's parameter
/// columns and must match [`WorkItem::columns`].
///
/// ```ignore
/// #[derive(Serialize, Deserialize)]
/// struct CouponWork { customer_id: i64 }
///
/// #[async_trait]
/// impl WorkItem for CouponWork {
///     const TABLE: &'static str = "coupon_work";
///     fn columns() -> Vec<Column> { vec![Column::bigint("customer_id")] }
///     async fn do_work(&self, txn: &mut Transaction) -> anyhow::Result<()> { ... }
/// }
/// ```
#[async_trait]
pub trait WorkItem: Serialize + DeserializeOwned + Send + Sync + 'static {
    /// Name of the table holding pending items of this type.
    const TABLE: &'static str;

    /// Parameter columns, excluding the shared leading columns.
    fn columns() -> Vec<Column>;

    /// Perform the work. Runs inside the performing transaction, after the
    /// row has been deleted; an error rolls both back.
    async fn do_work(&self, txn: &mut Transaction) -> anyhow::Result<()>;
}

/// A stored work row: shared columns plus the item itself.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkRecord<W> {
    pub id: DbId,
    pub not_before: Timestamp,
    pub work_group: Option<String>,
    #[serde(flatten)]
    pub item: W,
}

/// Full table definition for work type `W`.
pub fn work_table<W: WorkItem>() -> Table {
    W::columns().into_iter().fold(
        Table::new(W::TABLE)
            .with_column(Column::serial(ID_COLUMN))
            .with_column(Column::timestamp(NOT_BEFORE_COLUMN).default_now())
            .with_column(Column::text(GROUP_COLUMN).nullable())
            .with_primary_key([ID_COLUMN]),
        Table::with_column,
    )
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

/// Type-erased access to one registered work type.
#[async_trait]
pub trait WorkHandler: Send + Sync {
    fn table(&self) -> &Table;

    /// Decode `row` and run its `do_work` inside `txn`.
    async fn perform(&self, txn: &mut Transaction, row: Row) -> Result<(), QueueError>;
}

struct TypedHandler<W> {
    table: Table,
    _work: PhantomData<fn() -> W>,
}

#[async_trait]
impl<W: WorkItem> WorkHandler for TypedHandler<W> {
    fn table(&self) -> &Table {
        &self.table
    }

    async fn perform(&self, txn: &mut Transaction, row: Row) -> Result<(), QueueError> {
        let record: WorkRecord<W> = from_row(row)?;
        record
            .item
            .do_work(txn)
            .await
            .map_err(QueueError::Execution)
    }
}

/// Table name to work type lookup.
///
/// Both ends of every link hold the same registry; only table names cross
/// the wire.
#[derive(Clone, Default)]
pub struct WorkRegistry {
    handlers: BTreeMap<String, Arc<dyn WorkHandler>>,
}

impl WorkRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register work type `W` under its table name.
    pub fn register<W: WorkItem>(&mut self) -> &mut Self {
        let handler = TypedHandler::<W> {
            table: work_table::<W>(),
            _work: PhantomData,
        };
        self.handlers.insert(W::TABLE.to_string(), Arc::new(handler));
        self
    }

    /// Builder form of [`WorkRegistry::register`].
    pub fn with<W: WorkItem>(mut self) -> Self {
        self.register::<W>();
        self
    }

    pub fn handler(&self, table: &str) -> Result<Arc<dyn WorkHandler>, QueueError> {
        self.handlers
            .get(table)
            .cloned()
            .ok_or_else(|| QueueError::UnknownTable(table.to_string()))
    }

    /// Every registered work table, ordered by name.
    pub fn tables(&self) -> impl Iterator<Item = &Table> {
        self.handlers.values().map(|h| h.table())
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

impl std::fmt::Debug for WorkRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkRegistry")
            .field("tables", &self.handlers.keys().collect::<Vec<_>>())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Perform cycle
// ---------------------------------------------------------------------------

/// Result of [`ultimately_perform`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// The row was deleted and its work committed.
    Performed,
    /// No row with that id exists; another performer already consumed it.
    AlreadyPerformed,
}

/// Perform work item `work_id` from `table` in a fresh transaction.
///
/// The row is deleted first and `do_work` runs afterwards in the same
/// transaction, so a concurrent second delivery of the same id finds
/// nothing and reports [`Outcome::AlreadyPerformed`]. Any failure aborts the
/// transaction, which restores the row for a later recovery pass.
pub async fn ultimately_perform(
    store: &dyn Store,
    registry: &WorkRegistry,
    table: &str,
    work_id: DbId,
) -> Result<Outcome, QueueError> {
    let handler = registry.handler(table)?;

    let result = run_in_transaction(store, |txn| {
        Box::pin(async move {
            let by_id = Filter::all().eq(ID_COLUMN, work_id);
            let row = match txn.pop(handler.table(), &by_id).await {
                Ok(row) => row,
                Err(DbError::NoSuchRecord { .. }) => return Ok(Outcome::AlreadyPerformed),
                Err(e) => return Err(QueueError::from(e)),
            };
            handler.perform(txn, row).await?;
            Ok(Outcome::Performed)
        })
    })
    .await;

    match &result {
        Ok(Outcome::Performed) => tracing::debug!(%table, work_id, "Work performed"),
        Ok(Outcome::AlreadyPerformed) => {
            tracing::debug!(%table, work_id, "Work already performed elsewhere")
        }
        Err(e) => tracing::warn!(%table, work_id, error = %e, "Work failed, row restored"),
    }
    result
}
