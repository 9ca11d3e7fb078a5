//! Row stores.
//!
//! A [`Store`] opens [`Transaction`]s; each backend supplies a
//! [`StoreTransaction`] that executes row operations. Two backends exist:
//! [`PgStore`] for the shared cluster database and [`MemoryStore`] for
//! single-process deployments and tests.

pub mod memory;
pub mod postgres;

use std::sync::Arc;

use async_trait::async_trait;

use crate::error::DbError;
use crate::row::{Filter, Row};
use crate::schema::Table;
use crate::transaction::Transaction;

pub use memory::MemoryStore;
pub use postgres::PgStore;

/// Shared handle to any store.
pub type SharedStore = Arc<dyn Store>;

/// Something that can begin transactions.
#[async_trait]
pub trait Store: Send + Sync + 'static {
    /// Begin a new transaction.
    async fn begin(&self) -> Result<Transaction, DbError>;
}

/// Backend half of a [`Transaction`].
///
/// Implementations execute row operations inside one database transaction.
/// Column names are validated by [`Transaction`] before they reach here.
#[async_trait]
pub trait StoreTransaction: Send {
    /// Insert a row and return it as stored (generated ids and defaults filled in).
    async fn insert(&mut self, table: &Table, row: Row) -> Result<Row, DbError>;

    /// Return rows matching `filter`, ordered by primary key.
    async fn select(&mut self, table: &Table, filter: &Filter) -> Result<Vec<Row>, DbError>;

    /// Apply `changes` to rows matching `filter`; returns the number updated.
    async fn update(&mut self, table: &Table, filter: &Filter, changes: Row)
        -> Result<u64, DbError>;

    /// Remove rows matching `filter` and return them.
    async fn delete(&mut self, table: &Table, filter: &Filter) -> Result<Vec<Row>, DbError>;

    /// Take an exclusive lock on `table` until the transaction ends.
    async fn lock_exclusive(&mut self, table: &Table) -> Result<(), DbError>;

    async fn commit(self: Box<Self>) -> Result<(), DbError>;

    async fn rollback(self: Box<Self>) -> Result<(), DbError>;
}
