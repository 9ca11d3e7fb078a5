//! Persistence for the work queue: table model, row stores, transactions
//! with commit/abort hooks, and the node registry.

pub mod error;
pub mod models;
pub mod repositories;
pub mod row;
pub mod schema;
pub mod store;
pub mod transaction;

use sqlx::postgres::PgPoolOptions;

pub use error::DbError;
pub use row::{Filter, Row};
pub use schema::{Column, ColumnKind, Table};
pub use store::{MemoryStore, PgStore, SharedStore, Store};
pub use transaction::{run_in_transaction, Transaction};

pub type DbPool = sqlx::PgPool;

/// Create a connection pool from a database URL.
pub async fn create_pool(database_url: &str) -> Result<DbPool, sqlx::Error> {
    PgPoolOptions::new()
        .max_connections(20)
        .connect(database_url)
        .await
}

/// Round-trip a trivial query to confirm the database is reachable.
pub async fn health_check(pool: &DbPool) -> Result<(), sqlx::Error> {
    sqlx::query("SELECT 1").execute(pool).await?;
    Ok(())
}

/// Apply the bundled migrations (the `node_info` table).
pub async fn run_migrations(pool: &DbPool) -> Result<(), DbError> {
    sqlx::migrate!("./migrations").run(pool).await?;
    Ok(())
}

/// Create any of `tables` that do not exist yet.
pub async fn ensure_tables<'a, I>(pool: &DbPool, tables: I) -> Result<(), DbError>
where
    I: IntoIterator<Item = &'a Table>,
{
    for table in tables {
        sqlx::query(&table.create_sql()).execute(pool).await?;
        tracing::debug!(table = table.name(), "Ensured table exists");
    }
    Ok(())
}
