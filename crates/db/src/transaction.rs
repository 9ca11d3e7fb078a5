//! Transactions with post-commit and post-abort hooks.
//!
//! [`Transaction`] wraps a backend [`StoreTransaction`], validates column
//! names against table definitions, and runs registered hooks once the
//! outcome is known. Hooks are synchronous; anything long-running must be
//! spawned from inside the hook.

use futures::future::BoxFuture;

use crate::error::DbError;
use crate::row::{Filter, Row};
use crate::schema::Table;
use crate::store::{Store, StoreTransaction};

type Hook = Box<dyn FnOnce() + Send + 'static>;

/// A unit of work against a [`Store`].
///
/// Exactly one of `commit` or `abort` should be called. Dropping an
/// unfinished transaction rolls it back and runs the post-abort hooks.
pub struct Transaction {
    backend: Option<Box<dyn StoreTransaction>>,
    post_commit: Vec<Hook>,
    post_abort: Vec<Hook>,
}

impl Transaction {
    /// Wrap a backend transaction. Called by [`Store`] implementations.
    pub fn new(backend: Box<dyn StoreTransaction>) -> Self {
        Self {
            backend: Some(backend),
            post_commit: Vec::new(),
            post_abort: Vec::new(),
        }
    }

    /// Run `hook` after a successful commit.
    pub fn post_commit(&mut self, hook: impl FnOnce() + Send + 'static) {
        self.post_commit.push(Box::new(hook));
    }

    /// Run `hook` after an abort, a failed commit, or a drop without commit.
    pub fn post_abort(&mut self, hook: impl FnOnce() + Send + 'static) {
        self.post_abort.push(Box::new(hook));
    }

    fn backend(&mut self) -> Result<&mut Box<dyn StoreTransaction>, DbError> {
        self.backend.as_mut().ok_or(DbError::Finished)
    }

    /// Insert a row, returning it as stored.
    pub async fn insert(&mut self, table: &Table, row: Row) -> Result<Row, DbError> {
        for column in row.keys() {
            table.require_column(column)?;
        }
        self.backend()?.insert(table, row).await
    }

    /// Select rows matching `filter`.
    pub async fn select(&mut self, table: &Table, filter: &Filter) -> Result<Vec<Row>, DbError> {
        filter.validate(table)?;
        self.backend()?.select(table, filter).await
    }

    /// Update rows matching `filter` with `changes`.
    pub async fn update(
        &mut self,
        table: &Table,
        filter: &Filter,
        changes: Row,
    ) -> Result<u64, DbError> {
        filter.validate(table)?;
        for column in changes.keys() {
            table.require_column(column)?;
        }
        if changes.is_empty() {
            return Ok(0);
        }
        self.backend()?.update(table, filter, changes).await
    }

    /// Delete rows matching `filter`, returning the removed rows.
    pub async fn delete(&mut self, table: &Table, filter: &Filter) -> Result<Vec<Row>, DbError> {
        filter.validate(table)?;
        self.backend()?.delete(table, filter).await
    }

    /// Atomically remove and return the single row matching `filter`.
    ///
    /// Fails with [`DbError::NoSuchRecord`] when nothing matched.
    pub async fn pop(&mut self, table: &Table, filter: &Filter) -> Result<Row, DbError> {
        self.delete(table, filter)
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| DbError::NoSuchRecord {
                table: table.name().to_string(),
            })
    }

    /// Serialize against other writers of `table` until this transaction ends.
    pub async fn lock_exclusive(&mut self, table: &Table) -> Result<(), DbError> {
        self.backend()?.lock_exclusive(table).await
    }

    /// Commit, then run post-commit hooks. A failed commit runs the
    /// post-abort hooks instead and returns the commit error.
    pub async fn commit(mut self) -> Result<(), DbError> {
        let backend = self.backend.take().ok_or(DbError::Finished)?;
        match backend.commit().await {
            Ok(()) => {
                self.post_abort.clear();
                run_hooks(std::mem::take(&mut self.post_commit));
                Ok(())
            }
            Err(e) => {
                tracing::warn!(error = %e, "Transaction commit failed");
                self.post_commit.clear();
                run_hooks(std::mem::take(&mut self.post_abort));
                Err(e)
            }
        }
    }

    /// Roll back, then run post-abort hooks.
    pub async fn abort(mut self) -> Result<(), DbError> {
        let backend = self.backend.take().ok_or(DbError::Finished)?;
        let result = backend.rollback().await;
        self.post_commit.clear();
        run_hooks(std::mem::take(&mut self.post_abort));
        result
    }
}

impl Drop for Transaction {
    fn drop(&mut self) {
        let Some(backend) = self.backend.take() else {
            return;
        };
        // Backends roll back when dropped.
        drop(backend);
        tracing::warn!("Transaction dropped without commit or abort, rolled back");
        self.post_commit.clear();
        run_hooks(std::mem::take(&mut self.post_abort));
    }
}

fn run_hooks(hooks: Vec<Hook>) {
    for hook in hooks {
        hook();
    }
}

/// Run `operation` inside a new transaction.
///
/// Commits and returns the operation's value on success. On failure the
/// transaction is aborted and the operation's error returned; an error from
/// the commit or the abort itself takes precedence as the outer failure.
///
/// ```ignore
/// let count = run_in_transaction(&store, |txn| {
///     Box::pin(async move { Ok::<_, DbError>(txn.select(&table, &Filter::all()).await?.len()) })
/// })
/// .await?;
/// ```
pub async fn run_in_transaction<S, T, E, F>(store: &S, operation: F) -> Result<T, E>
where
    S: Store + ?Sized,
    E: From<DbError>,
    F: for<'t> FnOnce(&'t mut Transaction) -> BoxFuture<'t, Result<T, E>>,
{
    let mut txn = store.begin().await?;
    match operation(&mut txn).await {
        Ok(value) => {
            txn.commit().await?;
            Ok(value)
        }
        Err(e) => {
            txn.abort().await?;
            Err(e)
        }
    }
}
