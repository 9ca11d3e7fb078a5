//! Commit/abort hook ordering and `run_in_transaction` outcomes.

use std::sync::{Arc, Mutex};

use assert_matches::assert_matches;
use peerwork_db::{run_in_transaction, Column, DbError, Filter, MemoryStore, Row, Store, Table};
use serde_json::json;

fn table() -> Table {
    Table::new("coupon_issued")
        .with_column(Column::serial("id"))
        .with_column(Column::bigint("customer_id"))
        .with_primary_key(["id"])
}

fn coupon(customer_id: i64) -> Row {
    json!({ "customer_id": customer_id })
        .as_object()
        .cloned()
        .unwrap()
}

#[derive(Debug, thiserror::Error)]
enum AppError {
    #[error(transparent)]
    Db(#[from] DbError),
    #[error("rejected")]
    Rejected,
}

type Log = Arc<Mutex<Vec<&'static str>>>;

fn recorder(log: &Log, entry: &'static str) -> impl FnOnce() + Send + 'static {
    let log = Arc::clone(log);
    move || log.lock().unwrap().push(entry)
}

#[tokio::test]
async fn commit_runs_only_commit_hooks() {
    let store = MemoryStore::new();
    let log: Log = Arc::default();

    let mut txn = store.begin().await.unwrap();
    txn.post_commit(recorder(&log, "commit-1"));
    txn.post_abort(recorder(&log, "abort"));
    txn.post_commit(recorder(&log, "commit-2"));
    txn.commit().await.unwrap();

    assert_eq!(*log.lock().unwrap(), vec!["commit-1", "commit-2"]);
}

#[tokio::test]
async fn abort_runs_only_abort_hooks() {
    let store = MemoryStore::new();
    let log: Log = Arc::default();

    let mut txn = store.begin().await.unwrap();
    txn.post_commit(recorder(&log, "commit"));
    txn.post_abort(recorder(&log, "abort"));
    txn.abort().await.unwrap();

    assert_eq!(*log.lock().unwrap(), vec!["abort"]);
}

#[tokio::test]
async fn dropping_unfinished_transaction_runs_abort_hooks() {
    let store = MemoryStore::new();
    let log: Log = Arc::default();
    {
        let mut txn = store.begin().await.unwrap();
        txn.post_abort(recorder(&log, "abort"));
    }
    assert_eq!(*log.lock().unwrap(), vec!["abort"]);
}

#[tokio::test]
async fn helper_commits_on_success() {
    let store = MemoryStore::new();
    let table = table();

    let inserted = run_in_transaction(&store, |txn| {
        let table = table.clone();
        Box::pin(async move { txn.insert(&table, coupon(42)).await })
    })
    .await
    .unwrap();

    assert_eq!(inserted["customer_id"], json!(42));
    assert_eq!(store.rows("coupon_issued").await.len(), 1);
}

#[tokio::test]
async fn helper_aborts_and_returns_operation_error() {
    let store = MemoryStore::new();
    let table = table();
    let log: Log = Arc::default();

    let hook_log = Arc::clone(&log);
    let result: Result<(), AppError> = run_in_transaction(&store, |txn| {
        let table = table.clone();
        Box::pin(async move {
            txn.post_abort(move || hook_log.lock().unwrap().push("abort"));
            txn.insert(&table, coupon(42)).await?;
            Err(AppError::Rejected)
        })
    })
    .await;

    assert_matches!(result, Err(AppError::Rejected));
    assert!(store.rows("coupon_issued").await.is_empty());
    assert_eq!(*log.lock().unwrap(), vec!["abort"]);
}

#[tokio::test]
async fn pop_removes_exactly_once() {
    let store = MemoryStore::new();
    let table = table();

    let mut txn = store.begin().await.unwrap();
    let row = txn.insert(&table, coupon(7)).await.unwrap();
    txn.commit().await.unwrap();
    let by_id = Filter::all().eq("id", row["id"].clone());

    let mut txn = store.begin().await.unwrap();
    let popped = txn.pop(&table, &by_id).await.unwrap();
    assert_eq!(popped["customer_id"], json!(7));
    assert_matches!(
        txn.pop(&table, &by_id).await,
        Err(DbError::NoSuchRecord { .. })
    );
    txn.commit().await.unwrap();
}

#[tokio::test]
async fn unknown_column_fails_before_reaching_store() {
    let store = MemoryStore::new();
    let result: Result<(), DbError> = run_in_transaction(&store, |txn| {
        Box::pin(async move {
            txn.select(&Table::new("empty"), &Filter::all().eq("nope", 1))
                .await?;
            Ok(())
        })
    })
    .await;
    assert_matches!(result, Err(DbError::UnknownColumn { .. }));
}
