//! Shared fixtures for queue integration tests.
#![allow(dead_code)]

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use anyhow::bail;
use async_trait::async_trait;
use peerwork_core::types::{DbId, Timestamp};
use peerwork_db::row::to_row;
use peerwork_db::{run_in_transaction, Column, MemoryStore, SharedStore, Table, Transaction};
use peerwork_queue::work::{work_table, ID_COLUMN, NOT_BEFORE_COLUMN};
use peerwork_queue::{LocalPerformer, WorkItem, WorkRegistry};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

pub const COUPON_ISSUED_TABLE: &str = "coupon_issued";

/// Application table written by [`CouponWork`].
pub fn coupon_issued_table() -> Table {
    Table::new(COUPON_ISSUED_TABLE)
        .with_column(Column::serial("id"))
        .with_column(Column::bigint("customer_id"))
        .with_primary_key(["id"])
}

/// Issues a coupon to one customer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CouponWork {
    pub customer_id: i64,
}

#[async_trait]
impl WorkItem for CouponWork {
    const TABLE: &'static str = "coupon_work";

    fn columns() -> Vec<Column> {
        vec![Column::bigint("customer_id")]
    }

    async fn do_work(&self, txn: &mut Transaction) -> anyhow::Result<()> {
        let row = to_row(&json!({ "customer_id": self.customer_id }))?;
        txn.insert(&coupon_issued_table(), row).await?;
        Ok(())
    }
}

/// Always fails.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FailingWork {
    pub reason: String,
}

#[async_trait]
impl WorkItem for FailingWork {
    const TABLE: &'static str = "failing_work";

    fn columns() -> Vec<Column> {
        vec![Column::text("reason")]
    }

    async fn do_work(&self, _txn: &mut Transaction) -> anyhow::Result<()> {
        bail!("{}", self.reason)
    }
}

/// Issues a coupon, then fails.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HalfDoneWork {
    pub customer_id: i64,
}

#[async_trait]
impl WorkItem for HalfDoneWork {
    const TABLE: &'static str = "half_done_work";

    fn columns() -> Vec<Column> {
        vec![Column::bigint("customer_id")]
    }

    async fn do_work(&self, txn: &mut Transaction) -> anyhow::Result<()> {
        CouponWork {
            customer_id: self.customer_id,
        }
        .do_work(txn)
        .await?;
        bail!("printer jammed after coupon {}", self.customer_id)
    }
}

pub struct Harness {
    pub store: MemoryStore,
    pub shared: SharedStore,
    pub registry: Arc<WorkRegistry>,
}

impl Harness {
    pub fn new() -> Self {
        let store = MemoryStore::new();
        let registry = WorkRegistry::new()
            .with::<CouponWork>()
            .with::<FailingWork>()
            .with::<HalfDoneWork>();
        Self {
            shared: Arc::new(store.clone()),
            store,
            registry: Arc::new(registry),
        }
    }

    pub fn local_performer(&self) -> LocalPerformer {
        LocalPerformer::new(Arc::clone(&self.shared), Arc::clone(&self.registry))
    }

    /// Customer ids that received a coupon, in issue order.
    pub async fn issued_coupons(&self) -> Vec<i64> {
        self.store
            .rows(COUPON_ISSUED_TABLE)
            .await
            .iter()
            .filter_map(|row| row.get("customer_id").and_then(Value::as_i64))
            .collect()
    }

    /// Ids of committed, not yet performed rows of `W`.
    pub async fn pending<W: WorkItem>(&self) -> Vec<DbId> {
        self.store
            .rows(W::TABLE)
            .await
            .iter()
            .filter_map(|row| row.get(ID_COLUMN).and_then(Value::as_i64))
            .collect()
    }

    /// Commit a work row directly, bypassing any queuer.
    pub async fn insert_pending<W: WorkItem>(&self, item: &W, not_before: Timestamp) -> DbId {
        let mut row = to_row(item).unwrap();
        row.insert(NOT_BEFORE_COLUMN.to_string(), json!(not_before));
        let stored = run_in_transaction(&self.store, move |txn| {
            Box::pin(async move { txn.insert(&work_table::<W>(), row).await })
        })
        .await
        .unwrap();
        stored[ID_COLUMN].as_i64().unwrap()
    }
}

/// Await `future`, failing the test if it takes longer than five seconds.
pub async fn within<F: Future>(future: F) -> F::Output {
    tokio::time::timeout(Duration::from_secs(5), future)
        .await
        .expect("timed out")
}

/// Poll `check` until it holds, failing the test after five seconds.
pub async fn eventually<F, Fut>(mut check: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    within(async {
        while !check().await {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
}
