//! Repository for the `node_info` table.

use chrono::Utc;
use serde_json::json;

use crate::error::DbError;
use crate::models::node_info::{node_info_table, NodeInfo};
use crate::row::{from_row, to_row, Filter, Row};
use crate::transaction::Transaction;

/// Registration and lookup of cluster nodes.
pub struct NodeInfoRepo;

impl NodeInfoRepo {
    /// Record this node as active.
    ///
    /// The table is locked exclusively first, so concurrent registrations
    /// from different nodes serialize. An existing row for `(hostname, port)`
    /// gets its `pid` and `time` refreshed; otherwise a row is inserted.
    pub async fn register(
        txn: &mut Transaction,
        hostname: &str,
        port: u16,
        pid: u32,
    ) -> Result<NodeInfo, DbError> {
        let table = node_info_table();
        txn.lock_exclusive(&table).await?;

        let key = key_filter(hostname, port);
        let now = Utc::now();
        let existing = txn.select(&table, &key).await?;
        if existing.is_empty() {
            let info = NodeInfo {
                hostname: hostname.to_string(),
                port: i32::from(port),
                pid: pid_column(pid),
                time: now,
            };
            let stored = txn.insert(&table, to_row(&info)?).await?;
            tracing::info!(%hostname, port, pid, "Registered node");
            return from_row(stored);
        }

        let mut changes = Row::new();
        changes.insert("pid".into(), json!(pid_column(pid)));
        changes.insert("time".into(), serde_json::to_value(now)?);
        txn.update(&table, &key, changes).await?;
        tracing::info!(%hostname, port, pid, "Refreshed node registration");

        let rows = txn.select(&table, &key).await?;
        rows.into_iter()
            .next()
            .map(from_row)
            .unwrap_or_else(|| {
                Err(DbError::NoSuchRecord {
                    table: table.name().to_string(),
                })
            })
    }

    /// All registered nodes, ordered by `(hostname, port)`.
    pub async fn active_nodes(txn: &mut Transaction) -> Result<Vec<NodeInfo>, DbError> {
        let rows = txn.select(&node_info_table(), &Filter::all()).await?;
        rows.into_iter().map(from_row).collect()
    }

    /// Refresh `time` for an existing registration. Returns whether a row
    /// was updated.
    pub async fn touch(txn: &mut Transaction, hostname: &str, port: u16) -> Result<bool, DbError> {
        let mut changes = Row::new();
        changes.insert("time".into(), serde_json::to_value(Utc::now())?);
        let updated = txn
            .update(&node_info_table(), &key_filter(hostname, port), changes)
            .await?;
        Ok(updated > 0)
    }
}

fn key_filter(hostname: &str, port: u16) -> Filter {
    Filter::all()
        .eq("hostname", hostname)
        .eq("port", i32::from(port))
}

/// Process ids are stored in an `INTEGER` column.
fn pid_column(pid: u32) -> i32 {
    i32::try_from(pid).unwrap_or(i32::MAX)
}
