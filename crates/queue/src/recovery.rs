//! Lost-work recovery.
//!
//! A row still present long after its `not_before` was either never
//! dispatched (its enqueuer died after commit) or dispatched to a performer
//! that died before finishing. Either way it is resubmitted. Execution is
//! not idempotent, so a slow but healthy performer can see its item run a
//! second time.

use std::time::Duration;

use chrono::Utc;
use futures::future::join_all;
use peerwork_core::scheduling::overdue_cutoff;
use peerwork_core::types::{DbId, Timestamp};
use peerwork_db::{run_in_transaction, Filter, Store};
use serde_json::Value;

use crate::error::QueueError;
use crate::performer::PerformerChooser;
use crate::work::{WorkRegistry, ID_COLUMN, NOT_BEFORE_COLUMN};

/// One overdue row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OverdueWork {
    pub table: String,
    pub work_id: DbId,
}

/// Rows in every registered table whose `not_before` is earlier than
/// `cutoff`. The scan commits before anything is dispatched.
pub async fn overdue_work(
    store: &dyn Store,
    registry: &WorkRegistry,
    cutoff: Timestamp,
) -> Result<Vec<OverdueWork>, QueueError> {
    let tables: Vec<_> = registry.tables().cloned().collect();
    run_in_transaction(store, |txn| {
        Box::pin(async move {
            let mut overdue = Vec::new();
            for table in &tables {
                let filter = Filter::all().before(NOT_BEFORE_COLUMN, cutoff);
                for row in txn.select(table, &filter).await? {
                    if let Some(work_id) = row.get(ID_COLUMN).and_then(Value::as_i64) {
                        overdue.push(OverdueWork {
                            table: table.name().to_string(),
                            work_id,
                        });
                    }
                }
            }
            Ok::<_, QueueError>(overdue)
        })
    })
    .await
}

/// Dispatch every item through `chooser` and wait for all of them.
/// Returns how many completed successfully; failures are logged and left
/// for the next cycle.
pub async fn resubmit(chooser: &dyn PerformerChooser, overdue: Vec<OverdueWork>) -> usize {
    let attempts = overdue.into_iter().map(|work| async move {
        let performer = chooser.choose_performer().await;
        let result = performer.perform_work(&work.table, work.work_id).await;
        if let Err(e) = &result {
            tracing::warn!(
                table = %work.table,
                work_id = work.work_id,
                error = %e,
                "Recovered work failed, will retry next cycle",
            );
        }
        result.is_ok()
    });
    join_all(attempts).await.into_iter().filter(|ok| *ok).count()
}

/// One recovery pass: scan for overdue rows and resubmit them.
pub async fn run_cycle(
    store: &dyn Store,
    registry: &WorkRegistry,
    chooser: &dyn PerformerChooser,
    processing_timeout: Duration,
) -> Result<usize, QueueError> {
    let cutoff = overdue_cutoff(Utc::now(), processing_timeout);
    let overdue = overdue_work(store, registry, cutoff).await?;
    if overdue.is_empty() {
        tracing::debug!("Recovery scan found no overdue work");
        return Ok(0);
    }

    let found = overdue.len();
    tracing::info!(found, "Resubmitting overdue work");
    let completed = resubmit(chooser, overdue).await;
    tracing::info!(found, completed, "Recovery cycle finished");
    Ok(completed)
}
