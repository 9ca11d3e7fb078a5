//! Enqueueing work inside an application transaction.
//!
//! [`WorkQueuer`] writes the row, then hands `(table, id)` to a performer
//! once the transaction commits. [`ImmediateQueuer`] runs the work inside
//! the enqueuing transaction itself, for deployments with no queue.

use std::sync::Arc;

use chrono::Utc;
use peerwork_core::scheduling::delay_until;
use peerwork_core::types::{DbId, Timestamp};
use peerwork_db::row::{to_row, Row};
use peerwork_db::{DbError, Filter, Transaction};
use serde_json::Value;

use crate::error::{ProposalError, QueueError};
use crate::performer::{LocalPerformer, PerformerChooser};
use crate::proposal::WorkProposal;
use crate::work::{work_table, WorkItem, GROUP_COLUMN, ID_COLUMN, NOT_BEFORE_COLUMN};

/// Optional shared columns for an enqueued item.
#[derive(Debug, Clone, Default)]
pub struct EnqueueOptions {
    /// Earliest time the item may run; defaults to the insert time.
    pub not_before: Option<Timestamp>,
    /// Named set the item belongs to. Stored only.
    pub group: Option<String>,
}

impl EnqueueOptions {
    pub fn not_before(mut self, at: Timestamp) -> Self {
        self.not_before = Some(at);
        self
    }

    pub fn group(mut self, group: impl Into<String>) -> Self {
        self.group = Some(group.into());
        self
    }
}

/// Dispatches committed work through a [`PerformerChooser`].
#[derive(Clone)]
pub struct WorkQueuer {
    chooser: Arc<dyn PerformerChooser>,
}

impl WorkQueuer {
    pub fn new(chooser: Arc<dyn PerformerChooser>) -> Self {
        Self { chooser }
    }

    /// A queuer that always performs in this process.
    pub fn local(performer: LocalPerformer) -> Self {
        Self::new(Arc::new(performer))
    }

    /// Enqueue `item` in `txn` with default options.
    pub async fn enqueue_work<W: WorkItem>(&self, txn: &mut Transaction, item: W) -> WorkProposal {
        self.enqueue_work_with(txn, item, EnqueueOptions::default())
            .await
    }

    /// Enqueue `item` in `txn`.
    ///
    /// The row is inserted before this returns; *proposed* fires with its
    /// id (or the insert error). On commit *committed* fires and a task is
    /// spawned that waits for `not_before`, chooses a performer, and fires
    /// *executed* with the outcome. On abort *committed* fails and
    /// *executed* never fires.
    pub async fn enqueue_work_with<W: WorkItem>(
        &self,
        txn: &mut Transaction,
        item: W,
        options: EnqueueOptions,
    ) -> WorkProposal {
        let (proposal, signals) = WorkProposal::new(W::TABLE);
        let (work_id, not_before) = match insert_work(txn, &item, options).await {
            Ok(inserted) => inserted,
            Err(e) => {
                tracing::warn!(table = W::TABLE, error = %e, "Failed to propose work");
                signals
                    .proposed
                    .send_replace(Some(Err(ProposalError::Proposal(e.to_string()))));
                return proposal;
            }
        };
        signals.proposed.send_replace(Some(Ok(work_id)));

        let committed = Arc::clone(&signals.committed);
        txn.post_abort(move || {
            committed.send_replace(Some(Err(ProposalError::TransactionFailed)));
        });

        let chooser = Arc::clone(&self.chooser);
        let committed = signals.committed;
        let executed = signals.executed;
        txn.post_commit(move || {
            committed.send_replace(Some(Ok(())));
            tokio::spawn(async move {
                let delay = delay_until(Utc::now(), not_before);
                if !delay.is_zero() {
                    tracing::debug!(
                        table = W::TABLE,
                        work_id,
                        delay_ms = delay.as_millis() as u64,
                        "Delaying work until not_before",
                    );
                    tokio::time::sleep(delay).await;
                }
                let performer = chooser.choose_performer().await;
                let result = performer.perform_work(W::TABLE, work_id).await;
                if let Err(e) = &result {
                    tracing::warn!(table = W::TABLE, work_id, error = %e, "Work dispatch failed");
                }
                executed.send_replace(Some(
                    result.map_err(|e| ProposalError::Execution(e.to_string())),
                ));
            });
        });

        tracing::debug!(table = W::TABLE, work_id, "Work proposed");
        proposal
    }
}

/// Runs work synchronously inside the enqueuing transaction.
///
/// No durability or offload benefit, but the same API as [`WorkQueuer`].
/// The row is written, `do_work` runs, and the row is deleted only if
/// `do_work` succeeded; a failing item stays queued. *committed* and then
/// *executed* fire when the transaction commits.
///
/// `do_work` shares the caller's transaction, so writes a failing item made
/// before it failed are committed along with the queued row. Recovery later
/// re-runs the item on top of them; items run this way must tolerate that.
#[derive(Debug, Clone, Copy, Default)]
pub struct ImmediateQueuer;

impl ImmediateQueuer {
    pub fn new() -> Self {
        Self
    }

    pub async fn enqueue_work<W: WorkItem>(&self, txn: &mut Transaction, item: W) -> WorkProposal {
        self.enqueue_work_with(txn, item, EnqueueOptions::default())
            .await
    }

    pub async fn enqueue_work_with<W: WorkItem>(
        &self,
        txn: &mut Transaction,
        item: W,
        options: EnqueueOptions,
    ) -> WorkProposal {
        let (proposal, signals) = WorkProposal::new(W::TABLE);
        let work_id = match insert_work(txn, &item, options).await {
            Ok((work_id, _)) => work_id,
            Err(e) => {
                signals
                    .proposed
                    .send_replace(Some(Err(ProposalError::Proposal(e.to_string()))));
                return proposal;
            }
        };
        signals.proposed.send_replace(Some(Ok(work_id)));

        let outcome = match item.do_work(txn).await {
            Ok(()) => {
                let by_id = Filter::all().eq(ID_COLUMN, work_id);
                txn.delete(&work_table::<W>(), &by_id)
                    .await
                    .map(|_| ())
                    .map_err(|e| ProposalError::Execution(e.to_string()))
            }
            Err(e) => {
                tracing::warn!(table = W::TABLE, work_id, error = %e, "Immediate work failed");
                Err(ProposalError::Execution(format!("{e:#}")))
            }
        };

        let committed = Arc::clone(&signals.committed);
        txn.post_abort(move || {
            committed.send_replace(Some(Err(ProposalError::TransactionFailed)));
        });
        let committed = signals.committed;
        let executed = signals.executed;
        txn.post_commit(move || {
            committed.send_replace(Some(Ok(())));
            executed.send_replace(Some(outcome));
        });
        proposal
    }
}

/// Insert the row for `item`, returning its id and effective `not_before`.
async fn insert_work<W: WorkItem>(
    txn: &mut Transaction,
    item: &W,
    options: EnqueueOptions,
) -> Result<(DbId, Timestamp), QueueError> {
    let mut row: Row = to_row(item)?;
    if let Some(at) = options.not_before {
        row.insert(
            NOT_BEFORE_COLUMN.to_string(),
            serde_json::to_value(at).map_err(DbError::from)?,
        );
    }
    if let Some(group) = options.group {
        row.insert(GROUP_COLUMN.to_string(), Value::String(group));
    }

    let stored = txn.insert(&work_table::<W>(), row).await?;
    let work_id = stored
        .get(ID_COLUMN)
        .and_then(Value::as_i64)
        .ok_or_else(|| missing_column(W::TABLE, ID_COLUMN))?;
    let not_before = stored
        .get(NOT_BEFORE_COLUMN)
        .cloned()
        .and_then(|v| serde_json::from_value::<Timestamp>(v).ok())
        .ok_or_else(|| missing_column(W::TABLE, NOT_BEFORE_COLUMN))?;
    Ok((work_id, not_before))
}

fn missing_column(table: &str, column: &str) -> QueueError {
    QueueError::Db(DbError::NotNull {
        table: table.to_string(),
        column: column.to_string(),
    })
}
