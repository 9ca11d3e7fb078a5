//! In-memory lifecycle of one enqueued work item.
//!
//! A [`WorkProposal`] carries three one-shot signals that fire in order:
//! *proposed* (row written), *committed* (enclosing transaction outcome),
//! and *executed* (performer outcome). An aborted transaction fails
//! *committed* and *executed* never fires.

use std::sync::Arc;

use peerwork_core::types::DbId;
use tokio::sync::watch;

use crate::error::ProposalError;

type Signal<T> = Option<Result<T, ProposalError>>;

/// Observer handle for an enqueued work item. Cheap to clone.
#[derive(Debug, Clone)]
pub struct WorkProposal {
    table: &'static str,
    proposed: watch::Receiver<Signal<DbId>>,
    committed: watch::Receiver<Signal<()>>,
    executed: watch::Receiver<Signal<()>>,
}

impl WorkProposal {
    /// Create a proposal for `table` and the senders that resolve it.
    pub(crate) fn new(table: &'static str) -> (Self, ProposalSignals) {
        let (proposed_tx, proposed) = watch::channel(None);
        let (committed_tx, committed) = watch::channel(None);
        let (executed_tx, executed) = watch::channel(None);
        let proposal = Self {
            table,
            proposed,
            committed,
            executed,
        };
        let signals = ProposalSignals {
            proposed: proposed_tx,
            committed: Arc::new(committed_tx),
            executed: executed_tx,
        };
        (proposal, signals)
    }

    /// Work table of the proposed item.
    pub fn table(&self) -> &'static str {
        self.table
    }

    /// Resolves with the new row's id once it is written.
    pub async fn when_proposed(&self) -> Result<DbId, ProposalError> {
        wait(&self.proposed).await
    }

    /// Resolves once the enclosing transaction committed, or fails with
    /// [`ProposalError::TransactionFailed`].
    pub async fn when_committed(&self) -> Result<(), ProposalError> {
        wait(&self.committed).await
    }

    /// Resolves once a performer finished the work. Never resolves if the
    /// enclosing transaction failed.
    pub async fn when_executed(&self) -> Result<(), ProposalError> {
        wait(&self.executed).await
    }

    /// Non-blocking peek at the *proposed* signal.
    pub fn proposed(&self) -> Signal<DbId> {
        self.proposed.borrow().clone()
    }

    pub fn committed(&self) -> Signal<()> {
        self.committed.borrow().clone()
    }

    pub fn executed(&self) -> Signal<()> {
        self.executed.borrow().clone()
    }
}

/// Sending half of a [`WorkProposal`].
pub(crate) struct ProposalSignals {
    pub(crate) proposed: watch::Sender<Signal<DbId>>,
    /// Shared between the post-commit and post-abort hooks.
    pub(crate) committed: Arc<watch::Sender<Signal<()>>>,
    pub(crate) executed: watch::Sender<Signal<()>>,
}

/// Wait for a signal. A sender dropped without firing leaves the waiter
/// pending forever.
async fn wait<T: Clone>(rx: &watch::Receiver<Signal<T>>) -> Result<T, ProposalError> {
    let mut rx = rx.clone();
    if let Ok(value) = rx.wait_for(Option::is_some).await {
        if let Some(result) = value.as_ref() {
            return result.clone();
        }
    }
    std::future::pending().await
}
