use peerwork_db::DbError;

/// Failures on one RPC connection.
#[derive(Debug, thiserror::Error)]
pub enum RpcError {
    /// The connection was closed before the call was sent.
    #[error("Connection closed")]
    Closed,

    /// The connection dropped while the call was outstanding.
    #[error("Connection lost before a response arrived")]
    ConnectionLost,

    /// The remote side handled the call and reported failure.
    #[error("Remote error: {0}")]
    Remote(String),

    #[error("Frame encoding error: {0}")]
    Encoding(#[from] serde_json::Error),
}

/// Errors raised by enqueueing, dispatching, and performing work.
#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error(transparent)]
    Db(#[from] DbError),

    #[error(transparent)]
    Rpc(#[from] RpcError),

    /// A table name that no registered work type is bound to.
    #[error("Unknown work table: {0}")]
    UnknownTable(String),

    /// `do_work` failed; the surrounding transaction was aborted.
    #[error("Work execution failed: {0:#}")]
    Execution(anyhow::Error),

    /// The local pool was asked to perform work with no workers connected.
    #[error("No workers connected")]
    NoWorkers,

    /// A lifecycle operation was called in the wrong coordinator state.
    #[error("Invalid coordinator state: {0}")]
    InvalidState(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Failure carried by a [`WorkProposal`](crate::proposal::WorkProposal) signal.
///
/// Cloneable so every waiter on a signal observes the same value.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProposalError {
    /// The enclosing transaction aborted or failed to commit.
    #[error("Transaction failed")]
    TransactionFailed,

    /// The work row could not be written.
    #[error("Work proposal failed: {0}")]
    Proposal(String),

    /// The performer reported failure.
    #[error("Work execution failed: {0}")]
    Execution(String),
}
