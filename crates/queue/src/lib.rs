//! Distributed work queue and peer coordination.
//!
//! Work items are rows in per-type tables. Enqueueing inserts the row in
//! the caller's transaction; once that commits, a performer chosen by the
//! [`Coordinator`] (a local worker, the least-loaded peer node, or this
//! process) deletes the row and runs the item in a transaction of its own.
//! Rows that outlive the processing timeout are picked up again by the
//! recovery loop.

pub mod backoff;
pub mod config;
pub mod connection;
pub mod coordinator;
pub mod error;
pub mod peer;
pub mod performer;
pub mod pool;
pub mod proposal;
pub mod protocol;
pub mod queuer;
pub mod recovery;
pub mod work;
pub mod worker;

pub use config::QueueConfig;
pub use coordinator::{Coordinator, CoordinatorState, CoordinatorStatus, Performer};
pub use error::{ProposalError, QueueError, RpcError};
pub use performer::{LocalPerformer, PerformerChooser, WorkPerformer};
pub use pool::WorkerConnectionPool;
pub use proposal::WorkProposal;
pub use queuer::{EnqueueOptions, ImmediateQueuer, WorkQueuer};
pub use work::{ultimately_perform, Outcome, WorkItem, WorkRegistry};
pub use worker::WorkerProcess;
