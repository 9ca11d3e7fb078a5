//! Performers: anything that accepts a `(table, id)` and eventually runs it.

use std::sync::Arc;

use async_trait::async_trait;
use peerwork_core::load::LoadCounter;
use peerwork_core::types::DbId;
use peerwork_db::SharedStore;

use crate::error::QueueError;
use crate::work::{ultimately_perform, WorkRegistry};

/// Accepts work identified by table name and row id.
///
/// Resolves once the work has been performed (or found already performed)
/// and fails if the performer or the work itself failed.
#[async_trait]
pub trait WorkPerformer: Send + Sync {
    async fn perform_work(&self, table: &str, work_id: DbId) -> Result<(), QueueError>;
}

/// Picks the performer for newly committed or recovered work.
#[async_trait]
pub trait PerformerChooser: Send + Sync {
    async fn choose_performer(&self) -> Arc<dyn WorkPerformer>;
}

/// Performs work in this process, out of line from the enqueuing
/// transaction.
///
/// The final fallback of the coordinator and the performer used by
/// worker processes.
#[derive(Clone)]
pub struct LocalPerformer {
    store: SharedStore,
    registry: Arc<WorkRegistry>,
    load: Arc<LoadCounter>,
}

impl LocalPerformer {
    pub fn new(store: SharedStore, registry: Arc<WorkRegistry>) -> Self {
        Self {
            store,
            registry,
            load: Arc::new(LoadCounter::new()),
        }
    }

    /// Calls currently running through this performer (and its clones).
    pub fn current_load(&self) -> u64 {
        self.load.current()
    }

    pub fn store(&self) -> &SharedStore {
        &self.store
    }

    pub fn registry(&self) -> &Arc<WorkRegistry> {
        &self.registry
    }
}

#[async_trait]
impl WorkPerformer for LocalPerformer {
    async fn perform_work(&self, table: &str, work_id: DbId) -> Result<(), QueueError> {
        let _in_flight = self.load.track();
        ultimately_perform(self.store.as_ref(), &self.registry, table, work_id).await?;
        Ok(())
    }
}

/// Always performs locally.
#[async_trait]
impl PerformerChooser for LocalPerformer {
    async fn choose_performer(&self) -> Arc<dyn WorkPerformer> {
        Arc::new(self.clone())
    }
}
