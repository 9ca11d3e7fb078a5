//! The local worker pool: every worker process connected to this node.

use std::sync::Arc;

use async_trait::async_trait;
use peerwork_core::types::DbId;
use serde::Serialize;
use tokio::sync::RwLock;

use crate::error::QueueError;
use crate::performer::WorkPerformer;
use crate::worker::WorkerConnection;

/// Load snapshot of one worker link.
#[derive(Debug, Clone, Serialize)]
pub struct WorkerLoad {
    pub id: u64,
    pub load: u64,
}

/// Tracks connected workers and routes work to the least-loaded one.
pub struct WorkerConnectionPool {
    /// Kept in connection order.
    workers: RwLock<Vec<Arc<WorkerConnection>>>,
    max_load_per_worker: u64,
}

impl WorkerConnectionPool {
    pub fn new(max_load_per_worker: u64) -> Self {
        Self {
            workers: RwLock::new(Vec::new()),
            max_load_per_worker,
        }
    }

    pub fn max_load_per_worker(&self) -> u64 {
        self.max_load_per_worker
    }

    pub async fn add_worker(&self, worker: Arc<WorkerConnection>) {
        let mut workers = self.workers.write().await;
        workers.push(worker);
        tracing::info!(workers = workers.len(), "Worker added to local pool");
    }

    /// Remove the worker with `id`; returns whether it was present.
    pub async fn remove_worker(&self, id: u64) -> bool {
        let mut workers = self.workers.write().await;
        let before = workers.len();
        workers.retain(|w| w.id() != id);
        let removed = workers.len() != before;
        if removed {
            tracing::info!(worker_id = id, workers = workers.len(), "Worker removed from local pool");
        }
        removed
    }

    pub async fn worker_count(&self) -> usize {
        self.workers.read().await.len()
    }

    /// Whether at least one worker is below the per-worker maximum.
    pub async fn has_available_capacity(&self) -> bool {
        self.workers
            .read()
            .await
            .iter()
            .any(|w| w.current_load() < self.max_load_per_worker)
    }

    /// The worker with the smallest current load; ties go to the worker
    /// that connected first.
    pub async fn select_lowest_load(&self) -> Option<Arc<WorkerConnection>> {
        self.workers
            .read()
            .await
            .iter()
            .min_by_key(|w| w.current_load())
            .cloned()
    }

    /// Sum of in-flight calls across every worker.
    pub async fn all_worker_load(&self) -> u64 {
        self.workers
            .read()
            .await
            .iter()
            .map(|w| w.current_load())
            .sum()
    }

    pub async fn worker_loads(&self) -> Vec<WorkerLoad> {
        self.workers
            .read()
            .await
            .iter()
            .map(|w| WorkerLoad {
                id: w.id(),
                load: w.current_load(),
            })
            .collect()
    }

    /// Close and forget every worker link.
    pub async fn close_all(&self) {
        let workers: Vec<_> = self.workers.write().await.drain(..).collect();
        for worker in workers {
            worker.connection().close().await;
        }
    }
}

#[async_trait]
impl WorkPerformer for WorkerConnectionPool {
    async fn perform_work(&self, table: &str, work_id: DbId) -> Result<(), QueueError> {
        let worker = self.select_lowest_load().await.ok_or(QueueError::NoWorkers)?;
        tracing::debug!(%table, work_id, worker_id = worker.id(), "Dispatching work to local worker");
        worker.perform_work(table, work_id).await
    }
}
