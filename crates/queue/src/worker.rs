//! Links between a node controller and its local worker processes.
//!
//! The node side holds one [`WorkerConnection`] per connected worker and
//! only ever sends `PerformWork`. The worker side, [`WorkerProcess`], dials
//! the node and answers those calls by performing the work against its own
//! store.

use std::sync::Arc;

use async_trait::async_trait;
use peerwork_core::load::LoadCounter;
use peerwork_core::types::DbId;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::backoff::{connect_with_backoff, ReconnectConfig};
use crate::connection::{IncomingCall, RpcConnection};
use crate::error::QueueError;
use crate::performer::{LocalPerformer, WorkPerformer};
use crate::protocol::Command;

// ---------------------------------------------------------------------------
// Node side
// ---------------------------------------------------------------------------

/// The node controller's link to one worker process.
pub struct WorkerConnection {
    id: u64,
    connection: Arc<RpcConnection>,
    load: LoadCounter,
}

impl WorkerConnection {
    pub fn new(id: u64, connection: Arc<RpcConnection>) -> Self {
        Self {
            id,
            connection,
            load: LoadCounter::new(),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    /// Calls sent to this worker and not yet answered.
    pub fn current_load(&self) -> u64 {
        self.load.current()
    }

    pub fn connection(&self) -> &Arc<RpcConnection> {
        &self.connection
    }
}

#[async_trait]
impl WorkPerformer for WorkerConnection {
    async fn perform_work(&self, table: &str, work_id: DbId) -> Result<(), QueueError> {
        let _in_flight = self.load.track();
        self.connection
            .call(Command::PerformWork {
                table: table.to_string(),
                work_id,
            })
            .await?;
        Ok(())
    }
}

/// Workers never issue commands; refuse anything they send.
pub async fn refuse_worker_calls(mut incoming: mpsc::UnboundedReceiver<IncomingCall>) {
    while let Some(call) = incoming.recv().await {
        tracing::warn!(command = call.command.name(), "Ignoring command sent by a worker");
        call.respond(Err("Workers may not issue commands".into()));
    }
}

// ---------------------------------------------------------------------------
// Worker side
// ---------------------------------------------------------------------------

/// A worker process: keeps a link to its node controller open and performs
/// whatever work the node hands it.
pub struct WorkerProcess {
    node_addr: String,
    performer: LocalPerformer,
    reconnect: ReconnectConfig,
}

impl WorkerProcess {
    pub fn new(node_addr: impl Into<String>, performer: LocalPerformer) -> Self {
        Self {
            node_addr: node_addr.into(),
            performer,
            reconnect: ReconnectConfig::default(),
        }
    }

    pub fn with_reconnect(mut self, reconnect: ReconnectConfig) -> Self {
        self.reconnect = reconnect;
        self
    }

    /// Serve until `cancel` fires, reconnecting whenever the link drops.
    pub async fn run(&self, cancel: CancellationToken) {
        tracing::info!(node = %self.node_addr, "Worker process started");
        loop {
            let stream = connect_with_backoff(&self.node_addr, &self.reconnect, &cancel, || {
                TcpStream::connect(self.node_addr.as_str())
            })
            .await;
            let Some(stream) = stream else {
                break;
            };

            let (connection, incoming) = RpcConnection::open(stream, self.node_addr.clone());
            self.serve(&connection, incoming, &cancel).await;
            connection.close().await;

            if cancel.is_cancelled() {
                break;
            }
            tracing::warn!(node = %self.node_addr, "Lost connection to node, reconnecting");
        }
        tracing::info!(node = %self.node_addr, "Worker process stopped");
    }

    /// Answer calls on one link until it closes or `cancel` fires.
    async fn serve(
        &self,
        connection: &RpcConnection,
        mut incoming: mpsc::UnboundedReceiver<IncomingCall>,
        cancel: &CancellationToken,
    ) {
        loop {
            let call = tokio::select! {
                _ = cancel.cancelled() => return,
                _ = connection.closed() => return,
                call = incoming.recv() => match call {
                    Some(call) => call,
                    None => return,
                },
            };
            let performer = self.performer.clone();
            tokio::spawn(async move {
                let result = match &call.command {
                    Command::PerformWork { table, work_id } => performer
                        .perform_work(table, *work_id)
                        .await
                        .map_err(|e| e.to_string()),
                    other => Err(format!("{} is not supported by workers", other.name())),
                };
                call.respond(result);
            });
        }
    }
}
