//! Links between node controllers.
//!
//! A [`PeerConnection`] tracks two load figures for the remote node: the
//! load it last reported about itself, and the "bonus" load of work this
//! node sent it that has not been answered yet. Their sum is the estimate
//! used when picking a peer.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};

use async_trait::async_trait;
use peerwork_core::load::LoadCounter;
use peerwork_core::node::NodeAddress;
use peerwork_core::types::DbId;
use serde::Serialize;
use tokio::sync::mpsc;

use crate::connection::{IncomingCall, RpcConnection};
use crate::error::QueueError;
use crate::performer::{PerformerChooser, WorkPerformer};
use crate::protocol::Command;

/// Load snapshot of one peer link.
#[derive(Debug, Clone, Serialize)]
pub struct PeerLoad {
    pub node: Option<String>,
    pub reported_load: u64,
    pub bonus_load: u64,
}

/// This node's link to another node controller.
pub struct PeerConnection {
    connection: Arc<RpcConnection>,
    reported_load: AtomicU64,
    bonus_load: LoadCounter,
    identity: OnceLock<NodeAddress>,
}

impl PeerConnection {
    /// Wrap `connection`. Outbound links know the remote identity up front;
    /// inbound links learn it from `IdentifyNode`.
    pub fn new(connection: Arc<RpcConnection>, identity: Option<NodeAddress>) -> Self {
        let cell = OnceLock::new();
        if let Some(identity) = identity {
            let _ = cell.set(identity);
        }
        Self {
            connection,
            reported_load: AtomicU64::new(0),
            bonus_load: LoadCounter::new(),
            identity: cell,
        }
    }

    pub fn connection(&self) -> &Arc<RpcConnection> {
        &self.connection
    }

    /// Registered address of the remote node, once known.
    pub fn identity(&self) -> Option<&NodeAddress> {
        self.identity.get()
    }

    /// Load the remote node last reported about itself.
    pub fn reported_load(&self) -> u64 {
        self.reported_load.load(Ordering::Acquire)
    }

    /// Work sent to the remote node and not yet answered.
    pub fn bonus_load(&self) -> u64 {
        self.bonus_load.current()
    }

    pub fn current_load_estimate(&self) -> u64 {
        self.reported_load() + self.bonus_load()
    }

    pub fn snapshot(&self) -> PeerLoad {
        PeerLoad {
            node: self.identity().map(ToString::to_string),
            reported_load: self.reported_load(),
            bonus_load: self.bonus_load(),
        }
    }

    /// Record a `ReportLoad` from the remote node.
    pub fn record_reported_load(&self, load: u64) {
        self.reported_load.store(load, Ordering::Release);
    }

    /// Tell the remote node who we are. Sent once after dialling.
    pub async fn identify(&self, this_node: &NodeAddress) -> Result<(), QueueError> {
        self.connection
            .call(Command::IdentifyNode {
                host: this_node.host.clone(),
                port: this_node.port,
            })
            .await?;
        Ok(())
    }

    /// Tell the remote node our cumulative outstanding work.
    pub async fn report_load(&self, load: u64) -> Result<(), QueueError> {
        self.connection.call(Command::ReportLoad { load }).await?;
        Ok(())
    }

    /// Answer calls from the remote node until the link closes.
    ///
    /// `PerformWork` goes to `local`, which must never forward back out to
    /// a peer. Each call runs in its own task so slow work does not hold up
    /// load reports.
    pub async fn serve(
        self: Arc<Self>,
        mut incoming: mpsc::UnboundedReceiver<IncomingCall>,
        local: Arc<dyn PerformerChooser>,
    ) {
        while let Some(call) = incoming.recv().await {
            match &call.command {
                Command::PerformWork { table, work_id } => {
                    let (table, work_id) = (table.clone(), *work_id);
                    let local = Arc::clone(&local);
                    tokio::spawn(async move {
                        let performer = local.choose_performer().await;
                        let result = performer.perform_work(&table, work_id).await;
                        if let Err(e) = &result {
                            tracing::warn!(%table, work_id, error = %e, "Peer-requested work failed");
                        }
                        call.respond(result.map_err(|e| e.to_string()));
                    });
                }
                Command::ReportLoad { load } => {
                    self.record_reported_load(*load);
                    call.respond(Ok(()));
                }
                Command::IdentifyNode { host, port } => {
                    let node = NodeAddress::new(host.clone(), *port);
                    if self.identity.set(node.clone()).is_err() {
                        tracing::debug!(%node, "Peer identified more than once, keeping first");
                    } else {
                        tracing::info!(%node, "Peer identified");
                    }
                    call.respond(Ok(()));
                }
            }
        }
    }
}

#[async_trait]
impl WorkPerformer for PeerConnection {
    async fn perform_work(&self, table: &str, work_id: DbId) -> Result<(), QueueError> {
        let _in_flight = self.bonus_load.track();
        tracing::debug!(
            %table,
            work_id,
            peer = %self.connection.label(),
            "Dispatching work to peer",
        );
        self.connection
            .call(Command::PerformWork {
                table: table.to_string(),
                work_id,
            })
            .await?;
        Ok(())
    }
}
