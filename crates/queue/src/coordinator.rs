//! The cluster coordinator: one per node controller process.
//!
//! [`Coordinator`] owns the peer listener, the local worker pool, the set of
//! peer links, and the background loops (lost-work recovery, registry
//! heartbeat, load reports). It also decides where each piece of work runs:
//! a local worker with spare capacity first, then the least-loaded peer,
//! then in this process.
//!
//! Lifecycle: `Stopped -> Starting -> Running -> Stopping -> Stopped`.

use std::fmt;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use futures::future::join_all;
use peerwork_core::node::{node_index, NodeAddress};
use peerwork_core::scheduling::next_recovery_delay;
use peerwork_core::types::DbId;
use peerwork_db::models::node_info::NodeInfo;
use peerwork_db::repositories::NodeInfoRepo;
use peerwork_db::{run_in_transaction, DbError, SharedStore};
use serde::Serialize;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant};
use tokio_util::sync::CancellationToken;

use crate::config::QueueConfig;
use crate::connection::{IncomingCall, RpcConnection};
use crate::error::QueueError;
use crate::peer::{PeerConnection, PeerLoad};
use crate::performer::{LocalPerformer, PerformerChooser, WorkPerformer};
use crate::pool::{WorkerConnectionPool, WorkerLoad};
use crate::queuer::WorkQueuer;
use crate::recovery;
use crate::work::WorkRegistry;
use crate::worker::{refuse_worker_calls, WorkerConnection};

// ---------------------------------------------------------------------------
// State and status
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CoordinatorState {
    Stopped,
    Starting,
    Running,
    Stopping,
}

impl fmt::Display for CoordinatorState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            CoordinatorState::Stopped => "stopped",
            CoordinatorState::Starting => "starting",
            CoordinatorState::Running => "running",
            CoordinatorState::Stopping => "stopping",
        };
        f.write_str(name)
    }
}

/// Point-in-time view of a coordinator, served by the status endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct CoordinatorStatus {
    pub state: CoordinatorState,
    pub node: Option<String>,
    pub peers: Vec<PeerLoad>,
    pub workers: Vec<WorkerLoad>,
    /// Work running in this process through the fallback performer.
    pub local_load: u64,
}

// ---------------------------------------------------------------------------
// Performer selection
// ---------------------------------------------------------------------------

/// Where a piece of work was routed.
#[derive(Clone)]
pub enum Performer {
    LocalPool(Arc<WorkerConnectionPool>),
    Peer(Arc<PeerConnection>),
    Local(LocalPerformer),
}

impl fmt::Debug for Performer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Performer::LocalPool(_) => f.write_str("LocalPool"),
            Performer::Peer(peer) => write!(f, "Peer({})", peer.connection().label()),
            Performer::Local(_) => f.write_str("Local"),
        }
    }
}

#[async_trait]
impl WorkPerformer for Performer {
    async fn perform_work(&self, table: &str, work_id: DbId) -> Result<(), QueueError> {
        match self {
            Performer::LocalPool(pool) => pool.perform_work(table, work_id).await,
            Performer::Peer(peer) => peer.perform_work(table, work_id).await,
            Performer::Local(local) => local.perform_work(table, work_id).await,
        }
    }
}

/// Chooser handed to peer links: work a peer asks us to do is never
/// forwarded to a third node.
struct OnlyLocal(Arc<Coordinator>);

#[async_trait]
impl PerformerChooser for OnlyLocal {
    async fn choose_performer(&self) -> Arc<dyn WorkPerformer> {
        Arc::new(self.0.select_performer(true).await)
    }
}

// ---------------------------------------------------------------------------
// Coordinator
// ---------------------------------------------------------------------------

struct Lifecycle {
    state: CoordinatorState,
    cancel: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

/// Per-node coordination service.
///
/// Created with [`Coordinator::new`]; the returned `Arc` is shared with
/// request handlers and the queuer.
pub struct Coordinator {
    config: QueueConfig,
    local: LocalPerformer,
    pool: Arc<WorkerConnectionPool>,
    peers: RwLock<Vec<Arc<PeerConnection>>>,
    /// Registered address, set once the peer listener is bound.
    node: RwLock<Option<NodeAddress>>,
    worker_endpoint: RwLock<Option<SocketAddr>>,
    lifecycle: Mutex<Lifecycle>,
    next_worker_id: AtomicU64,
}

impl Coordinator {
    pub fn new(config: QueueConfig, store: SharedStore, registry: Arc<WorkRegistry>) -> Arc<Self> {
        let pool = Arc::new(WorkerConnectionPool::new(config.max_load_per_worker));
        Arc::new(Self {
            local: LocalPerformer::new(store, registry),
            pool,
            peers: RwLock::new(Vec::new()),
            node: RwLock::new(None),
            worker_endpoint: RwLock::new(None),
            lifecycle: Mutex::new(Lifecycle {
                state: CoordinatorState::Stopped,
                cancel: CancellationToken::new(),
                tasks: Vec::new(),
            }),
            next_worker_id: AtomicU64::new(1),
            config,
        })
    }

    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    pub fn pool(&self) -> &Arc<WorkerConnectionPool> {
        &self.pool
    }

    pub fn local_performer(&self) -> &LocalPerformer {
        &self.local
    }

    /// A queuer that dispatches through this coordinator.
    pub fn queuer(self: &Arc<Self>) -> WorkQueuer {
        WorkQueuer::new(Arc::clone(self) as Arc<dyn PerformerChooser>)
    }

    pub async fn state(&self) -> CoordinatorState {
        self.lifecycle.lock().await.state
    }

    /// Address this node registered, once started.
    pub async fn node_address(&self) -> Option<NodeAddress> {
        self.node.read().await.clone()
    }

    /// Bound endpoint local workers connect to, while running.
    pub async fn worker_endpoint(&self) -> Option<SocketAddr> {
        *self.worker_endpoint.read().await
    }

    pub async fn peers(&self) -> Vec<Arc<PeerConnection>> {
        self.peers.read().await.clone()
    }

    pub async fn status(&self) -> CoordinatorStatus {
        CoordinatorStatus {
            state: self.state().await,
            node: self.node_address().await.map(|n| n.to_string()),
            peers: self.peers.read().await.iter().map(|p| p.snapshot()).collect(),
            workers: self.pool.worker_loads().await,
            local_load: self.local.current_load(),
        }
    }

    /// Pick a performer: the local pool if any worker has capacity, else
    /// the peer with the lowest load estimate (unless `only_locally`), else
    /// this process.
    pub async fn select_performer(&self, only_locally: bool) -> Performer {
        if self.pool.has_available_capacity().await {
            return Performer::LocalPool(Arc::clone(&self.pool));
        }
        if !only_locally {
            let peers = self.peers.read().await;
            let best = peers
                .iter()
                .filter(|p| !p.connection().is_closed())
                .min_by_key(|p| p.current_load_estimate());
            if let Some(peer) = best {
                return Performer::Peer(Arc::clone(peer));
            }
        }
        Performer::Local(self.local.clone())
    }

    // ---- lifecycle ----

    /// Bind the peer listener, register in the node registry, start the
    /// background loops, and dial every other registered node.
    ///
    /// Binding and registration errors are returned and leave the
    /// coordinator stopped. Failing to reach a peer is only logged.
    pub async fn start(self: &Arc<Self>) -> Result<(), QueueError> {
        {
            let mut lifecycle = self.lifecycle.lock().await;
            if lifecycle.state != CoordinatorState::Stopped {
                return Err(QueueError::InvalidState(format!(
                    "cannot start while {}",
                    lifecycle.state
                )));
            }
            lifecycle.state = CoordinatorState::Starting;
        }

        let cancel = CancellationToken::new();
        let started = self.start_services(&cancel).await;

        let mut lifecycle = self.lifecycle.lock().await;
        match started {
            Ok(tasks) => {
                lifecycle.state = CoordinatorState::Running;
                lifecycle.cancel = cancel;
                lifecycle.tasks = tasks;
                tracing::info!("Coordinator running");
                Ok(())
            }
            Err(e) => {
                cancel.cancel();
                lifecycle.state = CoordinatorState::Stopped;
                tracing::error!(error = %e, "Coordinator failed to start");
                Err(e)
            }
        }
    }

    async fn start_services(
        self: &Arc<Self>,
        cancel: &CancellationToken,
    ) -> Result<Vec<JoinHandle<()>>, QueueError> {
        let listener =
            TcpListener::bind((self.config.bind_host.as_str(), self.config.peer_port)).await?;
        let node = NodeAddress::new(self.config.hostname.clone(), listener.local_addr()?.port());
        let known = self.register(&node).await?;
        *self.node.write().await = Some(node.clone());
        tracing::info!(%node, "Node registered, listening for peers");

        let worker_listener = match &self.config.worker_addr {
            Some(addr) => {
                let listener = TcpListener::bind(addr.as_str()).await?;
                let bound = listener.local_addr()?;
                *self.worker_endpoint.write().await = Some(bound);
                tracing::info!(%bound, "Listening for local workers");
                Some(listener)
            }
            None => None,
        };

        let mut tasks = vec![tokio::spawn(
            Arc::clone(self).accept_peers(listener, cancel.clone()),
        )];
        if let Some(listener) = worker_listener {
            tasks.push(tokio::spawn(
                Arc::clone(self).accept_workers(listener, cancel.clone()),
            ));
        }
        tasks.push(tokio::spawn(Arc::clone(self).recovery_loop(cancel.clone())));
        tasks.push(tokio::spawn(Arc::clone(self).heartbeat_loop(cancel.clone())));
        tasks.push(tokio::spawn(Arc::clone(self).load_report_loop(cancel.clone())));

        let others: Vec<NodeAddress> = known.into_iter().filter(|n| *n != node).collect();
        tracing::info!(peers = others.len(), "Connecting to registered peers");
        join_all(others.into_iter().map(|peer| async move {
            if let Err(e) = self.connect_to_peer(peer.clone()).await {
                tracing::warn!(%peer, error = %e, "Could not connect to peer");
            }
        }))
        .await;

        Ok(tasks)
    }

    /// Stop listening, stop the background loops (waiting for a recovery
    /// cycle already in flight), then close every peer and worker link.
    ///
    /// In-flight `PerformWork` calls are abandoned, not awaited.
    pub async fn stop(&self) -> Result<(), QueueError> {
        let (cancel, tasks) = {
            let mut lifecycle = self.lifecycle.lock().await;
            match lifecycle.state {
                CoordinatorState::Running => {}
                CoordinatorState::Stopped => return Ok(()),
                other => {
                    return Err(QueueError::InvalidState(format!("cannot stop while {other}")));
                }
            }
            lifecycle.state = CoordinatorState::Stopping;
            (lifecycle.cancel.clone(), std::mem::take(&mut lifecycle.tasks))
        };

        tracing::info!("Stopping coordinator");
        cancel.cancel();
        for task in tasks {
            if let Err(e) = task.await {
                tracing::warn!(error = %e, "Background task ended abnormally");
            }
        }

        let peers: Vec<_> = self.peers.write().await.drain(..).collect();
        for peer in peers {
            peer.connection().close().await;
        }
        self.pool.close_all().await;
        *self.worker_endpoint.write().await = None;

        self.lifecycle.lock().await.state = CoordinatorState::Stopped;
        tracing::info!("Coordinator stopped");
        Ok(())
    }

    // ---- node registry ----

    /// Register `node` and return every registered node address.
    async fn register(&self, node: &NodeAddress) -> Result<Vec<NodeAddress>, QueueError> {
        let (host, port) = (node.host.clone(), node.port);
        let nodes = run_in_transaction(self.local.store().as_ref(), move |txn| {
            Box::pin(async move {
                NodeInfoRepo::register(txn, &host, port, std::process::id()).await?;
                NodeInfoRepo::active_nodes(txn).await
            })
        })
        .await?;
        Ok(nodes.iter().filter_map(NodeInfo::address).collect())
    }

    async fn active_nodes(&self) -> Result<Vec<NodeAddress>, DbError> {
        let nodes = run_in_transaction(self.local.store().as_ref(), |txn| {
            Box::pin(async move { NodeInfoRepo::active_nodes(txn).await })
        })
        .await?;
        Ok(nodes.iter().filter_map(NodeInfo::address).collect())
    }

    // ---- peers ----

    /// Dial `peer`, attach the link, and identify ourselves.
    pub async fn connect_to_peer(
        self: &Arc<Self>,
        peer: NodeAddress,
    ) -> Result<Arc<PeerConnection>, QueueError> {
        let dial = TcpStream::connect((peer.host.as_str(), peer.port));
        let stream = bounded(
            self.config.connect_timeout,
            format!("connecting to {peer}"),
            async { Ok::<_, QueueError>(dial.await?) },
        )
        .await?;

        let (connection, incoming) = RpcConnection::open(stream, peer.to_string());
        let link = Arc::new(PeerConnection::new(connection, Some(peer.clone())));
        self.attach_peer(Arc::clone(&link), incoming).await;

        // A peer that accepts but never answers must not stall start().
        if let Some(this) = self.node_address().await {
            let identify = link.identify(&this);
            let limit = self.config.connect_timeout;
            if let Err(e) = bounded(limit, format!("identifying to {peer}"), identify).await {
                link.connection().close().await;
                return Err(e);
            }
        }
        tracing::info!(%peer, "Connected to peer");
        Ok(link)
    }

    /// Track `peer` and serve its calls; it is dropped from the peer set
    /// when the link closes.
    async fn attach_peer(
        self: &Arc<Self>,
        peer: Arc<PeerConnection>,
        incoming: mpsc::UnboundedReceiver<IncomingCall>,
    ) {
        self.peers.write().await.push(Arc::clone(&peer));
        let this = Arc::clone(self);
        tokio::spawn(async move {
            let only_local: Arc<dyn PerformerChooser> = Arc::new(OnlyLocal(Arc::clone(&this)));
            Arc::clone(&peer).serve(incoming, only_local).await;
            peer.connection().close().await;
            this.remove_peer(&peer).await;
        });
    }

    async fn remove_peer(&self, peer: &Arc<PeerConnection>) {
        let mut peers = self.peers.write().await;
        let before = peers.len();
        peers.retain(|p| !Arc::ptr_eq(p, peer));
        if peers.len() != before {
            tracing::info!(
                peer = %peer.connection().label(),
                peers = peers.len(),
                "Peer disconnected",
            );
        }
    }

    async fn accept_peers(self: Arc<Self>, listener: TcpListener, cancel: CancellationToken) {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                accepted = listener.accept() => match accepted {
                    Ok((stream, remote)) => {
                        tracing::info!(%remote, "Accepted peer connection");
                        let (connection, incoming) = RpcConnection::open(stream, remote.to_string());
                        let peer = Arc::new(PeerConnection::new(connection, None));
                        self.attach_peer(peer, incoming).await;
                    }
                    Err(e) => tracing::warn!(error = %e, "Failed to accept peer connection"),
                },
            }
        }
        tracing::info!("Peer listener stopped");
    }

    // ---- workers ----

    async fn accept_workers(self: Arc<Self>, listener: TcpListener, cancel: CancellationToken) {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                accepted = listener.accept() => match accepted {
                    Ok((stream, remote)) => self.attach_worker(stream, remote).await,
                    Err(e) => tracing::warn!(error = %e, "Failed to accept worker connection"),
                },
            }
        }
        tracing::info!("Worker listener stopped");
    }

    async fn attach_worker(&self, stream: TcpStream, remote: SocketAddr) {
        let id = self.next_worker_id.fetch_add(1, Ordering::Relaxed);
        let (connection, incoming) = RpcConnection::open(stream, format!("worker-{id}@{remote}"));
        let worker = Arc::new(WorkerConnection::new(id, connection));
        self.pool.add_worker(Arc::clone(&worker)).await;

        let pool = Arc::clone(&self.pool);
        tokio::spawn(async move {
            refuse_worker_calls(incoming).await;
            worker.connection().close().await;
            pool.remove_worker(id).await;
        });
    }

    // ---- background loops ----

    async fn recovery_loop(self: Arc<Self>, cancel: CancellationToken) {
        tracing::info!(
            period_secs = self.config.recovery_period.as_secs(),
            "Lost-work recovery loop started",
        );
        loop {
            let delay = self.next_recovery_delay().await;
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(delay) => {}
            }

            // A started cycle runs to completion; stop() waits for it.
            let result = recovery::run_cycle(
                self.local.store().as_ref(),
                self.local.registry(),
                &*self,
                self.config.processing_timeout,
            )
            .await;
            if let Err(e) = result {
                tracing::error!(error = %e, "Recovery cycle failed");
            }
        }
        tracing::info!("Lost-work recovery loop stopped");
    }

    /// Delay until this node's staggered recovery slot.
    async fn next_recovery_delay(&self) -> std::time::Duration {
        let (count, index) = match (self.active_nodes().await, self.node_address().await) {
            (Ok(nodes), Some(this)) => (nodes.len(), node_index(&nodes, &this).unwrap_or(0)),
            (Err(e), _) => {
                tracing::warn!(error = %e, "Could not list nodes, recovering unstaggered");
                (1, 0)
            }
            (Ok(_), None) => (1, 0),
        };
        next_recovery_delay(Utc::now(), self.config.recovery_period, count, index)
    }

    async fn heartbeat_loop(self: Arc<Self>, cancel: CancellationToken) {
        let period = self.config.heartbeat_interval;
        let mut ticker = interval_at(Instant::now() + period, period);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => self.heartbeat().await,
            }
        }
    }

    /// Refresh our registry row, re-creating it if it disappeared.
    async fn heartbeat(&self) {
        let Some(node) = self.node_address().await else {
            return;
        };
        let (host, port) = (node.host.clone(), node.port);
        let touched = run_in_transaction(self.local.store().as_ref(), move |txn| {
            Box::pin(async move { NodeInfoRepo::touch(txn, &host, port).await })
        })
        .await;
        match touched {
            Ok(true) => tracing::trace!(%node, "Heartbeat recorded"),
            Ok(false) => {
                tracing::warn!(%node, "Registration missing, registering again");
                if let Err(e) = self.register(&node).await {
                    tracing::error!(%node, error = %e, "Re-registration failed");
                }
            }
            Err(e) => tracing::warn!(%node, error = %e, "Heartbeat failed"),
        }
    }

    async fn load_report_loop(self: Arc<Self>, cancel: CancellationToken) {
        let period = self.config.load_report_interval;
        let mut ticker = interval_at(Instant::now() + period, period);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        () = self.broadcast_load() => {}
                    }
                }
            }
        }
    }

    /// Send our outstanding work count to every peer.
    ///
    /// A peer that does not acknowledge within `connect_timeout` is
    /// disconnected.
    pub async fn broadcast_load(&self) {
        let load = self.pool.all_worker_load().await + self.local.current_load();
        let limit = self.config.connect_timeout;
        let peers = self.peers().await;
        let reports = peers.iter().map(|peer| async move {
            let label = peer.connection().label().to_string();
            match tokio::time::timeout(limit, peer.report_load(load)).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    tracing::debug!(peer = %label, error = %e, "Load report failed");
                }
                Err(_) => {
                    tracing::warn!(peer = %label, "Peer stopped answering, disconnecting");
                    peer.connection().close().await;
                }
            }
        });
        join_all(reports).await;
    }
}

/// Run `call`, failing with `TimedOut` if it takes longer than `limit`.
async fn bounded<T>(
    limit: Duration,
    what: String,
    call: impl Future<Output = Result<T, QueueError>>,
) -> Result<T, QueueError> {
    tokio::time::timeout(limit, call).await.map_err(|_| {
        std::io::Error::new(std::io::ErrorKind::TimedOut, format!("{what} timed out"))
    })?
}

#[async_trait]
impl PerformerChooser for Coordinator {
    async fn choose_performer(&self) -> Arc<dyn WorkPerformer> {
        let performer = self.select_performer(false).await;
        tracing::debug!(?performer, "Performer chosen");
        Arc::new(performer)
    }
}
