//! Worker and peer links over in-memory streams: load accounting, pool
//! selection, and peer commands.

mod common;

use std::sync::Arc;

use assert_matches::assert_matches;
use chrono::Utc;
use common::{eventually, within, CouponWork, Harness};
use peerwork_core::node::NodeAddress;
use peerwork_queue::connection::{IncomingCall, RpcConnection};
use peerwork_queue::peer::PeerConnection;
use peerwork_queue::performer::PerformerChooser;
use peerwork_queue::worker::{refuse_worker_calls, WorkerConnection};
use peerwork_queue::{QueueError, RpcError, WorkPerformer, WorkerConnectionPool};
use tokio::sync::mpsc;

/// A worker whose calls the test answers by hand.
struct FakeWorker {
    link: Arc<WorkerConnection>,
    remote: Arc<RpcConnection>,
    calls: mpsc::UnboundedReceiver<IncomingCall>,
}

impl FakeWorker {
    fn new(id: u64) -> Self {
        let (node_end, worker_end) = tokio::io::duplex(4096);
        let (connection, incoming) = RpcConnection::open(node_end, format!("worker-{id}"));
        tokio::spawn(refuse_worker_calls(incoming));
        let (remote, calls) = RpcConnection::open(worker_end, "node");
        Self {
            link: Arc::new(WorkerConnection::new(id, connection)),
            remote,
            calls,
        }
    }

    async fn next_call(&mut self) -> IncomingCall {
        within(self.calls.recv()).await.expect("link closed")
    }
}

fn dispatch(
    performer: Arc<dyn WorkPerformer>,
    work_id: i64,
) -> tokio::task::JoinHandle<Result<(), QueueError>> {
    tokio::spawn(async move { performer.perform_work("coupon_work", work_id).await })
}

// ---------------------------------------------------------------------------
// Worker links
// ---------------------------------------------------------------------------

#[tokio::test]
async fn worker_load_tracks_outstanding_calls() {
    let mut worker = FakeWorker::new(1);
    let pending = dispatch(worker.link.clone(), 10);

    let call = worker.next_call().await;
    assert_eq!(worker.link.current_load(), 1);

    call.respond(Ok(()));
    within(pending).await.unwrap().unwrap();
    assert_eq!(worker.link.current_load(), 0);
}

#[tokio::test]
async fn worker_load_released_on_remote_failure() {
    let mut worker = FakeWorker::new(1);
    let pending = dispatch(worker.link.clone(), 10);

    worker.next_call().await.respond(Err("boom".into()));
    let result = within(pending).await.unwrap();

    assert_matches!(result, Err(QueueError::Rpc(RpcError::Remote(message))) if message == "boom");
    assert_eq!(worker.link.current_load(), 0);
}

#[tokio::test]
async fn worker_load_released_on_disconnect() {
    let mut worker = FakeWorker::new(1);
    let pending = dispatch(worker.link.clone(), 10);

    let _unanswered = worker.next_call().await;
    worker.remote.close().await;
    let result = within(pending).await.unwrap();

    assert_matches!(result, Err(QueueError::Rpc(RpcError::ConnectionLost)));
    assert_eq!(worker.link.current_load(), 0);
}

#[tokio::test]
async fn workers_may_not_issue_commands() {
    let worker = FakeWorker::new(1);
    let result = worker
        .remote
        .call(peerwork_queue::protocol::Command::ReportLoad { load: 1 })
        .await;
    assert_matches!(result, Err(RpcError::Remote(_)));
}

// ---------------------------------------------------------------------------
// Local worker pool
// ---------------------------------------------------------------------------

#[tokio::test]
async fn empty_pool_has_no_capacity() {
    let pool = WorkerConnectionPool::new(2);
    assert!(!pool.has_available_capacity().await);
    assert!(pool.select_lowest_load().await.is_none());
    assert_matches!(
        pool.perform_work("coupon_work", 1).await,
        Err(QueueError::NoWorkers)
    );
}

#[tokio::test]
async fn pool_routes_to_lowest_load_until_full() {
    let pool = Arc::new(WorkerConnectionPool::new(1));
    let mut first = FakeWorker::new(1);
    let mut second = FakeWorker::new(2);
    pool.add_worker(first.link.clone()).await;
    pool.add_worker(second.link.clone()).await;
    assert_eq!(pool.worker_count().await, 2);

    // Ties go to the worker that connected first.
    assert_eq!(pool.select_lowest_load().await.unwrap().id(), 1);
    let a = dispatch(pool.clone(), 1);
    let call_a = first.next_call().await;

    assert!(pool.has_available_capacity().await);
    assert_eq!(pool.select_lowest_load().await.unwrap().id(), 2);
    let b = dispatch(pool.clone(), 2);
    let call_b = second.next_call().await;

    assert!(!pool.has_available_capacity().await);
    assert_eq!(pool.all_worker_load().await, 2);

    call_a.respond(Ok(()));
    call_b.respond(Ok(()));
    within(a).await.unwrap().unwrap();
    within(b).await.unwrap().unwrap();
    assert!(pool.has_available_capacity().await);
    assert_eq!(pool.all_worker_load().await, 0);
}

#[tokio::test]
async fn removed_worker_is_not_selected() {
    let pool = WorkerConnectionPool::new(3);
    let first = FakeWorker::new(1);
    let second = FakeWorker::new(2);
    pool.add_worker(first.link.clone()).await;
    pool.add_worker(second.link.clone()).await;

    assert!(pool.remove_worker(1).await);
    assert!(!pool.remove_worker(1).await);
    assert_eq!(pool.select_lowest_load().await.unwrap().id(), 2);

    let loads = pool.worker_loads().await;
    assert_eq!(loads.len(), 1);
    assert_eq!(loads[0].id, 2);
}

#[tokio::test]
async fn close_all_empties_the_pool() {
    let pool = WorkerConnectionPool::new(3);
    let worker = FakeWorker::new(1);
    pool.add_worker(worker.link.clone()).await;

    pool.close_all().await;

    assert_eq!(pool.worker_count().await, 0);
    assert!(worker.link.connection().is_closed());
}

// ---------------------------------------------------------------------------
// Peer links
// ---------------------------------------------------------------------------

/// Two peer links joined back to back. `b` serves calls with `b_local`.
fn peer_pair(
    b_local: Arc<dyn PerformerChooser>,
) -> (Arc<PeerConnection>, Arc<PeerConnection>, mpsc::UnboundedReceiver<IncomingCall>) {
    let (a_end, b_end) = tokio::io::duplex(4096);
    let (a_conn, a_incoming) = RpcConnection::open(a_end, "b");
    let (b_conn, b_incoming) = RpcConnection::open(b_end, "a");
    let a = Arc::new(PeerConnection::new(a_conn, Some(NodeAddress::new("b.local", 7001))));
    let b = Arc::new(PeerConnection::new(b_conn, None));
    tokio::spawn(b.clone().serve(b_incoming, b_local));
    (a, b, a_incoming)
}

#[tokio::test]
async fn peer_work_runs_on_the_remote_node() {
    let h = Harness::new();
    let id = h
        .insert_pending(&CouponWork { customer_id: 42 }, Utc::now())
        .await;
    let (a, _b, _a_incoming) = peer_pair(Arc::new(h.local_performer()));

    within(a.perform_work("coupon_work", id)).await.unwrap();

    assert_eq!(h.issued_coupons().await, vec![42]);
    assert_eq!(a.bonus_load(), 0);
}

#[tokio::test]
async fn peer_bonus_load_tracks_outstanding_calls() {
    // Raw remote end so the test controls when calls are answered.
    let (a_end, b_end) = tokio::io::duplex(4096);
    let (a_conn, _a_incoming) = RpcConnection::open(a_end, "b");
    let (_b_conn, mut b_calls) = RpcConnection::open(b_end, "a");
    let a = Arc::new(PeerConnection::new(a_conn, None));

    a.record_reported_load(3);
    let ok = dispatch(a.clone(), 1);
    let call = within(b_calls.recv()).await.unwrap();
    assert_eq!(a.bonus_load(), 1);
    assert_eq!(a.current_load_estimate(), 4);
    call.respond(Ok(()));
    within(ok).await.unwrap().unwrap();
    assert_eq!(a.bonus_load(), 0);

    let failing = dispatch(a.clone(), 2);
    within(b_calls.recv()).await.unwrap().respond(Err("gone".into()));
    assert_matches!(within(failing).await.unwrap(), Err(QueueError::Rpc(_)));
    assert_eq!(a.bonus_load(), 0);
    assert_eq!(a.current_load_estimate(), 3);
}

#[tokio::test]
async fn peer_failure_is_reported_to_caller() {
    let h = Harness::new();
    let (a, _b, _a_incoming) = peer_pair(Arc::new(h.local_performer()));

    let result = within(a.perform_work("no_such_work", 1)).await;

    assert_matches!(result, Err(QueueError::Rpc(RpcError::Remote(message))) if message.contains("no_such_work"));
    assert_eq!(a.bonus_load(), 0);
}

#[tokio::test]
async fn load_reports_and_identity_reach_the_remote_link() {
    let h = Harness::new();
    let (a, b, _a_incoming) = peer_pair(Arc::new(h.local_performer()));
    assert!(b.identity().is_none());

    a.report_load(7).await.unwrap();
    a.identify(&NodeAddress::new("a.local", 7000)).await.unwrap();

    assert_eq!(b.reported_load(), 7);
    assert_eq!(b.current_load_estimate(), 7);
    assert_eq!(b.identity(), Some(&NodeAddress::new("a.local", 7000)));

    let snapshot = b.snapshot();
    assert_eq!(snapshot.node.as_deref(), Some("a.local:7000"));
    assert_eq!(snapshot.reported_load, 7);
}

#[tokio::test]
async fn peer_serve_ends_when_link_closes() {
    let h = Harness::new();
    let (a, b, _a_incoming) = peer_pair(Arc::new(h.local_performer()));

    a.connection().close().await;

    let b_conn = b.connection().clone();
    eventually(|| {
        let b_conn = b_conn.clone();
        async move { b_conn.is_closed() }
    })
    .await;
}
