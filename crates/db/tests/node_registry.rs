//! Node registry behaviour against the in-memory store.

use peerwork_core::node::NodeAddress;
use peerwork_db::models::node_info::NodeInfo;
use peerwork_db::repositories::NodeInfoRepo;
use peerwork_db::{run_in_transaction, DbError, MemoryStore, Store};

async fn register(store: &MemoryStore, host: &str, port: u16, pid: u32) -> NodeInfo {
    let host = host.to_string();
    run_in_transaction(store, move |txn| {
        Box::pin(async move { NodeInfoRepo::register(txn, &host, port, pid).await })
    })
    .await
    .unwrap()
}

async fn active(store: &MemoryStore) -> Vec<NodeInfo> {
    run_in_transaction(store, |txn| {
        Box::pin(async move { NodeInfoRepo::active_nodes(txn).await })
    })
    .await
    .unwrap()
}

#[tokio::test]
async fn registration_adds_one_row_per_node() {
    let store = MemoryStore::new();
    register(&store, "b.example.com", 7654, 10).await;
    register(&store, "a.example.com", 7654, 11).await;

    let nodes = active(&store).await;
    let addresses: Vec<_> = nodes.iter().filter_map(NodeInfo::address).collect();
    assert_eq!(
        addresses,
        vec![
            NodeAddress::new("a.example.com", 7654),
            NodeAddress::new("b.example.com", 7654),
        ]
    );
}

#[tokio::test]
async fn reregistration_updates_pid_and_time_in_place() {
    let store = MemoryStore::new();
    let first = register(&store, "a.example.com", 7654, 10).await;
    register(&store, "b.example.com", 7654, 20).await;

    let again = register(&store, "a.example.com", 7654, 99).await;

    let nodes = active(&store).await;
    assert_eq!(nodes.len(), 2);
    assert_eq!(again.pid, 99);
    assert!(again.time >= first.time);
    assert_eq!(nodes[0], again);
}

#[tokio::test]
async fn touch_refreshes_only_registered_nodes() {
    let store = MemoryStore::new();
    let before = register(&store, "a.example.com", 7654, 10).await;

    let touched = run_in_transaction(&store, |txn| {
        Box::pin(async move {
            Ok::<_, DbError>((
                NodeInfoRepo::touch(txn, "a.example.com", 7654).await?,
                NodeInfoRepo::touch(txn, "missing.example.com", 7654).await?,
            ))
        })
    })
    .await
    .unwrap();
    assert_eq!(touched, (true, false));

    let nodes = active(&store).await;
    assert!(nodes[0].time >= before.time);
}

#[tokio::test]
async fn failed_registration_leaves_registry_unchanged() {
    let store = MemoryStore::new();
    register(&store, "a.example.com", 7654, 10).await;

    let mut txn = store.begin().await.unwrap();
    NodeInfoRepo::register(&mut txn, "b.example.com", 7654, 20)
        .await
        .unwrap();
    txn.abort().await.unwrap();

    assert_eq!(active(&store).await.len(), 1);
}
