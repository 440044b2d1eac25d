//! Two full nodes over an in-process connection pair.

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;

use actionsync_log::{Log, MemoryStore, NewMeta, Order};
use actionsync_node::{
    ClientNode, Connection, LocalPair, NodeConfig, NodeOptions, NodeState, Reconnect,
    ReconnectConfig, ServerNode,
};
use actionsync_types::Action;

fn test_log(node_id: &str) -> Log {
    Log::new(node_id, MemoryStore::new()).unwrap()
}

fn options() -> NodeOptions {
    // A shared in-process clock needs no offset estimation; keeping it off
    // makes the asserted timestamps exact.
    NodeOptions::new(NodeConfig {
        fix_time: false,
        ..NodeConfig::default()
    })
}

fn reasoned() -> NewMeta {
    NewMeta::fresh().with_reasons(vec!["test".into()])
}

async fn wait_for(what: &str, mut check: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !check() {
        assert!(
            tokio::time::Instant::now() < deadline,
            "timed out waiting for {what}"
        );
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

async fn wait_synchronized(client: &ClientNode, server: &ServerNode) {
    wait_for("both nodes synchronized", || {
        client.state() == NodeState::Synchronized && server.state() == NodeState::Synchronized
    })
    .await;
}

/// `(type, id, time, reasons)` tuples in created order, ignoring the
/// store-local `added` sequence.
async fn snapshot(log: &Log) -> Vec<(String, String, i64, Vec<String>)> {
    log.entries(Order::Created)
        .await
        .unwrap()
        .into_iter()
        .map(|(action, meta)| (action.kind, meta.id.to_string(), meta.time, meta.reasons))
        .collect()
}

async fn converged(client_log: &Log, server_log: &Log, expected: usize) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        let client = snapshot(client_log).await;
        let server = snapshot(server_log).await;
        if client.len() == expected && client == server {
            return;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "logs did not converge: client {client:?}, server {server:?}"
        );
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

#[tokio::test]
async fn logs_converge_after_handshake() {
    let pair = LocalPair::new();
    let client_log = test_log("client:1");
    let server_log = test_log("server");

    // Backlog on both sides before any connection exists.
    client_log
        .add(Action::new("client/one"), reasoned())
        .await
        .unwrap();
    client_log
        .add(Action::new("client/two"), reasoned())
        .await
        .unwrap();
    server_log
        .add(Action::new("server/one"), reasoned())
        .await
        .unwrap();

    let client = ClientNode::new(client_log.clone(), pair.left.clone(), options()).unwrap();
    let _server = ServerNode::new(server_log.clone(), pair.right.clone(), options()).unwrap();

    client.connect().await.unwrap();
    converged(&client_log, &server_log, 3).await;
}

#[tokio::test]
async fn live_additions_flow_both_ways() {
    let pair = LocalPair::new();
    let client_log = test_log("client:1");
    let server_log = test_log("server");

    let client = ClientNode::new(client_log.clone(), pair.left.clone(), options()).unwrap();
    let server = ServerNode::new(server_log.clone(), pair.right.clone(), options()).unwrap();
    client.connect().await.unwrap();
    wait_synchronized(&client, &server).await;

    client_log
        .add(Action::new("from/client"), reasoned())
        .await
        .unwrap();
    server_log
        .add(Action::new("from/server"), reasoned())
        .await
        .unwrap();

    converged(&client_log, &server_log, 2).await;
}

#[tokio::test]
async fn duplicate_sync_messages_store_once() {
    let pair = LocalPair::new();
    let client_log = test_log("client:1");
    let server_log = test_log("server");

    let client = ClientNode::new(client_log.clone(), pair.left.clone(), options()).unwrap();
    let server = ServerNode::new(server_log.clone(), pair.right.clone(), options()).unwrap();
    client.connect().await.unwrap();
    wait_synchronized(&client, &server).await;

    let entry = json!([
        "sync",
        7,
        { "type": "dup" },
        { "id": [1, "server", 0], "time": 1, "reasons": ["test"] }
    ]);
    pair.right.send(entry.clone()).unwrap();
    pair.right.send(entry).unwrap();

    wait_for("both acknowledgements", || {
        pair.left
            .sent_frames()
            .iter()
            .filter(|frame| frame[0] == "synced")
            .count()
            == 2
    })
    .await;

    assert_eq!(client_log.entries(Order::Added).await.unwrap().len(), 1);
}

#[tokio::test]
async fn reconnection_resumes_from_cursors() {
    let pair = LocalPair::new();
    let client_log = test_log("client:1");
    let server_log = test_log("server");

    let client = ClientNode::new(client_log.clone(), pair.left.clone(), options()).unwrap();
    let _server = ServerNode::new(server_log.clone(), pair.right.clone(), options()).unwrap();

    client_log
        .add(Action::new("before"), reasoned())
        .await
        .unwrap();
    client.connect().await.unwrap();
    converged(&client_log, &server_log, 1).await;
    // The cursor is persisted when the acknowledgement lands.
    wait_for("first session to quiesce", || {
        client.state() == NodeState::Synchronized
    })
    .await;

    // Drop the link, keep adding, reconnect.
    pair.left.disconnect(None);
    client_log
        .add(Action::new("while/offline"), reasoned())
        .await
        .unwrap();
    client.connect().await.unwrap();
    converged(&client_log, &server_log, 2).await;

    // The second session only streamed the offline entry.
    let syncs: Vec<usize> = pair
        .left
        .sent_frames()
        .iter()
        .filter(|frame| frame[0] == "sync")
        .map(|frame| (frame.as_array().unwrap().len() - 2) / 2)
        .collect();
    assert_eq!(syncs, vec![1, 1]);
}

#[tokio::test]
async fn supervised_client_survives_link_drops() {
    let pair = LocalPair::new();
    let client_log = test_log("client:1");
    let server_log = test_log("server");

    let supervised = Reconnect::new(
        pair.left.clone(),
        ReconnectConfig {
            attempts: None,
            min_delay: 0,
            max_delay: 0,
        },
    );
    let connection: Arc<dyn Connection> = supervised.clone();
    let client = ClientNode::new(client_log.clone(), connection, options()).unwrap();
    let server = ServerNode::new(server_log.clone(), pair.right.clone(), options()).unwrap();

    client.connect().await.unwrap();
    wait_synchronized(&client, &server).await;

    // The server side drops the link; the supervisor dials again.
    pair.right.disconnect(None);
    wait_synchronized(&client, &server).await;

    client_log
        .add(Action::new("after/drop"), reasoned())
        .await
        .unwrap();
    converged(&client_log, &server_log, 1).await;

    client.destroy();
    supervised.destroy();
}
