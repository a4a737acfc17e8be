//! Nodes over HTTP raft RPCs: bootstrap, join, replicate, fail over

use raftroute::common::Error;
use raftroute::node::publisher::read_state_file;
use raftroute::node::{NodeClient, RunningNode};
use raftroute::{ConsensusEngine, Node, RaftConfig, RaftState};
use std::path::Path;
use std::time::Duration;
use tempfile::TempDir;

fn config(id: &str, dir: &Path, seed: Option<String>) -> RaftConfig {
    let mut cfg = RaftConfig::for_node(id, "127.0.0.1:0", "127.0.0.1:0", dir.join(id), seed);
    cfg.inmem = true;
    cfg.state_file = dir.join(format!("{}.raftstate", id));
    cfg.heartbeat_interval_ms = 50;
    cfg.election_timeout_ms = 1_000;
    cfg.apply_timeout_ms = 5_000;
    cfg.join_delay_ms = 10;
    cfg.transport.timeout_sec = 2;
    cfg
}

async fn eventually<F, Fut>(what: &str, check: F)
where
    F: Fn() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    for _ in 0..400 {
        if check().await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    panic!("timed out waiting for {}", what);
}

async fn cluster(dir: &Path) -> (RunningNode, RunningNode) {
    let a = Node::new(config("node-a", dir, None)).start().await.unwrap();
    let b = Node::new(config("node-b", dir, Some(a.http_addr().to_string())))
        .start()
        .await
        .unwrap();

    let engine = a.engine.clone();
    eventually("node-b to join", || {
        let engine = engine.clone();
        async move {
            engine
                .configuration()
                .await
                .map(|m| m.iter().any(|m| m.id == "node-b"))
                .unwrap_or(false)
        }
    })
    .await;
    (a, b)
}

#[tokio::test]
async fn test_writes_replicate_to_joined_node() {
    let dir = TempDir::new().unwrap();
    let (a, b) = cluster(dir.path()).await;
    let leader = NodeClient::new(&a.http_addr().to_string()).unwrap();
    let follower = NodeClient::new(&b.http_addr().to_string()).unwrap();

    leader.set("user1", "batman").await.unwrap();
    let follower = &follower;
    eventually("set to reach node-b", || async move {
        follower.get("user1").await.unwrap() == "batman"
    })
    .await;

    leader.delete("user1").await.unwrap();
    eventually("delete to reach node-b", || async move {
        follower.get("user1").await.unwrap().is_empty()
    })
    .await;

    b.shutdown().await;
    a.shutdown().await;
}

#[tokio::test]
async fn test_follower_refuses_writes() {
    let dir = TempDir::new().unwrap();
    let (a, b) = cluster(dir.path()).await;
    let follower = NodeClient::new(&b.http_addr().to_string()).unwrap();

    let err = follower.set("k", "v").await.unwrap_err();
    assert!(matches!(err, Error::NotLeader(_)), "{}", err);
    let err = follower.delete("k").await.unwrap_err();
    assert!(matches!(err, Error::NotLeader(_)), "{}", err);

    let status = follower.status().await.unwrap();
    assert_eq!(status.state, "Follower");
    assert_eq!(status.node, "node-b");

    b.shutdown().await;
    a.shutdown().await;
}

#[tokio::test]
async fn test_follower_publishes_leader_address() {
    let dir = TempDir::new().unwrap();
    let (a, b) = cluster(dir.path()).await;
    let path = dir.path().join("node-b.raftstate");
    let leader_addr = a.raft_addr().to_string();
    let (path, leader_addr) = (&path, &leader_addr);

    eventually("node-b state file to name the leader", || async move {
        read_state_file(path)
            .map(|s| s.state == "Follower" && &s.node_addr == leader_addr)
            .unwrap_or(false)
    })
    .await;

    b.shutdown().await;
    a.shutdown().await;
}

#[tokio::test]
async fn test_snapshot_reaches_late_joiner() {
    let dir = TempDir::new().unwrap();
    let mut cfg = config("node-a", dir.path(), None);
    cfg.log.trailing_logs = 0;
    cfg.snapshot.every_n_writes = 0;
    let a = Node::new(cfg).start().await.unwrap();
    let leader = NodeClient::new(&a.http_addr().to_string()).unwrap();
    for i in 0..5 {
        leader.set(&format!("k{}", i), &i.to_string()).await.unwrap();
    }
    a.engine.snapshot().await.unwrap();

    let b = Node::new(config("node-b", dir.path(), Some(a.http_addr().to_string())))
        .start()
        .await
        .unwrap();
    let follower = NodeClient::new(&b.http_addr().to_string()).unwrap();
    let follower = &follower;
    eventually("snapshot to reach node-b", || async move {
        follower.get("k4").await.unwrap() == "4"
    })
    .await;
    assert_eq!(b.store.len(), 5);

    b.shutdown().await;
    a.shutdown().await;
}

#[tokio::test]
async fn test_voters_elect_new_leader_after_leader_stops() {
    let dir = TempDir::new().unwrap();
    let (a, b) = cluster(dir.path()).await;
    let c = Node::new(config("node-c", dir.path(), Some(a.http_addr().to_string())))
        .start()
        .await
        .unwrap();
    let engine = a.engine.clone();
    eventually("node-c to join", || {
        let engine = engine.clone();
        async move {
            engine
                .configuration()
                .await
                .map(|m| m.iter().any(|m| m.id == "node-c"))
                .unwrap_or(false)
        }
    })
    .await;

    a.engine.add_voter("node-b", &b.raft_addr().to_string()).await.unwrap();
    a.engine.add_voter("node-c", &c.raft_addr().to_string()).await.unwrap();
    let voters = a.engine.configuration().await.unwrap();
    assert_eq!(voters.iter().filter(|m| m.voter).count(), 3);

    let leader = NodeClient::new(&a.http_addr().to_string()).unwrap();
    leader.set("before", "1").await.unwrap();
    a.shutdown().await;

    let (nb, nc) = (&b, &c);
    eventually("a surviving voter to take over", || async move {
        nb.engine.state() == RaftState::Leader || nc.engine.state() == RaftState::Leader
    })
    .await;
    let (new_leader, other) = if nb.engine.state() == RaftState::Leader {
        (nb, nc)
    } else {
        (nc, nb)
    };
    let leader_id = new_leader.id().to_string();
    let leader_id = &leader_id;
    eventually("the other voter to follow the new leader", || async move {
        other.engine.leader().map(|l| &l.id == leader_id).unwrap_or(false)
    })
    .await;

    let client = NodeClient::new(&new_leader.http_addr().to_string()).unwrap();
    let reader = &client;
    eventually("the new leader to apply earlier writes", || async move {
        reader.get("before").await.unwrap() == "1"
    })
    .await;
    client.set("after", "2").await.unwrap();
    let follower = NodeClient::new(&other.http_addr().to_string()).unwrap();
    let follower = &follower;
    eventually("write under the new leader to replicate", || async move {
        follower.get("after").await.unwrap() == "2"
    })
    .await;

    c.shutdown().await;
    b.shutdown().await;
}
