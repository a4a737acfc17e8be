//! Single in-memory engines for unit tests

use crate::common::RaftConfig;
use crate::raft::engine::{ClusterMember, ConsensusEngine};
use crate::raft::fsm::KvStateMachine;
use crate::raft::raft_engine::RaftEngine;
use crate::store::ReplicatedStore;
use std::sync::Arc;
use tracing::Span;

/// An engine for node `id` reachable at `raft-<id>`, optionally
/// bootstrapped as the sole voter (and then already leading).
pub async fn single_node(id: &str, bootstrap: bool) -> (Arc<RaftEngine>, Arc<ReplicatedStore>) {
    let address = format!("raft-{}", id);
    let mut config = RaftConfig::for_node(id, "127.0.0.1:0", address.clone(), "unused", None);
    config.inmem = true;
    config.heartbeat_interval_ms = 50;
    config.election_timeout_ms = 300;

    let store = Arc::new(ReplicatedStore::new());
    let fsm = Arc::new(KvStateMachine::new(store.clone(), &Span::none()));
    let engine = RaftEngine::open(&config, address.clone(), fsm, &Span::none())
        .await
        .unwrap();
    if bootstrap {
        engine
            .bootstrap(vec![ClusterMember::voter(id, address)])
            .await
            .unwrap();
    }
    (engine, store)
}
